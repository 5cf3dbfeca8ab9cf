//! Benchmark: full marking cycles over synthetic object graphs.
//!
//! Measures the root pause, the concurrent trace and the final pause together
//! for a wide tree, a long chain and a large chunked array, at several worker
//! counts.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

use conmark::roots::{RootEnumerator, RootPartition, RootView};
use conmark::{
    ConcurrentMark, GcFlags, MarkBitmap, MarkConfig, MarkContext, MarkingHeap, ObjectRef, RefSlot,
    RootPhase, SatbQueueSet,
};

struct BenchHeap {
    fields: Vec<Vec<RefSlot>>,
    marks: MarkBitmap,
}

impl BenchHeap {
    fn from_edges(edges: Vec<Vec<usize>>) -> Self {
        let n = edges.len();
        Self {
            fields: edges
                .into_iter()
                .map(|targets| {
                    targets
                        .into_iter()
                        .map(|t| RefSlot::new(ObjectRef::from_raw(t + 1)))
                        .collect()
                })
                .collect(),
            marks: MarkBitmap::new(n + 1),
        }
    }

    /// A complete tree with the given fan-out.
    fn tree(n: usize, fanout: usize) -> Self {
        Self::from_edges(
            (0..n)
                .map(|i| (1..=fanout).map(|k| i * fanout + k).filter(|&c| c < n).collect())
                .collect(),
        )
    }

    fn chain(n: usize) -> Self {
        Self::from_edges((0..n).map(|i| if i + 1 < n { vec![i + 1] } else { vec![] }).collect())
    }

    /// One array pointing at `n` leaves.
    fn array(n: usize) -> Self {
        let mut edges = vec![(1..=n).collect::<Vec<_>>()];
        edges.extend((0..n).map(|_| Vec::new()));
        Self::from_edges(edges)
    }

    fn reset(&self) {
        self.marks.clear();
    }
}

impl MarkingHeap for BenchHeap {
    fn try_mark(&self, obj: ObjectRef) -> bool {
        self.marks.try_mark(obj.raw())
    }

    fn is_marked(&self, obj: ObjectRef) -> bool {
        self.marks.is_marked(obj.raw())
    }

    fn fields(&self, obj: ObjectRef) -> &[RefSlot] {
        &self.fields[obj.raw() - 1]
    }

    fn object_size(&self, obj: ObjectRef) -> usize {
        16 + 8 * self.fields[obj.raw() - 1].len()
    }

    fn region_index(&self, obj: ObjectRef) -> usize {
        obj.raw() % 64
    }

    fn region_count(&self) -> usize {
        64
    }
}

struct SingleRoot {
    root: RefSlot,
    lock: parking_lot::Mutex<()>,
}

impl RootEnumerator for SingleRoot {
    fn roots_do(&self, partition: RootPartition, _view: RootView, f: &mut dyn FnMut(&RefSlot)) {
        if partition.owns(0) {
            f(&self.root);
        }
    }

    fn code_cache_lock(&self) -> &parking_lot::Mutex<()> {
        &self.lock
    }
}

fn engine(heap: &Arc<BenchHeap>, workers: usize) -> ConcurrentMark {
    let roots = Arc::new(SingleRoot {
        root: RefSlot::new(ObjectRef::from_raw(1)),
        lock: parking_lot::Mutex::new(()),
    });
    let config = MarkConfig::new(workers);
    let ctx = MarkContext::new(
        heap.clone(),
        roots,
        Arc::new(SatbQueueSet::new(config.satb_buffer_size)),
        Arc::new(GcFlags::new()),
    );
    ConcurrentMark::initialize(ctx, config)
}

fn run_cycle(heap: &BenchHeap, cm: &ConcurrentMark) {
    heap.reset();
    cm.mark_roots(RootPhase::InitMark);
    black_box(cm.mark_from_roots());
    cm.finish_mark_from_roots(false);
}

fn bench_graph(c: &mut Criterion, name: &str, heap: BenchHeap) {
    let heap = Arc::new(heap);
    let mut group = c.benchmark_group(name);
    group.sample_size(20);
    for workers in [1, 2, 4] {
        let cm = engine(&heap, workers);
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            b.iter(|| run_cycle(&heap, &cm));
        });
    }
    group.finish();
}

fn bench_tree(c: &mut Criterion) {
    bench_graph(c, "mark_tree_100k", BenchHeap::tree(100_000, 4));
}

fn bench_chain(c: &mut Criterion) {
    bench_graph(c, "mark_chain_20k", BenchHeap::chain(20_000));
}

fn bench_array(c: &mut Criterion) {
    bench_graph(c, "mark_array_100k", BenchHeap::array(100_000));
}

criterion_group!(benches, bench_tree, bench_chain, bench_array);
criterion_main!(benches);
