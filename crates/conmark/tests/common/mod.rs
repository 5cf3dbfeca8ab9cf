//! Shared test heap, roots and reference processor for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use conmark::roots::{RootEnumerator, RootPartition, RootView};
use conmark::{
    ConcurrentMark, GcFlags, MarkBitmap, MarkConfig, MarkContext, MarkingHeap, ObjectRef,
    RefProcExecutor, RefProcRound, RefSlot, ReferenceProcessor, SatbQueueSet, SatbThreadLog,
    ThreadId,
};

pub const OBJ_SIZE: usize = 16;

pub fn obj(raw: usize) -> ObjectRef {
    ObjectRef::from_raw(raw).unwrap()
}

// ============================================================================
// TestHeap
// ============================================================================

struct ObjectDef {
    region: usize,
    size: usize,
    fields: Vec<Option<ObjectRef>>,
    referent_field: Option<usize>,
    metadata: Option<ObjectRef>,
    dedup: bool,
}

/// Builds a [`TestHeap`]. Object ids start at 1.
pub struct HeapBuilder {
    regions: usize,
    objects: Vec<ObjectDef>,
    forwarding: HashMap<usize, ObjectRef>,
}

impl HeapBuilder {
    pub fn new(regions: usize) -> Self {
        Self {
            regions,
            objects: Vec::new(),
            forwarding: HashMap::new(),
        }
    }

    /// Allocate an object with `nfields` null fields.
    pub fn object(&mut self, region: usize, nfields: usize) -> ObjectRef {
        self.sized_object(region, OBJ_SIZE, nfields)
    }

    pub fn sized_object(&mut self, region: usize, size: usize, nfields: usize) -> ObjectRef {
        assert!(region < self.regions);
        self.objects.push(ObjectDef {
            region,
            size,
            fields: vec![None; nfields],
            referent_field: None,
            metadata: None,
            dedup: false,
        });
        obj(self.objects.len())
    }

    /// Allocate a reference object whose field 0 is the referent.
    pub fn reference(&mut self, region: usize, referent: ObjectRef) -> ObjectRef {
        let r = self.object(region, 1);
        self.def(r).referent_field = Some(0);
        self.set(r, 0, referent);
        r
    }

    pub fn set(&mut self, o: ObjectRef, field: usize, target: ObjectRef) -> &mut Self {
        self.def(o).fields[field] = Some(target);
        self
    }

    pub fn metadata(&mut self, o: ObjectRef, holder: ObjectRef) -> &mut Self {
        self.def(o).metadata = Some(holder);
        self
    }

    pub fn dedup_candidate(&mut self, o: ObjectRef) -> &mut Self {
        self.def(o).dedup = true;
        self
    }

    /// Record that `from` was relocated to `to`.
    pub fn forward(&mut self, from: ObjectRef, to: ObjectRef) -> &mut Self {
        self.forwarding.insert(from.raw(), to);
        self
    }

    /// A singly linked chain of `len` objects; returns the head.
    pub fn chain(&mut self, region: usize, len: usize) -> ObjectRef {
        let head = self.object(region, 1);
        let mut prev = head;
        for _ in 1..len {
            let next = self.object(region, 1);
            self.set(prev, 0, next);
            prev = next;
        }
        head
    }

    fn def(&mut self, o: ObjectRef) -> &mut ObjectDef {
        &mut self.objects[o.raw() - 1]
    }

    pub fn build(self) -> TestHeap {
        let n = self.objects.len();
        TestHeap {
            regions: self.regions,
            marks: MarkBitmap::new(n + 1),
            scans: (0..=n).map(|_| AtomicUsize::new(0)).collect(),
            objects: self
                .objects
                .into_iter()
                .map(|def| TestObject {
                    region: def.region,
                    size: def.size,
                    fields: def.fields.into_iter().map(RefSlot::new).collect(),
                    referent_field: def.referent_field,
                    metadata: def.metadata,
                    dedup: def.dedup,
                })
                .collect(),
            forwarding: self.forwarding,
            cancel_on_scan: OnceLock::new(),
        }
    }
}

struct TestObject {
    region: usize,
    size: usize,
    fields: Vec<RefSlot>,
    referent_field: Option<usize>,
    metadata: Option<ObjectRef>,
    dedup: bool,
}

/// An object graph with a mark bitmap, fixed at build time.
pub struct TestHeap {
    regions: usize,
    objects: Vec<TestObject>,
    marks: MarkBitmap,
    scans: Vec<AtomicUsize>,
    forwarding: HashMap<usize, ObjectRef>,
    cancel_on_scan: OnceLock<(ObjectRef, Arc<GcFlags>)>,
}

impl TestHeap {
    fn object(&self, o: ObjectRef) -> &TestObject {
        &self.objects[o.raw() - 1]
    }

    pub fn field(&self, o: ObjectRef, index: usize) -> &RefSlot {
        &self.object(o).fields[index]
    }

    /// Mutator store with the SATB pre-write barrier.
    pub fn store_field(
        &self,
        satb: &SatbQueueSet,
        log: &SatbThreadLog,
        o: ObjectRef,
        index: usize,
        value: Option<ObjectRef>,
    ) {
        let slot = self.field(o, index);
        if let Some(old) = slot.load() {
            satb.enqueue(log, old);
        }
        slot.store(value);
    }

    /// Number of times `o` was scanned as a whole object.
    pub fn scan_count(&self, o: ObjectRef) -> usize {
        self.scans[o.raw()].load(Ordering::Relaxed)
    }

    pub fn marked_count(&self) -> usize {
        self.marks.marked_count()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Allocate-black: mark `o` as a mutator would for a new object.
    pub fn allocate_marked(&self, o: ObjectRef) {
        self.marks.try_mark(o.raw());
    }

    /// Cancel the cycle through `flags` as soon as `o` is scanned.
    pub fn cancel_when_scanned(&self, o: ObjectRef, flags: Arc<GcFlags>) {
        assert!(self.cancel_on_scan.set((o, flags)).is_ok());
    }
}

impl MarkingHeap for TestHeap {
    fn try_mark(&self, obj: ObjectRef) -> bool {
        self.marks.try_mark(obj.raw())
    }

    fn is_marked(&self, obj: ObjectRef) -> bool {
        self.marks.is_marked(obj.raw())
    }

    fn fields(&self, obj: ObjectRef) -> &[RefSlot] {
        if let Some((trigger, flags)) = self.cancel_on_scan.get() {
            if *trigger == obj {
                flags.cancel_gc();
            }
        }
        &self.object(obj).fields
    }

    fn object_size(&self, obj: ObjectRef) -> usize {
        self.scans[obj.raw()].fetch_add(1, Ordering::Relaxed);
        self.object(obj).size
    }

    fn region_index(&self, obj: ObjectRef) -> usize {
        self.object(obj).region
    }

    fn region_count(&self) -> usize {
        self.regions
    }

    fn forwardee(&self, obj: ObjectRef) -> ObjectRef {
        self.forwarding.get(&obj.raw()).copied().unwrap_or(obj)
    }

    fn referent_field(&self, obj: ObjectRef) -> Option<usize> {
        self.object(obj).referent_field
    }

    fn metadata_ref(&self, obj: ObjectRef) -> Option<ObjectRef> {
        self.object(obj).metadata
    }

    fn is_dedup_candidate(&self, obj: ObjectRef) -> bool {
        self.object(obj).dedup
    }
}

// ============================================================================
// TestRoots
// ============================================================================

fn slots(objs: &[ObjectRef]) -> Vec<RefSlot> {
    objs.iter().map(|&o| RefSlot::new(Some(o))).collect()
}

/// Root sets of a fake runtime.
///
/// Thread roots are visited under every view, global roots under `Strong` and
/// `All`, class roots under `All` only.
#[derive(Default)]
pub struct TestRoots {
    pub thread_roots: Vec<RefSlot>,
    pub global_roots: Vec<RefSlot>,
    pub class_roots: Vec<RefSlot>,
    pub weak_roots: Vec<RefSlot>,
    pub code_roots: Vec<RefSlot>,
    pub thread_code_roots: Vec<(ThreadId, RefSlot)>,
    code_cache_lock: parking_lot::Mutex<()>,
    pub code_scans: AtomicUsize,
    pub code_scans_unlocked: AtomicUsize,
}

impl TestRoots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_roots(mut self, objs: &[ObjectRef]) -> Self {
        self.thread_roots = slots(objs);
        self
    }

    pub fn with_global_roots(mut self, objs: &[ObjectRef]) -> Self {
        self.global_roots = slots(objs);
        self
    }

    pub fn with_class_roots(mut self, objs: &[ObjectRef]) -> Self {
        self.class_roots = slots(objs);
        self
    }

    pub fn with_weak_roots(mut self, objs: &[ObjectRef]) -> Self {
        self.weak_roots = slots(objs);
        self
    }

    pub fn with_code_roots(mut self, objs: &[ObjectRef]) -> Self {
        self.code_roots = slots(objs);
        self
    }

    pub fn with_thread_code_root(mut self, thread: ThreadId, o: ObjectRef) -> Self {
        self.thread_code_roots.push((thread, RefSlot::new(Some(o))));
        self
    }
}

impl RootEnumerator for TestRoots {
    fn roots_do(&self, partition: RootPartition, view: RootView, f: &mut dyn FnMut(&RefSlot)) {
        let mut all: Vec<&RefSlot> = self.thread_roots.iter().collect();
        if view != RootView::Threads {
            all.extend(&self.global_roots);
        }
        if view == RootView::All {
            all.extend(&self.class_roots);
        }
        for (i, slot) in all.into_iter().enumerate() {
            if partition.owns(i) {
                f(slot);
            }
        }
    }

    fn weak_roots_do(&self, partition: RootPartition, f: &mut dyn FnMut(&RefSlot)) {
        for (i, slot) in self.weak_roots.iter().enumerate() {
            if partition.owns(i) {
                f(slot);
            }
        }
    }

    fn code_roots_do(&self, f: &mut dyn FnMut(&RefSlot)) {
        self.code_scans.fetch_add(1, Ordering::Relaxed);
        if !self.code_cache_lock.is_locked() {
            self.code_scans_unlocked.fetch_add(1, Ordering::Relaxed);
        }
        self.code_roots.iter().for_each(f);
    }

    fn code_cache_lock(&self) -> &parking_lot::Mutex<()> {
        &self.code_cache_lock
    }

    fn thread_code_roots_do(&self, thread: ThreadId, f: &mut dyn FnMut(&RefSlot)) {
        for (owner, slot) in &self.thread_code_roots {
            if *owner == thread {
                f(slot);
            }
        }
    }
}

// ============================================================================
// TestRefProc
// ============================================================================

/// What the fake processor does with references whose referent is unmarked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefPolicy {
    /// Clear the referent field (weak semantics).
    Clear,
    /// Keep the referent alive (soft semantics under no memory pressure).
    Revive,
    /// Keep the referent alive from worker 1 of the parallel task.
    ReviveInParallel,
}

pub struct TestRefProc {
    heap: Arc<TestHeap>,
    policy: RefPolicy,
    parallel_passes: usize,
    deferred: Mutex<Vec<ObjectRef>>,
    pub discovery_enabled: AtomicBool,
    pub mt_degree: AtomicUsize,
    pub discovered: Mutex<Vec<ObjectRef>>,
    pub cleared: Mutex<Vec<ObjectRef>>,
    pub serial_completions: AtomicUsize,
    pub parallel_rounds: AtomicUsize,
    pub enqueue_calls: AtomicUsize,
    pub precleaned: AtomicUsize,
}

impl TestRefProc {
    pub fn new(heap: Arc<TestHeap>, policy: RefPolicy) -> Self {
        Self {
            heap,
            policy,
            parallel_passes: 1,
            deferred: Mutex::new(Vec::new()),
            discovery_enabled: AtomicBool::new(false),
            mt_degree: AtomicUsize::new(0),
            discovered: Mutex::new(Vec::new()),
            cleared: Mutex::new(Vec::new()),
            serial_completions: AtomicUsize::new(0),
            parallel_rounds: AtomicUsize::new(0),
            enqueue_calls: AtomicUsize::new(0),
            precleaned: AtomicUsize::new(0),
        }
    }

    /// Number of `complete_gc` calls each worker makes in the parallel task.
    pub fn with_parallel_passes(mut self, passes: usize) -> Self {
        self.parallel_passes = passes;
        self
    }

    fn referent(&self, reference: ObjectRef) -> Option<ObjectRef> {
        self.heap.field(reference, 0).load()
    }
}

impl ReferenceProcessor for TestRefProc {
    fn discover_reference(&self, reference: ObjectRef, _referent: ObjectRef) -> bool {
        if !self.discovery_enabled.load(Ordering::Relaxed) {
            return false;
        }
        let mut discovered = self.discovered.lock().unwrap();
        if !discovered.contains(&reference) {
            discovered.push(reference);
        }
        true
    }

    fn enable_discovery(&self) {
        self.discovery_enabled.store(true, Ordering::Relaxed);
    }

    fn set_active_mt_degree(&self, workers: usize) {
        self.mt_degree.store(workers, Ordering::Relaxed);
    }

    fn process_discovered_references(
        &self,
        serial: &mut RefProcRound<'_>,
        executor: &RefProcExecutor<'_>,
    ) {
        let discovered = std::mem::take(&mut *self.discovered.lock().unwrap());
        for reference in discovered {
            let Some(referent) = self.referent(reference) else {
                continue;
            };
            if serial.is_alive(referent) {
                continue;
            }
            match self.policy {
                RefPolicy::Revive => serial.keep_alive(self.heap.field(reference, 0)),
                RefPolicy::Clear => {
                    self.heap.field(reference, 0).store(None);
                    self.cleared.lock().unwrap().push(reference);
                }
                RefPolicy::ReviveInParallel => {
                    self.deferred.lock().unwrap().push(reference);
                    continue;
                }
            }
            // Revived referents may make later referents reachable, so close
            // the graph after each one.
            serial.complete_gc();
        }
        serial.complete_gc();
        self.serial_completions
            .store(serial.completions(), Ordering::Relaxed);

        executor.execute(&|round| {
            for pass in 0..self.parallel_passes {
                if pass == 0 && round.worker_id() == 1 {
                    let deferred = std::mem::take(&mut *self.deferred.lock().unwrap());
                    for reference in deferred {
                        round.keep_alive(self.heap.field(reference, 0));
                    }
                }
                round.complete_gc();
                self.parallel_rounds.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    fn enqueue_discovered_references(&self, executor: &RefProcExecutor<'_>) {
        executor.execute_enqueue(&|_worker_id| {
            self.enqueue_calls.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn preclean_discovered_references(
        &self,
        round: &mut RefProcRound<'_>,
        should_yield: &dyn Fn() -> bool,
    ) {
        let mut discovered = self.discovered.lock().unwrap();
        let before = discovered.len();
        discovered.retain(|&reference| {
            if should_yield() {
                return true;
            }
            !self
                .referent(reference)
                .is_some_and(|referent| round.is_alive(referent))
        });
        drop(discovered);
        round.complete_gc();
        let after = self.discovered.lock().unwrap().len();
        self.precleaned.store(before - after, Ordering::Relaxed);
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A heap, its roots and a marking engine wired together.
pub struct Harness {
    pub heap: Arc<TestHeap>,
    pub roots: Arc<TestRoots>,
    pub satb: Arc<SatbQueueSet>,
    pub flags: Arc<GcFlags>,
    pub cm: ConcurrentMark,
}

impl Harness {
    pub fn new(heap: TestHeap, roots: TestRoots, config: MarkConfig) -> Self {
        Self::with_flags(heap, roots, config, GcFlags::new())
    }

    pub fn with_flags(heap: TestHeap, roots: TestRoots, config: MarkConfig, flags: GcFlags) -> Self {
        let heap = Arc::new(heap);
        let roots = Arc::new(roots);
        let satb = Arc::new(SatbQueueSet::new(config.satb_buffer_size));
        let flags = Arc::new(flags);
        let ctx = MarkContext::new(
            heap.clone(),
            roots.clone(),
            Arc::clone(&satb),
            Arc::clone(&flags),
        );
        Self::from_context(ctx, heap, roots, config)
    }

    pub fn from_context(
        ctx: MarkContext,
        heap: Arc<TestHeap>,
        roots: Arc<TestRoots>,
        config: MarkConfig,
    ) -> Self {
        let satb = Arc::clone(&ctx.satb);
        let flags = Arc::clone(&ctx.flags);
        Self {
            heap,
            roots,
            satb,
            flags,
            cm: ConcurrentMark::initialize(ctx, config),
        }
    }

    /// Run a full concurrent cycle that is not cancelled.
    pub fn run_cycle(&self) {
        self.cm.mark_roots(conmark::RootPhase::InitMark);
        assert!(!self.cm.mark_from_roots().is_cancelled());
        self.cm.finish_mark_from_roots(false);
    }
}

pub fn config(workers: usize) -> MarkConfig {
    let mut config = MarkConfig::new(workers);
    config.set_termination_wait(std::time::Duration::from_micros(100));
    config
}
