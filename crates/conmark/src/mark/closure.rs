//! Tracing through one object: reference loading, mark-bit transition, and
//! scanning of (possibly chunked) tasks.

use crate::dedup::StringDedupQueue;
use crate::heap::{GcFlags, MarkingHeap};
use crate::mark::liveness::{LiveData, LivenessTable};
use crate::mark::queue::TaskQueue;
use crate::object::{MarkTask, ObjectRef, RefSlot};
use crate::refproc::ReferenceProcessor;

/// How reference fields are read while marking in a heap that may hold
/// forwarded objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateRefsMode {
    /// The heap is stable; take references as they are.
    None,
    /// Follow forwarding without touching the slot.
    Resolve,
    /// Follow forwarding and store the forwardee back with a plain store.
    /// Only valid while mutators are stopped.
    Simple,
    /// Follow forwarding and store the forwardee back with a compare-and-swap,
    /// so a racing mutator store is never lost.
    Concurrent,
}

/// The tracing variant used by one marking loop, chosen once per phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkStrategy {
    /// Reference loading mode for fields of scanned objects.
    pub update_refs: UpdateRefsMode,
    /// Also mark each object's metadata holder.
    pub unload_classes: bool,
    /// Record string deduplication candidates.
    pub dedup: bool,
}

impl MarkStrategy {
    /// The strategy for a marking loop under the current `flags`.
    #[must_use]
    pub fn select(flags: &GcFlags, dedup: bool) -> Self {
        Self {
            update_refs: if flags.has_forwarded_objects() {
                UpdateRefsMode::Concurrent
            } else {
                UpdateRefsMode::None
            },
            unload_classes: flags.unload_classes(),
            dedup: dedup && flags.string_dedup(),
        }
    }

    /// A strategy that only marks, for root seeding and keep-alive.
    #[must_use]
    pub const fn plain(update_refs: UpdateRefsMode) -> Self {
        Self {
            update_refs,
            unload_classes: false,
            dedup: false,
        }
    }
}

/// Read `slot` under `mode`, rewriting it to the forwardee where the mode asks
/// for it.
#[inline]
pub fn load_ref(heap: &dyn MarkingHeap, slot: &RefSlot, mode: UpdateRefsMode) -> Option<ObjectRef> {
    let obj = slot.load()?;
    match mode {
        UpdateRefsMode::None => Some(obj),
        UpdateRefsMode::Resolve => Some(heap.forwardee(obj)),
        UpdateRefsMode::Simple => {
            let fwd = heap.forwardee(obj);
            if fwd != obj {
                slot.store(Some(fwd));
            }
            Some(fwd)
        }
        UpdateRefsMode::Concurrent => {
            let fwd = heap.forwardee(obj);
            if fwd == obj {
                return Some(obj);
            }
            match slot.compare_exchange(Some(obj), Some(fwd)) {
                Ok(_) => Some(fwd),
                // A mutator stored something else; trace whatever is there now.
                Err(witness) => witness.map(|w| heap.forwardee(w)),
            }
        }
    }
}

/// A worker's tracing state for one marking loop.
pub struct MarkClosure<'a> {
    heap: &'a dyn MarkingHeap,
    queue: &'a TaskQueue,
    strategy: MarkStrategy,
    rp: Option<&'a dyn ReferenceProcessor>,
    chunk_size: usize,
    live: LiveData,
    dedup: Vec<ObjectRef>,
    marked: usize,
}

impl<'a> MarkClosure<'a> {
    /// A closure that pushes newly marked objects to `queue`.
    pub fn new(
        heap: &'a dyn MarkingHeap,
        queue: &'a TaskQueue,
        strategy: MarkStrategy,
        rp: Option<&'a dyn ReferenceProcessor>,
        chunk_size: usize,
    ) -> Self {
        Self {
            heap,
            queue,
            strategy,
            rp,
            chunk_size: chunk_size.max(2),
            live: LiveData::new(heap.region_count()),
            dedup: Vec::new(),
            marked: 0,
        }
    }

    /// The strategy this closure traces with.
    #[must_use]
    pub const fn strategy(&self) -> MarkStrategy {
        self.strategy
    }

    /// Mark bits flipped by this closure so far.
    #[must_use]
    pub const fn marked(&self) -> usize {
        self.marked
    }

    /// Load `slot` under `mode` and mark its referent.
    #[inline]
    pub fn mark_through_ref(&mut self, slot: &RefSlot, mode: UpdateRefsMode) {
        if let Some(obj) = load_ref(self.heap, slot, mode) {
            self.mark_obj(obj);
        }
    }

    /// Flip the mark bit of `obj`; the winner of the flip enqueues it.
    #[inline]
    pub fn mark_obj(&mut self, obj: ObjectRef) {
        if self.heap.try_mark(obj) {
            self.marked += 1;
            self.queue.push(MarkTask::new(obj));
            if self.strategy.dedup && self.heap.is_dedup_candidate(obj) {
                self.dedup.push(obj);
            }
        }
    }

    /// Scan one task.
    pub fn do_task(&mut self, task: MarkTask) {
        let heap = self.heap;
        let obj = task.obj();
        let fields = heap.fields(obj);
        match task.range() {
            None => {
                self.live.count(heap.region_index(obj), heap.object_size(obj));
                if self.strategy.unload_classes {
                    if let Some(holder) = heap.metadata_ref(obj) {
                        self.mark_obj(holder);
                    }
                }
                if fields.len() > self.chunk_size {
                    let chunked = fields.len().min(MarkTask::MAX_CHUNKED_FIELDS);
                    if chunked < fields.len() {
                        self.scan_fields(obj, fields, chunked..fields.len());
                    }
                    self.do_chunked(obj, 0..chunked);
                } else {
                    self.scan_fields(obj, fields, 0..fields.len());
                }
            }
            Some(range) => {
                debug_assert!(range.end <= fields.len(), "chunk past object end");
                self.do_chunked(obj, range);
            }
        }
    }

    /// Halve `range` until it fits one chunk, handing off every upper half as
    /// a separate task, then scan what is left.
    fn do_chunked(&mut self, obj: ObjectRef, mut range: std::ops::Range<usize>) {
        while range.len() > self.chunk_size {
            let mid = range.start + range.len() / 2;
            self.queue.push(MarkTask::chunk(obj, mid..range.end));
            range.end = mid;
        }
        let heap = self.heap;
        self.scan_fields(obj, heap.fields(obj), range);
    }

    fn scan_fields(&mut self, obj: ObjectRef, fields: &[RefSlot], range: std::ops::Range<usize>) {
        let referent = self.discovery_field(obj);
        let mode = self.strategy.update_refs;
        for index in range {
            let slot = &fields[index];
            if Some(index) == referent && self.try_discover(obj, slot, mode) {
                continue;
            }
            self.mark_through_ref(slot, mode);
        }
    }

    fn discovery_field(&self, obj: ObjectRef) -> Option<usize> {
        self.rp.and_then(|_| self.heap.referent_field(obj))
    }

    /// Offer a reference object to the processor if its referent is not yet
    /// known to be alive. Returns `true` if the referent must not be traced.
    fn try_discover(&self, reference: ObjectRef, slot: &RefSlot, mode: UpdateRefsMode) -> bool {
        let Some(rp) = self.rp else {
            return false;
        };
        let Some(referent) = load_ref(self.heap, slot, mode) else {
            return false;
        };
        !self.heap.is_marked(referent) && rp.discover_reference(reference, referent)
    }

    /// Merge liveness and deduplication candidates into the shared tables.
    /// Returns the number of mark bits flipped.
    pub fn flush(mut self, liveness: &LivenessTable, dedup: &StringDedupQueue) -> usize {
        self.live.flush(liveness);
        dedup.push_all(&mut self.dedup);
        self.marked
    }
}
