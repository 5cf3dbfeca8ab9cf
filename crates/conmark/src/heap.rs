//! The heap owner's side of the marking contract.
//!
//! Region layout, allocation, evacuation and the object header encoding all
//! live outside this crate. The marking engine only needs the operations in
//! [`MarkingHeap`] and the per-cycle switches in [`GcFlags`].

use std::sync::atomic::{AtomicBool, Ordering};

use crate::object::{ObjectRef, RefSlot};

/// Object model consumed by the marking engine.
///
/// All methods may be called concurrently from every marking worker.
pub trait MarkingHeap: Sync + Send {
    /// Atomically set the mark bit of `obj`.
    ///
    /// Returns `true` only for the caller that performed the unmarked to marked
    /// transition. That caller, and no other, enqueues the object for scanning.
    fn try_mark(&self, obj: ObjectRef) -> bool;

    /// Whether `obj` is marked in the current cycle.
    fn is_marked(&self, obj: ObjectRef) -> bool;

    /// The reference fields of `obj`, in scan order.
    fn fields(&self, obj: ObjectRef) -> &[RefSlot];

    /// Size of `obj` in bytes, as accounted in the liveness table.
    fn object_size(&self, obj: ObjectRef) -> usize;

    /// Index of the region containing `obj`.
    fn region_index(&self, obj: ObjectRef) -> usize;

    /// Number of regions in the liveness table.
    fn region_count(&self) -> usize;

    /// The forwardee of `obj` if it was relocated, otherwise `obj` itself.
    fn forwardee(&self, obj: ObjectRef) -> ObjectRef {
        obj
    }

    /// For reference objects, the index of the referent field in
    /// [`MarkingHeap::fields`].
    fn referent_field(&self, _obj: ObjectRef) -> Option<usize> {
        None
    }

    /// The metadata holder (class mirror / loader) that keeps the class of
    /// `obj` alive. Traced only while classes are being unloaded.
    fn metadata_ref(&self, _obj: ObjectRef) -> Option<ObjectRef> {
        None
    }

    /// Whether `obj` should be offered for string deduplication.
    fn is_dedup_candidate(&self, _obj: ObjectRef) -> bool {
        false
    }

    /// Liveness that follows forwarding: the object is alive if its current
    /// copy is marked.
    fn is_alive(&self, obj: ObjectRef) -> bool {
        self.is_marked(self.forwardee(obj))
    }
}

/// Per-cycle switches set by the heap owner and polled by the marking engine.
///
/// The cancellation flag is monotonic within a cycle: it only goes from clear
/// to set until [`GcFlags::clear_cancelled_gc`] is called before the next one.
#[derive(Debug, Default)]
pub struct GcFlags {
    cancelled: AtomicBool,
    unload_classes: AtomicBool,
    has_forwarded_objects: AtomicBool,
    process_references: AtomicBool,
    string_dedup: AtomicBool,
    degenerated_gc: AtomicBool,
    full_gc: AtomicBool,
}

impl GcFlags {
    /// All switches off.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            unload_classes: AtomicBool::new(false),
            has_forwarded_objects: AtomicBool::new(false),
            process_references: AtomicBool::new(false),
            string_dedup: AtomicBool::new(false),
            degenerated_gc: AtomicBool::new(false),
            full_gc: AtomicBool::new(false),
        }
    }

    /// Request cancellation of the running cycle.
    ///
    /// Returns `true` if this call set the flag.
    pub fn cancel_gc(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    /// Whether the running cycle was cancelled.
    #[inline]
    pub fn cancelled_gc(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Re-arm for the next cycle.
    pub fn clear_cancelled_gc(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    /// Whether this cycle unloads classes.
    #[inline]
    pub fn unload_classes(&self) -> bool {
        self.unload_classes.load(Ordering::Acquire)
    }

    /// Turn class unloading on or off.
    pub fn set_unload_classes(&self, on: bool) {
        self.unload_classes.store(on, Ordering::Release);
    }

    /// Whether relocated objects with forwarding pointers exist.
    #[inline]
    pub fn has_forwarded_objects(&self) -> bool {
        self.has_forwarded_objects.load(Ordering::Acquire)
    }

    /// Record whether forwarded objects exist.
    pub fn set_has_forwarded_objects(&self, on: bool) {
        self.has_forwarded_objects.store(on, Ordering::Release);
    }

    /// Whether weak references are discovered and processed this cycle.
    #[inline]
    pub fn process_references(&self) -> bool {
        self.process_references.load(Ordering::Acquire)
    }

    /// Turn weak reference processing on or off.
    pub fn set_process_references(&self, on: bool) {
        self.process_references.store(on, Ordering::Release);
    }

    /// Whether string deduplication candidates are collected.
    #[inline]
    pub fn string_dedup(&self) -> bool {
        self.string_dedup.load(Ordering::Acquire)
    }

    /// Turn candidate collection on or off.
    pub fn set_string_dedup(&self, on: bool) {
        self.string_dedup.store(on, Ordering::Release);
    }

    /// Whether a degenerated cycle is running (it may skip the concurrent phase).
    #[inline]
    pub fn is_degenerated_gc_in_progress(&self) -> bool {
        self.degenerated_gc.load(Ordering::Acquire)
    }

    /// Mark a degenerated cycle as running or finished.
    pub fn set_degenerated_gc_in_progress(&self, on: bool) {
        self.degenerated_gc.store(on, Ordering::Release);
    }

    /// Whether a full collection is running.
    #[inline]
    pub fn is_full_gc_in_progress(&self) -> bool {
        self.full_gc.load(Ordering::Acquire)
    }

    /// Mark a full collection as running or finished.
    pub fn set_full_gc_in_progress(&self, on: bool) {
        self.full_gc.store(on, Ordering::Release);
    }
}
