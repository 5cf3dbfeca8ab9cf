//! Object handles, reference slots and mark tasks.
//!
//! The marking engine never dereferences objects itself. It sees the heap
//! through [`ObjectRef`] handles and reads or rewrites reference fields through
//! [`RefSlot`]s handed out by the heap owner.

use std::fmt;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A non-null handle to a heap object.
///
/// The encoding is owned by the heap: it may be an address or an index, the
/// marking engine only compares and forwards it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    /// Wrap a raw non-zero handle. Returns `None` for the null handle.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: usize) -> Option<Self> {
        match NonZeroUsize::new(raw) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// The raw handle value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0)
    }
}

/// A reference field that may be read and rewritten concurrently.
///
/// Zero encodes null. Mutators store through the same slot, so every access is
/// atomic; the update-references marking mode relies on
/// [`RefSlot::compare_exchange`] to avoid losing a racing mutator store.
#[derive(Default)]
#[repr(transparent)]
pub struct RefSlot(AtomicUsize);

impl RefSlot {
    /// Create a slot holding `value`.
    #[must_use]
    pub const fn new(value: Option<ObjectRef>) -> Self {
        Self(AtomicUsize::new(encode(value)))
    }

    /// Load the current referent.
    #[inline]
    pub fn load(&self) -> Option<ObjectRef> {
        ObjectRef::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Store a new referent.
    #[inline]
    pub fn store(&self, value: Option<ObjectRef>) {
        self.0.store(encode(value), Ordering::Release);
    }

    /// Replace `current` with `new` if the slot still holds `current`.
    ///
    /// On failure returns the value actually found.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Option<ObjectRef>,
        new: Option<ObjectRef>,
    ) -> Result<Option<ObjectRef>, Option<ObjectRef>> {
        self.0
            .compare_exchange(
                encode(current),
                encode(new),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(ObjectRef::from_raw)
            .map_err(ObjectRef::from_raw)
    }
}

impl fmt::Debug for RefSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefSlot").field(&self.load()).finish()
    }
}

#[inline]
const fn encode(value: Option<ObjectRef>) -> usize {
    match value {
        Some(obj) => obj.raw(),
        None => 0,
    }
}

/// One unit of tracing work.
///
/// A task either names a whole object or a sub-range of its reference fields.
/// Ranged tasks are produced only by splitting a large object, so a given
/// `(object, range)` pair is created at most once per cycle: the whole-object
/// task exists only after the object's mark bit flipped, and every split
/// partitions its parent range.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MarkTask {
    obj: ObjectRef,
    start: u32,
    /// Zero means "whole object".
    end: u32,
}

impl MarkTask {
    /// A task covering the whole object.
    #[inline]
    #[must_use]
    pub const fn new(obj: ObjectRef) -> Self {
        Self {
            obj,
            start: 0,
            end: 0,
        }
    }

    /// Highest field index a chunk can address. Fields past it are scanned
    /// with their object instead of being split off.
    pub const MAX_CHUNKED_FIELDS: usize = u32::MAX as usize;

    /// A task covering the reference fields `range` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `range.end` exceeds [`MarkTask::MAX_CHUNKED_FIELDS`], and in
    /// debug builds if the range is empty.
    #[inline]
    #[must_use]
    pub fn chunk(obj: ObjectRef, range: Range<usize>) -> Self {
        debug_assert!(range.start < range.end, "empty chunk {range:?}");
        assert!(
            range.end <= Self::MAX_CHUNKED_FIELDS,
            "chunk {range:?} past field {}",
            Self::MAX_CHUNKED_FIELDS
        );
        #[allow(clippy::cast_possible_truncation)]
        let (start, end) = (range.start as u32, range.end as u32);
        Self { obj, start, end }
    }

    /// The object to scan.
    #[inline]
    #[must_use]
    pub const fn obj(&self) -> ObjectRef {
        self.obj
    }

    /// The field range, or `None` for a whole-object task.
    #[inline]
    #[must_use]
    pub const fn range(&self) -> Option<Range<usize>> {
        if self.end == 0 {
            None
        } else {
            Some(self.start as usize..self.end as usize)
        }
    }
}

impl fmt::Debug for MarkTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.range() {
            None => write!(f, "MarkTask({:?})", self.obj),
            Some(r) => write!(f, "MarkTask({:?}[{}..{}])", self.obj, r.start, r.end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MarkTask, ObjectRef, RefSlot};

    #[test]
    fn test_object_ref_null() {
        assert!(ObjectRef::from_raw(0).is_none());
        assert_eq!(ObjectRef::from_raw(8).map(ObjectRef::raw), Some(8));
    }

    #[test]
    fn test_slot_compare_exchange() {
        let a = ObjectRef::from_raw(1);
        let b = ObjectRef::from_raw(2);
        let slot = RefSlot::new(a);

        assert_eq!(slot.compare_exchange(b, None), Err(a));
        assert_eq!(slot.compare_exchange(a, b), Ok(a));
        assert_eq!(slot.load(), b);
    }

    #[test]
    fn test_task_range() {
        let obj = ObjectRef::from_raw(16).unwrap();
        assert_eq!(MarkTask::new(obj).range(), None);
        assert_eq!(MarkTask::chunk(obj, 4..9).range(), Some(4..9));
        assert!(std::mem::size_of::<MarkTask>() <= 16);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    #[should_panic(expected = "past field")]
    fn test_chunk_bound_does_not_truncate() {
        let obj = ObjectRef::from_raw(16).unwrap();
        let end = MarkTask::MAX_CHUNKED_FIELDS + 1;
        let _ = MarkTask::chunk(obj, end - 4..end);
    }
}
