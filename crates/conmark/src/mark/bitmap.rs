//! Atomic mark bits for heap owners.
//!
//! [`MarkingHeap::try_mark`](crate::heap::MarkingHeap::try_mark) must report
//! the unmarked to marked transition to exactly one caller. A heap that keeps
//! its mark bits outside the object header can delegate to [`MarkBitmap`],
//! whose [`MarkBitmap::try_mark`] has that contract.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// One mark bit per object slot.
///
/// # Example
///
/// ```
/// use conmark::mark::MarkBitmap;
///
/// let bitmap = MarkBitmap::new(128);
/// assert!(bitmap.try_mark(3));
/// assert!(!bitmap.try_mark(3));
/// assert!(bitmap.is_marked(3));
/// assert_eq!(bitmap.marked_count(), 1);
/// ```
#[derive(Debug)]
pub struct MarkBitmap {
    words: Box<[AtomicU64]>,
    capacity: usize,
    marked_count: AtomicUsize,
}

impl MarkBitmap {
    /// A bitmap with room for `capacity` slots, all unmarked.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            words: (0..capacity.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
            capacity,
            marked_count: AtomicUsize::new(0),
        }
    }

    /// Number of slots covered.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots marked since the last [`MarkBitmap::clear`].
    #[must_use]
    pub fn marked_count(&self) -> usize {
        self.marked_count.load(Ordering::Relaxed)
    }

    /// Atomically set the bit of `index`.
    ///
    /// Returns `true` only for the caller that flipped the bit.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn try_mark(&self, index: usize) -> bool {
        assert!(index < self.capacity, "mark index {index} out of bounds");
        let mask = 1u64 << (index % 64);
        // AcqRel: the winner's later field reads must not float above the flip,
        // and losers must see the winner's prior writes.
        let prev = self.words[index / 64].fetch_or(mask, Ordering::AcqRel);
        if prev & mask == 0 {
            self.marked_count.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Whether `index` is marked.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    #[must_use]
    pub fn is_marked(&self, index: usize) -> bool {
        assert!(index < self.capacity, "mark index {index} out of bounds");
        (self.words[index / 64].load(Ordering::Acquire) >> (index % 64)) & 1 != 0
    }

    /// Clear all marks for the next cycle. Not safe against concurrent marking.
    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
        self.marked_count.store(0, Ordering::Relaxed);
    }
}
