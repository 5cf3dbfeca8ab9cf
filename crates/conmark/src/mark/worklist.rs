//! Work-stealing deque backing each marking task queue.
//!
//! The owner pushes and pops at the bottom (LIFO, for cache locality); thieves
//! take from the top (FIFO, away from the owner's end).
//!
//! Built with `--cfg loom`, the index atomics and fences come from loom so its
//! model checker can permute them.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
#[cfg(loom)]
use loom::sync::atomic::{fence, AtomicUsize, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

/// Lock-free work stealing queue.
///
/// Based on: "Simple and Efficient Work-Stealing Queues for Parallel Programming"
/// by Chase and Lev (2005), with the fences of "Correct and Efficient
/// Work-Stealing for Weak Memory Models" (Lê et al., 2013).
///
/// # Invariants
///
/// - `N` must be a power of 2
/// - `mask = N - 1`
/// - Queue is empty when `bottom == top`
/// - Queue is full when `bottom - top == N`
/// - Size is always `bottom - top` (modulo arithmetic)
///
/// Only one thread, the owner, may call [`StealQueue::push`] and
/// [`StealQueue::pop`] at any time. [`StealQueue::steal`] may be called from
/// any number of threads concurrently with the owner.
pub struct StealQueue<T: Copy, const N: usize> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    bottom: CachePadded<AtomicUsize>,
    top: CachePadded<AtomicUsize>,
    mask: usize,
}

impl<T: Copy, const N: usize> StealQueue<T, N> {
    /// Create a new steal queue.
    ///
    /// # Panics
    ///
    /// Panics if `N` is not a power of 2.
    #[must_use]
    pub fn new() -> Self {
        assert!(
            N.is_power_of_two(),
            "StealQueue size N must be a power of 2"
        );

        Self {
            buffer: (0..N).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect(),
            bottom: CachePadded::new(AtomicUsize::new(0)),
            top: CachePadded::new(AtomicUsize::new(0)),
            mask: N - 1,
        }
    }

    /// Push an item to the local end (LIFO).
    ///
    /// Returns `false` if the queue is full. Owner only.
    pub fn push(&self, item: T) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);

        if b.wrapping_sub(t) >= N {
            return false;
        }

        // SAFETY: slot `b` is outside the stealable window [t, b), and only the
        // owner writes slots.
        unsafe {
            (*self.buffer[b & self.mask].get()).write(item);
        }

        // Publish the slot before the new bottom becomes visible to thieves.
        self.bottom.store(b.wrapping_add(1), Ordering::Release);
        true
    }

    /// Pop an item from the local end (LIFO). Owner only.
    pub fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed).wrapping_sub(1);
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        #[allow(clippy::cast_possible_wrap)]
        let size = b.wrapping_sub(t) as isize;
        if size < 0 {
            self.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
            return None;
        }

        // SAFETY: [t, b] is non-empty so slot `b` was written by push.
        let item = unsafe { (*self.buffer[b & self.mask].get()).assume_init_read() };
        if size > 0 {
            return Some(item);
        }

        // Last item: race thieves for it on top.
        let won = self
            .top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
        won.then_some(item)
    }

    /// Steal an item from the remote end (FIFO).
    ///
    /// Returns `None` if the queue is empty or another thread won the race for
    /// the top item.
    pub fn steal(&self) -> Option<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        #[allow(clippy::cast_possible_wrap)]
        let size = b.wrapping_sub(t) as isize;
        if size <= 0 {
            return None;
        }

        // Read before claiming: once top moves the owner may reuse the slot.
        // A stale read is discarded when the CAS below fails.
        // SAFETY: the slot was published by a Release store of bottom that the
        // Acquire load above synchronized with.
        let item = unsafe { std::ptr::read_volatile(self.buffer[t & self.mask].get()) };

        if self
            .top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }

        // SAFETY: the CAS made us the unique consumer of slot `t`.
        Some(unsafe { item.assume_init() })
    }

    /// Get the current size of the queue.
    ///
    /// Racy when called off the owner thread; exact when the queue is quiescent.
    #[must_use]
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Acquire);
        let t = self.top.load(Ordering::Acquire);
        #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
        let len = (b.wrapping_sub(t) as isize).max(0) as usize;
        len
    }

    /// Check if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if the queue is full.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= N
    }

    /// Drop every item. The queue must be quiescent.
    pub fn clear(&self) {
        let t = self.top.load(Ordering::Acquire);
        self.bottom.store(t, Ordering::Release);
    }
}

impl<T: Copy, const N: usize> Default for StealQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy, const N: usize> std::fmt::Debug for StealQueue<T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StealQueue")
            .field("capacity", &N)
            .field("len", &self.len())
            .finish()
    }
}

// SAFETY: StealQueue is safe to share between threads because:
// - Push/pop are owner-only and touch slots outside the stealable window
// - Steal claims a slot with a CAS on top, so each item is consumed once
// - bottom/top publication uses Release/Acquire plus SeqCst fences
unsafe impl<T: Copy + Send, const N: usize> Send for StealQueue<T, N> {}

// SAFETY: See Send impl
unsafe impl<T: Copy + Send, const N: usize> Sync for StealQueue<T, N> {}
