//! Per-worker marking task queues and the set that owns them.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::worklist::StealQueue;
use crate::object::MarkTask;

/// Capacity of the stealable part of each task queue.
pub const TASK_QUEUE_CAPACITY: usize = 1 << 14;

/// A per-worker queue of [`MarkTask`]s.
///
/// Tasks are pushed to the local end (LIFO) for cache efficiency and stolen
/// from the remote end (FIFO). When the stealable buffer is full, tasks spill
/// into an owner-only overflow stack, so `push` never fails.
#[derive(Debug)]
pub struct TaskQueue {
    queue: StealQueue<MarkTask, TASK_QUEUE_CAPACITY>,
    /// Only the worker currently owning the queue touches this stack; the lock
    /// is uncontended and exists to keep the queue `Sync`.
    overflow: Mutex<Vec<MarkTask>>,
    overflow_len: AtomicUsize,
}

impl TaskQueue {
    /// Create an empty task queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: StealQueue::new(),
            overflow: Mutex::new(Vec::new()),
            overflow_len: AtomicUsize::new(0),
        }
    }

    /// Push a task onto this queue. Owner only.
    #[inline]
    pub fn push(&self, task: MarkTask) {
        if !self.queue.push(task) {
            let mut overflow = self.overflow.lock();
            overflow.push(task);
            self.overflow_len.store(overflow.len(), Ordering::Release);
        }
    }

    /// Pop the most recently pushed task. Owner only.
    #[inline]
    pub fn pop(&self) -> Option<MarkTask> {
        self.queue.pop().or_else(|| self.pop_overflow())
    }

    fn pop_overflow(&self) -> Option<MarkTask> {
        if self.overflow_len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut overflow = self.overflow.lock();
        let task = overflow.pop();
        self.overflow_len.store(overflow.len(), Ordering::Release);
        task
    }

    /// Steal the oldest task in the stealable buffer.
    ///
    /// Safe to race against the owner's [`TaskQueue::pop`]. Overflowed tasks
    /// are not stealable; the owner drains them.
    #[inline]
    pub fn steal(&self) -> Option<MarkTask> {
        self.queue.steal()
    }

    /// Number of queued tasks, overflow included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len() + self.overflow_len.load(Ordering::Acquire)
    }

    /// Whether the queue holds no tasks, overflow included.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.overflow_len.load(Ordering::Acquire) == 0
    }

    /// Drop every task. Only valid while no worker is running.
    pub fn clear(&self) {
        self.queue.clear();
        let mut overflow = self.overflow.lock();
        overflow.clear();
        self.overflow_len.store(0, Ordering::Release);
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// All marking task queues, indexed by worker id.
///
/// Sized to the largest worker count ever used. Each phase reserves the first
/// `n` queues for its `n` active workers; the remaining "extra" queues may
/// still hold tasks from a phase that ran with more workers and are handed out
/// one at a time through [`TaskQueueSet::claim_next`].
#[derive(Debug)]
pub struct TaskQueueSet {
    queues: Box<[TaskQueue]>,
    reserved: AtomicUsize,
    claimed: AtomicUsize,
    steal_attempts_multiplier: usize,
}

impl TaskQueueSet {
    /// Create a set of `count` empty queues.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    #[must_use]
    pub fn new(count: usize, steal_attempts_multiplier: usize) -> Self {
        assert!(count > 0, "TaskQueueSet needs at least one queue");
        Self {
            queues: (0..count).map(|_| TaskQueue::new()).collect(),
            reserved: AtomicUsize::new(count),
            claimed: AtomicUsize::new(count),
            steal_attempts_multiplier: steal_attempts_multiplier.max(1),
        }
    }

    /// Total number of queues.
    #[must_use]
    pub fn size(&self) -> usize {
        self.queues.len()
    }

    /// Declare the first `n` queues active for the next phase and make the rest
    /// claimable.
    ///
    /// Must be called before workers start; the worker gang's spawn provides
    /// the happens-before edge.
    pub fn reserve(&self, n: usize) {
        debug_assert!(
            n > 0 && n <= self.size(),
            "reserve({n}) outside 1..={}",
            self.size()
        );
        self.reserved.store(n, Ordering::Release);
        self.claimed.store(n, Ordering::Release);
    }

    /// Number of queues reserved for the current phase.
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    /// The queue owned by worker `worker_id`.
    ///
    /// # Panics
    ///
    /// Panics if `worker_id` is outside the set.
    #[inline]
    #[must_use]
    pub fn queue(&self, worker_id: usize) -> &TaskQueue {
        &self.queues[worker_id]
    }

    /// Atomically hand out one not-yet-claimed extra queue.
    ///
    /// Returns `None` once every queue past the reservation was claimed.
    pub fn claim_next(&self) -> Option<&TaskQueue> {
        let size = self.size();
        if self.claimed.load(Ordering::Relaxed) >= size {
            return None;
        }
        let index = self.claimed.fetch_add(1, Ordering::AcqRel);
        self.queues.get(index)
    }

    /// Try to steal one task for `worker_id` from some other queue.
    ///
    /// Victims are picked best-of-two from a per-worker xorshift `seed`, so
    /// concurrent thieves spread over different queues.
    pub fn steal(&self, worker_id: usize, seed: &mut u32) -> Option<MarkTask> {
        let n = self.size();
        if n < 2 {
            return None;
        }
        for _ in 0..self.steal_attempts_multiplier * n {
            let victim = self.pick_victim(worker_id, seed);
            if let Some(task) = self.queues[victim].steal() {
                return Some(task);
            }
        }
        // Random probing missed; sweep once so visible work is never overlooked.
        (1..n).find_map(|k| self.queues[(worker_id + k) % n].steal())
    }

    fn pick_victim(&self, worker_id: usize, seed: &mut u32) -> usize {
        let n = self.size();
        if n == 2 {
            return 1 - worker_id.min(1);
        }
        let pick = |seed: &mut u32| loop {
            let k = next_random(seed) as usize % n;
            if k != worker_id {
                break k;
            }
        };
        let a = pick(seed);
        let b = pick(seed);
        if self.queues[a].len() >= self.queues[b].len() {
            a
        } else {
            b
        }
    }

    /// Whether every queue in the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(TaskQueue::is_empty)
    }

    /// Total queued tasks across the set.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.queues.iter().map(TaskQueue::len).sum()
    }

    /// Drop every task in every queue. Only valid while no worker is running.
    pub fn clear(&self) {
        for q in self.queues.iter() {
            q.clear();
        }
    }
}

/// Marsaglia xorshift, as used for victim selection in parallel GC task queues.
#[inline]
fn next_random(seed: &mut u32) -> u32 {
    let mut x = *seed;
    if x == 0 {
        x = 17;
    }
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *seed = x;
    x
}
