//! Snapshot-at-the-beginning write-barrier log.
//!
//! While marking is active, every mutator logs the old value of a reference
//! field before overwriting it. Those pre-overwrite values are exactly the
//! edges that could hide a snapshot-reachable object from the tracer, so all of
//! them must be traced before marking may finish.
//!
//! Each registered thread owns a [`SatbThreadLog`] with a partial buffer. A
//! buffer that reaches capacity is handed to the shared FIFO of completed
//! buffers, which marking workers drain concurrently. Partial buffers are only
//! drained in the final pause, where every log is claimed exactly once per
//! round through an epoch counter.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, RwLock};

use crate::object::ObjectRef;

/// Identifier of a registered mutator thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub usize);

impl ThreadId {
    /// The id of the shared log used by non-mutator threads.
    pub const SHARED: Self = Self(0);
}

/// The per-thread part of the log.
#[derive(Debug)]
pub struct SatbThreadLog {
    id: ThreadId,
    buffer: Mutex<Vec<ObjectRef>>,
    claimed_epoch: AtomicU64,
}

impl SatbThreadLog {
    fn new(id: ThreadId) -> Self {
        Self {
            id,
            buffer: Mutex::new(Vec::new()),
            claimed_epoch: AtomicU64::new(0),
        }
    }

    /// Owning thread.
    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }

    /// Whether this is the log shared by non-mutator threads.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.id == ThreadId::SHARED
    }

    /// Entries sitting in the partial buffer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Claim this log for claim round `epoch`.
    ///
    /// Exactly one caller per epoch gets `true`.
    pub fn try_claim(&self, epoch: u64) -> bool {
        self.claimed_epoch.swap(epoch, Ordering::AcqRel) != epoch
    }
}

/// The global write-barrier log.
#[derive(Debug)]
pub struct SatbQueueSet {
    active: AtomicBool,
    buffer_capacity: AtomicUsize,
    completed: SegQueue<Vec<ObjectRef>>,
    threads: RwLock<Vec<Arc<SatbThreadLog>>>,
    next_thread_id: AtomicUsize,
    claim_epoch: AtomicU64,
}

impl SatbQueueSet {
    /// An inactive log whose thread buffers complete at `buffer_capacity`
    /// entries.
    #[must_use]
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            active: AtomicBool::new(false),
            buffer_capacity: AtomicUsize::new(buffer_capacity.max(1)),
            completed: SegQueue::new(),
            threads: RwLock::new(vec![Arc::new(SatbThreadLog::new(ThreadId::SHARED))]),
            next_thread_id: AtomicUsize::new(1),
            claim_epoch: AtomicU64::new(0),
        }
    }

    /// Entries per thread buffer.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity.load(Ordering::Relaxed)
    }

    /// Change the buffer capacity. Buffers already filling keep going until
    /// they reach the new capacity.
    pub fn set_buffer_capacity(&self, capacity: usize) {
        self.buffer_capacity.store(capacity.max(1), Ordering::Relaxed);
    }

    /// Whether mutators currently log overwritten references.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Turn the barrier on at the start of marking, off once marking completed.
    pub fn set_active(&self, active: bool) {
        debug_assert!(
            active || self.completed.is_empty(),
            "deactivating the write barrier with undrained buffers"
        );
        self.active.store(active, Ordering::Release);
    }

    /// Register a mutator thread and hand back its log.
    pub fn register_thread(&self) -> Arc<SatbThreadLog> {
        let id = ThreadId(self.next_thread_id.fetch_add(1, Ordering::Relaxed));
        let log = Arc::new(SatbThreadLog::new(id));
        self.threads.write().push(Arc::clone(&log));
        log
    }

    /// Remove a mutator thread. Its partial buffer is published first so no
    /// logged entry is lost.
    pub fn deregister_thread(&self, log: &SatbThreadLog) {
        self.flush(log);
        self.threads.write().retain(|t| t.id != log.id);
    }

    /// The log used by non-mutator threads.
    pub fn shared_log(&self) -> Arc<SatbThreadLog> {
        Arc::clone(&self.threads.read()[0])
    }

    /// Snapshot of every registered log, the shared one first.
    pub fn thread_logs(&self) -> Vec<Arc<SatbThreadLog>> {
        self.threads.read().clone()
    }

    /// Log the pre-overwrite value `obj` on behalf of `log`'s thread.
    ///
    /// A no-op while the barrier is inactive.
    pub fn enqueue(&self, log: &SatbThreadLog, obj: ObjectRef) {
        if !self.is_active() {
            return;
        }
        let capacity = self.buffer_capacity();
        let mut buffer = log.buffer.lock();
        buffer.push(obj);
        if buffer.len() >= capacity {
            let full = std::mem::replace(&mut *buffer, Vec::with_capacity(capacity));
            self.completed.push(full);
        }
    }

    /// Publish `log`'s partial buffer as a completed buffer.
    pub fn flush(&self, log: &SatbThreadLog) {
        let mut buffer = log.buffer.lock();
        if !buffer.is_empty() {
            self.completed.push(std::mem::take(&mut *buffer));
        }
    }

    /// Number of completed buffers not yet drained.
    #[inline]
    pub fn completed_buffers_num(&self) -> usize {
        self.completed.len()
    }

    /// Pop one completed buffer and feed each entry to `f`.
    ///
    /// Returns `false` if there was no completed buffer.
    pub fn apply_closure_to_completed_buffer(&self, mut f: impl FnMut(ObjectRef)) -> bool {
        match self.completed.pop() {
            Some(buffer) => {
                buffer.into_iter().for_each(&mut f);
                true
            }
            None => false,
        }
    }

    /// Drain `log`'s partial buffer through `f`.
    ///
    /// Returns the number of entries drained.
    pub fn apply_closure_and_empty(&self, log: &SatbThreadLog, mut f: impl FnMut(ObjectRef)) -> usize {
        let entries = std::mem::take(&mut *log.buffer.lock());
        let n = entries.len();
        entries.into_iter().for_each(&mut f);
        n
    }

    /// Open a new claim round over the thread logs.
    pub fn start_claim_round(&self) -> u64 {
        self.claim_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop every completed and partial buffer after a cancelled cycle.
    pub fn abandon_partial_marking(&self) {
        while self.completed.pop().is_some() {}
        for log in self.threads.read().iter() {
            log.buffer.lock().clear();
        }
    }
}
