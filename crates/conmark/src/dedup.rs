//! String deduplication candidates found while marking.
//!
//! Deduplication itself belongs to the runtime. The marker only records newly
//! marked candidates; the runtime drains them after the cycle.

use parking_lot::Mutex;

use crate::object::ObjectRef;
use crate::workers::WorkGang;

/// Queue of deduplication candidates.
#[derive(Debug, Default)]
pub struct StringDedupQueue {
    entries: Mutex<Vec<ObjectRef>>,
}

impl StringDedupQueue {
    /// An empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Append a worker's batch of candidates.
    pub fn push_all(&self, batch: &mut Vec<ObjectRef>) {
        if !batch.is_empty() {
            self.entries.lock().append(batch);
        }
    }

    /// Number of queued candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Take every queued candidate.
    pub fn drain(&self) -> Vec<ObjectRef> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Drop candidates that did not survive marking, splitting the scan over
    /// the gang's active workers. Returns how many were dropped.
    pub fn parallel_cleanup(&self, gang: &WorkGang, is_alive: &(dyn Fn(ObjectRef) -> bool + Sync)) -> usize {
        let entries = self.drain();
        let before = entries.len();
        if before == 0 {
            return 0;
        }
        let chunk = before.div_ceil(gang.active_workers());
        let survivors = Mutex::new(Vec::with_capacity(before));
        gang.run_task(&|worker_id| {
            let Some(part) = entries.chunks(chunk).nth(worker_id) else {
                return;
            };
            let mut alive: Vec<ObjectRef> = part.iter().copied().filter(|&o| is_alive(o)).collect();
            survivors.lock().append(&mut alive);
        });
        let mut survivors = survivors.into_inner();
        let dropped = before - survivors.len();
        self.push_all(&mut survivors);
        dropped
    }
}
