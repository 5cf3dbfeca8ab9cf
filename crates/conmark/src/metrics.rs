//! Marking metrics and statistics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Orchestrator phases recorded in the cycle log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkPhase {
    /// Stop-the-world root seeding.
    InitMark,
    /// Concurrent tracing.
    ConcurrentMark,
    /// Stop-the-world close-out.
    FinalMark,
    /// Weak reference processing.
    WeakRefs,
    /// Clearing of dead weak roots.
    WeakRoots,
    /// Concurrent weak reference precleaning.
    Preclean,
    /// Root reference rewriting.
    UpdateRoots,
    /// Thread-root reference rewriting.
    UpdateThreadRoots,
}

/// Statistics from one orchestrator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseMetrics {
    /// The phase.
    pub phase: MarkPhase,
    /// Active workers that ran it.
    pub workers: usize,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Tasks taken from queues and processed.
    pub tasks_processed: usize,
    /// Objects whose mark bit this phase flipped.
    pub objects_marked: usize,
    /// Tasks obtained by stealing.
    pub steals: usize,
    /// Write-barrier log entries drained.
    pub satb_entries: usize,
    /// Times a worker offered termination.
    pub termination_offers: usize,
    /// Whether the phase observed cancellation.
    pub cancelled: bool,
}

/// Counters a single worker keeps privately during one marking loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Tasks processed.
    pub tasks: usize,
    /// Mark bits flipped.
    pub objects_marked: usize,
    /// Successful steals.
    pub steals: usize,
    /// Write-barrier entries drained.
    pub satb_entries: usize,
    /// Termination offers.
    pub termination_offers: usize,
}

/// Shared counters for the phase in progress.
///
/// Workers merge their [`WorkerStats`] once, when their loop exits.
#[derive(Debug, Default)]
pub struct MarkStats {
    tasks: AtomicUsize,
    objects_marked: AtomicUsize,
    steals: AtomicUsize,
    satb_entries: AtomicUsize,
    termination_offers: AtomicUsize,
}

impl MarkStats {
    /// All counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tasks: AtomicUsize::new(0),
            objects_marked: AtomicUsize::new(0),
            steals: AtomicUsize::new(0),
            satb_entries: AtomicUsize::new(0),
            termination_offers: AtomicUsize::new(0),
        }
    }

    /// Add one worker's counters.
    pub fn merge(&self, w: &WorkerStats) {
        self.tasks.fetch_add(w.tasks, Ordering::Relaxed);
        self.objects_marked.fetch_add(w.objects_marked, Ordering::Relaxed);
        self.steals.fetch_add(w.steals, Ordering::Relaxed);
        self.satb_entries.fetch_add(w.satb_entries, Ordering::Relaxed);
        self.termination_offers
            .fetch_add(w.termination_offers, Ordering::Relaxed);
    }

    /// Read and zero every counter.
    pub fn take(&self) -> WorkerStats {
        WorkerStats {
            tasks: self.tasks.swap(0, Ordering::Relaxed),
            objects_marked: self.objects_marked.swap(0, Ordering::Relaxed),
            steals: self.steals.swap(0, Ordering::Relaxed),
            satb_entries: self.satb_entries.swap(0, Ordering::Relaxed),
            termination_offers: self.termination_offers.swap(0, Ordering::Relaxed),
        }
    }
}

/// Times one phase and turns the shared counters into a [`PhaseMetrics`].
#[derive(Debug)]
pub struct PhaseTimer {
    phase: MarkPhase,
    workers: usize,
    start: Instant,
}

impl PhaseTimer {
    /// Start timing `phase` run by `workers` workers.
    #[must_use]
    pub fn start(phase: MarkPhase, workers: usize) -> Self {
        Self {
            phase,
            workers,
            start: Instant::now(),
        }
    }

    /// Stop the timer, draining `stats`.
    #[must_use]
    pub fn finish(self, stats: &MarkStats, cancelled: bool) -> PhaseMetrics {
        let counters = stats.take();
        PhaseMetrics {
            phase: self.phase,
            workers: self.workers,
            duration: self.start.elapsed(),
            tasks_processed: counters.tasks,
            objects_marked: counters.objects_marked,
            steals: counters.steals,
            satb_entries: counters.satb_entries,
            termination_offers: counters.termination_offers,
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MarkPhase, MarkStats, PhaseTimer, WorkerStats};

    #[test]
    fn test_merge_and_take() {
        let stats = MarkStats::new();
        let w = WorkerStats {
            tasks: 3,
            objects_marked: 2,
            steals: 1,
            satb_entries: 4,
            termination_offers: 1,
        };
        stats.merge(&w);
        stats.merge(&w);

        let m = PhaseTimer::start(MarkPhase::FinalMark, 2).finish(&stats, false);
        assert_eq!(m.phase, MarkPhase::FinalMark);
        assert_eq!(m.tasks_processed, 6);
        assert_eq!(m.satb_entries, 8);
        assert!(!m.cancelled);

        assert_eq!(stats.take(), WorkerStats::default());
    }
}
