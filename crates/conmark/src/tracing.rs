//! Marking tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for the marking phases.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    use crate::metrics::{MarkPhase, PhaseMetrics};

    /// Stable identifier for a marking cycle.
    ///
    /// Correlates every span and event of one cycle. Starts at 1 and is bumped
    /// by each root seeding phase.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique cycle ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for one orchestrator phase.
    pub fn trace_phase(phase: MarkPhase, gc_id: GcId) -> span::EnteredSpan {
        span!(Level::DEBUG, "mark_phase", phase = ?phase, gc_id = gc_id.0).entered()
    }

    /// Log the start of a phase.
    pub fn log_phase_start(phase: MarkPhase, workers: usize) {
        tracing::debug!(phase = ?phase, workers, "phase_start");
    }

    /// Log the end of a phase with its statistics.
    pub fn log_phase_end(m: &PhaseMetrics) {
        tracing::debug!(
            phase = ?m.phase,
            workers = m.workers,
            tasks_processed = m.tasks_processed,
            objects_marked = m.objects_marked,
            steals = m.steals,
            satb_entries = m.satb_entries,
            cancelled = m.cancelled,
            "phase_end"
        );
    }

    /// Log that a worker observed cancellation and left its loop.
    pub fn log_cancelled(worker_id: usize) {
        tracing::debug!(worker_id, "mark_cancelled");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;
