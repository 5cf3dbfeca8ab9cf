//! Parallel marking machinery: task queues, termination, tracing closure and
//! the worker loop.

mod bitmap;
pub mod closure;
pub mod liveness;
pub mod queue;
pub mod terminator;
pub(crate) mod worker;
mod worklist;

pub use bitmap::MarkBitmap;
pub use closure::{MarkStrategy, UpdateRefsMode};
pub use liveness::{LiveData, LivenessTable};
pub use queue::{TaskQueue, TaskQueueSet, TASK_QUEUE_CAPACITY};
pub use terminator::TaskTerminator;
pub use worklist::StealQueue;

/// How a marking loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// Termination was declared; every queue was empty.
    Completed,
    /// The cycle was cancelled; queues may still hold tasks.
    Cancelled,
}

impl MarkOutcome {
    /// Whether the loop stopped because of cancellation.
    #[must_use]
    pub const fn is_cancelled(self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
