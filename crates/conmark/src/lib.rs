//! A concurrent, work-stealing marking engine for region-based collectors.
//!
//! `conmark` computes the set of live objects while mutator threads keep
//! running. It implements snapshot-at-the-beginning (SATB) marking: every
//! object reachable when marking starts, or allocated after, is found.
//!
//! The heap owner plugs in through three traits:
//!
//! - [`MarkingHeap`]: mark bits, object fields, sizes and forwarding.
//! - [`RootEnumerator`]: strong, weak and code roots.
//! - [`ReferenceProcessor`]: optional weak reference semantics.
//!
//! and drives a cycle through [`ConcurrentMark`].
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use conmark::{ConcurrentMark, GcFlags, MarkConfig, MarkContext, RootPhase, SatbQueueSet};
//!
//! let satb = Arc::new(SatbQueueSet::new(1024));
//! let flags = Arc::new(GcFlags::new());
//! let ctx = MarkContext::new(heap, roots, Arc::clone(&satb), Arc::clone(&flags));
//! let cm = ConcurrentMark::initialize(ctx, MarkConfig::new(4));
//!
//! cm.mark_roots(RootPhase::InitMark);       // paused
//! if cm.mark_from_roots().is_cancelled() {  // concurrent
//!     cm.cancel();
//! } else {
//!     cm.finish_mark_from_roots(false);     // paused
//! }
//! ```
//!
//! # Write barrier
//!
//! While [`SatbQueueSet::is_active`] reports `true`, mutators must log the old
//! value of every reference field they overwrite through
//! [`SatbQueueSet::enqueue`]. Objects allocated during marking must be created
//! marked.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod concurrent_mark;
pub mod config;
pub mod dedup;
pub mod heap;
pub mod mark;
pub mod metrics;
pub mod object;
pub mod refproc;
pub mod roots;
pub mod satb;
pub mod tracing;
pub mod workers;

pub use concurrent_mark::{ConcurrentMark, MarkContext};
pub use config::MarkConfig;
pub use dedup::StringDedupQueue;
pub use heap::{GcFlags, MarkingHeap};
pub use mark::{LivenessTable, MarkBitmap, MarkOutcome, MarkStrategy, UpdateRefsMode};
pub use metrics::{MarkPhase, PhaseMetrics};
pub use object::{MarkTask, ObjectRef, RefSlot};
pub use refproc::{RefProcExecutor, RefProcRound, ReferenceProcessor};
pub use roots::{RootEnumerator, RootPartition, RootPhase, RootView};
pub use satb::{SatbQueueSet, SatbThreadLog, ThreadId};
pub use workers::WorkGang;
