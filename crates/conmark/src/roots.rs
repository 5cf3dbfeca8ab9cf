//! Root enumeration contract and root-phase bookkeeping.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::object::RefSlot;
use crate::satb::ThreadId;

// ============================================================================
// Root selection
// ============================================================================

/// Which root sources an enumeration visits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootView {
    /// Only roots that keep their referents strongly alive. Used when classes
    /// are being unloaded, so dead classes can be identified.
    Strong,
    /// Strong roots plus the roots that only keep class metadata alive.
    ///
    /// No view covers the roots of [`RootEnumerator::weak_roots_do`]; the
    /// engine walks those separately.
    All,
    /// Only thread stacks.
    Threads,
}

/// The root phase a stop-the-world root walk runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootPhase {
    /// Seeding of a concurrent cycle.
    InitMark,
    /// Seeding of a degenerated cycle.
    DegeneratedMark,
    /// Seeding of a full collection.
    FullGcMark,
    /// Reference rewriting of a degenerated cycle.
    DegeneratedUpdateRoots,
    /// Reference rewriting of a full collection.
    FullGcUpdateRoots,
}

impl RootPhase {
    /// Whether this phase rewrites references instead of marking.
    #[must_use]
    pub const fn is_update(self) -> bool {
        matches!(self, Self::DegeneratedUpdateRoots | Self::FullGcUpdateRoots)
    }
}

/// One worker's share of a parallel root walk.
///
/// Enumerators must hand every root source to exactly one partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootPartition {
    /// The calling worker.
    pub worker_id: usize,
    /// Number of workers sharing the walk.
    pub n_workers: usize,
}

impl RootPartition {
    /// Partition `worker_id` of `n_workers`.
    #[must_use]
    pub const fn new(worker_id: usize, n_workers: usize) -> Self {
        Self {
            worker_id,
            n_workers,
        }
    }

    /// Round-robin ownership of the `index`-th root source.
    #[must_use]
    pub const fn owns(self, index: usize) -> bool {
        index % self.n_workers == self.worker_id
    }
}

// ============================================================================
// RootEnumerator - supplied by the runtime
// ============================================================================

/// Root sources of the managed runtime.
///
/// Code roots (references embedded in compiled code) are never part of
/// [`RootEnumerator::roots_do`]; the marker walks them separately through
/// [`RootEnumerator::code_roots_do`] so it can defer the walk.
pub trait RootEnumerator: Sync + Send {
    /// Visit this partition's roots under `view`.
    fn roots_do(&self, partition: RootPartition, view: RootView, f: &mut dyn FnMut(&RefSlot));

    /// Visit this partition's weakly held roots.
    ///
    /// These are not part of any [`RootView`]. Without class unloading they
    /// are marked through while seeding, like strong roots. With it they are
    /// left unmarked and cleaned once marking finishes.
    fn weak_roots_do(&self, _partition: RootPartition, _f: &mut dyn FnMut(&RefSlot)) {}

    /// Visit every reference embedded in compiled code.
    ///
    /// Called with [`RootEnumerator::code_cache_lock`] held when the code
    /// store may not be unloaded concurrently.
    fn code_roots_do(&self, _f: &mut dyn FnMut(&RefSlot)) {}

    /// Lock that keeps the code store stable during a concurrent walk.
    fn code_cache_lock(&self) -> &Mutex<()>;

    /// Visit the references of the compiled code active on `thread`.
    fn thread_code_roots_do(&self, _thread: ThreadId, _f: &mut dyn FnMut(&RefSlot)) {}
}

/// A flag that exactly one caller can set until it is unset again.
#[derive(Debug, Default)]
pub struct ClaimFlag(AtomicBool);

impl ClaimFlag {
    /// An unset flag.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Set the flag. Returns `true` only for the caller that set it.
    pub fn try_set(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear the flag for the next round.
    pub fn unset(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Whether the flag is set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
