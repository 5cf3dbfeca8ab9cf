//! Integration with an external weak reference processor.
//!
//! The processor decides the fate of discovered reference objects. To do that
//! it needs three services from the marker, provided by [`RefProcRound`]:
//!
//! - [`RefProcRound::is_alive`] answers liveness, following forwarding when the
//!   heap holds relocated objects.
//! - [`RefProcRound::keep_alive`] revives a referent and queues it for tracing.
//! - [`RefProcRound::complete_gc`] drains the queues again, because reviving one
//!   referent can make other undecided referents reachable.
//!
//! A processor may call `complete_gc` any number of times. In a parallel task
//! the workers share one terminator, so each of them must make the same number
//! of calls; every call forms one termination round.

use crate::mark::closure::{load_ref, UpdateRefsMode};
use crate::mark::terminator::TaskTerminator;
use crate::mark::worker::{mark_loop, MarkEnv};
use crate::mark::MarkOutcome;
use crate::metrics::WorkerStats;
use crate::object::{MarkTask, ObjectRef, RefSlot};
use crate::workers::WorkGang;

/// The reference processing engine of the runtime.
pub trait ReferenceProcessor: Sync + Send {
    /// Called while tracing `reference` when its referent is not yet marked.
    ///
    /// Return `true` to take ownership of the reference; the marker then does
    /// not trace its referent field.
    fn discover_reference(&self, reference: ObjectRef, referent: ObjectRef) -> bool;

    /// Turn discovery on at the start of concurrent marking.
    fn enable_discovery(&self) {}

    /// The number of workers that will run parallel processing tasks.
    fn set_active_mt_degree(&self, _workers: usize) {}

    /// Decide every discovered reference.
    ///
    /// `serial` runs on worker 0's queue with a single-worker terminator.
    /// Parallel phases go through `executor`.
    fn process_discovered_references(&self, serial: &mut RefProcRound<'_>, executor: &RefProcExecutor<'_>);

    /// Hand cleared references over to the runtime.
    fn enqueue_discovered_references(&self, _executor: &RefProcExecutor<'_>) {}

    /// Drop discovered references whose referents became reachable.
    ///
    /// Runs concurrently with mutators on a single worker. Must return as soon
    /// as `should_yield` reports `true`.
    fn preclean_discovered_references(&self, _round: &mut RefProcRound<'_>, _should_yield: &dyn Fn() -> bool) {}
}

/// One worker's view of a reference processing round.
pub struct RefProcRound<'a> {
    env: MarkEnv<'a>,
    rp: &'a dyn ReferenceProcessor,
    worker_id: usize,
    terminator: &'a TaskTerminator,
    keep_alive_mode: UpdateRefsMode,
    revived: usize,
    completions: usize,
}

impl<'a> RefProcRound<'a> {
    pub(crate) fn new(
        env: MarkEnv<'a>,
        rp: &'a dyn ReferenceProcessor,
        worker_id: usize,
        terminator: &'a TaskTerminator,
    ) -> Self {
        let keep_alive_mode = if env.flags.has_forwarded_objects() {
            UpdateRefsMode::Simple
        } else {
            UpdateRefsMode::None
        };
        Self {
            env,
            rp,
            worker_id,
            terminator,
            keep_alive_mode,
            revived: 0,
            completions: 0,
        }
    }

    /// The worker this round runs on.
    #[must_use]
    pub const fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Number of [`RefProcRound::complete_gc`] calls so far.
    #[must_use]
    pub const fn completions(&self) -> usize {
        self.completions
    }

    /// Whether `obj` survived marking.
    #[must_use]
    pub fn is_alive(&self, obj: ObjectRef) -> bool {
        if self.env.flags.has_forwarded_objects() {
            self.env.heap.is_alive(obj)
        } else {
            self.env.heap.is_marked(obj)
        }
    }

    /// Mark the referent held in `slot` reachable and queue it for tracing.
    ///
    /// When the heap holds forwarded objects the slot is updated to the
    /// forwardee.
    pub fn keep_alive(&mut self, slot: &RefSlot) {
        if let Some(obj) = load_ref(self.env.heap, slot, self.keep_alive_mode) {
            self.keep_alive_obj(obj);
        }
    }

    /// Mark `obj` reachable and queue it for tracing.
    pub fn keep_alive_obj(&mut self, obj: ObjectRef) {
        let obj = self.env.heap.forwardee(obj);
        if self.env.heap.try_mark(obj) {
            self.env.queues.queue(self.worker_id).push(MarkTask::new(obj));
            self.revived += 1;
        }
    }

    /// Trace everything reachable from revived referents.
    pub fn complete_gc(&mut self) {
        let outcome = mark_loop(&self.env, self.worker_id, self.terminator, Some(self.rp), false, false);
        debug_assert_eq!(outcome, MarkOutcome::Completed);
        self.completions += 1;
    }
}

impl Drop for RefProcRound<'_> {
    fn drop(&mut self) {
        if self.revived > 0 {
            self.env.stats.merge(&WorkerStats {
                objects_marked: self.revived,
                ..WorkerStats::default()
            });
        }
    }
}

/// Runs reference processing tasks on the marking workers.
pub struct RefProcExecutor<'a> {
    env: MarkEnv<'a>,
    rp: &'a dyn ReferenceProcessor,
    gang: &'a WorkGang,
}

impl<'a> RefProcExecutor<'a> {
    pub(crate) const fn new(env: MarkEnv<'a>, rp: &'a dyn ReferenceProcessor, gang: &'a WorkGang) -> Self {
        Self { env, rp, gang }
    }

    /// Number of workers a task runs on.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.gang.active_workers()
    }

    /// Run a processing task on every active worker.
    ///
    /// All workers share one terminator, so their `complete_gc` calls
    /// terminate together, round after round.
    pub fn execute(&self, task: &(dyn Fn(&mut RefProcRound<'_>) + Sync)) {
        let n = self.gang.active_workers();
        self.env.queues.reserve(n);
        let terminator = TaskTerminator::new(n, self.env.config.termination_wait);
        self.gang.run_task(&|worker_id| {
            let mut round = RefProcRound::new(self.env, self.rp, worker_id, &terminator);
            task(&mut round);
        });
    }

    /// Run an enqueue task on every active worker.
    pub fn execute_enqueue(&self, task: &(dyn Fn(usize) + Sync)) {
        self.gang.run_task(task);
    }
}
