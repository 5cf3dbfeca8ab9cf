//! The concurrent marking orchestrator.
//!
//! A cycle runs through these phases, driven by the heap owner:
//!
//! 1. [`ConcurrentMark::mark_roots`] (paused): seed each worker's queue from
//!    its partition of the roots, and activate the write barrier.
//! 2. [`ConcurrentMark::mark_from_roots`] (concurrent): trace with all active
//!    workers while mutators run. Cancellable.
//! 3. [`ConcurrentMark::preclean_weak_refs`] (concurrent, optional).
//! 4. [`ConcurrentMark::finish_mark_from_roots`] (paused): drain what the
//!    write barrier logged, close the marking, process weak references and
//!    weak roots.
//!
//! Degenerated and full collections skip step 2 and let step 4 drain the
//! seeded queues. They may call [`ConcurrentMark::update_roots`] to rewrite
//! roots that still point at relocated objects.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::MarkConfig;
use crate::dedup::StringDedupQueue;
use crate::heap::{GcFlags, MarkingHeap};
use crate::mark::closure::{load_ref, MarkClosure, MarkStrategy, UpdateRefsMode};
use crate::mark::liveness::LivenessTable;
use crate::mark::queue::{TaskQueue, TaskQueueSet};
use crate::mark::terminator::TaskTerminator;
use crate::mark::worker::{drain_satb, mark_loop, MarkEnv};
use crate::mark::MarkOutcome;
use crate::metrics::{MarkPhase, MarkStats, PhaseMetrics, PhaseTimer, WorkerStats};
use crate::object::{ObjectRef, RefSlot};
use crate::refproc::{RefProcExecutor, RefProcRound, ReferenceProcessor};
use crate::roots::{ClaimFlag, RootEnumerator, RootPartition, RootPhase, RootView};
use crate::satb::{SatbQueueSet, SatbThreadLog};
use crate::tracing::internal::next_gc_id;
use crate::tracing::GcId;
use crate::workers::WorkGang;

#[cfg(feature = "tracing")]
use crate::tracing::internal::{log_phase_end, log_phase_start, trace_phase};

/// The collaborators of the marking engine, shared with the heap owner.
#[derive(Clone)]
pub struct MarkContext {
    /// Object model and mark bits.
    pub heap: Arc<dyn MarkingHeap>,
    /// Root sources.
    pub roots: Arc<dyn RootEnumerator>,
    /// Write-barrier log.
    pub satb: Arc<SatbQueueSet>,
    /// Per-cycle switches, including cancellation.
    pub flags: Arc<GcFlags>,
    /// Per-region live bytes, filled by marking.
    pub liveness: Arc<LivenessTable>,
    /// Weak reference processor, used while `flags.process_references()`.
    pub ref_processor: Option<Arc<dyn ReferenceProcessor>>,
    /// Collected string deduplication candidates.
    pub dedup: Arc<StringDedupQueue>,
}

impl MarkContext {
    /// A context with a fresh liveness table sized to `heap`, an empty dedup
    /// queue and no reference processor.
    pub fn new(
        heap: Arc<dyn MarkingHeap>,
        roots: Arc<dyn RootEnumerator>,
        satb: Arc<SatbQueueSet>,
        flags: Arc<GcFlags>,
    ) -> Self {
        let liveness = Arc::new(LivenessTable::new(heap.region_count()));
        Self {
            heap,
            roots,
            satb,
            flags,
            liveness,
            ref_processor: None,
            dedup: Arc::new(StringDedupQueue::new()),
        }
    }

    /// Install a reference processor.
    #[must_use]
    pub fn with_ref_processor(mut self, rp: Arc<dyn ReferenceProcessor>) -> Self {
        self.ref_processor = Some(rp);
        self
    }
}

/// The concurrent marking engine.
pub struct ConcurrentMark {
    ctx: MarkContext,
    config: MarkConfig,
    queues: TaskQueueSet,
    gang: WorkGang,
    claimed_codecache: ClaimFlag,
    stats: MarkStats,
    cycle_metrics: Mutex<Vec<PhaseMetrics>>,
    gc_id: AtomicU64,
}

impl ConcurrentMark {
    /// Build the engine: one task queue per possible worker and a gang of
    /// `config.max_workers` workers.
    #[must_use]
    pub fn initialize(ctx: MarkContext, config: MarkConfig) -> Self {
        let num_queues = config.max_workers.max(1);
        ctx.satb.set_buffer_capacity(config.satb_buffer_size);
        Self {
            queues: TaskQueueSet::new(num_queues, config.steal_attempts_multiplier),
            gang: WorkGang::new("conmark", num_queues),
            ctx,
            config,
            claimed_codecache: ClaimFlag::new(),
            stats: MarkStats::new(),
            cycle_metrics: Mutex::new(Vec::new()),
            gc_id: AtomicU64::new(0),
        }
    }

    /// The shared collaborators.
    #[must_use]
    pub const fn context(&self) -> &MarkContext {
        &self.ctx
    }

    /// The configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &MarkConfig {
        &self.config
    }

    /// The task queues.
    #[must_use]
    pub const fn task_queues(&self) -> &TaskQueueSet {
        &self.queues
    }

    /// The worker gang; its active worker count sizes every phase.
    #[must_use]
    pub const fn workers(&self) -> &WorkGang {
        &self.gang
    }

    /// The queue of `worker_id`, which must be within the current
    /// reservation.
    #[must_use]
    pub fn get_queue(&self, worker_id: usize) -> &TaskQueue {
        debug_assert!(
            worker_id < self.queues.reserved(),
            "no reserved queue for worker {worker_id}"
        );
        self.queues.queue(worker_id)
    }

    /// Metrics of every phase since the last [`ConcurrentMark::mark_roots`].
    #[must_use]
    pub fn cycle_metrics(&self) -> Vec<PhaseMetrics> {
        self.cycle_metrics.lock().clone()
    }

    /// Identifier of the current cycle.
    #[must_use]
    pub fn current_gc_id(&self) -> GcId {
        GcId(self.gc_id.load(Ordering::Relaxed))
    }

    /// Claim the deferred code root scan. Exactly one caller per cycle wins.
    pub fn claim_codecache(&self) -> bool {
        self.claimed_codecache.try_set()
    }

    /// Re-arm the code root claim.
    pub fn clear_claim_codecache(&self) {
        self.claimed_codecache.unset();
    }

    // ========================================================================
    // Root phases
    // ========================================================================

    /// Seed the task queues from the roots. Mutators must be stopped.
    ///
    /// Starts a new cycle: the liveness table and the cycle metrics are
    /// cleared. With class unloading only strong roots are scanned, otherwise
    /// all of them, weak roots included. Code roots are left to the one-shot
    /// deferred scan.
    pub fn mark_roots(&self, phase: RootPhase) {
        debug_assert!(!phase.is_update(), "{phase:?} does not mark");
        self.cycle_metrics.lock().clear();
        self.gc_id.store(next_gc_id().0, Ordering::Relaxed);
        self.ctx.liveness.clear();

        let n = self.gang.active_workers();
        self.run_phase(MarkPhase::InitMark, n, || {
            debug_assert!(n <= self.queues.size(), "more workers than queues");
            self.queues.reserve(n);

            let mode = self.resolve_mode();
            let view = if self.ctx.flags.unload_classes() {
                RootView::Strong
            } else {
                RootView::All
            };
            self.gang.run_task(&|worker_id| {
                debug_assert!(self.queues.reserved() > worker_id);
                let partition = RootPartition::new(worker_id, n);
                self.with_root_closure(worker_id, mode, |cl| {
                    self.ctx.roots.roots_do(partition, view, &mut |slot| {
                        cl.mark_through_ref(slot, mode);
                    });
                    if view == RootView::All {
                        self.ctx.roots.weak_roots_do(partition, &mut |slot| {
                            cl.mark_through_ref(slot, mode);
                        });
                    }
                });
            });

            self.clear_claim_codecache();
            if phase == RootPhase::InitMark {
                self.ctx.satb.set_active(true);
            }
        });
    }

    /// Rewrite every root that still points at a relocated object. No marking
    /// happens. Dead weak roots are cleared.
    pub fn update_roots(&self, phase: RootPhase) {
        debug_assert!(phase.is_update(), "{phase:?} is not an update phase");
        let n = self.gang.active_workers();
        self.run_phase(MarkPhase::UpdateRoots, n, || {
            let heap = self.ctx.heap.as_ref();
            let update = |slot: &RefSlot| {
                load_ref(heap, slot, UpdateRefsMode::Simple);
            };
            self.gang.run_task(&|worker_id| {
                let partition = RootPartition::new(worker_id, n);
                self.ctx.roots.roots_do(partition, RootView::Strong, &mut |slot| update(slot));
                self.ctx.roots.weak_roots_do(partition, &mut |slot| match slot.load() {
                    Some(obj) if self.is_alive(obj) => update(slot),
                    Some(_) => slot.store(None),
                    None => {}
                });
                if worker_id == 0 {
                    self.ctx.roots.code_roots_do(&mut |slot| update(slot));
                }
            });
        });
    }

    /// Rewrite thread-stack roots that still point at relocated objects.
    pub fn update_thread_roots(&self, phase: RootPhase) {
        debug_assert!(phase.is_update(), "{phase:?} is not an update phase");
        let n = self.gang.active_workers();
        self.run_phase(MarkPhase::UpdateThreadRoots, n, || {
            let heap = self.ctx.heap.as_ref();
            self.gang.run_task(&|worker_id| {
                self.ctx.roots.roots_do(
                    RootPartition::new(worker_id, n),
                    RootView::Threads,
                    &mut |slot| {
                        load_ref(heap, slot, UpdateRefsMode::Simple);
                    },
                );
            });
        });
    }

    // ========================================================================
    // Marking phases
    // ========================================================================

    /// Trace concurrently with the mutators until the graph is closed or the
    /// cycle is cancelled.
    ///
    /// On [`MarkOutcome::Cancelled`] the queues may still hold tasks; the
    /// caller is expected to [`ConcurrentMark::cancel`] or to fall back to a
    /// degenerated cycle.
    pub fn mark_from_roots(&self) -> MarkOutcome {
        let n = self.gang.active_workers();
        self.run_phase(MarkPhase::ConcurrentMark, n, || {
            let rp = self.active_ref_processor();
            if let Some(rp) = rp {
                rp.set_active_mt_degree(n);
                rp.enable_discovery();
            }

            self.queues.reserve(n);
            let terminator = TaskTerminator::new(n, self.config.termination_wait);
            let env = self.env();
            let dedup = self.ctx.flags.string_dedup();
            self.gang.run_task(&|worker_id| {
                self.concurrent_scan_code_roots(worker_id);
                mark_loop(&env, worker_id, &terminator, rp, true, dedup);
            });

            let cancelled = self.ctx.flags.cancelled_gc();
            debug_assert!(
                cancelled || self.queues.is_empty(),
                "queues must be empty when not cancelled"
            );
            if cancelled {
                MarkOutcome::Cancelled
            } else {
                MarkOutcome::Completed
            }
        })
    }

    /// Close the marking in a pause, then process weak references, weak roots
    /// and deduplication candidates.
    ///
    /// After a concurrent cycle the queues start empty and the write-barrier
    /// log supplies the remaining work. After [`ConcurrentMark::mark_roots`] of
    /// a degenerated or full collection the seeded queues are drained here.
    pub fn finish_mark_from_roots(&self, full_gc: bool) {
        let n = self.gang.active_workers();
        self.run_phase(MarkPhase::FinalMark, n, || {
            self.queues.reserve(n);
            let terminator = TaskTerminator::new(n, self.config.termination_wait);
            let epoch = self.ctx.satb.start_claim_round();
            let logs = self.ctx.satb.thread_logs();
            let scan_code_roots = full_gc
                || self.ctx.flags.is_degenerated_gc_in_progress()
                || self.ctx.flags.is_full_gc_in_progress();
            self.gang.run_task(&|worker_id| {
                self.final_mark_work(worker_id, &terminator, epoch, &logs, scan_code_roots);
            });
            debug_assert!(self.queues.is_empty(), "queues must be empty after final mark");
        });

        self.ctx.satb.set_active(false);

        if self.ctx.flags.process_references() {
            if let Some(rp) = self.ctx.ref_processor.as_deref() {
                self.weak_refs_work(rp);
            }
        }

        if self.ctx.flags.unload_classes() {
            // Weak roots are not marked through when classes are unloaded.
            self.weak_roots_work();
        } else if self.ctx.flags.string_dedup() {
            self.ctx
                .dedup
                .parallel_cleanup(&self.gang, &|obj| self.is_alive(obj));
        }
        debug_assert!(self.queues.is_empty(), "queues must be empty after final mark");
    }

    fn final_mark_work(
        &self,
        worker_id: usize,
        terminator: &TaskTerminator,
        epoch: u64,
        logs: &[Arc<SatbThreadLog>],
        scan_code_roots: bool,
    ) {
        let env = self.env();
        let rp = self.active_ref_processor();
        let dedup = self.ctx.flags.string_dedup();

        // Drain every write-barrier buffer, completed or partial, and walk the
        // code active on each thread when classes are unloaded.
        {
            let mode = self.resolve_mode();
            let resolve = mode == UpdateRefsMode::Resolve;
            let mut strategy = MarkStrategy::plain(mode);
            strategy.dedup = dedup;
            let mut cl = MarkClosure::new(
                env.heap,
                self.queues.queue(worker_id),
                strategy,
                rp,
                self.config.array_chunk_size,
            );
            let mut stats = WorkerStats::default();
            drain_satb(&env, &mut cl, &mut stats);

            let thread_code_roots = self.ctx.flags.unload_classes();
            for log in logs {
                if !log.try_claim(epoch) {
                    continue;
                }
                stats.satb_entries += self.ctx.satb.apply_closure_and_empty(log, |obj| {
                    cl.mark_obj(if resolve { env.heap.forwardee(obj) } else { obj });
                });
                if thread_code_roots && !log.is_shared() {
                    self.ctx.roots.thread_code_roots_do(log.id(), &mut |slot| {
                        cl.mark_through_ref(slot, mode);
                    });
                }
            }
            stats.objects_marked += cl.flush(env.liveness, env.dedup);
            self.stats.merge(&stats);
        }

        if scan_code_roots {
            // Degenerated and full cycles may have bypassed the concurrent
            // phase that normally scans code roots.
            self.concurrent_scan_code_roots(worker_id);
        }

        mark_loop(&env, worker_id, terminator, rp, false, dedup);
    }

    /// Let the reference processor revisit references discovered during
    /// concurrent marking whose referents have since been marked. Runs on a
    /// single worker, concurrently with mutators, and stops on cancellation.
    pub fn preclean_weak_refs(&self) -> MarkOutcome {
        debug_assert!(self.ctx.flags.process_references(), "nothing to preclean");
        let Some(rp) = self.active_ref_processor() else {
            return MarkOutcome::Completed;
        };
        debug_assert!(self.queues.is_empty(), "queues must be empty before preclean");
        debug_assert!(
            !self.ctx.flags.has_forwarded_objects(),
            "no forwarded objects expected while precleaning"
        );

        self.run_phase(MarkPhase::Preclean, 1, || {
            self.queues.reserve(1);
            let terminator = TaskTerminator::new(1, self.config.termination_wait);
            let flags = self.ctx.flags.as_ref();
            {
                let mut round = RefProcRound::new(self.env(), rp, 0, &terminator);
                rp.preclean_discovered_references(&mut round, &|| flags.cancelled_gc());
            }
            if flags.cancelled_gc() {
                MarkOutcome::Cancelled
            } else {
                debug_assert!(self.queues.is_empty(), "queues must be empty after preclean");
                MarkOutcome::Completed
            }
        })
    }

    /// Abandon the cycle: drop every queued task and every logged write-barrier
    /// entry.
    pub fn cancel(&self) {
        self.queues.clear();
        self.ctx.satb.abandon_partial_marking();
    }

    // ========================================================================
    // Weak references and weak roots
    // ========================================================================

    fn weak_refs_work(&self, rp: &dyn ReferenceProcessor) {
        let n = self.gang.active_workers();
        self.run_phase(MarkPhase::WeakRefs, n, || {
            rp.set_active_mt_degree(n);
            debug_assert!(self.queues.is_empty(), "queues must be empty before weak refs");

            // The serial path shares worker 0's queue.
            let terminator = TaskTerminator::new(1, self.config.termination_wait);
            let env = self.env();
            let executor = RefProcExecutor::new(env, rp, &self.gang);
            {
                let mut serial = RefProcRound::new(env, rp, 0, &terminator);
                rp.process_discovered_references(&mut serial, &executor);
            }
            debug_assert!(self.queues.is_empty(), "queues must be empty after weak refs");

            rp.enqueue_discovered_references(&executor);
        });
    }

    fn weak_roots_work(&self) {
        let n = self.gang.active_workers();
        self.run_phase(MarkPhase::WeakRoots, n, || {
            self.gang.run_task(&|worker_id| {
                self.ctx
                    .roots
                    .weak_roots_do(RootPartition::new(worker_id, n), &mut |slot| {
                        if slot.load().is_some_and(|obj| !self.is_alive(obj)) {
                            slot.store(None);
                        }
                    });
            });
        });
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Scan code roots if this worker wins the one-shot claim. Unless classes
    /// are unloaded, the scan holds the code cache lock.
    fn concurrent_scan_code_roots(&self, worker_id: usize) {
        if !self.claim_codecache() || self.ctx.flags.unload_classes() {
            return;
        }
        let _guard = self.ctx.roots.code_cache_lock().lock();
        // No deduplication here: candidates found under the code cache lock
        // are skipped.
        let mode = self.resolve_mode();
        self.with_root_closure(worker_id, mode, |cl| {
            self.ctx
                .roots
                .code_roots_do(&mut |slot| cl.mark_through_ref(slot, mode));
        });
    }

    fn with_root_closure(
        &self,
        worker_id: usize,
        mode: UpdateRefsMode,
        walk: impl FnOnce(&mut MarkClosure<'_>),
    ) {
        let mut cl = MarkClosure::new(
            self.ctx.heap.as_ref(),
            self.queues.queue(worker_id),
            MarkStrategy::plain(mode),
            None,
            self.config.array_chunk_size,
        );
        walk(&mut cl);
        let marked = cl.flush(&self.ctx.liveness, &self.ctx.dedup);
        self.stats.merge(&WorkerStats {
            objects_marked: marked,
            ..WorkerStats::default()
        });
    }

    fn resolve_mode(&self) -> UpdateRefsMode {
        if self.ctx.flags.has_forwarded_objects() {
            UpdateRefsMode::Resolve
        } else {
            UpdateRefsMode::None
        }
    }

    fn is_alive(&self, obj: ObjectRef) -> bool {
        if self.ctx.flags.has_forwarded_objects() {
            self.ctx.heap.is_alive(obj)
        } else {
            self.ctx.heap.is_marked(obj)
        }
    }

    fn active_ref_processor(&self) -> Option<&dyn ReferenceProcessor> {
        if self.ctx.flags.process_references() {
            self.ctx.ref_processor.as_deref()
        } else {
            None
        }
    }

    fn env(&self) -> MarkEnv<'_> {
        MarkEnv {
            heap: self.ctx.heap.as_ref(),
            flags: &self.ctx.flags,
            satb: &self.ctx.satb,
            queues: &self.queues,
            liveness: &self.ctx.liveness,
            dedup: &self.ctx.dedup,
            stats: &self.stats,
            config: &self.config,
        }
    }

    fn run_phase<R>(&self, phase: MarkPhase, workers: usize, body: impl FnOnce() -> R) -> R {
        #[cfg(feature = "tracing")]
        let _span = trace_phase(phase, self.current_gc_id());
        #[cfg(feature = "tracing")]
        log_phase_start(phase, workers);

        let timer = PhaseTimer::start(phase, workers);
        let result = body();
        let metrics = timer.finish(&self.stats, self.ctx.flags.cancelled_gc());

        #[cfg(feature = "tracing")]
        log_phase_end(&metrics);

        self.cycle_metrics.lock().push(metrics);
        result
    }
}

impl std::fmt::Debug for ConcurrentMark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentMark")
            .field("config", &self.config)
            .field("queues", &self.queues)
            .field("gang", &self.gang)
            .finish_non_exhaustive()
    }
}
