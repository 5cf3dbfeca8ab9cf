//! The marking worker loop.

use super::closure::{MarkClosure, MarkStrategy};
use super::queue::TaskQueueSet;
use super::terminator::TaskTerminator;
use super::MarkOutcome;
use crate::config::MarkConfig;
use crate::dedup::StringDedupQueue;
use crate::heap::{GcFlags, MarkingHeap};
use crate::mark::liveness::LivenessTable;
use crate::metrics::{MarkStats, WorkerStats};
use crate::refproc::ReferenceProcessor;
use crate::satb::SatbQueueSet;

/// Everything a marking loop touches besides its own closure.
#[derive(Clone, Copy)]
pub(crate) struct MarkEnv<'a> {
    pub heap: &'a dyn MarkingHeap,
    pub flags: &'a GcFlags,
    pub satb: &'a SatbQueueSet,
    pub queues: &'a TaskQueueSet,
    pub liveness: &'a LivenessTable,
    pub dedup: &'a StringDedupQueue,
    pub stats: &'a MarkStats,
    pub config: &'a MarkConfig,
}

/// Run the marking loop of `worker_id` until `terminator` declares
/// termination or, when `cancellable`, the cycle is cancelled.
///
/// Liveness, deduplication candidates and statistics are flushed exactly once,
/// on the way out, whichever way the loop ends.
pub(crate) fn mark_loop(
    env: &MarkEnv<'_>,
    worker_id: usize,
    terminator: &TaskTerminator,
    rp: Option<&dyn ReferenceProcessor>,
    cancellable: bool,
    dedup: bool,
) -> MarkOutcome {
    debug_assert!(
        worker_id < env.queues.reserved(),
        "no reserved queue for worker {worker_id}"
    );
    let strategy = MarkStrategy::select(env.flags, dedup);
    let mut cl = MarkClosure::new(
        env.heap,
        env.queues.queue(worker_id),
        strategy,
        rp,
        env.config.array_chunk_size,
    );
    let mut stats = WorkerStats::default();

    let outcome = mark_loop_work(env, &mut cl, &mut stats, worker_id, terminator, cancellable);

    stats.objects_marked += cl.flush(env.liveness, env.dedup);
    env.stats.merge(&stats);

    #[cfg(feature = "tracing")]
    if outcome.is_cancelled() {
        crate::tracing::internal::log_cancelled(worker_id);
    }

    outcome
}

fn mark_loop_work(
    env: &MarkEnv<'_>,
    cl: &mut MarkClosure<'_>,
    stats: &mut WorkerStats,
    worker_id: usize,
    terminator: &TaskTerminator,
    cancellable: bool,
) -> MarkOutcome {
    let stride = env.config.mark_loop_stride.max(1);
    let queues = env.queues;
    let cancelled = || cancellable && env.flags.cancelled_gc();

    // There can be more queues than workers. Claim and drain the extra ones
    // first; new tasks go to our own queue, which the normal loop handles.
    let mut claimed = queues.claim_next();
    while let Some(q) = claimed {
        if cancelled() {
            return MarkOutcome::Cancelled;
        }
        for _ in 0..stride {
            if let Some(task) = q.pop() {
                cl.do_task(task);
                stats.tasks += 1;
            } else {
                debug_assert!(q.is_empty(), "claimed queue must be drained");
                claimed = queues.claim_next();
                break;
            }
        }
    }

    let q = queues.queue(worker_id);
    #[allow(clippy::cast_possible_truncation)]
    let mut seed = 17u32.wrapping_add(worker_id as u32);
    let abort = || env.flags.cancelled_gc();
    let never = || false;
    let should_abort: &dyn Fn() -> bool = if cancellable { &abort } else { &never };

    loop {
        if cancelled() {
            return MarkOutcome::Cancelled;
        }

        // Completed write-barrier buffers may resupply work, so they are
        // drained before a stride can count as empty.
        drain_satb(env, cl, stats);

        let mut work = 0;
        for _ in 0..stride {
            let task = q.pop().or_else(|| {
                let stolen = queues.steal(worker_id, &mut seed);
                stats.steals += usize::from(stolen.is_some());
                stolen
            });
            let Some(task) = task else {
                break;
            };
            cl.do_task(task);
            work += 1;
        }
        stats.tasks += work;

        if work == 0 {
            stats.termination_offers += 1;
            if terminator.offer_termination(queues, env.satb, should_abort) {
                return MarkOutcome::Completed;
            }
        }
    }
}

/// Turn every completed write-barrier buffer into marking work.
pub(crate) fn drain_satb(env: &MarkEnv<'_>, cl: &mut MarkClosure<'_>, stats: &mut WorkerStats) {
    let resolve = env.flags.has_forwarded_objects();
    while env.satb.completed_buffers_num() > 0 {
        env.satb.apply_closure_to_completed_buffer(|obj| {
            stats.satb_entries += 1;
            cl.mark_obj(if resolve { env.heap.forwardee(obj) } else { obj });
        });
    }
}
