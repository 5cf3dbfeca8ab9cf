//! Distributed termination detection for the marking workers.
//!
//! No worker can see global state, so a worker that ran a whole stride without
//! finding work offers termination. Marking is over only when every active
//! worker has offered at the same time, every task queue is empty, and the
//! write-barrier log has no completed buffers. Waiting workers keep peeking at
//! the queues and the log and withdraw their offer as soon as work appears.
//!
//! Declaring termination clears the offers, so the same workers can run
//! another round at once. Workers still waking from the declared round
//! recognize it by its generation and never touch the new round's offers.

use std::time::Duration;

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

use super::queue::TaskQueueSet;
use crate::satb::SatbQueueSet;

#[derive(Debug)]
struct TerminatorState {
    /// Offers in the current, undeclared generation.
    offered: usize,
    /// Bumped every time termination is declared; waiters compare against the
    /// value they entered with.
    generation: u64,
}

/// Termination protocol shared by the workers of one marking round.
#[derive(Debug)]
pub struct TaskTerminator {
    n_threads: usize,
    wait_slice: Duration,
    state: Mutex<TerminatorState>,
    cond: Condvar,
}

impl TaskTerminator {
    /// A terminator for `n_threads` cooperating workers.
    #[must_use]
    pub fn new(n_threads: usize, wait_slice: Duration) -> Self {
        debug_assert!(n_threads > 0, "terminator needs at least one worker");
        Self {
            n_threads,
            wait_slice,
            state: Mutex::new(TerminatorState {
                offered: 0,
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Number of workers this terminator waits for.
    #[must_use]
    pub const fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// Offer termination on behalf of a worker that just found no work in a
    /// full stride.
    ///
    /// Returns `true` when global termination was declared. Returns `false`
    /// when work showed up or `should_abort` fired; the caller must go back to
    /// its marking loop (and check cancellation there).
    pub fn offer_termination(
        &self,
        queues: &TaskQueueSet,
        satb: &SatbQueueSet,
        should_abort: &dyn Fn() -> bool,
    ) -> bool {
        let no_work = || queues.is_empty() && satb.completed_buffers_num() == 0;

        if self.n_threads == 1 {
            let mut state = self.state.lock();
            if no_work() {
                state.generation += 1;
                return true;
            }
            return false;
        }

        // Short optimistic spin: work often reappears right away.
        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if !no_work() || should_abort() {
                return false;
            }
            backoff.snooze();
        }

        let mut state = self.state.lock();
        let generation = state.generation;
        state.offered += 1;
        debug_assert!(state.offered <= self.n_threads, "too many offers");

        loop {
            if state.generation != generation {
                return true;
            }
            if state.offered == self.n_threads && no_work() {
                state.offered = 0;
                state.generation += 1;
                self.cond.notify_all();
                return true;
            }

            self.cond.wait_for(&mut state, self.wait_slice);

            if state.generation != generation {
                return true;
            }
            if should_abort() || !no_work() {
                state.offered -= 1;
                self.cond.notify_all();
                return false;
            }
        }
    }

    /// Withdraw every pending offer before another round of the same workers.
    ///
    /// A declared termination already leaves no offers behind, so this only
    /// matters after a round that ended by abort. Only call while no worker is
    /// inside [`TaskTerminator::offer_termination`].
    pub fn reset_for_reuse(&self) {
        self.state.lock().offered = 0;
    }

    /// How many times termination has been declared.
    #[must_use]
    pub fn terminations(&self) -> u64 {
        self.state.lock().generation
    }
}
