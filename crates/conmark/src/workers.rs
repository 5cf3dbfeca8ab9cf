//! A fixed-size gang of marking workers.
//!
//! The gang owns `max_workers - 1` named threads for its whole life. They park
//! on a condition variable between tasks. Each [`WorkGang::run_task`] call
//! publishes the task under a new epoch, runs worker 0 on the calling thread,
//! and returns once the other active workers have counted down the
//! completion latch. Tasks may therefore borrow from the caller's stack.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

type Task = dyn Fn(usize) + Sync;

#[derive(Default)]
struct Dispatch {
    /// Bumped for every published task.
    epoch: u64,
    /// Borrowed from the running `run_task` call, which outlives every use.
    task: Option<&'static Task>,
    active: usize,
    /// Pooled workers that have not finished the current task.
    pending: usize,
    panicked: bool,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    dispatch: Mutex<Dispatch>,
    start: Condvar,
    done: Condvar,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("epoch", &self.epoch)
            .field("running", &self.task.is_some())
            .field("active", &self.active)
            .field("pending", &self.pending)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

/// The worker gang.
#[derive(Debug)]
pub struct WorkGang {
    name: &'static str,
    max_workers: usize,
    active_workers: AtomicUsize,
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    /// Serializes drivers; one task runs at a time.
    driver: Mutex<()>,
}

impl WorkGang {
    /// A gang of up to `max_workers` workers, all active.
    ///
    /// If the system refuses to start a thread, the gang keeps the workers it
    /// got and `max_workers` shrinks accordingly.
    #[must_use]
    pub fn new(name: &'static str, max_workers: usize) -> Self {
        let shared = Arc::new(Shared::default());
        let mut threads = Vec::with_capacity(max_workers.saturating_sub(1));
        for worker_id in 1..max_workers.max(1) {
            let spawned = thread::Builder::new().name(format!("{name}#{worker_id}")).spawn({
                let shared = Arc::clone(&shared);
                move || worker_loop(&shared, worker_id)
            });
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(_) => break,
            }
        }
        let max_workers = threads.len() + 1;
        Self {
            name,
            max_workers,
            active_workers: AtomicUsize::new(max_workers),
            shared,
            threads,
            driver: Mutex::new(()),
        }
    }

    /// Gang name, used as the thread name prefix.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Largest possible worker count.
    #[must_use]
    pub const fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Workers the next task runs on.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    /// Change the active worker count, clamped to `1..=max_workers`.
    ///
    /// Returns the count actually set.
    pub fn set_active_workers(&self, n: usize) -> usize {
        let n = n.clamp(1, self.max_workers);
        self.active_workers.store(n, Ordering::Release);
        n
    }

    /// Run `task(worker_id)` on every active worker and wait for all of them.
    ///
    /// Must not be called from inside a task of the same gang.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from worker 0, and panics if any pooled worker
    /// panicked while running `task`.
    pub fn run_task(&self, task: &(dyn Fn(usize) + Sync)) {
        let n = self.active_workers();
        if n == 1 {
            task(0);
            return;
        }

        let _driver = self.driver.lock();
        {
            let mut dispatch = self.shared.dispatch.lock();
            // SAFETY: the `Latch` below does not let this call return, or
            // unwind, before every pooled worker has finished with `task` and
            // the reference has been taken back out of `dispatch`.
            let task = unsafe { mem::transmute::<&(dyn Fn(usize) + Sync), &'static Task>(task) };
            dispatch.task = Some(task);
            dispatch.active = n;
            dispatch.pending = n - 1;
            dispatch.panicked = false;
            dispatch.epoch += 1;
            self.shared.start.notify_all();
        }

        let latch = Latch(&self.shared);
        task(0);
        drop(latch);

        let panicked = mem::take(&mut self.shared.dispatch.lock().panicked);
        assert!(!panicked, "a {} worker panicked", self.name);
    }
}

impl Drop for WorkGang {
    fn drop(&mut self) {
        self.shared.dispatch.lock().shutdown = true;
        self.shared.start.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Waits for the pooled workers of the current task when dropped.
struct Latch<'a>(&'a Shared);

impl Drop for Latch<'_> {
    fn drop(&mut self) {
        let mut dispatch = self.0.dispatch.lock();
        while dispatch.pending > 0 {
            self.0.done.wait(&mut dispatch);
        }
        dispatch.task = None;
    }
}

fn worker_loop(shared: &Shared, worker_id: usize) {
    let mut seen = 0;
    loop {
        let task = {
            let mut dispatch = shared.dispatch.lock();
            while dispatch.epoch == seen && !dispatch.shutdown {
                shared.start.wait(&mut dispatch);
            }
            if dispatch.shutdown {
                return;
            }
            seen = dispatch.epoch;
            match dispatch.task {
                Some(task) if worker_id < dispatch.active => task,
                _ => continue,
            }
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| task(worker_id)));

        let mut dispatch = shared.dispatch.lock();
        dispatch.panicked |= result.is_err();
        dispatch.pending -= 1;
        if dispatch.pending == 0 {
            shared.done.notify_all();
        }
    }
}
