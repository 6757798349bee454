use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use scoped_thread_pool::Pool;

/// A named pool of GC worker threads.
///
/// Tasks run one at a time; every worker of a task is scheduled on its own
/// pool thread, so all of them make progress together.
pub struct WorkerThreads {
    name: &'static str,
    pool: Mutex<Pool>,
    total_workers: usize,
    active_workers: AtomicUsize,
}

impl WorkerThreads {
    pub fn new(name: &'static str, total_workers: usize) -> Self {
        let total_workers = total_workers.max(1);
        Self {
            name,
            pool: Mutex::new(Pool::new(total_workers)),
            total_workers,
            active_workers: AtomicUsize::new(total_workers),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn total_workers(&self) -> usize {
        self.total_workers
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    /// Returns the value actually set, clamped to `1..=total_workers`.
    pub fn set_active_workers(&self, n: usize) -> usize {
        let n = n.clamp(1, self.total_workers);
        self.active_workers.store(n, Ordering::Relaxed);
        log::trace!(target: "gc-task", "{}: using {} of {} workers", self.name, n, self.total_workers);
        n
    }

    /// Runs `task(worker_id)` for every id in `0..n` and waits for all of
    /// them. `n` is clamped to the pool size.
    pub fn run_task<F>(&self, n: usize, task: F)
    where
        F: Fn(usize) + Sync,
    {
        let n = n.clamp(1, self.total_workers);
        let pool = self.pool.lock();
        log::trace!(target: "gc-task", "{}: running task on {} worker(s)", self.name, n);

        pool.scoped(|scope| {
            for worker_id in 0..n {
                let task = &task;
                scope.execute(move || task(worker_id));
            }
        });
    }
}

impl Drop for WorkerThreads {
    fn drop(&mut self) {
        self.pool.get_mut().shutdown();
    }
}
