//! Termination protocol for parallel work-stealing workers.
//!
//! Based on the Optimized Work Stealing Threads (OWST) scheme of Hassanein
//! ("Understanding and Improving JVM GC Work Stealing at the Data Center
//! Scale", ISMM 2016), with the enhancement that the spin master gives up
//! its role before it goes to sleep, so another worker arriving at the
//! terminator can take over polling.
//!
//! A worker that runs out of local work calls
//! [`TaskTerminator::offer_termination`]. Exactly one offering worker at a
//! time polls the queue set (the spin master), the rest block on the
//! monitor with a bounded wait. The round terminates when every
//! participant has offered while no task is visible.

#[cfg(debug_assertions)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::{
    thread::{self, ThreadId},
    time::Duration,
};

use crossbeam_utils::CachePadded;

use super::taskqueue::{TaskQueueSetSuper, TerminatorTerminator};
use crate::sync::monitor::{Monitor, MonitorLock};

/// Tunables of the spin/yield/sleep backoff used while waiting for
/// termination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkStealingArguments {
    /// Upper bound of the busy-spin burst length.
    pub hard_spins: u32,
    /// Number of hard-spin bursts before a cooperative yield. Also the
    /// shift applied to `hard_spins` to get the initial burst length.
    pub spin_to_yield_ratio: u32,
    /// Number of delay steps the spin master performs before it gives up
    /// the role and sleeps.
    pub yields_before_sleep: u32,
    /// Timeout of every blocking wait on the terminator monitor.
    pub sleep_millis: u64,
}

impl Default for WorkStealingArguments {
    fn default() -> Self {
        Self {
            hard_spins: 4096,
            spin_to_yield_ratio: 10,
            yields_before_sleep: 5000,
            sleep_millis: 1,
        }
    }
}

struct TerminationState {
    offered_termination: usize,
    spin_master: Option<ThreadId>,
}

struct DelayContext {
    yield_count: u32,
    hard_spin_count: u32,
    hard_spin_limit: u32,
}

impl DelayContext {
    fn new(args: &WorkStealingArguments) -> Self {
        let mut ctx = Self {
            yield_count: 0,
            hard_spin_count: 0,
            hard_spin_limit: 0,
        };
        ctx.reset_hard_spin_information(args);
        ctx
    }

    fn reset_hard_spin_information(&mut self, args: &WorkStealingArguments) {
        self.hard_spin_count = 0;
        self.hard_spin_limit = args
            .hard_spins
            .checked_shr(args.spin_to_yield_ratio)
            .unwrap_or(0);
    }

    fn reset(&mut self, args: &WorkStealingArguments) {
        self.yield_count = 0;
        self.reset_hard_spin_information(args);
    }
}

pub struct TaskTerminator<'a> {
    n_threads: usize,
    queue_set: &'a dyn TaskQueueSetSuper,
    args: WorkStealingArguments,
    blocker: CachePadded<Monitor<TerminationState>>,
    /// Threads currently polling as spin master outside the lock.
    #[cfg(debug_assertions)]
    spin_pollers: AtomicUsize,
}

impl<'a> TaskTerminator<'a> {
    pub fn new(n_threads: usize, queue_set: &'a dyn TaskQueueSetSuper) -> Self {
        Self::with_arguments(n_threads, queue_set, WorkStealingArguments::default())
    }

    pub fn with_arguments(
        n_threads: usize,
        queue_set: &'a dyn TaskQueueSetSuper,
        args: WorkStealingArguments,
    ) -> Self {
        assert!(n_threads > 0, "terminator needs at least one participant");
        Self {
            n_threads,
            queue_set,
            args,
            blocker: CachePadded::new(Monitor::new(TerminationState {
                offered_termination: 0,
                spin_master: None,
            })),
            #[cfg(debug_assertions)]
            spin_pollers: AtomicUsize::new(0),
        }
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// Number of workers currently offering termination. Racy unless the
    /// round has completed.
    pub fn offered_termination(&self) -> usize {
        self.blocker.lock().offered_termination
    }

    /// Resets the terminator so it can be used for another round.
    ///
    /// The previous round must have completed: either nobody offered, or
    /// every participant observed termination.
    pub fn reset_for_reuse(&mut self) {
        let n_threads = self.n_threads;
        let state = self.blocker.get_mut();
        if state.offered_termination != 0 {
            debug_assert_eq!(
                state.offered_termination, n_threads,
                "only reset a completed round"
            );
            debug_assert!(state.spin_master.is_none(), "leftover spin master");
            state.offered_termination = 0;
        }
    }

    /// Like [`reset_for_reuse`](Self::reset_for_reuse), but also changes the
    /// number of participants of the next round.
    pub fn reset_for_reuse_with(&mut self, n_threads: usize) {
        assert!(n_threads > 0, "terminator needs at least one participant");
        self.reset_for_reuse();
        self.n_threads = n_threads;
    }

    pub fn offer_termination(&self) -> bool {
        self.offer(None)
    }

    /// Offers termination, additionally leaving the protocol with `false`
    /// as soon as `terminator` asks for it.
    pub fn offer_termination_with(&self, terminator: &dyn TerminatorTerminator) -> bool {
        self.offer(Some(terminator))
    }

    fn tasks_in_queue_set(&self) -> usize {
        self.queue_set.tasks()
    }

    fn exit_termination(&self, tasks: usize, terminator: Option<&dyn TerminatorTerminator>) -> bool {
        tasks > 0 || terminator.map_or(false, |t| t.should_exit_termination())
    }

    fn assert_queue_set_empty(&self) {
        debug_assert!(
            !self.queue_set.peek(),
            "task queues must be empty at termination"
        );
    }

    /// Clears the spin master role if held by this thread and wakes
    /// sleepers: all of them when `tasks` could keep everybody busy,
    /// otherwise one less than the number of visible tasks. `tasks == 0`
    /// wakes nobody unless this thread is the only one offered.
    fn prepare_for_return(
        &self,
        x: &mut MonitorLock<'_, TerminationState>,
        this_thread: ThreadId,
        tasks: usize,
    ) {
        debug_assert!(x.offered_termination >= 1);

        if x.spin_master == Some(this_thread) {
            x.spin_master = None;
        }

        if tasks >= x.offered_termination - 1 {
            x.notify_all();
        } else {
            for _ in 1..tasks {
                x.notify_one();
            }
        }
    }

    /// One step of the spin master's backoff. Returns true once the yield
    /// budget is exhausted and the caller should sleep instead.
    fn do_delay_step(&self, delay: &mut DelayContext) -> bool {
        if delay.yield_count < self.args.yields_before_sleep {
            delay.yield_count += 1;
            // Periodically yield instead of spinning: after
            // spin_to_yield_ratio bursts, yield and restart the bursts.
            if delay.hard_spin_count > self.args.spin_to_yield_ratio {
                thread::yield_now();
                delay.reset_hard_spin_information(&self.args);
            } else {
                for _ in 0..delay.hard_spin_limit {
                    std::hint::spin_loop();
                }
                delay.hard_spin_count += 1;
                delay.hard_spin_limit = delay
                    .hard_spin_limit
                    .saturating_mul(2)
                    .min(self.args.hard_spins);
            }
            false
        } else {
            true
        }
    }

    fn offer(&self, terminator: Option<&dyn TerminatorTerminator>) -> bool {
        if self.n_threads == 1 {
            let mut state = self.blocker.lock();
            debug_assert_eq!(state.offered_termination, 0, "invariant");
            state.offered_termination = 1;
            drop(state);
            self.assert_queue_set_empty();
            return true;
        }

        let this_thread = thread::current().id();
        let mut delay = DelayContext::new(&self.args);
        let sleep = Duration::from_millis(self.args.sleep_millis);

        let mut x = self.blocker.lock();
        debug_assert!(x.offered_termination < self.n_threads, "invariant");
        x.offered_termination += 1;

        if x.offered_termination == self.n_threads {
            self.prepare_for_return(&mut x, this_thread, usize::MAX);
            self.assert_queue_set_empty();
            log::trace!(target: "gc-task", "{:?} completed termination of {} workers", this_thread, self.n_threads);
            return true;
        }

        loop {
            if x.spin_master.is_none() {
                x.spin_master = Some(this_thread);
                loop {
                    let (giveup_spin, tasks, should_exit_termination) = x.unlocked(|| {
                        #[cfg(debug_assertions)]
                        debug_assert_eq!(
                            self.spin_pollers.fetch_add(1, Ordering::AcqRel),
                            0,
                            "more than one spin master polling"
                        );
                        let giveup_spin = self.do_delay_step(&mut delay);
                        // Dirty read of the exit condition.
                        let tasks = self.tasks_in_queue_set();
                        let exit = self.exit_termination(tasks, terminator);
                        #[cfg(debug_assertions)]
                        self.spin_pollers.fetch_sub(1, Ordering::AcqRel);
                        (giveup_spin, tasks, exit)
                    });

                    // Check the exit conditions right after re-acquiring the lock.
                    if x.offered_termination == self.n_threads {
                        self.prepare_for_return(&mut x, this_thread, usize::MAX);
                        self.assert_queue_set_empty();
                        return true;
                    } else if should_exit_termination {
                        self.prepare_for_return(&mut x, this_thread, tasks);
                        x.offered_termination -= 1;
                        log::trace!(target: "gc-task", "{:?} spin master left termination, {} task(s) visible", this_thread, tasks);
                        return false;
                    }

                    if giveup_spin {
                        break;
                    }
                }
                // Give up the spin master role before sleeping.
                x.spin_master = None;
            }

            x.wait_timeout(sleep);

            // Check the exit conditions after every wake-up, timed out or not.
            if x.offered_termination == self.n_threads {
                self.prepare_for_return(&mut x, this_thread, usize::MAX);
                self.assert_queue_set_empty();
                return true;
            }
            let tasks = self.tasks_in_queue_set();
            if self.exit_termination(tasks, terminator) {
                // Waking peers is left to the spin master.
                self.prepare_for_return(&mut x, this_thread, 0);
                x.offered_termination -= 1;
                return false;
            }
            delay.reset(&self.args);
        }
    }
}

impl Drop for TaskTerminator<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        let n_threads = self.n_threads;
        let state = self.blocker.get_mut();
        if state.offered_termination != 0 {
            debug_assert_eq!(state.offered_termination, n_threads, "must be terminated or aborted");
        }
        debug_assert!(state.spin_master.is_none(), "spin master must be cleared");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    struct CountingQueueSet {
        tasks: AtomicUsize,
    }

    impl CountingQueueSet {
        fn new(tasks: usize) -> Self {
            Self {
                tasks: AtomicUsize::new(tasks),
            }
        }

        fn push(&self) {
            self.tasks.fetch_add(1, Ordering::SeqCst);
        }

        fn take(&self) -> bool {
            self.tasks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| t.checked_sub(1))
                .is_ok()
        }
    }

    impl TaskQueueSetSuper for CountingQueueSet {
        fn tasks(&self) -> usize {
            self.tasks.load(Ordering::SeqCst)
        }

        fn size(&self) -> usize {
            1
        }
    }

    fn fast_args() -> WorkStealingArguments {
        WorkStealingArguments {
            hard_spins: 64,
            spin_to_yield_ratio: 2,
            yields_before_sleep: 50,
            sleep_millis: 1,
        }
    }

    #[test]
    fn test_single_thread_terminates_immediately() {
        let qs = CountingQueueSet::new(0);
        let mut terminator = TaskTerminator::new(1, &qs);
        assert!(terminator.offer_termination());
        assert_eq!(terminator.offered_termination(), 1);
        terminator.reset_for_reuse();
        assert_eq!(terminator.offered_termination(), 0);
    }

    #[test]
    fn test_all_offer_converges() {
        let qs = CountingQueueSet::new(0);
        let terminator = TaskTerminator::with_arguments(4, &qs, fast_args());
        let terminated = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    assert!(terminator.offer_termination());
                    terminated.fetch_add(1, Ordering::Relaxed);
                });
            }
        });

        assert_eq!(terminated.load(Ordering::Relaxed), 4);
        assert_eq!(terminator.offered_termination(), 4);
    }

    #[test]
    fn test_resurfaced_work_forces_retry() {
        let qs = CountingQueueSet::new(0);
        let terminator = TaskTerminator::with_arguments(2, &qs, fast_args());
        let retries = AtomicUsize::new(0);

        thread::scope(|s| {
            s.spawn(|| loop {
                if terminator.offer_termination() {
                    break;
                }
                retries.fetch_add(1, Ordering::SeqCst);
                // The worker left the protocol, so it is no longer counted.
                assert!(terminator.offered_termination() <= 1);
                qs.take();
            });

            thread::sleep(Duration::from_millis(20));
            qs.push();
            while qs.tasks() != 0 {
                thread::yield_now();
            }

            s.spawn(|| {
                while !terminator.offer_termination() {
                    qs.take();
                }
            });
        });

        assert!(retries.load(Ordering::SeqCst) >= 1);
        assert_eq!(terminator.offered_termination(), 2);
    }

    #[test]
    fn test_external_predicate_exits() {
        let qs = CountingQueueSet::new(0);
        let terminator = TaskTerminator::with_arguments(2, &qs, fast_args());
        let abort = AtomicBool::new(false);

        thread::scope(|s| {
            let handle = s.spawn(|| {
                let should_exit = || abort.load(Ordering::SeqCst);
                terminator.offer_termination_with(&should_exit)
            });

            thread::sleep(Duration::from_millis(10));
            abort.store(true, Ordering::SeqCst);
            assert!(!handle.join().unwrap());
        });

        assert_eq!(terminator.offered_termination(), 0);
    }

    #[test]
    fn test_reuse_with_different_thread_count() {
        let qs = CountingQueueSet::new(0);
        let mut terminator = TaskTerminator::with_arguments(2, &qs, fast_args());

        for n in [2usize, 3, 2] {
            terminator.reset_for_reuse_with(n);
            assert_eq!(terminator.offered_termination(), 0);
            let terminator = &terminator;
            thread::scope(|s| {
                for _ in 0..n {
                    s.spawn(move || assert!(terminator.offer_termination()));
                }
            });
            assert_eq!(terminator.offered_termination(), n);
        }
    }

    /// Four workers, one task owned by worker 0; nobody ever adds work.
    #[test]
    fn test_one_task_four_workers() {
        let qs = CountingQueueSet::new(1);
        let terminator = TaskTerminator::with_arguments(4, &qs, fast_args());
        let terminated = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 1..4 {
                s.spawn(|| {
                    // Idle workers keep offering; the visible task of worker
                    // 0 can make them leave the protocol until it is done.
                    while !terminator.offer_termination() {
                        thread::yield_now();
                    }
                    terminated.fetch_add(1, Ordering::SeqCst);
                });
            }

            s.spawn(|| {
                thread::sleep(Duration::from_millis(5));
                assert!(qs.take());
                assert_eq!(qs.tasks(), 0);
                while !terminator.offer_termination() {}
                terminated.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert_eq!(terminated.load(Ordering::SeqCst), 4);
        assert_eq!(qs.tasks(), 0);
        assert_eq!(terminator.offered_termination(), 4);
    }

    /// Two workers; a third party publishes a task while one worker is
    /// offered. The spin master notices it and leaves the protocol.
    #[test]
    fn test_third_party_task_wakes_spin_master() {
        let qs = CountingQueueSet::new(0);
        let terminator = TaskTerminator::with_arguments(2, &qs, fast_args());

        thread::scope(|s| {
            let a = s.spawn(|| terminator.offer_termination());

            thread::sleep(Duration::from_millis(10));
            qs.push();
            assert!(!a.join().unwrap());
            assert_eq!(terminator.offered_termination(), 0);

            // Somebody consumes the task, then a fresh attempt succeeds.
            assert!(qs.take());
            let a = s.spawn(|| terminator.offer_termination());
            let b = s.spawn(|| terminator.offer_termination());
            assert!(a.join().unwrap());
            assert!(b.join().unwrap());
        });
    }

    /// A parked worker whose own predicate asks to leave must not wait for
    /// the spin master role: it notices after its next timed wait.
    #[test]
    fn test_waiter_predicate_exits_after_timed_wait() {
        let qs = CountingQueueSet::new(0);
        let args = WorkStealingArguments {
            hard_spins: 8,
            spin_to_yield_ratio: 1,
            yields_before_sleep: u32::MAX,
            sleep_millis: 1,
        };
        let terminator = TaskTerminator::with_arguments(3, &qs, args);
        let release_master = AtomicBool::new(false);

        thread::scope(|s| {
            let master = s.spawn(|| {
                let should_exit = || release_master.load(Ordering::SeqCst);
                terminator.offer_termination_with(&should_exit)
            });
            thread::sleep(Duration::from_millis(20));

            let waiter = s.spawn(|| {
                let always = || true;
                terminator.offer_termination_with(&always)
            });

            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while !waiter.is_finished() && std::time::Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            let left_while_master_spun = waiter.is_finished();

            release_master.store(true, Ordering::SeqCst);
            assert!(!master.join().unwrap());
            assert!(!waiter.join().unwrap());
            assert!(left_while_master_spun);
        });

        assert_eq!(terminator.offered_termination(), 0);
    }

    /// Workers keep finding and finishing work while the others offer, so
    /// the spin master role changes hands many times within a round.
    #[test]
    fn test_single_spin_master() {
        struct PollingQueueSet {
            tasks: AtomicUsize,
            polls: AtomicUsize,
        }

        impl TaskQueueSetSuper for PollingQueueSet {
            fn tasks(&self) -> usize {
                self.polls.fetch_add(1, Ordering::Relaxed);
                self.tasks.load(Ordering::SeqCst)
            }

            fn size(&self) -> usize {
                1
            }
        }

        let qs = PollingQueueSet {
            tasks: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        };
        let args = WorkStealingArguments {
            hard_spins: 4,
            spin_to_yield_ratio: 1,
            yields_before_sleep: 2,
            sleep_millis: 1,
        };
        let mut terminator = TaskTerminator::with_arguments(6, &qs, args);

        for _ in 0..10 {
            terminator.reset_for_reuse();
            qs.tasks.store(64, Ordering::SeqCst);
            let terminator = &terminator;
            let qs = &qs;
            thread::scope(|s| {
                for _ in 0..6 {
                    s.spawn(move || loop {
                        let took = qs
                            .tasks
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| t.checked_sub(1))
                            .is_ok();
                        if took {
                            thread::yield_now();
                        } else if terminator.offer_termination() {
                            break;
                        }
                    });
                }
            });
            assert_eq!(terminator.offered_termination(), 6);
            assert_eq!(qs.tasks.load(Ordering::SeqCst), 0);
        }

        assert!(qs.polls.load(Ordering::Relaxed) > 0);
        #[cfg(debug_assertions)]
        assert_eq!(terminator.spin_pollers.load(Ordering::SeqCst), 0);
    }
}
