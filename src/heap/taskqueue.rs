use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Mutex, MutexGuard};
use rand::{
    distributions::{Distribution, Uniform},
    thread_rng,
};

use super::{heap::Heap, object::ObjectRef};
use crate::utils::taskqueue::{TaskQueueSetSuper, TerminatorTerminator};

/// MarkTask
///
/// Either a whole object, or a slice of a large object's reference fields
/// starting at `from`. `from == 0` means "not chunked": the object is seen
/// for the first time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MarkTask {
    obj: ObjectRef,
    from: usize,
}

impl MarkTask {
    pub fn new(obj: ObjectRef) -> Self {
        Self { obj, from: 0 }
    }

    pub fn slice(obj: ObjectRef, from: usize) -> Self {
        debug_assert!(from > 0, "slices start past the first field");
        Self { obj, from }
    }

    pub fn obj(self) -> ObjectRef {
        self.obj
    }

    pub fn from(self) -> usize {
        self.from
    }

    pub fn is_not_chunked(self) -> bool {
        self.from == 0
    }
}

pub type ObjToScanQueue = Worker<MarkTask>;

/// Per-worker LIFO deques plus a shared injector for tasks published by
/// threads that own no queue.
///
/// A worker locks its own queue for the duration of a task; other workers
/// reach it only through its stealer. Queues past the reserved prefix hold
/// left-over work of a previous phase that ran with more workers, and are
/// drained by claiming them.
pub struct ObjToScanQueueSet {
    queues: Box<[Mutex<ObjToScanQueue>]>,
    stealers: Box<[Stealer<MarkTask>]>,
    injector: Injector<MarkTask>,
    claimed_index: AtomicUsize,
}

impl ObjToScanQueueSet {
    pub fn new(n: usize) -> Self {
        let workers = (0..n.max(1)).map(|_| Worker::new_lifo()).collect::<Vec<_>>();
        let stealers = workers.iter().map(Worker::stealer).collect();
        let size = workers.len();

        Self {
            queues: workers.into_iter().map(Mutex::new).collect(),
            stealers,
            injector: Injector::new(),
            claimed_index: AtomicUsize::new(size),
        }
    }

    pub fn queue(&self, index: usize) -> MutexGuard<'_, ObjToScanQueue> {
        self.queues[index].lock()
    }

    pub fn push_external(&self, task: MarkTask) {
        self.injector.push(task);
    }

    /// Reserves the first `n` queues for the workers of the next phase. The
    /// remaining queues become claimable.
    pub fn reserve(&self, n: usize) {
        assert!(n <= self.size(), "not enough queues");
        self.claimed_index.store(n, Ordering::Release);
    }

    /// Claims the next unreserved queue.
    pub fn claim_next(&self) -> Option<usize> {
        let size = self.size();
        if self.claimed_index.load(Ordering::Relaxed) >= size {
            return None;
        }

        let index = self.claimed_index.fetch_add(1, Ordering::AcqRel);
        (index < size).then(|| index)
    }

    pub fn clear_claimed(&self) {
        self.claimed_index.store(self.size(), Ordering::Release);
    }

    /// Steals a batch from the injector into `dest` and pops one task.
    pub fn pop_global(&self, dest: &ObjToScanQueue) -> Option<MarkTask> {
        loop {
            match self.injector.steal_batch_and_pop(dest) {
                Steal::Empty => return None,
                Steal::Success(task) => return Some(task),
                Steal::Retry => continue,
            }
        }
    }

    /// Tries to steal from randomly chosen victims other than `queue_num`.
    pub fn steal(&self, queue_num: usize, dest: &ObjToScanQueue) -> Option<MarkTask> {
        let n = self.stealers.len();
        if n == 1 {
            return None;
        }

        let mut rng = thread_rng();
        let range = Uniform::new(0, n);

        for _ in 0..2 * n {
            let mut victim = queue_num;
            while victim == queue_num {
                victim = range.sample(&mut rng);
            }

            loop {
                match self.stealers[victim].steal_batch_and_pop(dest) {
                    Steal::Empty => break,
                    Steal::Success(task) => return Some(task),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    /// Drops every task. Only valid while no worker is running.
    pub fn clear(&self) {
        for queue in self.queues.iter() {
            let queue = queue.lock();
            while queue.pop().is_some() {}
        }
        while !self.injector.is_empty() {
            let _ = self.injector.steal();
        }
        self.clear_claimed();
    }

    pub fn is_empty(&self) -> bool {
        self.injector.is_empty() && self.stealers.iter().all(Stealer::is_empty)
    }
}

impl TaskQueueSetSuper for ObjToScanQueueSet {
    /// Approximate: a non-empty worker queue counts as a single task.
    fn tasks(&self) -> usize {
        self.injector.len() + self.stealers.iter().filter(|s| !s.is_empty()).count()
    }

    fn size(&self) -> usize {
        self.queues.len()
    }

    fn peek(&self) -> bool {
        !self.is_empty()
    }
}

/// Leaves termination as soon as the collection is cancelled.
pub struct GCTerminator<'a> {
    heap: &'a Heap,
}

impl<'a> GCTerminator<'a> {
    pub fn new(heap: &'a Heap) -> Self {
        Self { heap }
    }
}

impl<'a> TerminatorTerminator for GCTerminator<'a> {
    fn should_exit_termination(&self) -> bool {
        self.heap.cancelled_gc()
    }
}
