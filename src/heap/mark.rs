use parking_lot::MutexGuard;

use super::{
    heap::Heap,
    object::ObjectRef,
    root_processor::RootScanner,
    string_dedup::{StringDedupMode, StringDedupRequests},
    taskqueue::{GCTerminator, MarkTask, ObjToScanQueue},
    GenerationMode,
};
use crate::utils::task_terminator::TaskTerminator;

/// Marking state of one GC worker.
///
/// The worker owns queue `worker_id` of the heap's queue set for as long as
/// the task lives; other workers only steal from it.
pub struct MarkingTask<'a> {
    worker_id: usize,
    heap: &'a Heap,
    queue: MutexGuard<'a, ObjToScanQueue>,
    generation: GenerationMode,
    dedup_mode: StringDedupMode,
    requests: StringDedupRequests<'a>,
}

impl<'a> MarkingTask<'a> {
    pub fn new(
        heap: &'a Heap,
        worker_id: usize,
        generation: GenerationMode,
        dedup_mode: StringDedupMode,
    ) -> Self {
        Self {
            worker_id,
            heap,
            queue: heap.task_queues().queue(worker_id),
            generation,
            dedup_mode,
            requests: StringDedupRequests::new(heap),
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Marks `obj` and queues it for scanning if this worker marked it first.
    pub fn mark_through_ref(&mut self, obj: ObjectRef) {
        let Some(object) = self.heap.object(obj) else {
            return;
        };
        if !self.generation.contains(object.affiliation()) {
            return;
        }
        if self.heap.marking_context().mark(obj) {
            self.queue.push(MarkTask::new(obj));
        }
    }

    fn do_task(&mut self, task: MarkTask) {
        let heap = self.heap;
        let obj = task.obj();
        let Some(object) = heap.object(obj) else {
            return;
        };

        let mut from = task.from();
        if task.is_not_chunked() {
            self.requests.add(self.dedup_mode, obj, object);
            // A discovered reference does not keep its referent alive.
            if object.kind().is_reference()
                && heap
                    .ref_processor()
                    .discover_reference(heap.marking_context(), obj, object)
            {
                from = 1;
            }
        }

        let len = object.len();
        let stride = heap.args().obj_array_marking_stride;
        let end = if len.saturating_sub(from) > stride {
            self.queue.push(MarkTask::slice(obj, from + stride));
            from + stride
        } else {
            len
        };

        for index in from..end {
            if let Some(field) = object.field(index) {
                self.mark_through_ref(field);
            }
        }
    }

    fn pop(&mut self) -> Option<MarkTask> {
        let heap = self.heap;
        let queues = heap.task_queues();
        if let Some(task) = self.queue.pop() {
            return Some(task);
        }
        if let Some(task) = queues.pop_global(&self.queue) {
            return Some(task);
        }
        queues.steal(self.worker_id, &self.queue)
    }

    /// Marks through every completed SATB buffer.
    pub fn drain_satb_buffers(&mut self) {
        let heap = self.heap;
        let satb = heap.satb_mark_queue_set();
        while satb.apply_closure_to_completed_buffer(|buffer| {
            for obj in buffer.iter() {
                self.mark_through_ref(*obj);
            }
        }) {}
    }

    /// Takes over queues left behind by a phase that ran with more workers.
    fn drain_outstanding_queues(&mut self) {
        let heap = self.heap;
        let queues = heap.task_queues();
        while let Some(index) = queues.claim_next() {
            let outstanding = queues.queue(index);
            while let Some(task) = outstanding.pop() {
                self.do_task(task);
            }
        }
    }

    /// Marks until the terminator agrees there is no work left or, for a
    /// cancellable loop, until the collection is cancelled.
    pub fn run(&mut self, terminator: &TaskTerminator<'_>, cancellable: bool) {
        let heap = self.heap;
        let stride = heap.args().mark_loop_stride;
        let mut processed = 0;

        loop {
            if cancellable && heap.cancelled_gc() {
                log::trace!(target: "gc-marking", "worker {} cancelled after {} task(s)", self.worker_id, processed);
                return;
            }

            self.drain_outstanding_queues();
            self.drain_satb_buffers();

            let mut work = 0;
            while work < stride {
                match self.pop() {
                    Some(task) => {
                        self.do_task(task);
                        work += 1;
                    }
                    None => break,
                }
            }
            processed += work;

            if work == 0 {
                let terminated = if cancellable {
                    terminator.offer_termination_with(&GCTerminator::new(heap))
                } else {
                    terminator.offer_termination()
                };
                if terminated {
                    break;
                }
            }
        }

        log::trace!(target: "gc-marking", "worker {} processed {} task(s)", self.worker_id, processed);
    }
}

/// Runs one worker's mark loop against the shared terminator.
pub fn mark_loop(
    heap: &Heap,
    worker_id: usize,
    terminator: &TaskTerminator<'_>,
    generation: GenerationMode,
    cancellable: bool,
    dedup_mode: StringDedupMode,
) {
    let mut task = MarkingTask::new(heap, worker_id, generation, dedup_mode);
    task.run(terminator, cancellable);
}

/// Parallel stop-the-world marking from the roots to the transitive
/// closure. Must run at a safepoint, after [`Heap::prepare_gc`].
pub struct STWMark<'a> {
    heap: &'a Heap,
    generation: GenerationMode,
    dedup_mode: StringDedupMode,
    terminator: TaskTerminator<'a>,
}

impl<'a> STWMark<'a> {
    pub fn new(heap: &'a Heap) -> Self {
        Self::with_generation(heap, GenerationMode::NonGenerational)
    }

    pub fn with_generation(heap: &'a Heap, generation: GenerationMode) -> Self {
        let nworkers = heap.workers().active_workers();
        Self {
            heap,
            generation,
            dedup_mode: StringDedupMode::for_heap(heap),
            terminator: TaskTerminator::with_arguments(
                nworkers,
                heap.task_queues(),
                heap.args().work_stealing,
            ),
        }
    }

    pub fn set_dedup_mode(&mut self, dedup_mode: StringDedupMode) {
        self.dedup_mode = dedup_mode;
    }

    pub fn mark(&mut self) {
        let heap = self.heap;
        debug_assert!(heap.safepoint().is_at_safepoint(), "must be at a safepoint");

        self.terminator.reset_for_reuse();
        heap.code_cache().arm_nmethods();

        let rp = heap.ref_processor();
        rp.set_soft_reference_policy(heap.should_clear_all_soft_refs());
        rp.enable_discovery();

        let nworkers = self.terminator.n_threads();
        let queues = heap.task_queues();
        queues.reserve(nworkers);

        let scanner = RootScanner::new(heap);
        let terminator = &self.terminator;
        let generation = self.generation;
        let dedup_mode = self.dedup_mode;

        heap.workers().run_task(nworkers, |worker_id| {
            let mut task = MarkingTask::new(heap, worker_id, generation, dedup_mode);
            scanner.roots_do(worker_id, |obj| task.mark_through_ref(obj));
            task.run(terminator, false);
        });

        heap.marking_context().mark_complete();
        heap.code_cache().disarm_nmethods();
        queues.clear_claimed();

        debug_assert!(queues.is_empty(), "marking queues must be drained");
        log::debug!(
            target: "gc-marking",
            "STW mark: {} object(s) marked by {} worker(s)",
            heap.marking_context().marked_count(),
            nworkers
        );
    }
}
