//! Concurrent SATB marking.
//!
//! Marking runs while mutators keep mutating the heap. Overwritten
//! references are logged by the SATB barrier; the driver repeatedly drains
//! the work, then forces every mutator to flush its partially filled SATB
//! buffer. When a flush produces no new buffers the concurrent phase has
//! caught up and the remaining work is left to the final-mark pause.

use super::{
    heap::Heap,
    mark::{mark_loop, MarkingTask},
    root_processor::RootScanner,
    string_dedup::StringDedupMode,
    GenerationMode,
};
use crate::utils::task_terminator::TaskTerminator;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ConcurrentMarkStats {
    /// Parallel mark rounds executed.
    pub rounds: usize,
    /// Handshakes that produced new completed SATB buffers.
    pub flushes: usize,
    pub cancelled: bool,
}

pub struct ConcurrentMark<'a> {
    heap: &'a Heap,
    generation: GenerationMode,
}

impl<'a> ConcurrentMark<'a> {
    pub fn new(heap: &'a Heap) -> Self {
        Self::with_generation(heap, GenerationMode::NonGenerational)
    }

    pub fn with_generation(heap: &'a Heap, generation: GenerationMode) -> Self {
        Self { heap, generation }
    }

    /// Init-mark root scan. Must run at a safepoint with marking already
    /// in progress. Every worker marks its share of the roots into its own
    /// queue; tracing happens in [`concurrent_mark`](Self::concurrent_mark).
    pub fn mark_stw_roots(&self) {
        let heap = self.heap;
        debug_assert!(heap.safepoint().is_at_safepoint(), "must be at a safepoint");

        let nworkers = heap
            .workers()
            .set_active_workers(heap.args().parallel_gc_threads);
        let scanner = RootScanner::new(heap);
        let generation = self.generation;
        let dedup_mode = StringDedupMode::for_heap(heap);

        heap.workers().run_task(nworkers, |worker_id| {
            let mut task = MarkingTask::new(heap, worker_id, generation, dedup_mode);
            scanner.roots_do(worker_id, |obj| task.mark_through_ref(obj));
        });
    }

    /// Concurrent phase. Returns early when the collection is cancelled.
    pub fn concurrent_mark(&self) -> ConcurrentMarkStats {
        let heap = self.heap;
        let nworkers = heap.workers().set_active_workers(heap.args().conc_gc_threads);
        let queues = heap.task_queues();
        let satb = heap.satb_mark_queue_set();
        let generation = self.generation;
        let dedup_mode = StringDedupMode::for_heap(heap);
        let mut stats = ConcurrentMarkStats::default();

        for _ in 0..heap.args().max_satb_buffer_flushes {
            queues.reserve(nworkers);
            stats.rounds += 1;
            {
                let terminator =
                    TaskTerminator::with_arguments(nworkers, queues, heap.args().work_stealing);
                heap.workers().run_task(nworkers, |worker_id| {
                    mark_loop(heap, worker_id, &terminator, generation, true, dedup_mode);
                });
            }

            if heap.cancelled_gc() {
                stats.cancelled = true;
                break;
            }

            // Mutators may still hold entries in partially filled buffers.
            // Force them out and go again if that produced anything.
            let before = satb.completed_buffers_num();
            heap.threads()
                .handshake(|_, queue| satb.flush_queue(queue, heap.marking_context()));
            let after = satb.completed_buffers_num();
            log::trace!(target: "gc-marking", "SATB flush: {} -> {} completed buffer(s)", before, after);

            if before == after {
                break;
            }
            stats.flushes += 1;
        }

        queues.clear_claimed();
        debug_assert!(stats.cancelled || queues.is_empty(), "marking queues must be drained");
        log::debug!(
            target: "gc-marking",
            "Concurrent mark: {} round(s), {} SATB flush(es){}",
            stats.rounds,
            stats.flushes,
            if stats.cancelled { ", cancelled" } else { "" }
        );
        stats
    }

    /// Final mark. Must run at a safepoint.
    pub fn finish_mark(&self) {
        let heap = self.heap;
        debug_assert!(heap.safepoint().is_at_safepoint(), "must be at a safepoint");

        self.finish_mark_work();
        heap.marking_context().mark_complete();
        heap.set_concurrent_mark_in_progress(false);
    }

    /// Drains everything marking left behind: completed SATB buffers, the
    /// partially filled buffers of every thread and the task queues.
    pub fn finish_mark_work(&self) {
        let heap = self.heap;
        let nworkers = heap
            .workers()
            .set_active_workers(heap.args().parallel_gc_threads);
        let queues = heap.task_queues();
        queues.reserve(nworkers);

        let token = heap.threads().change_thread_claim_token();
        let terminator = TaskTerminator::with_arguments(nworkers, queues, heap.args().work_stealing);
        let generation = self.generation;
        let dedup_mode = StringDedupMode::for_heap(heap);

        heap.workers().run_task(nworkers, |worker_id| {
            let mut task = MarkingTask::new(heap, worker_id, generation, dedup_mode);
            task.drain_satb_buffers();
            heap.threads().possibly_parallel_threads_do(token, |thread| {
                thread
                    .satb_mark_queue()
                    .apply_closure_and_empty(|obj| task.mark_through_ref(obj));
            });
            task.run(&terminator, false);
        });

        queues.clear_claimed();
        debug_assert!(queues.is_empty(), "marking queues must be drained");
    }

    /// Abandons the current marking cycle. Must run at a safepoint.
    pub fn cancel(&self) {
        let heap = self.heap;
        heap.task_queues().clear();
        heap.satb_mark_queue_set()
            .abandon_partial_marking(heap.threads());
        heap.ref_processor().abandon_partial_discovery();
        log::debug!(target: "gc-marking", "Concurrent mark cancelled");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::heap::{
        arguments::HeapArguments,
        object::{ObjectKind, ObjectRef},
        thread::Mutator,
    };

    fn heap(max_satb_buffer_flushes: usize) -> Heap {
        let _ = env_logger::builder().is_test(true).try_init();
        Heap::new(HeapArguments {
            parallel_gc_threads: 2,
            conc_gc_threads: 2,
            max_objects: 1 << 16,
            max_satb_buffer_flushes,
            satb_buffer_size: 16,
            ..Default::default()
        })
        .unwrap()
    }

    fn init_mark(heap: &Heap, mark: &ConcurrentMark<'_>) {
        let _sp = heap.safepoint().begin();
        heap.prepare_gc();
        heap.set_concurrent_mark_in_progress(true);
        mark.mark_stw_roots();
    }

    fn final_mark(heap: &Heap, mark: &ConcurrentMark<'_>) {
        let _sp = heap.safepoint().begin();
        mark.finish_mark();
    }

    /// Root `a` pointing to `b`, with `b` unlinked after the root scan.
    fn hidden_object(heap: &Heap, mutator: &Mutator<'_>, mark: &ConcurrentMark<'_>) -> ObjectRef {
        let a = mutator.allocate(ObjectKind::Regular, 1).unwrap();
        let b = mutator.allocate(ObjectKind::Regular, 0).unwrap();
        mutator.store(a, 0, Some(b)).unwrap();
        mutator.add_root(a).unwrap();

        init_mark(heap, mark);
        assert!(heap.is_marked(a));
        assert!(!heap.is_marked(b));

        // `b` is only reachable through the snapshot now.
        mutator.store(a, 0, None).unwrap();
        b
    }

    #[test]
    fn test_flush_retry_then_early_exit() {
        let heap = heap(5);
        let mutator = heap.attach_thread();
        let mark = ConcurrentMark::new(&heap);
        let b = hidden_object(&heap, &mutator, &mark);

        let stats = mark.concurrent_mark();
        assert_eq!(
            stats,
            ConcurrentMarkStats {
                rounds: 2,
                flushes: 1,
                cancelled: false
            }
        );
        assert!(heap.is_marked(b));
        assert!(heap.task_queues().is_empty());

        final_mark(&heap, &mark);
        assert!(heap.marking_context().is_complete());
        assert!(!heap.is_concurrent_mark_in_progress());
    }

    #[test]
    fn test_retry_bound_leaves_rest_to_final_mark() {
        let heap = heap(1);
        let mutator = heap.attach_thread();
        let mark = ConcurrentMark::new(&heap);
        let b = hidden_object(&heap, &mutator, &mark);

        let stats = mark.concurrent_mark();
        assert_eq!(stats.rounds, 1);
        assert_eq!(stats.flushes, 1);
        assert!(!heap.is_marked(b));
        assert_eq!(heap.satb_mark_queue_set().completed_buffers_num(), 1);

        final_mark(&heap, &mark);
        assert!(heap.is_marked(b));
        assert_eq!(heap.satb_mark_queue_set().completed_buffers_num(), 0);
    }

    #[test]
    fn test_final_mark_drains_thread_buffers() {
        let heap = heap(3);
        let mutator = heap.attach_thread();
        let mark = ConcurrentMark::new(&heap);
        let root = mutator.allocate(ObjectKind::Regular, 1).unwrap();
        let child = mutator.allocate(ObjectKind::Regular, 0).unwrap();
        mutator.add_root(root).unwrap();
        init_mark(&heap, &mark);

        let stats = mark.concurrent_mark();
        assert_eq!(stats.rounds, 1);
        assert!(!heap.is_marked(child));

        // Linked and unlinked after the last flush: the old value only sits
        // in the thread's own buffer.
        mutator.store(root, 0, Some(child)).unwrap();
        mutator.store(root, 0, None).unwrap();
        assert!(!mutator.thread().satb_mark_queue().is_empty());

        final_mark(&heap, &mark);
        assert!(heap.is_marked(child));
        assert!(mutator.thread().satb_mark_queue().is_empty());
    }

    #[test]
    fn test_cancelled_mark() {
        let heap = heap(5);
        let mutator = heap.attach_thread();
        let mark = ConcurrentMark::new(&heap);
        let nodes = (0..64)
            .map(|_| mutator.allocate(ObjectKind::Regular, 1).unwrap())
            .collect::<Vec<_>>();
        for pair in nodes.windows(2) {
            mutator.store(pair[0], 0, Some(pair[1])).unwrap();
        }
        mutator.add_root(nodes[0]).unwrap();
        init_mark(&heap, &mark);

        heap.cancel_gc();
        let stats = mark.concurrent_mark();
        assert_eq!(
            stats,
            ConcurrentMarkStats {
                rounds: 1,
                flushes: 0,
                cancelled: true
            }
        );
        assert!(!heap.task_queues().is_empty());

        {
            let _sp = heap.safepoint().begin();
            mark.cancel();
            heap.set_concurrent_mark_in_progress(false);
        }
        assert!(heap.task_queues().is_empty());
        heap.clear_cancelled_gc();
    }

    #[test]
    fn test_concurrent_mark_with_running_mutators() {
        let heap = heap(5);
        let mark = ConcurrentMark::new(&heap);
        let stop = AtomicBool::new(false);
        let ready = AtomicUsize::new(0);

        let setup = heap.attach_thread();
        let holders = (0..4)
            .map(|_| {
                let holder = setup.allocate(ObjectKind::Regular, 8).unwrap();
                for i in 0..8 {
                    let leaf = setup.allocate(ObjectKind::Regular, 1).unwrap();
                    setup.store(holder, i, Some(leaf)).unwrap();
                }
                setup.add_root(holder).unwrap();
                holder
            })
            .collect::<Vec<_>>();
        let mut snapshot = Vec::new();

        std::thread::scope(|s| {
            for holder in holders.iter().copied() {
                let heap = &heap;
                let stop = &stop;
                let ready = &ready;
                s.spawn(move || {
                    let mutator = heap.attach_thread();
                    ready.fetch_add(1, Ordering::AcqRel);
                    let mut i = 0;
                    // Shuffle the holder's fields around while marking runs.
                    while !stop.load(Ordering::Acquire) {
                        let from = i % 8;
                        let to = (i * 3 + 1) % 8;
                        let value = mutator.load(holder, from).unwrap();
                        let fresh = mutator.allocate(ObjectKind::Regular, 0).ok();
                        mutator.store(holder, to, value).unwrap();
                        mutator.store(holder, from, fresh).unwrap();
                        i += 1;
                    }
                });
            }

            while ready.load(Ordering::Acquire) < holders.len() {
                std::thread::yield_now();
            }

            {
                let _sp = heap.safepoint().begin();
                heap.prepare_gc();
                heap.set_concurrent_mark_in_progress(true);
                mark.mark_stw_roots();
                for holder in holders.iter() {
                    let object = heap.object(*holder).unwrap();
                    snapshot.extend((0..8).filter_map(|i| object.field(i)));
                }
            }
            let stats = mark.concurrent_mark();
            assert!(!stats.cancelled);
            assert!(stats.rounds >= 1 && stats.rounds <= 5);
            final_mark(&heap, &mark);
            stop.store(true, Ordering::Release);
        });

        // Everything reachable at the snapshot survives.
        assert!(holders.iter().all(|h| heap.is_marked(*h)));
        assert!(snapshot.iter().all(|obj| heap.is_marked(*obj)));
    }
}
