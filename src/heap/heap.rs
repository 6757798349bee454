use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

use super::{
    arguments::HeapArguments,
    code_roots::{CodeCache, NMethod},
    concurrent_gc::ConcurrentGC,
    degenerated_gc::DegeneratedGC,
    full_gc::FullGC,
    marking_context::MarkingContext,
    object::{HeapObject, ObjectArena, ObjectRef},
    reference_processor::ReferenceProcessor,
    safepoint::SafepointSynchronize,
    satb_mark_queue::SatbMarkQueueSet,
    shared_vars::{SharedEnumFlag, SharedFlag},
    taskqueue::ObjToScanQueueSet,
    thread::{Mutator, Threads},
};
use crate::{error::GcResult, sync::worker_threads::WorkerThreads};

pub const GC_CANCELLABLE: u8 = 0;
pub const GC_CANCELLED: u8 = 1;

/// The collected heap: object storage plus every piece of state the
/// marking cycle shares between mutators and GC workers.
pub struct Heap {
    args: HeapArguments,
    arena: ObjectArena,
    marking_context: MarkingContext,
    task_queues: ObjToScanQueueSet,
    satb_mark_queue_set: SatbMarkQueueSet,
    threads: Threads,
    safepoint: SafepointSynchronize,
    code_cache: CodeCache,
    ref_processor: ReferenceProcessor,
    global_roots: Mutex<Vec<ObjectRef>>,
    string_dedup_queue: Mutex<Vec<ObjectRef>>,
    workers: WorkerThreads,
    is_concurrent_mark_in_progress: SharedFlag,
    cancelled_gc: SharedEnumFlag,
    clear_all_soft_refs: SharedFlag,
    gc_id: AtomicUsize,
}

impl Heap {
    pub fn new(args: HeapArguments) -> GcResult<Self> {
        args.validate()?;
        let max_workers = args.max_workers();
        log::info!(target: "gc", "Heap: {} object(s), {} GC worker(s)", args.max_objects, max_workers);
        log::debug!(target: "gc", "{:?}", args);

        Ok(Self {
            arena: ObjectArena::new(args.max_objects),
            marking_context: MarkingContext::new(args.max_objects),
            task_queues: ObjToScanQueueSet::new(max_workers),
            satb_mark_queue_set: SatbMarkQueueSet::new(
                args.satb_buffer_size,
                args.satb_buffer_enqueue_threshold_percent,
            ),
            threads: Threads::new(),
            safepoint: SafepointSynchronize::new(),
            code_cache: CodeCache::new(),
            ref_processor: ReferenceProcessor::new(),
            global_roots: Mutex::new(Vec::new()),
            string_dedup_queue: Mutex::new(Vec::new()),
            workers: WorkerThreads::new("GC Thread", max_workers),
            is_concurrent_mark_in_progress: SharedFlag::new(),
            cancelled_gc: SharedEnumFlag::new(GC_CANCELLABLE),
            clear_all_soft_refs: SharedFlag::new(),
            gc_id: AtomicUsize::new(0),
            args,
        })
    }

    pub fn args(&self) -> &HeapArguments {
        &self.args
    }

    pub fn arena(&self) -> &ObjectArena {
        &self.arena
    }

    pub fn object(&self, obj: ObjectRef) -> Option<&HeapObject> {
        self.arena.get(obj)
    }

    pub fn marking_context(&self) -> &MarkingContext {
        &self.marking_context
    }

    pub fn task_queues(&self) -> &ObjToScanQueueSet {
        &self.task_queues
    }

    pub fn satb_mark_queue_set(&self) -> &SatbMarkQueueSet {
        &self.satb_mark_queue_set
    }

    pub fn threads(&self) -> &Threads {
        &self.threads
    }

    pub fn safepoint(&self) -> &SafepointSynchronize {
        &self.safepoint
    }

    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    pub fn ref_processor(&self) -> &ReferenceProcessor {
        &self.ref_processor
    }

    pub fn workers(&self) -> &WorkerThreads {
        &self.workers
    }

    /// Attaches the calling thread as a mutator.
    pub fn attach_thread(&self) -> Mutator<'_> {
        Mutator::attach(self)
    }

    pub fn add_global_root(&self, obj: ObjectRef) {
        self.global_roots.lock().push(obj);
    }

    pub fn remove_global_root(&self, obj: ObjectRef) -> bool {
        let mut roots = self.global_roots.lock();
        match roots.iter().rposition(|root| *root == obj) {
            Some(position) => {
                roots.swap_remove(position);
                true
            }
            None => false,
        }
    }

    pub fn global_roots(&self) -> Vec<ObjectRef> {
        self.global_roots.lock().clone()
    }

    pub fn register_nmethod(&self, oops: Vec<ObjectRef>) -> Arc<NMethod> {
        self.code_cache.register(oops)
    }

    pub fn is_concurrent_mark_in_progress(&self) -> bool {
        self.is_concurrent_mark_in_progress.is_set()
    }

    /// Must be called at a safepoint. Activates or deactivates SATB logging
    /// on every thread together with the flag.
    pub fn set_concurrent_mark_in_progress(&self, in_progress: bool) {
        self.satb_mark_queue_set
            .set_active_all_threads(&self.threads, in_progress, !in_progress);
        self.is_concurrent_mark_in_progress.set_cond(in_progress);
    }

    /// Returns true if this call cancelled the collection.
    pub fn try_cancel_gc(&self) -> bool {
        let prev = self.cancelled_gc.cmpxchg(GC_CANCELLABLE, GC_CANCELLED);
        prev == GC_CANCELLABLE
    }

    pub fn cancel_gc(&self) {
        if self.try_cancel_gc() {
            log::info!(target: "gc", "GC({}) Cancelling GC", self.gc_id());
        }
    }

    pub fn cancelled_gc(&self) -> bool {
        self.cancelled_gc.get() == GC_CANCELLED
    }

    pub fn clear_cancelled_gc(&self) {
        self.cancelled_gc.set(GC_CANCELLABLE);
    }

    pub fn should_clear_all_soft_refs(&self) -> bool {
        self.clear_all_soft_refs.is_set()
    }

    pub fn set_clear_all_soft_refs(&self, clear: bool) {
        self.clear_all_soft_refs.set_cond(clear);
    }

    pub fn gc_id(&self) -> usize {
        self.gc_id.load(Ordering::Relaxed)
    }

    fn next_gc_id(&self) -> usize {
        self.gc_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Starts a new marking cycle: clears the bitmap and snapshots
    /// top-at-mark-start. Must be called at a safepoint.
    pub fn prepare_gc(&self) {
        self.marking_context.clear_bitmap();
        self.marking_context.capture_top_at_mark_start(self.arena.top());
        self.marking_context.mark_incomplete();
    }

    pub fn is_marked(&self, obj: ObjectRef) -> bool {
        self.marking_context.is_marked(obj)
    }

    pub(crate) fn enqueue_string_dedup_requests(&self, requests: impl Iterator<Item = ObjectRef>) {
        self.string_dedup_queue.lock().extend(requests);
    }

    pub fn take_string_dedup_requests(&self) -> Vec<ObjectRef> {
        std::mem::take(&mut *self.string_dedup_queue.lock())
    }

    /// Runs a concurrent cycle, finishing it stop-the-world if it gets
    /// cancelled. Returns true if the concurrent cycle completed on its own.
    ///
    /// Must be called from a thread that is not inside a mutator heap
    /// access.
    pub fn request_gc(&self) -> bool {
        self.next_gc_id();
        let mut gc = ConcurrentGC::new(self);
        if gc.collect() {
            return true;
        }
        DegeneratedGC::new(self, gc.degen_point()).collect();
        false
    }

    /// Runs a stop-the-world cycle that also clears soft references.
    pub fn request_full_gc(&self) {
        self.next_gc_id();
        FullGC::new(self).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::object::ObjectKind;

    fn heap() -> Heap {
        Heap::new(HeapArguments {
            parallel_gc_threads: 2,
            conc_gc_threads: 1,
            max_objects: 64,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_cancellation() {
        let heap = heap();
        assert!(!heap.cancelled_gc());
        assert!(heap.try_cancel_gc());
        assert!(!heap.try_cancel_gc());
        assert!(heap.cancelled_gc());
        heap.clear_cancelled_gc();
        assert!(!heap.cancelled_gc());
    }

    #[test]
    fn test_global_roots() {
        let heap = heap();
        let mutator = heap.attach_thread();
        let obj = mutator.allocate(ObjectKind::Regular, 0).unwrap();
        heap.add_global_root(obj);
        assert_eq!(heap.global_roots(), vec![obj]);
        assert!(heap.remove_global_root(obj));
        assert!(!heap.remove_global_root(obj));
    }

    #[test]
    fn test_invalid_arguments() {
        let err = Heap::new(HeapArguments {
            mark_loop_stride: 0,
            ..Default::default()
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_prepare_gc_captures_tams() {
        let heap = heap();
        let mutator = heap.attach_thread();
        let before = mutator.allocate(ObjectKind::Regular, 0).unwrap();
        {
            let _sp = heap.safepoint().begin();
            heap.prepare_gc();
        }
        let after = mutator.allocate(ObjectKind::Regular, 0).unwrap();
        assert!(!heap.is_marked(before));
        assert!(heap.is_marked(after));
        assert_eq!(heap.marking_context().top_at_mark_start(), 1);
    }
}
