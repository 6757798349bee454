use super::{
    concurrent_mark::ConcurrentMark, heap::Heap, mark::STWMark, string_dedup::StringDedupMode,
    PausePhase,
};

/// Stop-the-world marking that also clears every softly reachable
/// referent. Aborts a concurrent cycle that is still running.
pub struct FullGC<'a> {
    heap: &'a Heap,
}

impl<'a> FullGC<'a> {
    pub fn new(heap: &'a Heap) -> Self {
        Self { heap }
    }

    pub fn collect(&mut self) {
        let heap = self.heap;
        let start = std::time::Instant::now();
        let _sp = heap.safepoint().begin();
        let _phase = PausePhase::new(heap, "Full GC");

        if heap.is_concurrent_mark_in_progress() {
            ConcurrentMark::new(heap).cancel();
            heap.set_concurrent_mark_in_progress(false);
        }
        heap.clear_cancelled_gc();
        heap.set_clear_all_soft_refs(true);

        heap.prepare_gc();
        heap.workers()
            .set_active_workers(heap.args().parallel_gc_threads);
        let mut mark = STWMark::new(heap);
        mark.set_dedup_mode(StringDedupMode::for_full_gc(heap));
        mark.mark();
        let stats = heap.ref_processor().process_references(heap);

        heap.set_clear_all_soft_refs(false);
        log::info!(
            target: "gc",
            "GC({}) Full GC: {} object(s) marked, {} reference(s) cleared in {}ms",
            heap.gc_id(),
            heap.marking_context().marked_count(),
            stats.cleared,
            start.elapsed().as_micros() as f64 / 1000.0
        );
    }
}
