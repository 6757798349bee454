use super::{
    concurrent_mark::ConcurrentMark, heap::Heap, ConcurrentPhase, DegenPoint, GenerationMode,
    PausePhase,
};

/// A marking cycle that does most of its work concurrently with mutators:
/// a short init-mark pause, concurrent marking, and a final-mark pause.
pub struct ConcurrentGC<'a> {
    heap: &'a Heap,
    degen_point: DegenPoint,
    generation: GenerationMode,
}

impl<'a> ConcurrentGC<'a> {
    pub fn new(heap: &'a Heap) -> Self {
        Self::with_generation(heap, GenerationMode::NonGenerational)
    }

    pub fn with_generation(heap: &'a Heap, generation: GenerationMode) -> Self {
        Self {
            heap,
            degen_point: DegenPoint::Unset,
            generation,
        }
    }

    pub fn degen_point(&self) -> DegenPoint {
        self.degen_point
    }

    fn check_cancellation_and_abort(&mut self, point: DegenPoint) -> bool {
        if self.heap.cancelled_gc() {
            self.degen_point = point;
            return true;
        }
        false
    }

    /// Returns false if the cycle was cancelled; [`degen_point`](Self::degen_point)
    /// then tells where a degenerated cycle has to pick up.
    pub fn collect(&mut self) -> bool {
        let heap = self.heap;
        let start = std::time::Instant::now();
        let mark = ConcurrentMark::with_generation(heap, self.generation);

        {
            let _sp = heap.safepoint().begin();
            let _phase = PausePhase::new(heap, "Init Mark");
            heap.prepare_gc();

            let rp = heap.ref_processor();
            rp.set_soft_reference_policy(heap.should_clear_all_soft_refs());
            rp.enable_discovery();

            heap.set_concurrent_mark_in_progress(true);
            heap.code_cache().arm_nmethods();
            mark.mark_stw_roots();
        }

        {
            let _phase = ConcurrentPhase::new(heap, "Mark");
            mark.concurrent_mark();
        }
        if self.check_cancellation_and_abort(DegenPoint::ConcurrentMark) {
            log::info!(target: "gc", "GC({}) Concurrent mark cancelled", heap.gc_id());
            return false;
        }

        {
            let _sp = heap.safepoint().begin();
            let _phase = PausePhase::new(heap, "Final Mark");
            mark.finish_mark();
            heap.code_cache().disarm_nmethods();
            heap.ref_processor().process_references(heap);
        }

        log::info!(
            target: "gc",
            "GC({}) Concurrent cycle: {} object(s) marked in {}ms",
            heap.gc_id(),
            heap.marking_context().marked_count(),
            start.elapsed().as_micros() as f64 / 1000.0
        );
        true
    }
}
