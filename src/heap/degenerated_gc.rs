use super::{
    concurrent_mark::ConcurrentMark, heap::Heap, mark::STWMark, DegenPoint, GenerationMode,
    PausePhase,
};

/// Finishes a cancelled concurrent cycle inside a single pause.
pub struct DegeneratedGC<'a> {
    heap: &'a Heap,
    degen_point: DegenPoint,
    generation: GenerationMode,
}

impl<'a> DegeneratedGC<'a> {
    pub fn new(heap: &'a Heap, degen_point: DegenPoint) -> Self {
        Self::with_generation(heap, degen_point, GenerationMode::NonGenerational)
    }

    pub fn with_generation(heap: &'a Heap, degen_point: DegenPoint, generation: GenerationMode) -> Self {
        Self {
            heap,
            degen_point,
            generation,
        }
    }

    pub fn collect(&mut self) {
        let heap = self.heap;
        let start = std::time::Instant::now();
        let _sp = heap.safepoint().begin();
        heap.clear_cancelled_gc();

        // Each case falls through to the next one: the cycle is entered at
        // the point where the concurrent cycle gave up.
        if self.degen_point == DegenPoint::OutsideCycle || self.degen_point == DegenPoint::Unset {
            let _phase = PausePhase::new(heap, "Degenerated GC: Mark");
            if heap.is_concurrent_mark_in_progress() {
                ConcurrentMark::with_generation(heap, self.generation).cancel();
                heap.set_concurrent_mark_in_progress(false);
            }
            heap.prepare_gc();
            heap.workers()
                .set_active_workers(heap.args().parallel_gc_threads);
            STWMark::with_generation(heap, self.generation).mark();
            self.degen_point = DegenPoint::ConcurrentMark;
        } else if self.degen_point == DegenPoint::ConcurrentMark
            && heap.is_concurrent_mark_in_progress()
        {
            let _phase = PausePhase::new(heap, "Degenerated GC: Finish Mark");
            ConcurrentMark::with_generation(heap, self.generation).finish_mark();
        }

        {
            let _phase = PausePhase::new(heap, "Degenerated GC: Process References");
            heap.code_cache().disarm_nmethods();
            heap.ref_processor().process_references(heap);
        }

        log::info!(
            target: "gc",
            "GC({}) Degenerated cycle: {} object(s) marked in {}ms",
            heap.gc_id(),
            heap.marking_context().marked_count(),
            start.elapsed().as_micros() as f64 / 1000.0
        );
    }
}
