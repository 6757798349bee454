use std::time::Instant;

use self::{heap::Heap, object::Affiliation};

pub mod arguments;
pub mod code_roots;
pub mod concurrent_gc;
pub mod concurrent_mark;
pub mod degenerated_gc;
pub mod full_gc;
pub mod heap;
pub mod mark;
pub mod marking_context;
pub mod object;
pub mod reference_processor;
pub mod root_processor;
pub mod safepoint;
pub mod satb_mark_queue;
pub mod shared_vars;
pub mod string_dedup;
pub mod taskqueue;
pub mod thread;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum DegenPoint {
    Unset,
    OutsideCycle,
    ConcurrentMark,
}

/// Which objects a marking cycle traces.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GenerationMode {
    Young,
    Old,
    Global,
    NonGenerational,
}

impl GenerationMode {
    pub fn contains(self, affiliation: Affiliation) -> bool {
        match self {
            GenerationMode::Young => affiliation == Affiliation::Young,
            GenerationMode::Old => affiliation == Affiliation::Old,
            GenerationMode::Global | GenerationMode::NonGenerational => true,
        }
    }
}

pub struct ConcurrentPhase {
    name: &'static str,
    gc_id: usize,
    start: Instant,
}

pub struct PausePhase {
    name: &'static str,
    gc_id: usize,
    start: Instant,
}

impl ConcurrentPhase {
    pub fn new(heap: &Heap, name: &'static str) -> Self {
        Self {
            name,
            gc_id: heap.gc_id(),
            start: Instant::now(),
        }
    }
}

impl Drop for ConcurrentPhase {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        log::info!(target: "gc", "GC({}) Concurrent {} {}ms", self.gc_id, self.name, elapsed.as_micros() as f64 / 1000.0);
    }
}

impl PausePhase {
    pub fn new(heap: &Heap, name: &'static str) -> Self {
        Self {
            name,
            gc_id: heap.gc_id(),
            start: Instant::now(),
        }
    }
}

impl Drop for PausePhase {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        log::info!(target: "gc", "GC({}) Pause {} {}ms", self.gc_id, self.name, elapsed.as_micros() as f64 / 1000.0);
    }
}
