//! Parallel and concurrent marking for a snapshot-at-the-beginning
//! collector.
//!
//! The entry points are [`Heap`](heap::heap::Heap), which owns all collector
//! state and hands out [`Mutator`](heap::thread::Mutator) handles, and the
//! cycle drivers in [`heap`]. Worker termination uses the work-stealing
//! protocol of [`utils::task_terminator`].

pub mod env;
pub mod error;
pub mod heap;
pub mod sync;
pub mod utils;

pub use error::{GcError, GcResult};
pub use heap::{
    arguments::HeapArguments,
    concurrent_mark::{ConcurrentMark, ConcurrentMarkStats},
    heap::Heap,
    mark::STWMark,
    object::{ObjectKind, ObjectRef},
    thread::Mutator,
    GenerationMode,
};
pub use utils::task_terminator::{TaskTerminator, WorkStealingArguments};
