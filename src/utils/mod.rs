pub mod task_terminator;
pub mod taskqueue;
