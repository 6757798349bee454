pub mod monitor;
pub mod worker_threads;
