/// Aggregate view over a set of work-stealing queues, as consumed by the
/// termination protocol.
///
/// All queries are approximate: queues are concurrently pushed to and
/// stolen from, so a count is only a snapshot.
pub trait TaskQueueSetSuper: Sync {
    /// Approximate number of pending tasks over all queues.
    fn tasks(&self) -> usize;
    /// Number of queues in the set.
    fn size(&self) -> usize;
    /// Whether any task is visible in any queue.
    fn peek(&self) -> bool {
        self.tasks() > 0
    }
}

/// When to terminate from the termination protocol.
pub trait TerminatorTerminator {
    fn should_exit_termination(&self) -> bool;
}

impl<F: Fn() -> bool> TerminatorTerminator for F {
    fn should_exit_termination(&self) -> bool {
        self()
    }
}
