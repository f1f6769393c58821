//! Scheduler error types.
//!
//! Timeouts applied inside the queue are never returned from queue
//! operations directly; they surface through each payload's completion
//! channel as [`ScheduleError::DeadlineExceeded`].

use thiserror::Error;

/// Errors surfaced by the scheduling core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Enqueue refused because the level's queue is at capacity.
    #[error("queue full: {current}/{max} pending requests")]
    QueueFull { current: usize, max: usize },

    /// Per-request deadline elapsed under the reject policy.
    #[error("deadline exceeded after {waited_ms}ms in queue")]
    DeadlineExceeded { waited_ms: u64 },

    /// A shape-tensor peek failed while starting a pending batch.
    #[error("shape peek failed for input '{0}'")]
    ShapePeek(String),

    /// Dequeue called on an empty queue.
    #[error("dequeue on empty queue")]
    EmptyQueue,

    /// Scheduler is tearing down; the request was not executed.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl ScheduleError {
    /// True when the error is expected back-pressure rather than a fault.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }
}
