//! Error types for the worker.

use hopper_queue::QueueError;
use hopper_scheduler::SchedulerError;
use thiserror::Error;

/// Errors that can occur while setting up a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Queue error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Scheduler error.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}
