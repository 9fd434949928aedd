//! Error types for the queue core.

use thiserror::Error;

use crate::JobStatus;

/// Errors that can occur in queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No handler is registered for the job type.
    #[error("job type '{0}' is not registered")]
    UnknownJobType(String),

    /// Job not found.
    #[error("job with ID '{0}' not found")]
    NotFound(String),

    /// The job is not in a state that allows the requested operation.
    #[error("job '{id}' is {status}, only failed jobs can be retried")]
    InvalidState { id: String, status: JobStatus },

    /// The key-value backend rejected an operation.
    #[error("backend error: {0}")]
    Backend(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error from a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
