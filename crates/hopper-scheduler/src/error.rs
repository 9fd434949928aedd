//! Error types for the scheduler.

use hopper_queue::QueueError;
use thiserror::Error;

/// Errors raised while parsing a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    /// Wrong number of fields or a value that is not a number.
    #[error("invalid cron format: {0}")]
    InvalidFormat(String),

    /// Range whose start is greater than its end.
    #[error("invalid range '{range}' in {field} field")]
    InvalidRange { field: &'static str, range: String },

    /// Step that is zero or not a number.
    #[error("invalid step '{step}' in {field} field")]
    InvalidStep { field: &'static str, step: String },

    /// Literal outside the field's bounds.
    #[error("{field} value {value} is out of bounds ({min}-{max})")]
    OutOfBounds {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cron expression was rejected.
    #[error("invalid cron expression '{expression}': {source}")]
    InvalidCronExpression {
        expression: String,
        #[source]
        source: CronError,
    },

    /// Unknown IANA timezone name.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Schedule not found.
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    /// Queue error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}
