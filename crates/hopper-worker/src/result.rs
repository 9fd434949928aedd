//! Outcome of one job execution.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use hopper_queue::{JobError, JobStatus};

/// What happened when a worker ran a job.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: String,
    /// Status the job was left in: completed, pending (released for a retry)
    /// or failed.
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub output: Option<Value>,
    pub error: Option<JobError>,
}

impl JobResult {
    pub fn success(&self) -> bool {
        self.status == JobStatus::Completed
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// Released for another attempt.
    pub fn will_retry(&self) -> bool {
        self.status == JobStatus::Pending
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration.as_secs_f64()
    }

    pub fn duration_ms(&self) -> u128 {
        self.duration.as_millis()
    }
}
