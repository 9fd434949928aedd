//! Persisted job types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum number of log entries kept on a job record. Oldest entries are
/// evicted first.
pub const MAX_JOB_LOGS: usize = 100;

/// Current status of a job.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting to be processed.
    #[default]
    Pending,
    /// Job is currently being processed.
    Running,
    /// Job completed successfully.
    Completed,
    /// Job failed after all retry attempts.
    Failed,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
        }
    }

    /// Completed and failed jobs never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Only failed jobs can be retried.
    pub fn can_retry(&self) -> bool {
        *self == JobStatus::Failed
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!(
                "invalid job status '{}', expected pending/running/completed/failed",
                other
            )),
        }
    }
}

/// Per-job execution options.
///
/// Unset fields fall back to the handler's defaults and then to the
/// configured worker defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Queue override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Delay in seconds before the job becomes available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// Maximum attempts override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Base backoff in seconds override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<u64>,
    /// Timeout in seconds override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl JobOptions {
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn delay(mut self, seconds: u64) -> Self {
        self.delay = Some(seconds);
        self
    }

    pub fn tries(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, seconds: u64) -> Self {
        self.backoff = Some(seconds);
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    /// Layer these options over `base`; fields set here win.
    pub fn merged_over(self, base: &JobOptions) -> JobOptions {
        JobOptions {
            queue: self.queue.or_else(|| base.queue.clone()),
            delay: self.delay.or(base.delay),
            max_attempts: self.max_attempts.or(base.max_attempts),
            backoff: self.backoff.or(base.backoff),
            timeout: self.timeout.or(base.timeout),
        }
    }
}

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// A progress or diagnostic line attached to a job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub context: Value,
}

/// Structured snapshot of the failure that made a job fail permanently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionDetail {
    /// Error class, e.g. `timeout`, `panic` or a Rust type name.
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    /// `file:line` where the error was raised, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// The canonical persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job ID, immutable once assigned.
    pub id: String,
    /// Registered job type identifier.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Human-readable job name.
    #[serde(default)]
    pub name: String,
    pub queue: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub options: JobOptions,
    pub status: JobStatus,
    /// Incremented every time the job starts running.
    pub attempts: u32,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub progress_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// The job must not be dequeued before this instant.
    pub available_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    /// Set while a worker holds the job.
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub exception: Option<ExceptionDetail>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl JobRecord {
    /// Create a new pending record.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        job_type: String,
        name: String,
        queue: String,
        payload: Value,
        options: JobOptions,
        created_at: DateTime<Utc>,
        available_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_type,
            name,
            queue,
            payload,
            options,
            status: JobStatus::Pending,
            attempts: 0,
            progress: 0.0,
            progress_message: None,
            created_at,
            available_at: available_at.max(created_at),
            updated_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            worker_id: None,
            result: None,
            error: None,
            exception: None,
            logs: Vec::new(),
        }
    }

    /// Whether a worker may dequeue this record at `now`.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.available_at <= now
    }

    /// Append a log entry, evicting the oldest entries past [`MAX_JOB_LOGS`].
    pub fn push_log(&mut self, entry: LogEntry) {
        self.logs.push(entry);
        if self.logs.len() > MAX_JOB_LOGS {
            let excess = self.logs.len() - MAX_JOB_LOGS;
            self.logs.drain(..excess);
        }
    }
}

/// A partial update merged into a stored record.
///
/// `None` leaves a field untouched. Fields that can be cleared use a nested
/// `Option`.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub attempts: Option<u32>,
    pub available_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<Option<String>>,
    pub result: Option<Option<Value>>,
    pub error: Option<Option<String>>,
    pub exception: Option<Option<ExceptionDetail>>,
    pub progress: Option<f64>,
    pub progress_message: Option<Option<String>>,
    pub logs: Option<Vec<LogEntry>>,
}

impl JobPatch {
    /// Merge this patch into `record` and stamp `updated_at`.
    pub fn apply(self, record: &mut JobRecord, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(attempts) = self.attempts {
            // attempts only ever grows
            record.attempts = record.attempts.max(attempts);
        }
        if let Some(at) = self.available_at {
            record.available_at = at;
        }
        if let Some(at) = self.started_at {
            record.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            record.completed_at = Some(at);
        }
        if let Some(at) = self.failed_at {
            record.failed_at = Some(at);
        }
        if let Some(worker_id) = self.worker_id {
            record.worker_id = worker_id;
        }
        if let Some(result) = self.result {
            record.result = result;
        }
        if let Some(error) = self.error {
            record.error = error;
        }
        if let Some(exception) = self.exception {
            record.exception = exception;
        }
        if let Some(progress) = self.progress {
            record.progress = progress;
        }
        if let Some(message) = self.progress_message {
            record.progress_message = message;
        }
        if let Some(logs) = self.logs {
            record.logs = logs;
        }
        record.updated_at = Some(now);
    }
}

/// Aggregate counts over every stored job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub by_status: BTreeMap<JobStatus, usize>,
    pub by_queue: BTreeMap<String, usize>,
}

impl QueueStats {
    /// Empty statistics with every status present at zero.
    pub fn empty() -> Self {
        Self {
            total: 0,
            by_status: JobStatus::ALL.iter().map(|s| (*s, 0)).collect(),
            by_queue: BTreeMap::new(),
        }
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use serde_json::json;

    fn record() -> JobRecord {
        let now = Utc::now();
        JobRecord::new(
            "job-1".to_string(),
            "test:job".to_string(),
            "Test Job".to_string(),
            "default".to_string(),
            json!({"key": "value"}),
            JobOptions::default(),
            now,
            now,
        )
    }

    fn log_entry(n: usize) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            message: format!("line {}", n),
            context: Value::Null,
        }
    }

    #[test]
    fn test_new_record_is_pending() {
        let record = record();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.worker_id.is_none());
        assert!(record.available_at >= record.created_at);
    }

    #[test]
    fn test_available_at_never_precedes_created_at() {
        let now = Utc::now();
        let record = JobRecord::new(
            "id".to_string(),
            "t".to_string(),
            "t".to_string(),
            "default".to_string(),
            Value::Null,
            JobOptions::default(),
            now,
            now - Duration::hours(1),
        );
        assert_eq!(record.available_at, now);
    }

    #[test]
    fn test_is_available() {
        let mut record = record();
        let now = Utc::now();
        assert!(record.is_available(now));

        record.available_at = now + Duration::seconds(60);
        assert!(!record.is_available(now));

        record.available_at = now;
        record.status = JobStatus::Running;
        assert!(!record.is_available(now));
    }

    #[test]
    fn test_status_terminal_and_retry() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());

        assert!(JobStatus::Failed.can_retry());
        assert!(!JobStatus::Completed.can_retry());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("FAILED".parse::<JobStatus>(), Ok(JobStatus::Failed));
        assert!("processing".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn test_patch_merges_and_stamps() {
        let mut record = record();
        let now = Utc::now();
        JobPatch {
            status: Some(JobStatus::Running),
            attempts: Some(1),
            worker_id: Some(Some("worker-1".to_string())),
            ..Default::default()
        }
        .apply(&mut record, now);

        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(record.updated_at, Some(now));
        // untouched
        assert_eq!(record.payload, json!({"key": "value"}));

        JobPatch {
            worker_id: Some(None),
            ..Default::default()
        }
        .apply(&mut record, now);
        assert!(record.worker_id.is_none());
    }

    #[test]
    fn test_patch_never_decreases_attempts() {
        let mut record = record();
        record.attempts = 3;
        JobPatch {
            attempts: Some(1),
            ..Default::default()
        }
        .apply(&mut record, Utc::now());
        assert_eq!(record.attempts, 3);
    }

    #[test]
    fn test_options_merge() {
        let base = JobOptions::default().tries(2).timeout(30).on_queue("low");
        let merged = JobOptions::default().on_queue("high").merged_over(&base);
        assert_eq!(merged.queue.as_deref(), Some("high"));
        assert_eq!(merged.max_attempts, Some(2));
        assert_eq!(merged.timeout, Some(30));
        assert_eq!(merged.backoff, None);
    }

    #[test]
    fn test_record_json_uses_type_key() {
        let value = serde_json::to_value(record()).unwrap();
        assert_eq!(value["type"], "test:job");
        assert_eq!(value["status"], "pending");
    }

    #[test]
    fn test_stats_empty_has_all_statuses() {
        let stats = QueueStats::empty();
        for status in JobStatus::ALL {
            assert_eq!(stats.count(status), 0);
        }
        assert_eq!(stats.by_status.len(), 4);
    }

    proptest! {
        // The log never exceeds the cap and always keeps the newest entries
        #[test]
        fn logs_are_bounded(count in 0usize..300) {
            let mut record = record();
            for i in 0..count {
                record.push_log(log_entry(i));
            }

            prop_assert_eq!(record.logs.len(), count.min(MAX_JOB_LOGS));
            if count > 0 {
                let last = record.logs.last().unwrap();
                prop_assert_eq!(&last.message, &format!("line {}", count - 1));
            }
            if count > MAX_JOB_LOGS {
                let first = record.logs.first().unwrap();
                prop_assert_eq!(&first.message, &format!("line {}", count - MAX_JOB_LOGS));
            }
        }
    }
}
