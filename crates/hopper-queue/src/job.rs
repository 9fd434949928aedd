//! Job handlers, runnable jobs and the job-type registry.

use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{ExceptionDetail, JobOptions, JobRecord, LogLevel, Manager, QueueError};

/// Code that executes one job type.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Globally unique type identifier, e.g. `mail:send`.
    fn job_type(&self) -> &str;

    /// Human-readable name shown in listings.
    fn name(&self) -> &str {
        self.job_type()
    }

    /// Handler-level defaults, overridden by per-job options.
    fn options(&self) -> JobOptions {
        JobOptions::default()
    }

    /// Run the job. The returned value is stored as the job's result.
    async fn handle(&self, ctx: JobContext) -> Result<Option<Value>, JobError>;

    /// Called once after the final attempt failed. Errors are logged and
    /// dropped.
    async fn failed(&self, _ctx: JobContext, _error: &JobError) -> Result<(), JobError> {
        Ok(())
    }
}

/// Failure raised by a job handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct JobError {
    pub kind: String,
    pub message: String,
    pub code: Option<i64>,
    pub location: Option<String>,
    pub trace: Option<String>,
}

impl JobError {
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        let caller = Location::caller();
        Self {
            kind: "job_error".to_string(),
            message: message.into(),
            code: None,
            location: Some(format!("{}:{}", caller.file(), caller.line())),
            trace: None,
        }
    }

    /// Wrap any error, keeping its source chain as the trace.
    #[track_caller]
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        let caller = Location::caller();
        Self {
            kind: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
            code: None,
            location: Some(format!("{}:{}", caller.file(), caller.line())),
            trace: (!chain.is_empty()).then(|| chain.join("\n")),
        }
    }

    /// The handler ran past its time limit.
    pub fn timeout(seconds: u64) -> Self {
        Self {
            kind: "timeout".to_string(),
            message: format!("job exceeded its timeout of {} seconds", seconds),
            code: None,
            location: None,
            trace: None,
        }
    }

    /// The handler panicked.
    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            kind: "panic".to_string(),
            message: message.into(),
            code: None,
            location: None,
            trace: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Snapshot stored on a permanently failed record.
    pub fn detail(&self) -> ExceptionDetail {
        ExceptionDetail {
            kind: self.kind.clone(),
            message: self.message.clone(),
            code: self.code,
            location: self.location.clone(),
            trace: self.trace.clone(),
        }
    }
}

impl From<serde_json::Error> for JobError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        JobError::from_error(&err)
    }
}

impl From<std::io::Error> for JobError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        JobError::from_error(&err)
    }
}

impl From<QueueError> for JobError {
    #[track_caller]
    fn from(err: QueueError) -> Self {
        JobError::from_error(&err)
    }
}

/// What a handler sees while it runs.
#[derive(Clone)]
pub struct JobContext {
    record: JobRecord,
    manager: Manager,
}

impl JobContext {
    pub fn new(record: JobRecord, manager: Manager) -> Self {
        Self { record, manager }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn job_type(&self) -> &str {
        &self.record.job_type
    }

    pub fn queue(&self) -> &str {
        &self.record.queue
    }

    /// Attempt number of the current run, starting at 1.
    pub fn attempts(&self) -> u32 {
        self.record.attempts
    }

    pub fn payload(&self) -> &Value {
        &self.record.payload
    }

    /// Deserialize the payload into a typed struct.
    #[track_caller]
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.record.payload.clone()).map_err(|e| JobError::from_error(&e))
    }

    /// Report progress, clamped to 0–100.
    pub async fn progress(&self, percent: f64, message: Option<&str>) {
        if let Err(e) = self
            .manager
            .update_progress(&self.record.id, percent, message.map(str::to_string))
            .await
        {
            warn!(job.id = %self.record.id, error = %e, "failed to store job progress");
        }
    }

    pub async fn log_debug(&self, message: &str, context: Value) {
        self.log(LogLevel::Debug, message, context).await;
    }

    pub async fn log_info(&self, message: &str, context: Value) {
        self.log(LogLevel::Info, message, context).await;
    }

    pub async fn log_warning(&self, message: &str, context: Value) {
        self.log(LogLevel::Warning, message, context).await;
    }

    pub async fn log_error(&self, message: &str, context: Value) {
        self.log(LogLevel::Error, message, context).await;
    }

    async fn log(&self, level: LogLevel, message: &str, context: Value) {
        let id = self.record.id.as_str();
        let job_type = self.record.job_type.as_str();
        match level {
            LogLevel::Debug => debug!(job.id = %id, job_type = %job_type, "{}", message),
            LogLevel::Info => info!(job.id = %id, job_type = %job_type, "{}", message),
            LogLevel::Warning => warn!(job.id = %id, job_type = %job_type, "{}", message),
            LogLevel::Error => error!(job.id = %id, job_type = %job_type, "{}", message),
        }
        if let Err(e) = self.manager.add_job_log(id, level, message, context).await {
            warn!(job.id = %id, error = %e, "failed to store job log");
        }
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("id", &self.record.id)
            .field("job_type", &self.record.job_type)
            .field("attempts", &self.record.attempts)
            .finish()
    }
}

/// A stored record paired with the handler that runs it.
#[derive(Clone)]
pub struct Job {
    record: JobRecord,
    handler: Arc<dyn JobHandler>,
}

impl Job {
    pub fn new(record: JobRecord, handler: Arc<dyn JobHandler>) -> Self {
        Self { record, handler }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn job_type(&self) -> &str {
        &self.record.job_type
    }

    pub fn queue(&self) -> &str {
        &self.record.queue
    }

    pub fn payload(&self) -> &Value {
        &self.record.payload
    }

    pub fn attempts(&self) -> u32 {
        self.record.attempts
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn handler(&self) -> &Arc<dyn JobHandler> {
        &self.handler
    }

    /// Record the attempt count written by `mark_running`.
    pub fn set_attempts(&mut self, attempts: u32) {
        self.record.attempts = self.record.attempts.max(attempts);
    }

    /// Per-job options layered over the handler's.
    pub fn options(&self) -> JobOptions {
        self.record.options.clone().merged_over(&self.handler.options())
    }

    pub fn max_attempts(&self, default: u32) -> u32 {
        self.options().max_attempts.unwrap_or(default).max(1)
    }

    pub fn backoff(&self, default: u64) -> u64 {
        self.options().backoff.unwrap_or(default)
    }

    pub fn timeout(&self, default: u64) -> u64 {
        self.options().timeout.unwrap_or(default)
    }

    /// Whether a failure at the current attempt count should be retried.
    pub fn should_retry(&self, default_tries: u32) -> bool {
        self.record.attempts < self.max_attempts(default_tries)
    }

    /// `backoff * attempts²`, using the attempt count that just failed.
    pub fn retry_backoff(&self, default_backoff: u64) -> Duration {
        let attempts = u64::from(self.record.attempts);
        let seconds = self
            .backoff(default_backoff)
            .saturating_mul(attempts.saturating_mul(attempts));
        Duration::from_secs(seconds)
    }

    pub fn context(&self, manager: Manager) -> JobContext {
        JobContext::new(self.record.clone(), manager)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.record.id)
            .field("job_type", &self.record.job_type)
            .field("queue", &self.record.queue)
            .field("attempts", &self.record.attempts)
            .finish()
    }
}

/// How a caller names the job to enqueue: by registered type, or with a
/// ready handler that is registered on first use.
#[derive(Clone)]
pub enum JobSpec {
    Type(String),
    Handler(Arc<dyn JobHandler>),
}

impl JobSpec {
    pub fn job_type(&self) -> &str {
        match self {
            JobSpec::Type(t) => t,
            JobSpec::Handler(h) => h.job_type(),
        }
    }
}

impl fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobSpec::Type(t) => f.debug_tuple("Type").field(t).finish(),
            JobSpec::Handler(h) => f.debug_tuple("Handler").field(&h.job_type()).finish(),
        }
    }
}

impl From<&str> for JobSpec {
    fn from(job_type: &str) -> Self {
        JobSpec::Type(job_type.to_string())
    }
}

impl From<String> for JobSpec {
    fn from(job_type: String) -> Self {
        JobSpec::Type(job_type)
    }
}

impl From<Arc<dyn JobHandler>> for JobSpec {
    fn from(handler: Arc<dyn JobHandler>) -> Self {
        JobSpec::Handler(handler)
    }
}

/// Maps job type identifiers to handlers.
#[derive(Default)]
pub struct JobRegistry {
    handlers: DashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type.
    pub fn register(&self, handler: Arc<dyn JobHandler>) {
        let job_type = handler.job_type().to_string();
        debug!(job_type = %job_type, "registered job handler");
        self.handlers.insert(job_type, handler);
    }

    pub fn lookup(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).map(|h| h.value().clone())
    }

    /// Registered type identifiers, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    /// Find the handler for a spec, registering ready handlers that are not
    /// known yet.
    pub fn resolve(&self, spec: &JobSpec) -> Result<Arc<dyn JobHandler>, QueueError> {
        match spec {
            JobSpec::Type(job_type) => self
                .lookup(job_type)
                .ok_or_else(|| QueueError::UnknownJobType(job_type.clone())),
            JobSpec::Handler(handler) => {
                if !self.handlers.contains_key(handler.job_type()) {
                    self.register(handler.clone());
                }
                Ok(handler.clone())
            }
        }
    }
}
