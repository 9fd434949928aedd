//! Queue manager: the public face of the queue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::storage::Storage;
use crate::{
    Job, JobError, JobHandler, JobOptions, JobPatch, JobRecord, JobSpec, JobStatus, LogEntry,
    LogLevel, QueueConfig, QueueContext, QueueError, QueueStats,
};

/// Orchestrates storage for producers, workers and admin tools.
#[derive(Clone)]
pub struct Manager {
    storage: Arc<dyn Storage>,
    context: Arc<QueueContext>,
}

impl Manager {
    pub fn new(storage: Arc<dyn Storage>, context: Arc<QueueContext>) -> Self {
        Self { storage, context }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn context(&self) -> &Arc<QueueContext> {
        &self.context
    }

    pub fn config(&self) -> &QueueConfig {
        self.context.config()
    }

    /// Register a handler with this manager's registry.
    pub fn register(&self, handler: Arc<dyn JobHandler>) {
        self.context.registry().register(handler);
    }

    /// Enqueue a job for immediate processing.
    pub async fn push(
        &self,
        job: impl Into<JobSpec>,
        payload: Value,
        queue: Option<&str>,
    ) -> Result<String, QueueError> {
        self.enqueue(job.into(), payload, queue.map(str::to_string), JobOptions::default(), None)
            .await
    }

    /// Enqueue a job that becomes available after `delay_seconds`.
    pub async fn later(
        &self,
        delay_seconds: u64,
        job: impl Into<JobSpec>,
        payload: Value,
        queue: Option<&str>,
    ) -> Result<String, QueueError> {
        self.enqueue(
            job.into(),
            payload,
            queue.map(str::to_string),
            JobOptions::default(),
            Some(delay_seconds),
        )
        .await
    }

    /// Enqueue with explicit per-job options. `options.delay` postpones
    /// availability.
    pub async fn push_with_options(
        &self,
        job: impl Into<JobSpec>,
        payload: Value,
        options: JobOptions,
    ) -> Result<String, QueueError> {
        self.enqueue(job.into(), payload, None, options, None).await
    }

    #[tracing::instrument(skip(self, payload, options), fields(job_type = %spec.job_type()))]
    async fn enqueue(
        &self,
        spec: JobSpec,
        payload: Value,
        queue: Option<String>,
        options: JobOptions,
        delay: Option<u64>,
    ) -> Result<String, QueueError> {
        let handler = self.context.registry().resolve(&spec)?;
        let options = options.merged_over(&handler.options());
        let queue = queue
            .or_else(|| options.queue.clone())
            .unwrap_or_else(|| self.config().default_queue.clone());
        let delay = delay.or(options.delay).unwrap_or(0);

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let available_at = i64::try_from(delay)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| {
                QueueError::InvalidConfig(format!("delay of {} seconds is out of range", delay))
            })?;
        let record = JobRecord::new(
            id.clone(),
            handler.job_type().to_string(),
            handler.name().to_string(),
            queue.clone(),
            payload,
            options,
            now,
            available_at,
        );

        self.storage.push(&queue, record).await?;
        info!(job.id = %id, queue = %queue, delay, "job queued");
        Ok(id)
    }

    /// Take the next available job from `queue` (default queue if `None`).
    ///
    /// A record whose type is no longer registered is marked failed and
    /// reported as [`QueueError::UnknownJobType`].
    #[tracing::instrument(skip(self))]
    pub async fn pop(&self, queue: Option<&str>) -> Result<Option<Job>, QueueError> {
        let queue = queue.unwrap_or(&self.config().default_queue);
        let Some(record) = self.storage.pop(queue).await? else {
            return Ok(None);
        };

        match self.context.registry().lookup(&record.job_type) {
            Some(handler) => {
                debug!(job.id = %record.id, "job dequeued");
                Ok(Some(Job::new(record, handler)))
            }
            None => {
                let err = QueueError::UnknownJobType(record.job_type.clone());
                warn!(job.id = %record.id, error = %err, "dequeued job has no handler");
                let detail = JobError::from_error(&err).with_kind("unknown_job_type");
                self.storage
                    .mark_failed(&record.id, err.to_string(), Some(detail.detail()))
                    .await?;
                Err(err)
            }
        }
    }

    /// A runnable job by id.
    pub async fn find(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let Some(record) = self.storage.get(id).await? else {
            return Ok(None);
        };
        let handler = self
            .context
            .registry()
            .lookup(&record.job_type)
            .ok_or_else(|| QueueError::UnknownJobType(record.job_type.clone()))?;
        Ok(Some(Job::new(record, handler)))
    }

    /// The stored record by id, whether or not its type is registered.
    pub async fn record(&self, id: &str) -> Result<Option<JobRecord>, QueueError> {
        self.storage.get(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), QueueError> {
        self.storage.delete(id).await
    }

    /// Re-enqueue a failed job under a new id. The failed record is kept.
    #[tracing::instrument(skip(self))]
    pub async fn retry(&self, id: &str) -> Result<String, QueueError> {
        let record = self
            .storage
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        if !record.status.can_retry() {
            return Err(QueueError::InvalidState {
                id: id.to_string(),
                status: record.status,
            });
        }

        let options = JobOptions {
            delay: None,
            ..record.options
        };
        let new_id = self
            .enqueue(
                JobSpec::Type(record.job_type),
                record.payload,
                Some(record.queue),
                options,
                None,
            )
            .await?;
        info!(job.id = %id, new_id = %new_id, "failed job retried");
        Ok(new_id)
    }

    /// Returns the new attempt count.
    pub async fn mark_running(&self, id: &str, worker_id: &str) -> Result<Option<u32>, QueueError> {
        self.storage.mark_running(id, worker_id).await
    }

    pub async fn mark_completed(&self, id: &str, result: Option<Value>) -> Result<(), QueueError> {
        self.storage.mark_completed(id, result).await
    }

    /// Fail permanently, keeping a structured snapshot of the error.
    pub async fn mark_failed(&self, id: &str, error: &JobError) -> Result<(), QueueError> {
        self.storage
            .mark_failed(id, error.message.clone(), Some(error.detail()))
            .await
    }

    pub async fn release(&self, id: &str, delay: Duration) -> Result<(), QueueError> {
        self.storage.release(id, delay).await
    }

    /// Append to the record's bounded log.
    pub async fn add_job_log(
        &self,
        id: &str,
        level: LogLevel,
        message: &str,
        context: Value,
    ) -> Result<(), QueueError> {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
            context,
        };
        self.storage.append_log(id, entry).await
    }

    /// Store progress, clamped to 0–100.
    pub async fn update_progress(
        &self,
        id: &str,
        percent: f64,
        message: Option<String>,
    ) -> Result<(), QueueError> {
        let percent = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 100.0) };
        self.storage
            .update(
                id,
                JobPatch {
                    progress: Some(percent),
                    progress_message: Some(message),
                    ..Default::default()
                },
            )
            .await
    }

    pub async fn get_by_status(
        &self,
        status: JobStatus,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, QueueError> {
        self.storage.get_by_status(status, limit, offset).await
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.storage.stats().await
    }

    pub async fn queues(&self) -> Result<BTreeMap<String, usize>, QueueError> {
        self.storage.queues().await
    }

    /// Retention sweep. `None` uses the configured window.
    #[tracing::instrument(skip(self))]
    pub async fn clear(
        &self,
        completed_hours: Option<u64>,
        failed_hours: Option<u64>,
    ) -> Result<usize, QueueError> {
        let retention = &self.config().retention;
        let cleared = self
            .storage
            .clear(
                completed_hours.unwrap_or(retention.completed),
                failed_hours.unwrap_or(retention.failed),
            )
            .await?;
        info!(cleared, "cleared old jobs");
        Ok(cleared)
    }

    /// Wipe every job, queue and schedule.
    pub async fn flush(&self) -> Result<(), QueueError> {
        warn!("flushing all queue data");
        self.storage.flush().await
    }
}
