//! The worker loop.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use hopper_queue::{Job, JobError, JobStatus, Manager};
use hopper_scheduler::Scheduler;

use crate::memory::{MemoryProbe, host_name};
use crate::{JobResult, WorkerError, WorkerOptions};

/// Why [`Worker::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// A stop was requested.
    Stopped,
    /// Processed-job limit reached; the supervisor should restart us.
    MaxJobs,
    /// Memory limit reached; the supervisor should restart us.
    MemoryLimit,
    /// Once mode processed its job.
    Once,
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerExit::Stopped => "stopped",
            WorkerExit::MaxJobs => "max jobs reached",
            WorkerExit::MemoryLimit => "memory limit exceeded",
            WorkerExit::Once => "processed one job",
        };
        f.write_str(s)
    }
}

/// Snapshot returned by [`Worker::status`].
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<u64>,
    pub jobs_processed: u64,
    pub memory_bytes: u64,
}

/// Pulls jobs from a set of queues and runs them one at a time.
///
/// Handlers run on a spawned task under a watchdog. When the timeout fires
/// the task is aborted at its next await point; handler code that blocks
/// without yielding can still overrun it.
pub struct Worker {
    manager: Manager,
    scheduler: Arc<Scheduler>,
    options: WorkerOptions,
    id: String,
    jobs_processed: AtomicU64,
    running: AtomicBool,
    started_at: Mutex<Option<(DateTime<Utc>, Instant)>>,
    memory: Mutex<MemoryProbe>,
    shutdown: watch::Sender<bool>,
}

impl Worker {
    pub fn new(manager: Manager, scheduler: Arc<Scheduler>, options: WorkerOptions) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}:{}:{}", host_name(), std::process::id(), &suffix[..8]);
        let (shutdown, _) = watch::channel(false);
        Self {
            manager,
            scheduler,
            options,
            id,
            jobs_processed: AtomicU64::new(0),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            memory: Mutex::new(MemoryProbe::new()),
            shutdown,
        }
    }

    /// Build a worker with its own scheduler loaded from storage.
    pub async fn build(manager: Manager, options: WorkerOptions) -> Result<Self, WorkerError> {
        let scheduler = Arc::new(Scheduler::new(manager.clone()).await?);
        Ok(Self::new(manager, scheduler, options))
    }

    /// Unique per host and process.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed.load(Ordering::SeqCst)
    }

    /// Ask the loop to stop after the current job.
    pub fn stop(&self) {
        info!(worker.id = %self.id, "stop requested");
        self.shutdown.send_replace(true);
    }

    fn stop_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run until stopped, a restart threshold is hit, or (in once mode) one
    /// job was processed. `queues` defaults to every registered queue.
    #[tracing::instrument(skip(self), fields(worker.id = %self.id))]
    pub async fn run(&self, queues: Option<Vec<String>>, once: bool) -> WorkerExit {
        let queues = match queues {
            Some(queues) if !queues.is_empty() => queues,
            _ => self.manager.context().registered_queues(),
        };
        let mut shutdown = self.shutdown.subscribe();

        self.running.store(true, Ordering::SeqCst);
        if let Ok(mut started) = self.started_at.lock() {
            *started = Some((Utc::now(), Instant::now()));
        }
        info!(queues = ?queues, "worker started");

        let exit = 'outer: loop {
            if self.stop_requested() {
                break WorkerExit::Stopped;
            }

            match self.scheduler.run_due().await {
                Ok(queued) if !queued.is_empty() => {
                    debug!(count = queued.len(), "queued scheduled jobs");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "failed to run scheduled jobs"),
            }

            let mut processed = false;
            for queue in &queues {
                let job = match self.manager.pop(Some(queue.as_str())).await {
                    Ok(Some(job)) => job,
                    Ok(None) => continue,
                    Err(e) => {
                        error!(queue = %queue, error = %e, "failed to fetch job");
                        continue;
                    }
                };

                self.process_job(job).await;
                processed = true;
                self.jobs_processed.fetch_add(1, Ordering::SeqCst);

                if let Some(reason) = self.restart_reason() {
                    info!(jobs_processed = self.jobs_processed(), reason = %reason, "worker restarting");
                    break 'outer reason;
                }
                if once {
                    break 'outer WorkerExit::Once;
                }
            }

            if !processed {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(self.options.sleep)) => {}
                    changed = shutdown.changed() => {
                        // the sender lives in `self`, so this only errors if
                        // we are being torn down
                        if changed.is_err() {
                            break WorkerExit::Stopped;
                        }
                    }
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        info!(jobs_processed = self.jobs_processed(), reason = %exit, "worker stopped");
        exit
    }

    fn restart_reason(&self) -> Option<WorkerExit> {
        if self.jobs_processed() >= self.options.effective_max_jobs() {
            return Some(WorkerExit::MaxJobs);
        }
        if self.options.memory > 0 {
            let used = self.memory.lock().map(|mut m| m.current_mb()).unwrap_or(0);
            if used >= self.options.memory {
                warn!(used_mb = used, limit_mb = self.options.memory, "memory limit exceeded");
                return Some(WorkerExit::MemoryLimit);
            }
        }
        None
    }

    /// Run one job to a resolution: completed, released for a retry, or
    /// failed.
    #[tracing::instrument(skip(self, job), fields(job.id = %job.id(), job_type = %job.job_type()))]
    pub async fn process_job(&self, mut job: Job) -> JobResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(queue = %job.queue(), "processing job");

        match self.manager.mark_running(job.id(), &self.id).await {
            Ok(Some(attempts)) => job.set_attempts(attempts),
            Ok(None) => {
                warn!("job record disappeared before it could run");
                let error = JobError::new("job record no longer exists").with_kind("missing");
                return finish(&job, JobStatus::Failed, started_at, clock, None, Some(error));
            }
            Err(e) => {
                error!(error = %e, "failed to mark job running");
                let attempts = job.attempts() + 1;
                job.set_attempts(attempts);
            }
        }

        match self.execute(&job).await {
            Ok(output) => {
                if let Err(e) = self.manager.mark_completed(job.id(), output.clone()).await {
                    error!(error = %e, "failed to mark job completed");
                }
                let result = finish(&job, JobStatus::Completed, started_at, clock, output, None);
                info!(duration_ms = result.duration_ms() as u64, "job completed");
                result
            }
            Err(err) => self.handle_failure(&job, err, started_at, clock).await,
        }
    }

    async fn execute(&self, job: &Job) -> Result<Option<serde_json::Value>, JobError> {
        let timeout = job.timeout(self.options.timeout);
        let handler = job.handler().clone();
        let ctx = job.context(self.manager.clone());
        let mut task = tokio::spawn(async move { handler.handle(ctx).await });

        if timeout == 0 {
            return joined(task.await);
        }
        match tokio::time::timeout(Duration::from_secs(timeout), &mut task).await {
            Ok(result) => joined(result),
            Err(_) => {
                task.abort();
                Err(JobError::timeout(timeout))
            }
        }
    }

    async fn handle_failure(
        &self,
        job: &Job,
        err: JobError,
        started_at: DateTime<Utc>,
        clock: Instant,
    ) -> JobResult {
        let max_attempts = job.max_attempts(self.options.tries);
        warn!(
            attempts = job.attempts(),
            max_attempts,
            kind = %err.kind,
            error = %err,
            "job failed"
        );

        if job.should_retry(self.options.tries) {
            let delay = job.retry_backoff(self.options.backoff);
            if let Err(e) = self.manager.release(job.id(), delay).await {
                error!(error = %e, "failed to release job");
            }
            info!(delay_secs = delay.as_secs(), attempts = job.attempts(), max_attempts, "job released for retry");
            return finish(job, JobStatus::Pending, started_at, clock, None, Some(err));
        }

        if let Err(e) = self.manager.mark_failed(job.id(), &err).await {
            error!(error = %e, "failed to mark job failed");
        }

        let handler = job.handler().clone();
        let ctx = job.context(self.manager.clone());
        let callback_err = err.clone();
        match tokio::spawn(async move { handler.failed(ctx, &callback_err).await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "failure callback returned an error"),
            Err(e) => error!(error = %e, "failure callback panicked"),
        }

        finish(job, JobStatus::Failed, started_at, clock, None, Some(err))
    }

    pub fn status(&self) -> WorkerStatus {
        let started = self.started_at.lock().ok().and_then(|s| *s);
        WorkerStatus {
            worker_id: self.id.clone(),
            running: self.running.load(Ordering::SeqCst) && !self.stop_requested(),
            started_at: started.map(|(at, _)| at),
            uptime_secs: started.map(|(_, clock)| clock.elapsed().as_secs()),
            jobs_processed: self.jobs_processed(),
            memory_bytes: self.memory.lock().map(|mut m| m.current_bytes()).unwrap_or(0),
        }
    }
}

fn finish(
    job: &Job,
    status: JobStatus,
    started_at: DateTime<Utc>,
    clock: Instant,
    output: Option<serde_json::Value>,
    error: Option<JobError>,
) -> JobResult {
    JobResult {
        job_id: job.id().to_string(),
        status,
        started_at,
        finished_at: Utc::now(),
        duration: clock.elapsed(),
        output,
        error,
    }
}

fn joined(
    result: Result<Result<Option<serde_json::Value>, JobError>, JoinError>,
) -> Result<Option<serde_json::Value>, JobError> {
    match result {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(JobError::panic(panic_message(e.into_panic()))),
        Err(e) => Err(JobError::new(format!("job task was cancelled: {}", e)).with_kind("cancelled")),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("job panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("job panicked: {}", s)
    } else {
        "job panicked".to_string()
    }
}
