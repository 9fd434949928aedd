//! Worker behaviour against in-memory storage.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use hopper_queue::{
    JobContext, JobError, JobHandler, JobOptions, JobPatch, JobStatus, KvStorage, Manager,
    QueueConfig, QueueContext, Storage,
};
use hopper_scheduler::{ScheduleOptions, Scheduler};
use hopper_worker::{Worker, WorkerExit, WorkerOptions};

#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    Fail,
    Panic,
    Sleep(u64),
}

struct TestJob {
    job_type: &'static str,
    behaviour: Behaviour,
    options: JobOptions,
    failed_calls: Arc<AtomicUsize>,
    failed_callback_errors: bool,
}

impl TestJob {
    fn new(job_type: &'static str, behaviour: Behaviour) -> Self {
        Self {
            job_type,
            behaviour,
            options: JobOptions::default(),
            failed_calls: Arc::new(AtomicUsize::new(0)),
            failed_callback_errors: false,
        }
    }

    fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl JobHandler for TestJob {
    fn job_type(&self) -> &str {
        self.job_type
    }

    fn options(&self) -> JobOptions {
        self.options.clone()
    }

    async fn handle(&self, ctx: JobContext) -> Result<Option<Value>, JobError> {
        match self.behaviour {
            Behaviour::Succeed => {
                ctx.progress(50.0, Some("halfway")).await;
                Ok(Some(json!({"echo": ctx.payload().clone()})))
            }
            Behaviour::Fail => Err(JobError::new("boom").with_kind("test_failure")),
            Behaviour::Panic => panic!("handler exploded"),
            Behaviour::Sleep(secs) => {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                Ok(None)
            }
        }
    }

    async fn failed(&self, _ctx: JobContext, _error: &JobError) -> Result<(), JobError> {
        self.failed_calls.fetch_add(1, Ordering::SeqCst);
        if self.failed_callback_errors {
            return Err(JobError::new("callback broke"));
        }
        Ok(())
    }
}

fn manager() -> Manager {
    let context = QueueContext::new(QueueConfig::default());
    Manager::new(Arc::new(KvStorage::in_memory()), context)
}

async fn worker(manager: &Manager, options: WorkerOptions) -> Worker {
    Worker::build(manager.clone(), options.sleep(0).memory_limit(0))
        .await
        .unwrap()
}

/// Make a released job available again without waiting out its backoff.
async fn make_available(manager: &Manager, id: &str) {
    let patch = JobPatch {
        available_at: Some(Utc::now()),
        ..Default::default()
    };
    manager.storage().update(id, patch).await.unwrap();
}

#[tokio::test]
async fn test_successful_job_completes() {
    let manager = manager();
    manager.register(Arc::new(TestJob::new("test:ok", Behaviour::Succeed)));
    let worker = worker(&manager, WorkerOptions::default()).await;

    let id = manager.push("test:ok", json!({"n": 1}), None).await.unwrap();
    let job = manager.pop(None).await.unwrap().unwrap();
    let result = worker.process_job(job).await;

    assert!(result.success());
    assert!(!result.failed());
    assert_eq!(result.output, Some(json!({"echo": {"n": 1}})));

    let record = manager.record(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.progress, 100.0);
    assert_eq!(record.result, Some(json!({"echo": {"n": 1}})));
    assert_eq!(record.worker_id.as_deref(), Some(worker.id()));
    assert!(record.completed_at.is_some());
}

#[tokio::test]
async fn test_failing_job_retries_then_fails() {
    let manager = manager();
    let handler = Arc::new(
        TestJob::new("test:fail", Behaviour::Fail).with_options(JobOptions::default().tries(2)),
    );
    let failed_calls = handler.failed_calls.clone();
    manager.register(handler);
    let worker = worker(&manager, WorkerOptions::default().backoff(1)).await;

    let id = manager.push("test:fail", json!({}), None).await.unwrap();

    let first = worker.process_job(manager.pop(None).await.unwrap().unwrap()).await;
    assert!(first.will_retry());
    assert_eq!(failed_calls.load(Ordering::SeqCst), 0);

    let record = manager.record(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.attempts, 1);

    make_available(&manager, &id).await;
    let second = worker.process_job(manager.pop(None).await.unwrap().unwrap()).await;
    assert_eq!(second.status, JobStatus::Failed);
    assert_eq!(failed_calls.load(Ordering::SeqCst), 1);

    let record = manager.record(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.attempts, 2);
    assert_eq!(record.error.as_deref(), Some("boom"));
    assert_eq!(record.exception.unwrap().kind, "test_failure");
    assert!(record.failed_at.is_some());

    // a failed job is not picked up again
    assert!(manager.pop(None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_retry_backoff_is_quadratic() {
    let manager = manager();
    manager.register(Arc::new(
        TestJob::new("test:fail", Behaviour::Fail).with_options(JobOptions::default().tries(4)),
    ));
    let worker = worker(&manager, WorkerOptions::default().backoff(10)).await;

    let id = manager.push("test:fail", json!({}), None).await.unwrap();

    for expected in [10, 40, 90] {
        let before = Utc::now();
        let result = worker.process_job(manager.pop(None).await.unwrap().unwrap()).await;
        assert!(result.will_retry());

        let record = manager.record(&id).await.unwrap().unwrap();
        let delay = (record.available_at - before).num_seconds();
        assert!(
            (expected - 1..=expected + 1).contains(&delay),
            "expected a delay of about {expected}s, got {delay}s"
        );
        make_available(&manager, &id).await;
    }

    let last = worker.process_job(manager.pop(None).await.unwrap().unwrap()).await;
    assert_eq!(last.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_timeout_fails_job() {
    let manager = manager();
    manager.register(Arc::new(
        TestJob::new("test:slow", Behaviour::Sleep(30))
            .with_options(JobOptions::default().timeout(1).tries(1)),
    ));
    let worker = worker(&manager, WorkerOptions::default()).await;

    let id = manager.push("test:slow", json!({}), None).await.unwrap();
    let result = worker.process_job(manager.pop(None).await.unwrap().unwrap()).await;

    assert_eq!(result.status, JobStatus::Failed);
    assert!(result.duration < Duration::from_secs(5));
    assert_eq!(result.error.unwrap().kind, "timeout");

    let record = manager.record(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.exception.unwrap().kind, "timeout");
}

#[tokio::test]
async fn test_panicking_handler_fails_job() {
    let manager = manager();
    manager.register(Arc::new(
        TestJob::new("test:panic", Behaviour::Panic).with_options(JobOptions::default().tries(1)),
    ));
    let worker = worker(&manager, WorkerOptions::default()).await;

    let id = manager.push("test:panic", json!({}), None).await.unwrap();
    let result = worker.process_job(manager.pop(None).await.unwrap().unwrap()).await;

    assert_eq!(result.status, JobStatus::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.kind, "panic");
    assert!(error.message.contains("handler exploded"));

    let record = manager.record(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_failing_failed_callback_is_isolated() {
    let manager = manager();
    let mut handler =
        TestJob::new("test:fail", Behaviour::Fail).with_options(JobOptions::default().tries(1));
    handler.failed_callback_errors = true;
    let handler = Arc::new(handler);
    let failed_calls = handler.failed_calls.clone();
    manager.register(handler);
    manager.register(Arc::new(TestJob::new("test:ok", Behaviour::Succeed)));
    let worker = worker(&manager, WorkerOptions::default()).await;

    let failing = manager.push("test:fail", json!({}), None).await.unwrap();
    let ok = manager.push("test:ok", json!({}), None).await.unwrap();

    let first = worker.process_job(manager.pop(None).await.unwrap().unwrap()).await;
    assert_eq!(first.status, JobStatus::Failed);
    assert_eq!(failed_calls.load(Ordering::SeqCst), 1);

    let second = worker.process_job(manager.pop(None).await.unwrap().unwrap()).await;
    assert!(second.success());

    let failing = manager.record(&failing).await.unwrap().unwrap();
    assert_eq!(failing.status, JobStatus::Failed);
    let ok = manager.record(&ok).await.unwrap().unwrap();
    assert_eq!(ok.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_run_once_processes_one_job() {
    let manager = manager();
    manager.register(Arc::new(TestJob::new("test:ok", Behaviour::Succeed)));
    let worker = worker(&manager, WorkerOptions::default()).await;

    manager.push("test:ok", json!({}), None).await.unwrap();
    manager.push("test:ok", json!({}), None).await.unwrap();

    let exit = tokio::time::timeout(Duration::from_secs(5), worker.run(None, true))
        .await
        .unwrap();
    assert_eq!(exit, WorkerExit::Once);
    assert_eq!(worker.jobs_processed(), 1);

    let stats = manager.stats().await.unwrap();
    assert_eq!(stats.count(JobStatus::Completed), 1);
    assert_eq!(stats.count(JobStatus::Pending), 1);
}

#[tokio::test]
async fn test_queue_order_is_respected() {
    let manager = manager();
    manager.register(Arc::new(TestJob::new("test:ok", Behaviour::Succeed)));
    let worker = worker(&manager, WorkerOptions::default()).await;

    let low = manager.push("test:ok", json!({}), Some("low")).await.unwrap();
    let high = manager.push("test:ok", json!({}), Some("high")).await.unwrap();

    let queues = vec!["high".to_string(), "low".to_string()];
    let exit = tokio::time::timeout(Duration::from_secs(5), worker.run(Some(queues), true))
        .await
        .unwrap();
    assert_eq!(exit, WorkerExit::Once);

    let high = manager.record(&high).await.unwrap().unwrap();
    assert_eq!(high.status, JobStatus::Completed);
    let low = manager.record(&low).await.unwrap().unwrap();
    assert_eq!(low.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_max_jobs_stops_worker() {
    let manager = manager();
    manager.register(Arc::new(TestJob::new("test:ok", Behaviour::Succeed)));
    let worker = worker(&manager, WorkerOptions::default().max_jobs(2)).await;

    for _ in 0..3 {
        manager.push("test:ok", json!({}), None).await.unwrap();
    }

    let exit = tokio::time::timeout(Duration::from_secs(5), worker.run(None, false))
        .await
        .unwrap();
    assert_eq!(exit, WorkerExit::MaxJobs);
    assert_eq!(worker.jobs_processed(), 2);
}

#[tokio::test]
async fn test_stop_ends_idle_worker() {
    let manager = manager();
    let worker = Arc::new(
        Worker::build(manager.clone(), WorkerOptions::default().sleep(60).memory_limit(0))
            .await
            .unwrap(),
    );

    let running = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(None, false).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(worker.status().running);

    worker.stop();
    let exit = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit, WorkerExit::Stopped);
    assert!(!worker.status().running);
}

#[tokio::test]
async fn test_worker_runs_due_schedules() {
    let manager = manager();
    manager.register(Arc::new(TestJob::new("test:ok", Behaviour::Succeed)));
    let scheduler = Arc::new(Scheduler::new(manager.clone()).await.unwrap());
    let id = scheduler
        .schedule("* * * * *", "test:ok".into(), json!({"from": "cron"}), ScheduleOptions::default())
        .await
        .unwrap();
    scheduler
        .set_next_run(&id, Some(Utc::now() - chrono::Duration::minutes(1)))
        .await
        .unwrap();

    let worker = Worker::new(
        manager.clone(),
        scheduler.clone(),
        WorkerOptions::default().sleep(0).memory_limit(0),
    );
    let exit = tokio::time::timeout(Duration::from_secs(5), worker.run(None, true))
        .await
        .unwrap();
    assert_eq!(exit, WorkerExit::Once);

    let completed = manager
        .get_by_status(JobStatus::Completed, 10, 0)
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].payload, json!({"from": "cron"}));

    let schedule = scheduler.find(&id).await.unwrap();
    assert!(schedule.last_run.is_some());
    assert!(schedule.next_run.unwrap() > Utc::now());
}

#[tokio::test]
async fn test_status_reports_worker_state() {
    let manager = manager();
    let worker = worker(&manager, WorkerOptions::default()).await;

    let status = worker.status();
    assert_eq!(status.worker_id, worker.id());
    assert!(!status.running);
    assert_eq!(status.started_at, None);
    assert_eq!(status.jobs_processed, 0);
    assert!(worker.id().contains(&std::process::id().to_string()));
}
