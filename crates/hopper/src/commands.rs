//! Command implementations.

use std::sync::Arc;

use miette::Result;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use hopper_queue::JobStatus;
use hopper_scheduler::ScheduleOptions;
use hopper_worker::{Worker, WorkerExit, WorkerOptions};

use crate::app::App;
use crate::jobs::{EXAMPLE_JOB, FAILING_JOB};

/// Failed jobs considered by `retry all`.
const RETRY_ALL_LIMIT: usize = 1000;

const EXAMPLE_QUEUES: [&str; 3] = ["high", "default", "low"];

/// Push `count` example jobs across the example queues, plus one delayed and
/// one failing job.
pub async fn example(app: &App, count: usize) -> Result<()> {
    for i in 0..count {
        let queue = EXAMPLE_QUEUES[i % EXAMPLE_QUEUES.len()];
        let payload = json!({
            "duration": 1 + (i % 3) as u64,
            "message": format!("example job #{}", i + 1),
        });
        let id = app
            .manager
            .push(EXAMPLE_JOB, payload, Some(queue))
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        println!("queued {} on {}", id, queue);
    }

    let delayed = app
        .manager
        .later(
            10,
            EXAMPLE_JOB,
            json!({"duration": 1, "message": "delayed example"}),
            None,
        )
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("queued {} (available in 10s)", delayed);

    let failing = app
        .manager
        .push(FAILING_JOB, json!({}), None)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("queued {} (fails on purpose)", failing);

    Ok(())
}

pub async fn status(app: &App) -> Result<()> {
    let stats = app
        .manager
        .stats()
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    let queues = app
        .manager
        .queues()
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    println!("Jobs: {}", stats.total);
    for status in JobStatus::ALL {
        println!("  {:<10} {}", status.label(), stats.count(status));
    }

    println!("\nQueues (pending / total):");
    for name in app.manager.context().registered_queues() {
        let pending = queues.get(&name).copied().unwrap_or(0);
        let total = stats.by_queue.get(&name).copied().unwrap_or(0);
        println!("  {:<10} {} / {}", name, pending, total);
    }

    let failed = app
        .manager
        .get_by_status(JobStatus::Failed, 10, 0)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    if !failed.is_empty() {
        println!("\nRecent failures:");
        for record in failed {
            println!(
                "  {} {} ({} attempts): {}",
                record.id,
                record.job_type,
                record.attempts,
                record.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}

/// Retry one failed job by id, or every failed job with `all`.
pub async fn retry(app: &App, target: &str) -> Result<()> {
    if target != "all" {
        let new_id = app
            .manager
            .retry(target)
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        println!("retried {} as {}", target, new_id);
        return Ok(());
    }

    let failed = app
        .manager
        .get_by_status(JobStatus::Failed, RETRY_ALL_LIMIT, 0)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    if failed.is_empty() {
        println!("No failed jobs.");
        return Ok(());
    }

    let mut retried = 0;
    for record in &failed {
        match app.manager.retry(&record.id).await {
            Ok(new_id) => {
                retried += 1;
                println!("  {} -> {}", record.id, new_id);
            }
            Err(e) => println!("  {} failed: {}", record.id, e),
        }
    }
    println!("Retried {} of {} failed job(s)", retried, failed.len());
    Ok(())
}

pub async fn clear(app: &App, completed: Option<u64>, failed: Option<u64>) -> Result<()> {
    let removed = app
        .manager
        .clear(completed, failed)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("Removed {} job(s)", removed);
    Ok(())
}

pub async fn schedules(app: &App) -> Result<()> {
    let schedules = app.scheduler.all().await;
    if schedules.is_empty() {
        println!("No schedules.");
        return Ok(());
    }

    for schedule in &schedules {
        let next = schedule
            .next_run
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        let last = schedule
            .last_run
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!("{}  {}  {}", schedule.id, schedule.expression, schedule.job);
        println!("    timezone {}  last {}  next {}", schedule.timezone, last, next);
    }

    if let Some(next) = app.scheduler.next_due().await {
        println!("\nNext: {} ({})", next.job, next.id);
    }
    Ok(())
}

pub struct ScheduleArgs {
    pub expression: String,
    pub job_type: String,
    pub payload: Option<String>,
    pub queue: Option<String>,
    pub timezone: Option<String>,
    pub allow_overlap: bool,
}

pub async fn schedule(app: &App, args: ScheduleArgs) -> Result<()> {
    let payload = match args.payload.as_deref() {
        Some(raw) => serde_json::from_str::<Value>(raw)
            .map_err(|e| miette::miette!("payload is not valid JSON: {}", e))?,
        None => json!({}),
    };

    let mut options = ScheduleOptions::default();
    if let Some(queue) = args.queue {
        options = options.on_queue(queue);
    }
    if let Some(timezone) = args.timezone {
        options = options.timezone(timezone);
    }
    if args.allow_overlap {
        options = options.without_overlapping(false);
    }

    let id = app
        .scheduler
        .schedule(&args.expression, args.job_type.into(), payload, options)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    let next = app
        .scheduler
        .find(&id)
        .await
        .and_then(|s| s.next_run)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    println!("scheduled {} (next run {})", id, next);
    Ok(())
}

pub async fn unschedule(app: &App, id: &str) -> Result<()> {
    app.scheduler
        .unschedule(id)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("removed schedule {}", id);
    Ok(())
}

pub async fn flush(app: &App, force: bool) -> Result<()> {
    if !force && !confirm("This deletes every job and schedule. Type 'yes' to continue: ").await? {
        println!("Aborted.");
        return Ok(());
    }
    app.manager
        .flush()
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    app.scheduler
        .reload()
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("Flushed all queue data.");
    Ok(())
}

async fn confirm(prompt: &str) -> Result<bool> {
    print!("{}", prompt);
    std::io::Write::flush(&mut std::io::stdout()).map_err(|e| miette::miette!("{}", e))?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .map_err(|e| miette::miette!("failed to read confirmation: {}", e))?;
    Ok(line.trim().eq_ignore_ascii_case("yes"))
}

/// Split a comma-separated queue list, dropping blanks.
pub fn parse_queues(raw: Option<&str>) -> Option<Vec<String>> {
    let queues: Vec<String> = raw?
        .split(',')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .collect();
    (!queues.is_empty()).then_some(queues)
}

pub async fn work(
    app: App,
    queues: Option<Vec<String>>,
    once: bool,
    options: WorkerOptions,
) -> Result<()> {
    if let Some(queues) = &queues {
        for queue in queues {
            app.manager.context().register_queue(queue.clone());
        }
    }

    let worker = Arc::new(Worker::new(app.manager.clone(), app.scheduler.clone(), options));

    let signal_worker = Arc::clone(&worker);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        signal_worker.stop();
    });

    let exit = worker.run(queues, once).await;
    let status = worker.status();
    match exit {
        WorkerExit::MaxJobs | WorkerExit::MemoryLimit => {
            warn!(reason = %exit, jobs_processed = status.jobs_processed, "worker exiting for restart");
        }
        WorkerExit::Stopped | WorkerExit::Once => {}
    }
    println!(
        "Worker {} exited ({}), {} job(s) processed",
        status.worker_id, exit, status.jobs_processed
    );
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
