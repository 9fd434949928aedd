//! Demonstration jobs used by `hopper example`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use hopper_queue::{JobContext, JobError, JobHandler, JobOptions};

pub const EXAMPLE_JOB: &str = "queues:example-job";
pub const FAILING_JOB: &str = "queues:failing-example";

/// Logs, reports progress and sleeps for `payload.duration` seconds.
pub struct ExampleJob;

#[async_trait]
impl JobHandler for ExampleJob {
    fn job_type(&self) -> &str {
        EXAMPLE_JOB
    }

    fn name(&self) -> &str {
        "Example job"
    }

    async fn handle(&self, ctx: JobContext) -> Result<Option<Value>, JobError> {
        let duration = ctx
            .payload()
            .get("duration")
            .and_then(Value::as_u64)
            .unwrap_or(1);
        let message = ctx
            .payload()
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("hello from hopper")
            .to_string();

        ctx.log_info("example job started", json!({"duration": duration}))
            .await;

        let steps = duration.max(1);
        for step in 1..=steps {
            if duration > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            let percent = step as f64 * 100.0 / steps as f64;
            ctx.progress(percent, Some(&format!("step {} of {}", step, steps)))
                .await;
        }

        ctx.log_info("example job finished", json!({"message": message}))
            .await;
        Ok(Some(json!({
            "message": message,
            "slept": duration,
            "attempt": ctx.attempts(),
        })))
    }
}

/// Always fails; gives up after two attempts.
pub struct FailingExampleJob;

#[async_trait]
impl JobHandler for FailingExampleJob {
    fn job_type(&self) -> &str {
        FAILING_JOB
    }

    fn name(&self) -> &str {
        "Failing example"
    }

    fn options(&self) -> JobOptions {
        JobOptions::default().tries(2).backoff(5)
    }

    async fn handle(&self, ctx: JobContext) -> Result<Option<Value>, JobError> {
        ctx.log_warning("about to fail on purpose", json!({"attempt": ctx.attempts()}))
            .await;
        Err(JobError::new("this job always fails").with_kind("example_failure"))
    }

    async fn failed(&self, ctx: JobContext, error: &JobError) -> Result<(), JobError> {
        tracing::warn!(job.id = %ctx.id(), error = %error, "example job gave up");
        Ok(())
    }
}
