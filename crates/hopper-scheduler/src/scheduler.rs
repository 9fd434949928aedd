//! Recurring job scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use hopper_queue::{JobSpec, JobStatus, Manager, QueueError};

use crate::types::parse_timezone;
use crate::{CronExpression, Schedule, ScheduleOptions, SchedulerError, schedule_id};

/// How long an overlap flag survives if nobody clears it.
const RUNNING_FLAG_TTL: Duration = Duration::from_secs(24 * 60 * 60);

fn running_flag(schedule_id: &str) -> String {
    format!("schedule.running.{}", schedule_id)
}

/// Owns the schedule table and enqueues due jobs through the manager.
///
/// The table is loaded from storage when the scheduler is built and written
/// back whole after every change. Two schedulers in different processes do
/// not see each other's changes until they reload.
pub struct Scheduler {
    manager: Manager,
    schedules: Arc<RwLock<BTreeMap<String, Schedule>>>,
}

impl Scheduler {
    /// Create a scheduler and load the persisted table.
    pub async fn new(manager: Manager) -> Result<Self, SchedulerError> {
        let scheduler = Self {
            manager,
            schedules: Arc::new(RwLock::new(BTreeMap::new())),
        };
        scheduler.reload().await?;
        Ok(scheduler)
    }

    /// Replace the in-memory table with the persisted one.
    #[tracing::instrument(skip(self))]
    pub async fn reload(&self) -> Result<(), SchedulerError> {
        let table: BTreeMap<String, Schedule> = match self.manager.storage().get_scheduled().await? {
            Some(value) => serde_json::from_value(value).map_err(QueueError::from)?,
            None => BTreeMap::new(),
        };
        debug!(count = table.len(), "loaded schedules");
        *self.schedules.write().await = table;
        Ok(())
    }

    async fn persist(&self, table: &BTreeMap<String, Schedule>) -> Result<(), SchedulerError> {
        let value = serde_json::to_value(table).map_err(QueueError::from)?;
        self.manager.storage().save_scheduled(value).await?;
        Ok(())
    }

    /// Register a recurring job and return its id.
    ///
    /// Scheduling the same job type with the same expression again replaces
    /// the payload and options but keeps the run history.
    #[tracing::instrument(skip(self, job, payload, options), fields(job_type = %job.job_type()))]
    pub async fn schedule(
        &self,
        expression: &str,
        job: JobSpec,
        payload: Value,
        options: ScheduleOptions,
    ) -> Result<String, SchedulerError> {
        let cron = CronExpression::parse(expression).map_err(|source| {
            SchedulerError::InvalidCronExpression {
                expression: expression.to_string(),
                source,
            }
        })?;
        let timezone = options
            .timezone
            .clone()
            .unwrap_or_else(|| self.manager.config().schedule.timezone.clone());
        let cron = cron.with_timezone(parse_timezone(&timezone)?);

        let handler = self.manager.context().registry().resolve(&job)?;
        let job_type = handler.job_type().to_string();
        let id = schedule_id(&job_type, cron.expression());

        let mut table = self.schedules.write().await;
        let last_run = table.get(&id).and_then(|s| s.last_run);
        let mut schedule = Schedule {
            id: id.clone(),
            expression: cron.expression().to_string(),
            job: job_type,
            payload,
            options,
            timezone,
            last_run,
            next_run: None,
        };
        schedule.next_run = schedule.calculate_next_run(Utc::now())?;

        info!(
            schedule.id = %id,
            expression = %schedule.expression,
            next_run = ?schedule.next_run,
            "schedule registered"
        );
        table.insert(id.clone(), schedule);
        self.persist(&table).await?;
        Ok(id)
    }

    /// Remove a schedule.
    #[tracing::instrument(skip(self))]
    pub async fn unschedule(&self, id: &str) -> Result<(), SchedulerError> {
        let mut table = self.schedules.write().await;
        if table.remove(id).is_none() {
            return Err(SchedulerError::ScheduleNotFound(id.to_string()));
        }
        self.persist(&table).await?;
        info!(schedule.id = %id, "schedule removed");
        Ok(())
    }

    /// All schedules ordered by id.
    pub async fn all(&self) -> Vec<Schedule> {
        self.schedules.read().await.values().cloned().collect()
    }

    pub async fn find(&self, id: &str) -> Option<Schedule> {
        self.schedules.read().await.get(id).cloned()
    }

    /// The schedule that fires soonest.
    pub async fn next_due(&self) -> Option<Schedule> {
        self.schedules
            .read()
            .await
            .values()
            .filter(|s| s.next_run.is_some())
            .min_by_key(|s| s.next_run)
            .cloned()
    }

    /// Override when a schedule fires next.
    pub async fn set_next_run(
        &self,
        id: &str,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), SchedulerError> {
        let mut table = self.schedules.write().await;
        let schedule = table
            .get_mut(id)
            .ok_or_else(|| SchedulerError::ScheduleNotFound(id.to_string()))?;
        schedule.next_run = next_run;
        self.persist(&table).await
    }

    /// Enqueue every due schedule. Returns the ids of the queued jobs.
    pub async fn run_due(&self) -> Result<Vec<String>, SchedulerError> {
        self.run_due_at(Utc::now()).await
    }

    /// [`run_due`](Self::run_due) as of `now`.
    ///
    /// A failure to enqueue one schedule is logged and does not stop the
    /// others.
    #[tracing::instrument(skip(self))]
    pub async fn run_due_at(&self, now: DateTime<Utc>) -> Result<Vec<String>, SchedulerError> {
        let prevent_default = self.manager.config().schedule.prevent_overlap;
        let mut table = self.schedules.write().await;
        let mut queued = Vec::new();

        for schedule in table.values_mut() {
            if !schedule.is_due(now) {
                continue;
            }

            let prevent_overlap = schedule.prevents_overlap(prevent_default);
            if prevent_overlap {
                match self.is_running(&schedule.id).await {
                    Ok(true) => {
                        debug!(schedule.id = %schedule.id, "previous run still outstanding, skipping");
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        error!(schedule.id = %schedule.id, error = %e, "failed to check overlap flag");
                        continue;
                    }
                }
            }

            let job_id = match self
                .manager
                .push(
                    JobSpec::Type(schedule.job.clone()),
                    schedule.payload.clone(),
                    schedule.options.queue.as_deref(),
                )
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    error!(schedule.id = %schedule.id, job_type = %schedule.job, error = %e, "failed to queue scheduled job");
                    continue;
                }
            };

            schedule.last_run = Some(now);
            schedule.next_run = match schedule.calculate_next_run(now) {
                Ok(next) => next,
                Err(e) => {
                    warn!(schedule.id = %schedule.id, error = %e, "cannot compute next run");
                    None
                }
            };

            if prevent_overlap {
                if let Err(e) = self.track_running(&schedule.id, &job_id).await {
                    warn!(schedule.id = %schedule.id, error = %e, "failed to set overlap flag");
                }
            }

            info!(
                schedule.id = %schedule.id,
                job.id = %job_id,
                next_run = ?schedule.next_run,
                "scheduled job queued"
            );
            queued.push(job_id);
        }

        if !queued.is_empty() {
            self.persist(&table).await?;
        }
        Ok(queued)
    }

    /// Whether the job recorded by the overlap flag is still pending or
    /// running. A stale flag is cleared.
    async fn is_running(&self, schedule_id: &str) -> Result<bool, QueueError> {
        let storage = self.manager.storage();
        let flag = running_flag(schedule_id);
        let Some(value) = storage.get_flag(&flag).await? else {
            return Ok(false);
        };

        let outstanding = match value.get("job_id").and_then(Value::as_str) {
            Some(job_id) => matches!(
                self.manager.record(job_id).await?.map(|r| r.status),
                Some(JobStatus::Pending | JobStatus::Running)
            ),
            None => false,
        };
        if !outstanding {
            storage.remove_flag(&flag).await?;
        }
        Ok(outstanding)
    }

    async fn track_running(&self, schedule_id: &str, job_id: &str) -> Result<(), QueueError> {
        self.manager
            .storage()
            .set_flag(
                &running_flag(schedule_id),
                json!({ "job_id": job_id, "started_at": Utc::now() }),
                Some(RUNNING_FLAG_TTL),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use hopper_queue::{
        JobContext, JobError, JobHandler, KvStorage, QueueConfig, QueueContext,
    };

    struct Scheduled;

    #[async_trait]
    impl JobHandler for Scheduled {
        fn job_type(&self) -> &str {
            "test:scheduled"
        }

        async fn handle(&self, _ctx: JobContext) -> Result<Option<Value>, JobError> {
            Ok(None)
        }
    }

    fn manager() -> Manager {
        let manager = Manager::new(
            Arc::new(KvStorage::in_memory()),
            QueueContext::new(QueueConfig::default()),
        );
        manager.register(Arc::new(Scheduled));
        manager
    }

    #[tokio::test]
    async fn test_schedule_rejects_bad_input() {
        let scheduler = Scheduler::new(manager()).await.unwrap();

        let err = scheduler
            .schedule("* * *", "test:scheduled".into(), json!({}), ScheduleOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCronExpression { .. }));

        let err = scheduler
            .schedule("* * * * *", "test:missing".into(), json!({}), ScheduleOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Queue(QueueError::UnknownJobType(_))
        ));

        let err = scheduler
            .schedule(
                "* * * * *",
                "test:scheduled".into(),
                json!({}),
                ScheduleOptions::default().timezone("Nowhere/Special"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTimezone(_)));
        assert!(scheduler.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_is_idempotent() {
        let scheduler = Scheduler::new(manager()).await.unwrap();
        let a = scheduler
            .schedule("0 * * * *", "test:scheduled".into(), json!({"v": 1}), ScheduleOptions::default())
            .await
            .unwrap();
        let b = scheduler
            .schedule("0  *  * * *", "test:scheduled".into(), json!({"v": 2}), ScheduleOptions::default())
            .await
            .unwrap();

        assert_eq!(a, b);
        let all = scheduler.all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload, json!({"v": 2}));
        assert!(all[0].next_run.unwrap() >= Utc::now() - ChronoDuration::minutes(1));
    }

    #[tokio::test]
    async fn test_table_survives_reload() {
        let manager = manager();
        let scheduler = Scheduler::new(manager.clone()).await.unwrap();
        let id = scheduler
            .schedule("*/5 * * * *", "test:scheduled".into(), json!({}), ScheduleOptions::default())
            .await
            .unwrap();

        let other = Scheduler::new(manager).await.unwrap();
        assert_eq!(other.find(&id).await, scheduler.find(&id).await);

        scheduler.unschedule(&id).await.unwrap();
        other.reload().await.unwrap();
        assert!(other.find(&id).await.is_none());
        assert!(matches!(
            scheduler.unschedule(&id).await,
            Err(SchedulerError::ScheduleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_due_queues_job_and_advances() {
        let manager = manager();
        let scheduler = Scheduler::new(manager.clone()).await.unwrap();
        let id = scheduler
            .schedule("* * * * *", "test:scheduled".into(), json!({"tick": true}), ScheduleOptions::default())
            .await
            .unwrap();

        let past = Utc::now() - ChronoDuration::minutes(5);
        scheduler.set_next_run(&id, Some(past)).await.unwrap();

        let now = Utc::now();
        let queued = scheduler.run_due_at(now).await.unwrap();
        assert_eq!(queued.len(), 1);

        let record = manager.record(&queued[0]).await.unwrap().unwrap();
        assert_eq!(record.job_type, "test:scheduled");
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.payload, json!({"tick": true}));

        let schedule = scheduler.find(&id).await.unwrap();
        assert_eq!(schedule.last_run, Some(now));
        assert!(schedule.next_run.unwrap() > now);

        // not due again this minute
        assert!(scheduler.run_due_at(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overlap_prevention() {
        let manager = manager();
        let scheduler = Scheduler::new(manager.clone()).await.unwrap();
        let id = scheduler
            .schedule("* * * * *", "test:scheduled".into(), json!({}), ScheduleOptions::default())
            .await
            .unwrap();

        let t0 = Utc::now() + ChronoDuration::minutes(1);
        let first = scheduler.run_due_at(t0).await.unwrap();
        assert_eq!(first.len(), 1);

        // the first job is still pending, so the next minute is skipped
        let t1 = t0 + ChronoDuration::minutes(2);
        assert!(scheduler.run_due_at(t1).await.unwrap().is_empty());

        // once it finishes the flag is stale and the schedule fires again
        manager.mark_completed(&first[0], None).await.unwrap();
        let second = scheduler.run_due_at(t1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(scheduler.find(&id).await.unwrap().last_run == Some(t1));
    }

    #[tokio::test]
    async fn test_every_minute_fires_each_minute_between_ticks() {
        use chrono::TimeZone;

        let scheduler = Scheduler::new(manager()).await.unwrap();
        let id = scheduler
            .schedule(
                "* * * * *",
                "test:scheduled".into(),
                json!({}),
                ScheduleOptions::default().without_overlapping(false),
            )
            .await
            .unwrap();
        let start = Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap();
        scheduler.set_next_run(&id, Some(start)).await.unwrap();

        // ticks every 5 seconds, never on a minute boundary
        let mut fired = 0;
        let mut tick = start + ChronoDuration::seconds(3);
        while tick < start + ChronoDuration::minutes(10) {
            fired += scheduler.run_due_at(tick).await.unwrap().len();
            tick += ChronoDuration::seconds(5);
        }
        assert_eq!(fired, 10);

        let schedule = scheduler.find(&id).await.unwrap();
        assert_eq!(schedule.next_run, Some(start + ChronoDuration::minutes(10)));
    }

    #[tokio::test]
    async fn test_overlap_can_be_disabled() {
        let scheduler = Scheduler::new(manager()).await.unwrap();
        scheduler
            .schedule(
                "* * * * *",
                "test:scheduled".into(),
                json!({}),
                ScheduleOptions::default().without_overlapping(false),
            )
            .await
            .unwrap();

        let t0 = Utc::now() + ChronoDuration::minutes(1);
        assert_eq!(scheduler.run_due_at(t0).await.unwrap().len(), 1);
        let t1 = t0 + ChronoDuration::minutes(2);
        assert_eq!(scheduler.run_due_at(t1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_schedule_does_not_block_others() {
        let manager = manager();
        let scheduler = Scheduler::new(manager.clone()).await.unwrap();
        let good = scheduler
            .schedule("* * * * *", "test:scheduled".into(), json!({}), ScheduleOptions::default())
            .await
            .unwrap();

        // a persisted schedule whose job type this process does not know
        {
            let mut table = scheduler.schedules.write().await;
            let mut orphan = table.get(&good).unwrap().clone();
            orphan.id = schedule_id("test:orphan", "* * * * *");
            orphan.job = "test:orphan".to_string();
            table.insert(orphan.id.clone(), orphan);
        }

        let queued = scheduler
            .run_due_at(Utc::now() + ChronoDuration::minutes(1))
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(
            manager.record(&queued[0]).await.unwrap().unwrap().job_type,
            "test:scheduled"
        );
    }

    #[tokio::test]
    async fn test_next_due() {
        let scheduler = Scheduler::new(manager()).await.unwrap();
        assert!(scheduler.next_due().await.is_none());

        let hourly = scheduler
            .schedule("0 * * * *", "test:scheduled".into(), json!({}), ScheduleOptions::default())
            .await
            .unwrap();
        let minutely = scheduler
            .schedule("* * * * *", "test:scheduled".into(), json!({}), ScheduleOptions::default())
            .await
            .unwrap();
        assert_ne!(hourly, minutely);
        assert_eq!(scheduler.next_due().await.unwrap().id, minutely);
    }
}
