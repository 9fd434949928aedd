//! Scheduler types.

use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{CronExpression, SchedulerError};

/// Per-schedule options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOptions {
    /// Queue the job is pushed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Overlap prevention override. `None` follows the global setting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub without_overlapping: Option<bool>,
    /// IANA zone override. `None` uses the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl ScheduleOptions {
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn without_overlapping(mut self, prevent: bool) -> Self {
        self.without_overlapping = Some(prevent);
        self
    }

    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }
}

/// A recurring job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Stable id derived from job type and expression.
    pub id: String,
    pub expression: String,
    /// Job type to enqueue.
    pub job: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub options: ScheduleOptions,
    /// IANA zone name.
    pub timezone: String,
    pub last_run: Option<DateTime<Utc>>,
    /// `None` when no future occurrence was found.
    pub next_run: Option<DateTime<Utc>>,
}

/// Deterministic schedule id: the first 32 hex digits of
/// `sha256("{job_type}|{expression}")`.
pub fn schedule_id(job_type: &str, expression: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}", job_type, expression).as_bytes());
    hex::encode(&digest[..16])
}

/// Parse an IANA zone name.
pub fn parse_timezone(name: &str) -> Result<Tz, SchedulerError> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))
}

impl Schedule {
    /// The parsed expression in this schedule's timezone.
    pub fn cron(&self) -> Result<CronExpression, SchedulerError> {
        let cron = CronExpression::parse(&self.expression).map_err(|source| {
            SchedulerError::InvalidCronExpression {
                expression: self.expression.clone(),
                source,
            }
        })?;
        Ok(cron.with_timezone(parse_timezone(&self.timezone)?))
    }

    /// Whether the schedule should fire at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run.is_some_and(|next| next <= now)
    }

    /// Next occurrence: from the minute after the last run, or from `now` if
    /// the schedule never ran. Seconds on `last_run` are dropped first so the
    /// following minute is still eligible.
    pub fn calculate_next_run(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let from = match self.last_run {
            Some(last_run) => {
                let minute = last_run
                    .with_second(0)
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(last_run);
                minute + Duration::minutes(1)
            }
            None => now,
        };
        Ok(self.cron()?.next_run_after(from))
    }

    /// Whether a run is skipped while the previous one is outstanding.
    pub fn prevents_overlap(&self, default: bool) -> bool {
        self.options.without_overlapping.unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    fn schedule(expression: &str) -> Schedule {
        Schedule {
            id: schedule_id("test:scheduled", expression),
            expression: expression.to_string(),
            job: "test:scheduled".to_string(),
            payload: json!({}),
            options: ScheduleOptions::default(),
            timezone: "UTC".to_string(),
            last_run: None,
            next_run: None,
        }
    }

    #[test]
    fn test_schedule_id_is_stable() {
        let a = schedule_id("mail:digest", "0 8 * * *");
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, schedule_id("mail:digest", "0 8 * * *"));
        assert_ne!(a, schedule_id("mail:digest", "0 9 * * *"));
        assert_ne!(a, schedule_id("mail:other", "0 8 * * *"));
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut s = schedule("* * * * *");
        assert!(!s.is_due(now));

        s.next_run = Some(now - Duration::minutes(1));
        assert!(s.is_due(now));

        s.next_run = Some(now + Duration::minutes(1));
        assert!(!s.is_due(now));
    }

    #[test]
    fn test_next_run_uses_last_run() {
        let mut s = schedule("* * * * *");
        let last = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        s.last_run = Some(last);
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        assert_eq!(
            s.calculate_next_run(now).unwrap(),
            Some(last + Duration::minutes(1))
        );

        s.last_run = None;
        assert_eq!(s.calculate_next_run(now).unwrap(), Some(now));
    }

    #[test]
    fn test_next_run_after_last_run_with_seconds() {
        let mut s = schedule("* * * * *");
        s.last_run = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 3).unwrap());
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 3).unwrap();
        assert_eq!(
            s.calculate_next_run(now).unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap())
        );

        let mut s = schedule("30 9 * * *");
        s.last_run = Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 29, 59).unwrap());
        assert_eq!(
            s.calculate_next_run(now).unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_bad_timezone() {
        let mut s = schedule("* * * * *");
        s.timezone = "Mars/Olympus".to_string();
        assert!(matches!(s.cron(), Err(SchedulerError::InvalidTimezone(_))));
    }

    #[test]
    fn test_overlap_default() {
        let s = schedule("* * * * *");
        assert!(s.prevents_overlap(true));
        assert!(!s.prevents_overlap(false));

        let mut s = schedule("* * * * *");
        s.options = ScheduleOptions::default().without_overlapping(false);
        assert!(!s.prevents_overlap(true));
    }

    proptest! {
        // The computed next run never precedes the instant it was computed from
        #[test]
        fn next_run_not_before_origin(
            last_offset in proptest::option::of(0i64..100_000),
            now_offset in 0i64..100_000,
        ) {
            let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let mut s = schedule("*/7 */3 * * *");
            s.last_run = last_offset.map(|m| base + Duration::minutes(m));
            let now = base + Duration::minutes(now_offset);

            let origin = match s.last_run {
                Some(last) => last + Duration::minutes(1),
                None => now,
            };
            let next = s.calculate_next_run(now).unwrap().unwrap();
            prop_assert!(next >= origin);
        }
    }
}
