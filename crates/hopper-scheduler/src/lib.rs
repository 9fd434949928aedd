//! Cron scheduler for recurring Hopper jobs.
//!
//! This crate provides:
//! - Five-field cron expressions evaluated in any IANA timezone
//! - Schedules keyed by a stable id so re-registration is idempotent
//! - A scheduler that enqueues due jobs and suppresses overlapping runs

mod cron;
mod error;
mod scheduler;
mod types;

pub use cron::CronExpression;
pub use error::{CronError, SchedulerError};
pub use scheduler::Scheduler;
pub use types::{Schedule, ScheduleOptions, parse_timezone, schedule_id};
