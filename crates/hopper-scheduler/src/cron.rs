//! Five-field cron expressions.
//!
//! Fields are minute (0-59), hour (0-23), day of month (1-31), month (1-12)
//! and day of week (0-7, where 0 and 7 are both Sunday). Each field accepts
//! `*`, lists (`1,5`), ranges (`1-5`) and steps (`*/15`, `1-30/5`, `5/10`).
//! All five fields must match for a minute to be due; there is no special
//! OR between day of month and day of week.

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;

use crate::CronError;

/// How far ahead `next_run_after` searches before giving up.
const SEARCH_HORIZON_DAYS: i64 = 4 * 365 + 1;

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
};

/// Allowed values of one field as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct FieldSet(u64);

impl FieldSet {
    fn insert(&mut self, value: u32) {
        self.0 |= 1 << value;
    }

    fn remove(&mut self, value: u32) {
        self.0 &= !(1 << value);
    }

    fn contains(&self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }

    fn values(&self) -> Vec<u32> {
        (0..64).filter(|v| self.contains(*v)).collect()
    }
}

/// A parsed cron expression bound to a timezone.
#[derive(Debug, Clone, PartialEq)]
pub struct CronExpression {
    expression: String,
    minutes: FieldSet,
    hours: FieldSet,
    days: FieldSet,
    months: FieldSet,
    weekdays: FieldSet,
    timezone: Tz,
}

impl CronExpression {
    /// Parse an expression evaluated in UTC.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::InvalidFormat(format!(
                "expected 5 fields, found {} in '{}'",
                fields.len(),
                expression
            )));
        }

        let mut weekdays = parse_field(fields[4], DAY_OF_WEEK)?;
        if weekdays.contains(7) {
            weekdays.remove(7);
            weekdays.insert(0);
        }

        Ok(Self {
            expression: fields.join(" "),
            minutes: parse_field(fields[0], MINUTE)?,
            hours: parse_field(fields[1], HOUR)?,
            days: parse_field(fields[2], DAY_OF_MONTH)?,
            months: parse_field(fields[3], MONTH)?,
            weekdays,
            timezone: Tz::UTC,
        })
    }

    /// Evaluate in `timezone` instead of UTC.
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Allowed minutes, for display.
    pub fn minutes(&self) -> Vec<u32> {
        self.minutes.values()
    }

    /// Allowed days of week with Sunday as 0.
    pub fn weekdays(&self) -> Vec<u32> {
        self.weekdays.values()
    }

    /// Whether the minute containing `at` matches, in this expression's
    /// timezone.
    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        self.matches(&at.with_timezone(&self.timezone).naive_local())
    }

    fn matches(&self, local: &NaiveDateTime) -> bool {
        self.minutes.contains(local.minute())
            && self.hours.contains(local.hour())
            && self.matches_date(local.date())
    }

    fn matches_date(&self, date: NaiveDate) -> bool {
        self.days.contains(date.day())
            && self.months.contains(date.month())
            && self.weekdays.contains(date.weekday().num_days_from_sunday())
    }

    /// The first due minute at or after `from`.
    ///
    /// `from` is rounded up to a whole minute, so a minute-aligned `from`
    /// that is itself due is returned as is. Returns `None` if nothing
    /// matches within four years, e.g. for February 30th.
    pub fn next_run_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut start = from.with_second(0)?.with_nanosecond(0)?;
        if start < from {
            start += Duration::minutes(1);
        }

        let mut local = start.with_timezone(&self.timezone).naive_local();
        let horizon = local + Duration::days(SEARCH_HORIZON_DAYS);

        while local <= horizon {
            let date = local.date();
            if !self.months.contains(date.month()) {
                local = first_of_next_month(date)?;
                continue;
            }
            if !self.matches_date(date) {
                local = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(local.hour()) {
                local = date.and_hms_opt(local.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(local.minute()) {
                local += Duration::minutes(1);
                continue;
            }

            match self.timezone.from_local_datetime(&local) {
                LocalResult::Single(at) => {
                    let at = at.with_timezone(&Utc);
                    if at >= start {
                        return Some(at);
                    }
                }
                LocalResult::Ambiguous(earliest, latest) => {
                    let earliest = earliest.with_timezone(&Utc);
                    let latest = latest.with_timezone(&Utc);
                    if earliest >= start {
                        return Some(earliest);
                    }
                    if latest >= start {
                        return Some(latest);
                    }
                }
                // skipped by a DST jump
                LocalResult::None => {}
            }
            local += Duration::minutes(1);
        }
        None
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_field(text: &str, spec: FieldSpec) -> Result<FieldSet, CronError> {
    let mut set = FieldSet::default();
    for part in text.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(parse_step(step, spec)?)),
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (parse_value(a, spec)?, parse_value(b, spec)?);
            if a > b {
                return Err(CronError::InvalidRange {
                    field: spec.name,
                    range: range.to_string(),
                });
            }
            (a, b)
        } else {
            let value = parse_value(range, spec)?;
            // `5/10` means every 10th value starting at 5
            if step.is_some() {
                (value, spec.max)
            } else {
                (value, value)
            }
        };

        for value in [start, end] {
            if value < spec.min || value > spec.max {
                return Err(CronError::OutOfBounds {
                    field: spec.name,
                    value,
                    min: spec.min,
                    max: spec.max,
                });
            }
        }

        for value in (start..=end).step_by(step.unwrap_or(1)) {
            set.insert(value);
        }
    }
    Ok(set)
}

fn parse_value(text: &str, spec: FieldSpec) -> Result<u32, CronError> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CronError::InvalidFormat(format!(
            "'{}' is not a valid {} value",
            text, spec.name
        )));
    }
    text.parse::<u32>().map_err(|_| CronError::OutOfBounds {
        field: spec.name,
        value: u32::MAX,
        min: spec.min,
        max: spec.max,
    })
}

fn parse_step(text: &str, spec: FieldSpec) -> Result<usize, CronError> {
    match text.parse::<usize>() {
        Ok(step) if step >= 1 => Ok(step),
        _ => Err(CronError::InvalidStep {
            field: spec.name,
            step: text.to_string(),
        }),
    }
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}
