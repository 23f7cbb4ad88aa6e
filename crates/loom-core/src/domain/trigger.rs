//! Trigger: when a schedule fires.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use super::errors::{Result, TaskQueueError};

/// Calendar expression backed by the `cron` crate.
///
/// Accepts the classic 5-field form (`min hour dom mon dow`, seconds = 0) and
/// the 6/7-field form with a leading seconds column.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields = expr.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {}", expr.trim()),
            6 | 7 => expr.trim().to_string(),
            _ => {
                return Err(TaskQueueError::InvalidSchedule(format!(
                    "cron expression '{expr}' has {fields} fields"
                )));
            }
        };
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| TaskQueueError::InvalidSchedule(format!("cron '{expr}': {e}")))?;
        Ok(Self {
            source: expr.trim().to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

#[derive(Debug, Clone)]
pub enum Trigger {
    /// One-shot at an absolute time.
    Date(DateTime<Utc>),
    Cron(CronExpr),
    Interval(Duration),
}

impl Trigger {
    pub fn cron(expr: &str) -> Result<Self> {
        Ok(Trigger::Cron(CronExpr::parse(expr)?))
    }

    pub fn interval(every: Duration) -> Result<Self> {
        if every.is_zero() {
            return Err(TaskQueueError::InvalidSchedule(
                "interval must be greater than zero".into(),
            ));
        }
        to_delta(every)?;
        Ok(Trigger::Interval(every))
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Trigger::Date(_))
    }

    /// First fire time for a schedule created at `now`.
    ///
    /// A date in the past fires immediately.
    pub fn first_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Date(at) => Some(*at),
            Trigger::Cron(expr) => expr.next_after(now),
            Trigger::Interval(every) => to_delta(*every).ok().map(|d| now + d),
        }
    }

    /// Next fire time after a fire at `previous`, skipping every occurrence
    /// that is already `<= now` (missed runs coalesce into the one that just ran).
    pub fn next_fire(&self, previous: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Date(_) => None,
            Trigger::Cron(expr) => expr.next_after(previous.max(now)),
            Trigger::Interval(every) => {
                let step = to_delta(*every).ok()?;
                let mut next = previous + step;
                if next <= now {
                    let behind = (now - previous).num_milliseconds();
                    let step_ms = step.num_milliseconds().max(1);
                    let skipped = behind / step_ms;
                    next = previous + TimeDelta::milliseconds(step_ms * (skipped + 1));
                }
                Some(next)
            }
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Date(at) => write!(f, "date[{}]", at.to_rfc3339()),
            Trigger::Cron(expr) => write!(f, "cron[{}]", expr.as_str()),
            Trigger::Interval(every) => write!(f, "interval[{}ms]", every.as_millis()),
        }
    }
}

pub(crate) fn to_delta(d: Duration) -> Result<TimeDelta> {
    TimeDelta::from_std(d)
        .map_err(|_| TaskQueueError::InvalidSchedule(format!("duration {d:?} out of range")))
}
