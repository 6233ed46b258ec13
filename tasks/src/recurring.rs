use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use concave_proto::ScheduleId;
use croner::Cron;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

use crate::error::TaskError;

/// How a recurring schedule fires: a cron expression (evaluated in the
/// schedule's timezone) or a fixed interval. Exactly one must be set.
#[derive(Debug, Clone, Default)]
pub struct Recurrence {
    pub cron: Option<String>,
    pub interval: Option<Duration>,
    pub timezone: Option<String>,
}

impl Recurrence {
    pub fn cron(expression: impl Into<String>) -> Self { Self { cron: Some(expression.into()), interval: None, timezone: None } }

    pub fn interval(interval: Duration) -> Self { Self { cron: None, interval: Some(interval), timezone: None } }

    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        match (&self.cron, &self.interval) {
            (Some(_), Some(_)) => Err(TaskError::InvalidSchedule("cron and interval are mutually exclusive".into())),
            (None, None) => Err(TaskError::InvalidSchedule("either cron or interval is required".into())),
            (Some(expression), None) => {
                expression.parse::<Cron>().map_err(|e| TaskError::InvalidSchedule(format!("bad cron: {e}")))?;
                if let Some(tz) = &self.timezone {
                    Tz::from_str(tz).map_err(|_| TaskError::InvalidSchedule(format!("unknown timezone: {tz}")))?;
                }
                Ok(())
            }
            (None, Some(interval)) => {
                if interval.is_zero() {
                    return Err(TaskError::InvalidSchedule("interval must be positive".into()));
                }
                Ok(())
            }
        }
    }
}

/// A persisted recurring schedule. The sweeper enqueues a one-shot task
/// whenever `next_run` is due and advances it; missed runs during
/// downtime collapse into at most one immediate run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringSchedule {
    pub id: ScheduleId,
    /// Task definition name to enqueue.
    pub name: String,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub next_run: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RecurringSchedule {
    /// Next fire time strictly after `after`.
    pub fn next_run_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, TaskError> {
        if let Some(expression) = &self.cron {
            let cron = expression.parse::<Cron>().map_err(|e| TaskError::InvalidSchedule(format!("bad cron: {e}")))?;
            let next = match &self.timezone {
                Some(tz) => {
                    let tz = Tz::from_str(tz).map_err(|_| TaskError::InvalidSchedule(format!("unknown timezone: {tz}")))?;
                    cron.find_next_occurrence(&after.with_timezone(&tz), false)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| TaskError::InvalidSchedule(e.to_string()))?
                }
                None => cron.find_next_occurrence(&after, false).map_err(|e| TaskError::InvalidSchedule(e.to_string()))?,
            };
            return Ok(next);
        }
        let interval = self.interval_ms.ok_or_else(|| TaskError::InvalidSchedule("schedule has neither cron nor interval".into()))?;
        Ok(after + ChronoDuration::milliseconds(interval as i64))
    }
}
