use chrono::{DateTime, Utc};
use concave_proto::{ScheduleId, TaskId, WorkerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Dead,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Dead => "dead",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "pending" => TaskStatus::Pending,
            "scheduled" => TaskStatus::Scheduled,
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "dead" => TaskStatus::Dead,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool { matches!(self, TaskStatus::Completed | TaskStatus::Dead | TaskStatus::Failed) }

    /// The only transitions the state machine permits; everything else is
    /// rejected. Cancellation is a removal, not a transition.
    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Scheduled)
                | (TaskStatus::Scheduled, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Scheduled)
                | (TaskStatus::Running, TaskStatus::Dead)
        )
    }

    pub const ALL: [TaskStatus; 6] =
        [TaskStatus::Pending, TaskStatus::Scheduled, TaskStatus::Running, TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Dead];
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.as_str()) }
}

/// Priority buckets: a small fixed set of ordered sets keyed by
/// `scheduled_for`. Workers drain highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriorityBucket {
    Critical,
    High,
    Normal,
    Low,
}

impl PriorityBucket {
    /// Highest priority first; the worker's scan order.
    pub const ALL: [PriorityBucket; 4] = [PriorityBucket::Critical, PriorityBucket::High, PriorityBucket::Normal, PriorityBucket::Low];

    pub fn for_priority(priority: u8) -> Self {
        match priority {
            75..=u8::MAX => PriorityBucket::Critical,
            50..=74 => PriorityBucket::High,
            25..=49 => PriorityBucket::Normal,
            _ => PriorityBucket::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityBucket::Critical => "critical",
            PriorityBucket::High => "high",
            PriorityBucket::Normal => "normal",
            PriorityBucket::Low => "low",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub input: Value,
    pub status: TaskStatus,
    /// 0-100; bucketed for queueing.
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurring: Option<ScheduleId>,
}

impl TaskRecord {
    pub fn bucket(&self) -> PriorityBucket { PriorityBucket::for_priority(self.priority) }

    pub fn scheduled_for_ms(&self) -> f64 { self.scheduled_for.timestamp_millis() as f64 }

    /// Field map for the `data:<id>` hash.
    pub fn to_fields(&self) -> Result<Vec<(String, String)>, TaskError> {
        let mut fields = vec![
            ("id".to_string(), self.id.to_string()),
            ("name".to_string(), self.name.clone()),
            ("input".to_string(), self.input.to_string()),
            ("status".to_string(), self.status.as_str().to_string()),
            ("priority".to_string(), self.priority.to_string()),
            ("createdAt".to_string(), self.created_at.to_rfc3339()),
            ("scheduledFor".to_string(), self.scheduled_for.to_rfc3339()),
            ("attempt".to_string(), self.attempt.to_string()),
            ("maxAttempts".to_string(), self.max_attempts.to_string()),
        ];
        if let Some(at) = self.started_at {
            fields.push(("startedAt".to_string(), at.to_rfc3339()));
        }
        if let Some(at) = self.completed_at {
            fields.push(("completedAt".to_string(), at.to_rfc3339()));
        }
        if let Some(worker_id) = self.worker_id {
            fields.push(("workerId".to_string(), worker_id.to_string()));
        }
        if let Some(error) = &self.last_error {
            fields.push(("lastError".to_string(), error.clone()));
        }
        if let Some(result) = &self.result {
            fields.push(("result".to_string(), result.to_string()));
        }
        if let Some(key) = &self.idempotency_key {
            fields.push(("idempotencyKey".to_string(), key.clone()));
        }
        if let Some(schedule) = self.recurring {
            fields.push(("recurring".to_string(), schedule.to_string()));
        }
        Ok(fields)
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, TaskError> {
        fn required<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, TaskError> {
            fields.get(name).map(String::as_str).ok_or_else(|| TaskError::Corrupt(format!("missing field {name}")))
        }
        fn parse_time(value: &str, name: &str) -> Result<DateTime<Utc>, TaskError> {
            DateTime::parse_from_rfc3339(value)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| TaskError::Corrupt(format!("bad {name}: {e}")))
        }

        let status = TaskStatus::parse(required(fields, "status")?)
            .ok_or_else(|| TaskError::Corrupt(format!("bad status: {}", fields["status"])))?;

        Ok(TaskRecord {
            id: required(fields, "id")?.parse().map_err(|e| TaskError::Corrupt(format!("bad id: {e}")))?,
            name: required(fields, "name")?.to_string(),
            input: serde_json::from_str(required(fields, "input")?).map_err(|e| TaskError::Corrupt(format!("bad input: {e}")))?,
            status,
            priority: required(fields, "priority")?.parse().map_err(|e| TaskError::Corrupt(format!("bad priority: {e}")))?,
            created_at: parse_time(required(fields, "createdAt")?, "createdAt")?,
            scheduled_for: parse_time(required(fields, "scheduledFor")?, "scheduledFor")?,
            started_at: fields.get("startedAt").map(|v| parse_time(v, "startedAt")).transpose()?,
            completed_at: fields.get("completedAt").map(|v| parse_time(v, "completedAt")).transpose()?,
            worker_id: fields.get("workerId").map(|v| v.parse()).transpose().map_err(|e| TaskError::Corrupt(format!("bad workerId: {e}")))?,
            last_error: fields.get("lastError").cloned(),
            result: fields.get("result").map(|v| serde_json::from_str(v)).transpose().map_err(|e| TaskError::Corrupt(format!("bad result: {e}")))?,
            attempt: required(fields, "attempt")?.parse().map_err(|e| TaskError::Corrupt(format!("bad attempt: {e}")))?,
            max_attempts: required(fields, "maxAttempts")?.parse().map_err(|e| TaskError::Corrupt(format!("bad maxAttempts: {e}")))?,
            idempotency_key: fields.get("idempotencyKey").cloned(),
            recurring: fields
                .get("recurring")
                .map(|v| v.parse())
                .transpose()
                .map_err(|e| TaskError::Corrupt(format!("bad recurring: {e}")))?,
        })
    }
}
