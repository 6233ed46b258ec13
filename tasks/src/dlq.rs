use chrono::{DateTime, Duration as ChronoDuration, Utc};
use concave_proto::TaskId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    error::TaskError,
    record::{TaskRecord, TaskStatus},
    store::TaskStore,
};

/// Terminal storage for tasks that exhausted their retries, ordered by
/// failure time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub task_id: TaskId,
    /// Snapshot of the task at the moment it died.
    pub task: TaskRecord,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct DeadLetterQueue {
    store: TaskStore,
}

impl DeadLetterQueue {
    pub fn new(store: TaskStore) -> Self { Self { store } }

    pub async fn add(&self, task: &TaskRecord, reason: impl Into<String>) -> Result<(), TaskError> {
        let entry = DeadLetterEntry {
            task_id: task.id,
            task: task.clone(),
            failed_at: Utc::now(),
            reason: reason.into(),
            attempts: task.attempt,
        };
        let keyspace = self.store.keyspace();
        let encoded = serde_json::to_string(&entry).map_err(|e| TaskError::Corrupt(e.to_string()))?;
        self.store.kv().hset(&keyspace.dead_data(task.id), "entry", &encoded).await?;
        self.store.kv().zadd(&keyspace.dead(), entry.failed_at.timestamp_millis() as f64, &task.id.to_string()).await?;
        debug!("task {} dead-lettered: {}", task.id, entry.reason);
        Ok(())
    }

    pub async fn get(&self, task_id: TaskId) -> Result<Option<DeadLetterEntry>, TaskError> {
        let fields = self.store.kv().hgetall(&self.store.keyspace().dead_data(task_id)).await?;
        let Some(encoded) = fields.get("entry") else { return Ok(None) };
        Ok(Some(serde_json::from_str(encoded).map_err(|e| TaskError::Corrupt(e.to_string()))?))
    }

    /// Entries ordered by `failed_at`, oldest first.
    pub async fn list(&self, limit: Option<usize>) -> Result<Vec<DeadLetterEntry>, TaskError> {
        let keyspace = self.store.keyspace();
        let stop = limit.map(|l| l as isize - 1).unwrap_or(-1);
        let members = self.store.kv().zrange(&keyspace.dead(), 0, stop).await?;
        let mut entries = Vec::with_capacity(members.len());
        for member in members {
            let Ok(task_id) = member.parse::<TaskId>() else {
                warn!("skipping unparsable DLQ member {member}");
                continue;
            };
            if let Some(entry) = self.get(task_id).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn count(&self) -> Result<usize, TaskError> { Ok(self.store.kv().zcard(&self.store.keyspace().dead()).await?) }

    /// Re-enqueue a dead task as a fresh clone: new id, `attempt` reset,
    /// queued immediately. The original id is not resurrected.
    pub async fn retry(&self, task_id: TaskId) -> Result<TaskId, TaskError> {
        let entry = self.get(task_id).await?.ok_or(TaskError::UnknownTask(task_id))?;

        let mut clone = entry.task.clone();
        clone.id = TaskId::new();
        clone.status = TaskStatus::Pending;
        clone.attempt = 0;
        clone.created_at = Utc::now();
        clone.scheduled_for = Utc::now();
        clone.started_at = None;
        clone.completed_at = None;
        clone.worker_id = None;
        clone.last_error = None;
        clone.result = None;

        self.store.put(&clone).await?;
        self.store.enqueue(&clone).await?;
        let clone = self.store.transition(clone.id, TaskStatus::Scheduled, |_| {}).await?;
        if let Some(key) = &clone.idempotency_key {
            self.store.set_idempotency(key, clone.id).await?;
        }
        self.remove(task_id).await?;
        Ok(clone.id)
    }

    pub async fn retry_all(&self) -> Result<Vec<TaskId>, TaskError> {
        let entries = self.list(None).await?;
        let mut retried = Vec::with_capacity(entries.len());
        for entry in entries {
            retried.push(self.retry(entry.task_id).await?);
        }
        Ok(retried)
    }

    /// Drop entries older than the given age. Returns how many were purged.
    pub async fn purge(&self, older_than: Duration) -> Result<usize, TaskError> {
        let cutoff = Utc::now() - ChronoDuration::milliseconds(older_than.as_millis() as i64);
        let keyspace = self.store.keyspace();
        let members = self.store.kv().zrangebyscore(&keyspace.dead(), f64::MIN, cutoff.timestamp_millis() as f64, None).await?;
        let mut purged = 0;
        for member in members {
            if let Ok(task_id) = member.parse::<TaskId>() {
                self.remove(task_id).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn remove(&self, task_id: TaskId) -> Result<(), TaskError> {
        let keyspace = self.store.keyspace();
        self.store.kv().zrem(&keyspace.dead(), &task_id.to_string()).await?;
        self.store.kv().del(&keyspace.dead_data(task_id)).await?;
        Ok(())
    }
}
