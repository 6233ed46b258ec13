use chrono::Utc;
use concave_kv::{Batch, SharedKv, ZRangeLimit};
use concave_proto::{ScheduleId, TaskId};
use tracing::warn;

use crate::{
    error::TaskError,
    record::{PriorityBucket, TaskRecord, TaskStatus},
};

/// Key layout under the `concave:tasks:` prefix.
#[derive(Debug, Clone)]
pub struct TaskKeyspace {
    prefix: String,
}

impl Default for TaskKeyspace {
    fn default() -> Self { Self { prefix: "concave:tasks:".to_string() } }
}

impl TaskKeyspace {
    pub fn with_prefix(prefix: impl Into<String>) -> Self { Self { prefix: prefix.into() } }

    pub fn data(&self, id: TaskId) -> String { format!("{}data:{id}", self.prefix) }

    pub fn status(&self, status: TaskStatus) -> String { format!("{}status:{status}", self.prefix) }

    pub fn name(&self, name: &str) -> String { format!("{}name:{name}", self.prefix) }

    pub fn idempotency(&self, key: &str) -> String { format!("{}idempotency:{key}", self.prefix) }

    pub fn queue(&self, bucket: PriorityBucket) -> String { format!("{}queue:{}", self.prefix, bucket.as_str()) }

    pub fn lock(&self, id: TaskId) -> String { format!("{}lock:{id}", self.prefix) }

    pub fn dead(&self) -> String { format!("{}dead", self.prefix) }

    pub fn dead_data(&self, id: TaskId) -> String { format!("{}dead:data:{id}", self.prefix) }

    pub fn workers(&self) -> String { format!("{}workers", self.prefix) }

    pub fn notify_channel(&self) -> String { format!("{}notify", self.prefix) }

    pub fn schedules(&self) -> String { format!("{}schedules", self.prefix) }

    pub fn schedule(&self, id: ScheduleId) -> String { format!("{}schedule:{id}", self.prefix) }
}

/// Task persistence over the KV: record hashes, status/name index sets and
/// the priority queues.
#[derive(Clone)]
pub struct TaskStore {
    kv: SharedKv,
    keyspace: TaskKeyspace,
}

impl TaskStore {
    pub fn new(kv: SharedKv, keyspace: TaskKeyspace) -> Self { Self { kv, keyspace } }

    pub fn kv(&self) -> &SharedKv { &self.kv }

    pub fn keyspace(&self) -> &TaskKeyspace { &self.keyspace }

    /// Persist a new record and index it.
    pub async fn put(&self, record: &TaskRecord) -> Result<(), TaskError> {
        self.kv.hmset(&self.keyspace.data(record.id), &record.to_fields()?).await?;
        let batch = Batch::new()
            .sadd(self.keyspace.status(record.status), record.id.to_string())
            .sadd(self.keyspace.name(&record.name), record.id.to_string());
        self.kv.exec(batch).await?;
        Ok(())
    }

    pub async fn load(&self, id: TaskId) -> Result<Option<TaskRecord>, TaskError> {
        let fields = self.kv.hgetall(&self.keyspace.data(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(TaskRecord::from_fields(&fields)?))
    }

    /// Apply a guarded state-machine transition, mutate the record under
    /// the new status, and persist. Anything outside the machine is
    /// rejected with `InvalidTransition`.
    pub async fn transition(
        &self,
        id: TaskId,
        to: TaskStatus,
        mutate: impl FnOnce(&mut TaskRecord),
    ) -> Result<TaskRecord, TaskError> {
        let mut record = self.load(id).await?.ok_or(TaskError::UnknownTask(id))?;
        let from = record.status;
        if !TaskStatus::can_transition(from, to) {
            return Err(TaskError::InvalidTransition { from, to });
        }
        record.status = to;
        mutate(&mut record);
        // the mutator must not bypass the guard
        debug_assert_eq!(record.status, to);

        self.kv.hmset(&self.keyspace.data(record.id), &record.to_fields()?).await?;
        let batch = Batch::new()
            .srem(self.keyspace.status(from), record.id.to_string())
            .sadd(self.keyspace.status(to), record.id.to_string());
        self.kv.exec(batch).await?;
        Ok(record)
    }

    /// Remove a record entirely (cancellation, DLQ move of the live row).
    pub async fn remove(&self, record: &TaskRecord) -> Result<(), TaskError> {
        let mut batch = Batch::new()
            .del(self.keyspace.data(record.id))
            .srem(self.keyspace.status(record.status), record.id.to_string())
            .srem(self.keyspace.name(&record.name), record.id.to_string())
            .zrem(self.keyspace.queue(record.bucket()), record.id.to_string());
        if let Some(key) = &record.idempotency_key {
            batch = batch.del(self.keyspace.idempotency(key));
        }
        self.kv.exec(batch).await?;
        Ok(())
    }

    // Queue operations.

    pub async fn enqueue(&self, record: &TaskRecord) -> Result<(), TaskError> {
        self.kv.zadd(&self.keyspace.queue(record.bucket()), record.scheduled_for_ms(), &record.id.to_string()).await?;
        Ok(())
    }

    pub async fn dequeue(&self, record: &TaskRecord) -> Result<bool, TaskError> {
        Ok(self.kv.zrem(&self.keyspace.queue(record.bucket()), &record.id.to_string()).await?)
    }

    pub async fn dequeue_raw(&self, bucket: PriorityBucket, id: &str) -> Result<bool, TaskError> {
        Ok(self.kv.zrem(&self.keyspace.queue(bucket), id).await?)
    }

    /// Ids due for execution in one bucket (`scheduled_for <= now`).
    pub async fn due(&self, bucket: PriorityBucket, limit: usize) -> Result<Vec<TaskId>, TaskError> {
        let now_ms = Utc::now().timestamp_millis() as f64;
        let members =
            self.kv.zrangebyscore(&self.keyspace.queue(bucket), f64::MIN, now_ms, Some(ZRangeLimit::first(limit))).await?;
        let mut ids = Vec::with_capacity(members.len());
        for member in members {
            match member.parse() {
                Ok(id) => ids.push(id),
                Err(e) => warn!("dropping unparsable queue member {member}: {e}"),
            }
        }
        Ok(ids)
    }

    pub async fn queue_len(&self, bucket: PriorityBucket) -> Result<usize, TaskError> {
        Ok(self.kv.zcard(&self.keyspace.queue(bucket)).await?)
    }

    // Index sets.

    pub async fn ids_with_status(&self, status: TaskStatus) -> Result<Vec<TaskId>, TaskError> {
        self.parse_members(self.kv.smembers(&self.keyspace.status(status)).await?)
    }

    pub async fn ids_with_name(&self, name: &str) -> Result<Vec<TaskId>, TaskError> {
        self.parse_members(self.kv.smembers(&self.keyspace.name(name)).await?)
    }

    fn parse_members(&self, members: Vec<String>) -> Result<Vec<TaskId>, TaskError> {
        Ok(members.into_iter().filter_map(|member| member.parse().ok()).collect())
    }

    // Idempotency mapping.

    pub async fn idempotent_task(&self, key: &str) -> Result<Option<TaskId>, TaskError> {
        Ok(self.kv.get(&self.keyspace.idempotency(key)).await?.and_then(|id| id.parse().ok()))
    }

    pub async fn set_idempotency(&self, key: &str, id: TaskId) -> Result<(), TaskError> {
        self.kv.set(&self.keyspace.idempotency(key), &id.to_string(), Default::default()).await?;
        Ok(())
    }

    pub async fn clear_idempotency(&self, record: &TaskRecord) -> Result<(), TaskError> {
        if let Some(key) = &record.idempotency_key {
            self.kv.del(&self.keyspace.idempotency(key)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concave_kv::MemoryKv;
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> TaskStore { TaskStore::new(Arc::new(MemoryKv::new()), TaskKeyspace::default()) }

    fn record(status: TaskStatus, priority: u8) -> TaskRecord {
        TaskRecord {
            id: TaskId::new(),
            name: "send-email".to_string(),
            input: json!({}),
            status,
            priority,
            created_at: Utc::now(),
            scheduled_for: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_id: None,
            last_error: None,
            result: None,
            attempt: 0,
            max_attempts: 3,
            idempotency_key: None,
            recurring: None,
        }
    }

    #[tokio::test]
    async fn put_load_round_trip_with_indexes() {
        let store = store();
        let task = record(TaskStatus::Pending, 60);
        store.put(&task).await.unwrap();

        assert_eq!(store.load(task.id).await.unwrap().unwrap(), task);
        assert_eq!(store.ids_with_status(TaskStatus::Pending).await.unwrap(), vec![task.id]);
        assert_eq!(store.ids_with_name("send-email").await.unwrap(), vec![task.id]);
    }

    #[tokio::test]
    async fn transition_moves_status_sets_and_rejects_illegal() {
        let store = store();
        let task = record(TaskStatus::Pending, 50);
        store.put(&task).await.unwrap();

        store.transition(task.id, TaskStatus::Scheduled, |_| {}).await.unwrap();
        assert!(store.ids_with_status(TaskStatus::Pending).await.unwrap().is_empty());
        assert_eq!(store.ids_with_status(TaskStatus::Scheduled).await.unwrap(), vec![task.id]);

        // scheduled -> completed is not in the machine
        let err = store.transition(task.id, TaskStatus::Completed, |_| {}).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { from: TaskStatus::Scheduled, to: TaskStatus::Completed }));
    }

    #[tokio::test]
    async fn due_respects_schedule_time_and_bucket() {
        let store = store();
        let mut due_now = record(TaskStatus::Scheduled, 80);
        due_now.scheduled_for = Utc::now() - chrono::Duration::seconds(1);
        let mut future = record(TaskStatus::Scheduled, 80);
        future.scheduled_for = Utc::now() + chrono::Duration::seconds(3600);

        store.enqueue(&due_now).await.unwrap();
        store.enqueue(&future).await.unwrap();

        let due = store.due(PriorityBucket::Critical, 10).await.unwrap();
        assert_eq!(due, vec![due_now.id]);
        assert!(store.due(PriorityBucket::Low, 10).await.unwrap().is_empty());
        assert_eq!(store.queue_len(PriorityBucket::Critical).await.unwrap(), 2);
    }
}
