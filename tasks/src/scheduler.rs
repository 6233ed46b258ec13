use chrono::{DateTime, Duration as ChronoDuration, Utc};
use concave_kv::SharedKv;
use concave_proto::{ScheduleId, TaskId};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    definition::TaskDefinition,
    dlq::DeadLetterQueue,
    error::TaskError,
    record::{PriorityBucket, TaskRecord, TaskStatus},
    recurring::{Recurrence, RecurringSchedule},
    store::{TaskKeyspace, TaskStore},
    worker::TaskRegistry,
};

#[derive(Debug, Clone, Default)]
pub struct ScheduleSpec {
    pub delay: Option<Duration>,
    pub at: Option<DateTime<Utc>>,
    pub priority: Option<u8>,
    pub idempotency_key: Option<String>,
}

impl ScheduleSpec {
    pub fn delay(delay: Duration) -> Self { Self { delay: Some(delay), ..Self::default() } }

    pub fn at(at: DateTime<Utc>) -> Self { Self { at: Some(at), ..Self::default() } }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub name: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepth {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize { self.critical + self.high + self.normal + self.low }
}

/// Entry point for producing work: enqueue, schedule, recurring schedules,
/// cancellation and queue introspection.
#[derive(Clone)]
pub struct Scheduler {
    store: TaskStore,
    dlq: DeadLetterQueue,
}

impl Scheduler {
    pub fn new(kv: SharedKv, keyspace: TaskKeyspace) -> Self {
        let store = TaskStore::new(kv, keyspace);
        let dlq = DeadLetterQueue::new(store.clone());
        Self { store, dlq }
    }

    pub fn store(&self) -> &TaskStore { &self.store }

    pub fn dlq(&self) -> &DeadLetterQueue { &self.dlq }

    /// Enqueue for immediate execution.
    pub async fn enqueue(&self, def: &TaskDefinition, input: Value) -> Result<TaskId, TaskError> {
        self.schedule(def, input, ScheduleSpec::default()).await
    }

    pub async fn schedule(&self, def: &TaskDefinition, input: Value, spec: ScheduleSpec) -> Result<TaskId, TaskError> {
        def.validate_input(&input)?;

        let idempotency_key = spec.idempotency_key.clone().or_else(|| def.derive_idempotency_key(&input));
        if let Some(key) = &idempotency_key {
            if let Some(existing_id) = self.store.idempotent_task(key).await? {
                if let Some(existing) = self.store.load(existing_id).await? {
                    if !existing.status.is_terminal() {
                        debug!("idempotency key {key} resolves to live task {existing_id}");
                        return Ok(existing_id);
                    }
                }
            }
        }

        // A debounced definition absorbs immediate re-enqueues into the
        // task already waiting in the window.
        if let (Some(window), None, None) = (def.debounce, spec.at, spec.delay) {
            if let Some(existing_id) = self.debounced_task(def, window).await? {
                return Ok(existing_id);
            }
        }

        let scheduled_for = spec
            .at
            .unwrap_or_else(|| Utc::now() + ChronoDuration::milliseconds(spec.delay.map(|d| d.as_millis() as i64).unwrap_or(0)));

        let record = TaskRecord {
            id: TaskId::new(),
            name: def.name.clone(),
            input,
            status: TaskStatus::Pending,
            priority: spec.priority.unwrap_or(def.priority).min(100),
            created_at: Utc::now(),
            scheduled_for,
            started_at: None,
            completed_at: None,
            worker_id: None,
            last_error: None,
            result: None,
            attempt: 0,
            max_attempts: def.retry.max_attempts,
            idempotency_key: idempotency_key.clone(),
            recurring: None,
        };

        self.store.put(&record).await?;
        self.store.enqueue(&record).await?;
        self.store.transition(record.id, TaskStatus::Scheduled, |_| {}).await?;
        if let Some(key) = &idempotency_key {
            self.store.set_idempotency(key, record.id).await?;
        }
        self.notify().await;
        debug!("task {} ({}) scheduled for {}", record.id, record.name, scheduled_for);
        Ok(record.id)
    }

    async fn debounced_task(&self, def: &TaskDefinition, window: Duration) -> Result<Option<TaskId>, TaskError> {
        let horizon = Utc::now() + ChronoDuration::milliseconds(window.as_millis() as i64);
        for id in self.store.ids_with_name(&def.name).await? {
            if let Some(existing) = self.store.load(id).await? {
                if matches!(existing.status, TaskStatus::Pending | TaskStatus::Scheduled) && existing.scheduled_for <= horizon {
                    debug!("debounce: absorbing enqueue of {} into {id}", def.name);
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    pub async fn schedule_recurring(
        &self,
        def: &TaskDefinition,
        input: Value,
        recurrence: Recurrence,
    ) -> Result<ScheduleId, TaskError> {
        recurrence.validate()?;
        def.validate_input(&input)?;

        let mut schedule = RecurringSchedule {
            id: ScheduleId::new(),
            name: def.name.clone(),
            input,
            cron: recurrence.cron,
            interval_ms: recurrence.interval.map(|interval| interval.as_millis() as u64),
            timezone: recurrence.timezone,
            next_run: Utc::now(),
            created_at: Utc::now(),
        };
        schedule.next_run = schedule.next_run_after(Utc::now())?;

        self.save_schedule(&schedule).await?;
        self.store.kv().sadd(&self.store.keyspace().schedules(), &schedule.id.to_string()).await?;
        debug!("recurring schedule {} for {} first fires at {}", schedule.id, schedule.name, schedule.next_run);
        Ok(schedule.id)
    }

    pub async fn cancel_recurring(&self, id: ScheduleId) -> Result<bool, TaskError> {
        let keyspace = self.store.keyspace();
        let removed = self.store.kv().srem(&keyspace.schedules(), &id.to_string()).await?;
        self.store.kv().del(&keyspace.schedule(id)).await?;
        Ok(removed)
    }

    /// Cancel a waiting task. Fails (returns `false`) when the task is
    /// running or already terminal; success removes it entirely.
    pub async fn cancel(&self, id: TaskId) -> Result<bool, TaskError> {
        let Some(record) = self.store.load(id).await? else { return Ok(false) };
        if record.status == TaskStatus::Running || record.status.is_terminal() {
            return Ok(false);
        }
        self.store.dequeue(&record).await?;
        self.store.remove(&record).await?;
        debug!("task {id} cancelled");
        Ok(true)
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, TaskError> { self.store.load(id).await }

    /// Filtered listing, sorted by `created_at` descending after the
    /// intersection.
    pub async fn get_tasks(&self, filter: TaskFilter) -> Result<Vec<TaskRecord>, TaskError> {
        let ids: Vec<TaskId> = match (&filter.status, &filter.name) {
            (Some(status), Some(name)) => {
                let with_name: std::collections::HashSet<TaskId> = self.store.ids_with_name(name).await?.into_iter().collect();
                self.store.ids_with_status(*status).await?.into_iter().filter(|id| with_name.contains(id)).collect()
            }
            (Some(status), None) => self.store.ids_with_status(*status).await?,
            (None, Some(name)) => self.store.ids_with_name(name).await?,
            (None, None) => {
                let mut ids = Vec::new();
                for status in TaskStatus::ALL {
                    ids.extend(self.store.ids_with_status(status).await?);
                }
                ids
            }
        };

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.store.load(id).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    pub async fn queue_depth(&self) -> Result<QueueDepth, TaskError> {
        Ok(QueueDepth {
            critical: self.store.queue_len(PriorityBucket::Critical).await?,
            high: self.store.queue_len(PriorityBucket::High).await?,
            normal: self.store.queue_len(PriorityBucket::Normal).await?,
            low: self.store.queue_len(PriorityBucket::Low).await?,
        })
    }

    // Recurring sweeper.

    /// Fire every due schedule once and advance it. Missed runs during
    /// downtime collapse to a single immediate run because the next fire
    /// time is computed from now, not from the stale cursor.
    pub async fn sweep_recurring_once(&self, registry: &TaskRegistry) -> Result<usize, TaskError> {
        let keyspace = self.store.keyspace();
        let ids = self.store.kv().smembers(&keyspace.schedules()).await?;
        let mut fired = 0;

        for member in ids {
            let Ok(schedule_id) = member.parse::<ScheduleId>() else {
                warn!("skipping unparsable schedule id {member}");
                continue;
            };
            let Some(mut schedule) = self.load_schedule(schedule_id).await? else { continue };
            if schedule.next_run > Utc::now() {
                continue;
            }
            let Some(def) = registry.get(&schedule.name) else {
                warn!("no definition for recurring schedule {} ({})", schedule.id, schedule.name);
                continue;
            };

            let task_id = self.fire_recurring(&def, &schedule).await?;
            debug!("recurring schedule {} fired task {task_id}", schedule.id);
            fired += 1;

            schedule.next_run = schedule.next_run_after(Utc::now())?;
            self.save_schedule(&schedule).await?;
        }
        Ok(fired)
    }

    async fn fire_recurring(&self, def: &TaskDefinition, schedule: &RecurringSchedule) -> Result<TaskId, TaskError> {
        let record = TaskRecord {
            id: TaskId::new(),
            name: def.name.clone(),
            input: schedule.input.clone(),
            status: TaskStatus::Pending,
            priority: def.priority,
            created_at: Utc::now(),
            scheduled_for: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_id: None,
            last_error: None,
            result: None,
            attempt: 0,
            max_attempts: def.retry.max_attempts,
            idempotency_key: None,
            recurring: Some(schedule.id),
        };
        self.store.put(&record).await?;
        self.store.enqueue(&record).await?;
        self.store.transition(record.id, TaskStatus::Scheduled, |_| {}).await?;
        self.notify().await;
        Ok(record.id)
    }

    pub fn spawn_recurring_sweeper(&self, registry: Arc<TaskRegistry>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.sweep_recurring_once(&registry).await {
                    warn!("recurring sweep failed: {e}");
                }
            }
        })
    }

    async fn load_schedule(&self, id: ScheduleId) -> Result<Option<RecurringSchedule>, TaskError> {
        let fields = self.store.kv().hgetall(&self.store.keyspace().schedule(id)).await?;
        let Some(encoded) = fields.get("schedule") else { return Ok(None) };
        Ok(Some(serde_json::from_str(encoded).map_err(|e| TaskError::Corrupt(e.to_string()))?))
    }

    async fn save_schedule(&self, schedule: &RecurringSchedule) -> Result<(), TaskError> {
        let encoded = serde_json::to_string(schedule).map_err(|e| TaskError::Corrupt(e.to_string()))?;
        self.store.kv().hset(&self.store.keyspace().schedule(schedule.id), "schedule", &encoded).await?;
        Ok(())
    }

    async fn notify(&self) {
        if let Err(e) = self.store.kv().publish(&self.store.keyspace().notify_channel(), "enqueued").await {
            debug!("queue notify publish failed: {e}");
        }
    }
}
