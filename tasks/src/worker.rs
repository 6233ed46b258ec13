//! The worker pool: claims due tasks under a lease, executes handlers with
//! a heartbeat/timeout supervision group, and routes failures through the
//! retry policy or into the DLQ.

use chrono::Utc;
use concave_kv::SharedKv;
use concave_proto::{TaskId, WorkerId};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    context::TaskContext,
    definition::TaskDefinition,
    dlq::DeadLetterQueue,
    error::TaskError,
    lease::LeaseManager,
    record::{PriorityBucket, TaskRecord, TaskStatus},
    store::{TaskKeyspace, TaskStore},
};

/// Definitions known to this worker process, by task name.
#[derive(Default)]
pub struct TaskRegistry {
    defs: std::sync::RwLock<HashMap<String, Arc<TaskDefinition>>>,
}

impl TaskRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn register(&self, def: TaskDefinition) {
        self.defs.write().expect("registry lock poisoned").insert(def.name.clone(), Arc::new(def));
    }

    pub fn get(&self, name: &str) -> Option<Arc<TaskDefinition>> {
        self.defs.read().expect("registry lock poisoned").get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> { self.defs.read().expect("registry lock poisoned").keys().cloned().collect() }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Max tasks executing concurrently in this worker.
    pub concurrency: usize,
    /// Lease TTL; the heartbeat extends at a third of this.
    pub lock_ttl: Duration,
    /// Queue poll fallback when no wake-up arrives.
    pub poll_interval: Duration,
    /// Candidates fetched per bucket per claim pass.
    pub claim_batch: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            lock_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            claim_batch: 16,
        }
    }
}

struct WorkerInner {
    id: WorkerId,
    store: TaskStore,
    lease: LeaseManager,
    dlq: DeadLetterQueue,
    registry: Arc<TaskRegistry>,
    config: WorkerConfig,
    shutdown: CancellationToken,
    active_total: AtomicUsize,
    active_by_name: std::sync::Mutex<HashMap<String, usize>>,
    task_done: tokio::sync::Notify,
}

#[derive(Clone)]
pub struct Worker(Arc<WorkerInner>);

/// Handle to a spawned worker; `stop` drains it gracefully.
pub struct WorkerHandle {
    pub id: WorkerId,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

impl Worker {
    pub fn new(kv: SharedKv, keyspace: TaskKeyspace, registry: Arc<TaskRegistry>, config: WorkerConfig) -> Self {
        let store = TaskStore::new(kv, keyspace.clone());
        let lease = LeaseManager::new(store.kv().clone(), keyspace, config.lock_ttl);
        let dlq = DeadLetterQueue::new(store.clone());
        Self(Arc::new(WorkerInner {
            id: WorkerId::new(),
            store,
            lease,
            dlq,
            registry,
            config,
            shutdown: CancellationToken::new(),
            active_total: AtomicUsize::new(0),
            active_by_name: std::sync::Mutex::new(HashMap::new()),
            task_done: tokio::sync::Notify::new(),
        }))
    }

    pub fn id(&self) -> WorkerId { self.0.id }

    pub fn shutdown_token(&self) -> CancellationToken { self.0.shutdown.clone() }

    pub fn active_count(&self) -> usize { self.0.active_total.load(Ordering::SeqCst) }

    pub fn spawn(self) -> WorkerHandle {
        let id = self.id();
        let shutdown = self.shutdown_token();
        let handle = tokio::spawn(async move { self.run().await });
        WorkerHandle { id, shutdown, handle }
    }

    /// Main loop: claim while capacity remains, otherwise wait for a queue
    /// wake-up, a finished task, or the poll interval.
    pub async fn run(&self) {
        let inner = &self.0;
        info!("worker {} starting (concurrency {})", inner.id, inner.config.concurrency);
        if let Err(e) = inner.store.kv().sadd(&inner.store.keyspace().workers(), &inner.id.to_string()).await {
            warn!("worker registration failed: {e}");
        }
        let mut wakeup = match inner.store.kv().subscribe(&inner.store.keyspace().notify_channel()).await {
            Ok(receiver) => Some(receiver),
            Err(e) => {
                debug!("queue wake-ups unavailable, polling only: {e}");
                None
            }
        };

        while !inner.shutdown.is_cancelled() {
            if inner.active_total.load(Ordering::SeqCst) < inner.config.concurrency {
                match self.claim_next().await {
                    Ok(true) => continue, // claimed one; try to fill remaining capacity
                    Ok(false) => {}
                    Err(e) => warn!("claim pass failed: {e}"),
                }
            }

            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = tokio::time::sleep(inner.config.poll_interval) => {}
                _ = inner.task_done.notified() => {}
                _ = async {
                    match &mut wakeup {
                        Some(receiver) => { receiver.rx.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }
        }

        // drain: in-flight handlers observe the cancelled child tokens and
        // requeue themselves
        while inner.active_total.load(Ordering::SeqCst) > 0 {
            tokio::select! {
                _ = inner.task_done.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
        if let Err(e) = inner.store.kv().srem(&inner.store.keyspace().workers(), &inner.id.to_string()).await {
            debug!("worker deregistration failed: {e}");
        }
        info!("worker {} stopped", inner.id);
    }

    /// Scan buckets high-to-low and claim at most one due task.
    async fn claim_next(&self) -> Result<bool, TaskError> {
        let inner = &self.0;
        for bucket in PriorityBucket::ALL {
            for id in inner.store.due(bucket, inner.config.claim_batch).await? {
                let Some(record) = inner.store.load(id).await? else {
                    // stale queue entry for a removed task
                    inner.store.dequeue_raw(bucket, &id.to_string()).await?;
                    continue;
                };
                let Some(def) = inner.registry.get(&record.name) else {
                    // another worker deployment may own this task type
                    continue;
                };
                if self.at_name_capacity(&def) {
                    continue;
                }
                if !inner.lease.acquire(id, inner.id).await? {
                    continue;
                }

                inner.store.dequeue(&record).await?;
                let running = match self.mark_running(record).await {
                    Ok(running) => running,
                    Err(e) => {
                        warn!("claimed task {id} could not start: {e}");
                        let _ = inner.lease.release(id, inner.id).await;
                        continue;
                    }
                };
                self.spawn_task(running, def);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn at_name_capacity(&self, def: &TaskDefinition) -> bool {
        let Some(limit) = def.max_concurrency else { return false };
        let active = self.0.active_by_name.lock().expect("active lock poisoned");
        active.get(&def.name).copied().unwrap_or(0) >= limit
    }

    async fn mark_running(&self, record: TaskRecord) -> Result<TaskRecord, TaskError> {
        let inner = &self.0;
        // bridge the enqueue race where the producer has not flipped
        // pending -> scheduled yet
        if record.status == TaskStatus::Pending {
            inner.store.transition(record.id, TaskStatus::Scheduled, |_| {}).await?;
        }
        inner
            .store
            .transition(record.id, TaskStatus::Running, |task| {
                task.started_at = Some(Utc::now());
                task.worker_id = Some(inner.id);
            })
            .await
    }

    fn spawn_task(&self, record: TaskRecord, def: Arc<TaskDefinition>) {
        let inner = self.0.clone();
        inner.active_total.fetch_add(1, Ordering::SeqCst);
        *inner.active_by_name.lock().expect("active lock poisoned").entry(def.name.clone()).or_insert(0) += 1;
        debug!("worker {} executing task {} ({})", inner.id, record.id, record.name);
        tokio::spawn(run_task(inner, record, def));
    }
}

async fn run_task(inner: Arc<WorkerInner>, record: TaskRecord, def: Arc<TaskDefinition>) {
    // handler, heartbeat and timeout form one supervised group: whichever
    // exits first cancels the others
    let token = inner.shutdown.child_token();
    let ctx = TaskContext {
        task_id: record.id,
        attempt: record.attempt,
        scheduled_at: record.scheduled_for,
        started_at: Utc::now(),
        worker_id: inner.id,
        cancellation: token.clone(),
    };

    let heartbeat = tokio::spawn(heartbeat_loop(inner.clone(), record.id, token.clone()));

    let outcome = tokio::select! {
        result = def.handler.run(ctx, record.input.clone()) => result,
        _ = tokio::time::sleep(def.timeout) => Err(TaskError::Timeout),
        _ = token.cancelled() => Err(TaskError::Cancelled),
    };
    heartbeat.abort();

    let outcome = match outcome {
        Ok(output) => def.validate_output(&output).map(|_| output),
        Err(e) => Err(e),
    };

    if let Err(e) = finish_task(&inner, &record, &def, outcome).await {
        warn!("task {} post-processing failed: {e}", record.id);
    }

    inner.active_total.fetch_sub(1, Ordering::SeqCst);
    if let Some(count) = inner.active_by_name.lock().expect("active lock poisoned").get_mut(&def.name) {
        *count = count.saturating_sub(1);
    }
    inner.task_done.notify_one();
}

/// Extend the lease at a third of its TTL. Extension failure means the
/// lease was stolen or vanished: cancel the in-flight handler.
async fn heartbeat_loop(inner: Arc<WorkerInner>, task_id: TaskId, token: CancellationToken) {
    let interval = inner.lease.ttl() / 3;
    loop {
        tokio::time::sleep(interval).await;
        match inner.lease.extend(task_id, inner.id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("lease for task {task_id} lost; cancelling handler");
                token.cancel();
                return;
            }
            Err(e) => {
                warn!("heartbeat for task {task_id} failed: {e}; cancelling handler");
                token.cancel();
                return;
            }
        }
    }
}

async fn finish_task(
    inner: &Arc<WorkerInner>,
    record: &TaskRecord,
    def: &TaskDefinition,
    outcome: Result<serde_json::Value, TaskError>,
) -> Result<(), TaskError> {
    match outcome {
        Ok(output) => {
            let updated = inner
                .store
                .transition(record.id, TaskStatus::Completed, |task| {
                    task.result = Some(output);
                    task.completed_at = Some(Utc::now());
                })
                .await?;
            inner.store.clear_idempotency(&updated).await?;
            inner.lease.release(record.id, inner.id).await?;
            debug!("task {} completed", record.id);
        }
        Err(TaskError::Cancelled) => {
            // lease loss or shutdown: requeue immediately, attempt unchanged
            let updated = inner
                .store
                .transition(record.id, TaskStatus::Scheduled, |task| {
                    task.worker_id = None;
                    task.scheduled_for = Utc::now();
                })
                .await?;
            inner.store.enqueue(&updated).await?;
            // no-op when another worker already stole the lease
            let _ = inner.lease.release(record.id, inner.id).await;
            debug!("task {} requeued after cancellation", record.id);
        }
        Err(error) => {
            let attempt_number = record.attempt + 1;
            if def.retry.should_retry(&error, attempt_number) {
                let delay = def.retry.delay(attempt_number);
                let updated = inner
                    .store
                    .transition(record.id, TaskStatus::Scheduled, |task| {
                        task.attempt = attempt_number;
                        task.last_error = Some(error.to_string());
                        task.worker_id = None;
                        task.scheduled_for = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                    })
                    .await?;
                inner.store.enqueue(&updated).await?;
                inner.lease.release(record.id, inner.id).await?;
                debug!("task {} retrying in {delay:?} (attempt {attempt_number}/{})", record.id, record.max_attempts);
            } else {
                let updated = inner
                    .store
                    .transition(record.id, TaskStatus::Dead, |task| {
                        task.attempt = attempt_number;
                        task.last_error = Some(error.to_string());
                        task.completed_at = Some(Utc::now());
                    })
                    .await?;
                inner.dlq.add(&updated, error.to_string()).await?;
                inner.store.clear_idempotency(&updated).await?;
                inner.lease.release(record.id, inner.id).await?;
                warn!("task {} dead-lettered after {attempt_number} attempts: {error}", record.id);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        retry::RetryPolicy,
        scheduler::{Scheduler, TaskFilter},
    };
    use concave_kv::MemoryKv;
    use serde_json::{json, Value};

    fn setup() -> (SharedKv, Scheduler, Arc<TaskRegistry>) {
        let kv: SharedKv = Arc::new(MemoryKv::new());
        let scheduler = Scheduler::new(kv.clone(), TaskKeyspace::default());
        (kv, scheduler, Arc::new(TaskRegistry::new()))
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            lock_ttl: Duration::from_millis(300),
            poll_interval: Duration::from_millis(20),
            claim_batch: 16,
        }
    }

    async fn wait_for_status(scheduler: &Scheduler, id: TaskId, status: TaskStatus) -> TaskRecord {
        for _ in 0..400 {
            if let Some(task) = scheduler.get_task(id).await.unwrap() {
                if task.status == status {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {id} never reached {status}");
    }

    #[tokio::test]
    async fn executes_to_completion() {
        let (kv, scheduler, registry) = setup();
        let def = TaskDefinition::from_fn("double", |_ctx, input| async move {
            let n = input["n"].as_i64().unwrap_or(0);
            Ok(json!({ "doubled": n * 2 }))
        });
        registry.register(def.clone());

        let id = scheduler.enqueue(&def, json!({"n": 21})).await.unwrap();
        let handle = Worker::new(kv, TaskKeyspace::default(), registry, fast_config()).spawn();

        let task = wait_for_status(&scheduler, id, TaskStatus::Completed).await;
        assert_eq!(task.result, Some(json!({"doubled": 42})));
        assert!(task.started_at.is_some() && task.completed_at.is_some());
        assert_eq!(scheduler.queue_depth().await.unwrap().total(), 0);
        // lease released
        assert!(scheduler.store().kv().get(&TaskKeyspace::default().lock(id)).await.unwrap().is_none());
        handle.stop().await;
    }

    #[tokio::test]
    async fn retries_with_backoff_then_succeeds() {
        let (kv, scheduler, registry) = setup();
        let attempts = Arc::new(AtomicUsize::new(0));
        let def = {
            let attempts = attempts.clone();
            TaskDefinition::from_fn("flaky", move |_ctx, _input| {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TaskError::failed("transient"))
                    } else {
                        Ok(Value::Null)
                    }
                }
            })
            .retry(RetryPolicy::exponential(Duration::from_millis(20), Duration::from_secs(1), 3))
        };
        registry.register(def.clone());

        let id = scheduler.enqueue(&def, json!({})).await.unwrap();
        let handle = Worker::new(kv, TaskKeyspace::default(), registry, fast_config()).spawn();

        let task = wait_for_status(&scheduler, id, TaskStatus::Completed).await;
        assert_eq!(task.attempt, 2, "two retry requeues before success");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        handle.stop().await;
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let (kv, scheduler, registry) = setup();
        let def = TaskDefinition::from_fn("doomed", |_ctx, _input| async { Err::<Value, _>(TaskError::failed("always")) })
            .retry(RetryPolicy::exponential(Duration::from_millis(5), Duration::from_millis(20), 2));
        registry.register(def.clone());

        let id = scheduler.enqueue(&def, json!({})).await.unwrap();
        let handle = Worker::new(kv, TaskKeyspace::default(), registry, fast_config()).spawn();

        let task = wait_for_status(&scheduler, id, TaskStatus::Dead).await;
        assert_eq!(task.attempt, 2);
        assert!(task.completed_at.is_some());

        let entry = scheduler.dlq().get(id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 2);
        assert!(entry.reason.contains("always"));
        handle.stop().await;
    }

    #[tokio::test]
    async fn validation_failure_is_not_retried() {
        let (kv, scheduler, registry) = setup();
        let def = TaskDefinition::from_fn("badout", |_ctx, _input| async { Ok(json!("wrong shape")) })
            .output_validator(|output| if output.is_object() { Ok(()) } else { Err("expected object".into()) });
        registry.register(def.clone());

        let id = scheduler.enqueue(&def, json!({})).await.unwrap();
        let handle = Worker::new(kv, TaskKeyspace::default(), registry, fast_config()).spawn();

        let task = wait_for_status(&scheduler, id, TaskStatus::Dead).await;
        assert_eq!(task.attempt, 1, "no retries for validation mismatch");
        assert!(task.last_error.as_deref().unwrap_or("").contains("expected object"));
        handle.stop().await;
    }

    #[tokio::test]
    async fn timeout_takes_the_retry_path() {
        let (kv, scheduler, registry) = setup();
        let def = TaskDefinition::from_fn("slow", |_ctx, _input| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        })
        .timeout(Duration::from_millis(30))
        .retry(RetryPolicy::fixed(Duration::from_millis(5), 2));
        registry.register(def.clone());

        let id = scheduler.enqueue(&def, json!({})).await.unwrap();
        let handle = Worker::new(kv, TaskKeyspace::default(), registry, fast_config()).spawn();

        let task = wait_for_status(&scheduler, id, TaskStatus::Dead).await;
        assert!(task.last_error.as_deref().unwrap_or("").contains("timed out"));
        handle.stop().await;
    }

    #[tokio::test]
    async fn lease_loss_requeues_with_attempt_unchanged() {
        let (kv, scheduler, registry) = setup();
        let runs = Arc::new(AtomicUsize::new(0));
        let def = {
            let runs = runs.clone();
            TaskDefinition::from_fn("long", move |_ctx, _input| {
                let runs = runs.clone();
                async move {
                    if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                        // first run hangs until the lease is torn out from
                        // under us
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Ok(Value::Null)
                }
            })
            .timeout(Duration::from_secs(120))
        };
        registry.register(def.clone());

        let id = scheduler.enqueue(&def, json!({})).await.unwrap();
        let handle = Worker::new(kv.clone(), TaskKeyspace::default(), registry, fast_config()).spawn();

        wait_for_status(&scheduler, id, TaskStatus::Running).await;
        // simulate another worker stealing the lease
        kv.del(&TaskKeyspace::default().lock(id)).await.unwrap();

        // the heartbeat notices, the handler is cancelled, the task is
        // requeued with attempt unchanged and executed to completion
        let task = wait_for_status(&scheduler, id, TaskStatus::Completed).await;
        assert_eq!(task.attempt, 0, "lease loss does not burn an attempt");
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        handle.stop().await;
    }

    #[tokio::test]
    async fn shutdown_requeues_in_flight_tasks() {
        let (kv, scheduler, registry) = setup();
        let def = TaskDefinition::from_fn("hang", |_ctx, _input| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        })
        .timeout(Duration::from_secs(120));
        registry.register(def.clone());

        let id = scheduler.enqueue(&def, json!({})).await.unwrap();
        let handle = Worker::new(kv, TaskKeyspace::default(), registry, fast_config()).spawn();

        wait_for_status(&scheduler, id, TaskStatus::Running).await;
        handle.stop().await;

        let task = scheduler.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Scheduled, "graceful shutdown hands the task back");
        assert_eq!(task.attempt, 0);
        assert!(task.worker_id.is_none());
    }

    #[tokio::test]
    async fn priority_buckets_drain_high_first() {
        let (kv, scheduler, registry) = setup();
        let order: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let def = {
            let order = order.clone();
            TaskDefinition::from_fn("tagged", move |_ctx, input| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(input["tag"].as_str().unwrap_or("?").to_string());
                    Ok(Value::Null)
                }
            })
        };
        registry.register(def.clone());

        use crate::scheduler::ScheduleSpec;
        let low = scheduler
            .schedule(&def, json!({"tag": "low"}), ScheduleSpec { priority: Some(10), ..Default::default() })
            .await
            .unwrap();
        let high = scheduler
            .schedule(&def, json!({"tag": "high"}), ScheduleSpec { priority: Some(90), ..Default::default() })
            .await
            .unwrap();

        // single-threaded worker claims strictly by bucket order
        let config = WorkerConfig { concurrency: 1, ..fast_config() };
        let handle = Worker::new(kv, TaskKeyspace::default(), registry, config).spawn();

        wait_for_status(&scheduler, low, TaskStatus::Completed).await;
        wait_for_status(&scheduler, high, TaskStatus::Completed).await;
        assert_eq!(order.lock().unwrap().as_slice(), ["high".to_string(), "low".to_string()]);
        handle.stop().await;
    }

    #[tokio::test]
    async fn per_definition_concurrency_cap_is_respected() {
        let (kv, scheduler, registry) = setup();
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let def = {
            let (peak, current) = (peak.clone(), current.clone());
            TaskDefinition::from_fn("capped", move |_ctx, _input| {
                let (peak, current) = (peak.clone(), current.clone());
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                }
            })
            .max_concurrency(1)
        };
        registry.register(def.clone());

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(scheduler.enqueue(&def, json!({})).await.unwrap());
        }
        // worker-wide concurrency would allow 4; the definition caps at 1
        let config = WorkerConfig { concurrency: 4, ..fast_config() };
        let handle = Worker::new(kv, TaskKeyspace::default(), registry, config).spawn();

        for id in ids {
            wait_for_status(&scheduler, id, TaskStatus::Completed).await;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn invariant_running_tasks_have_worker_and_lease() {
        let (kv, scheduler, registry) = setup();
        let def = TaskDefinition::from_fn("probe", |_ctx, _input| async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(Value::Null)
        });
        registry.register(def.clone());

        let id = scheduler.enqueue(&def, json!({})).await.unwrap();
        let handle = Worker::new(kv.clone(), TaskKeyspace::default(), registry, fast_config()).spawn();

        let running = wait_for_status(&scheduler, id, TaskStatus::Running).await;
        let worker_id = running.worker_id.expect("running task carries its worker");
        let holder = kv.get(&TaskKeyspace::default().lock(id)).await.unwrap();
        assert_eq!(holder, Some(worker_id.to_string()), "live lease held by the same worker");

        wait_for_status(&scheduler, id, TaskStatus::Completed).await;
        handle.stop().await;

        let tasks = scheduler.get_tasks(TaskFilter { status: Some(TaskStatus::Running), ..Default::default() }).await.unwrap();
        assert!(tasks.is_empty());
    }
}
