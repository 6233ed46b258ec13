use concave_kv::{MemoryKv, SharedKv};
use concave_proto::TaskId;
use concave_tasks::{
    RetryPolicy, Scheduler, TaskDefinition, TaskError, TaskKeyspace, TaskRegistry, TaskStatus, Worker, WorkerConfig,
};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

fn fast_config(concurrency: usize) -> WorkerConfig {
    WorkerConfig {
        concurrency,
        lock_ttl: Duration::from_millis(500),
        poll_interval: Duration::from_millis(10),
        claim_batch: 16,
    }
}

async fn wait_for_status(scheduler: &Scheduler, id: TaskId, status: TaskStatus) -> concave_tasks::TaskRecord {
    for _ in 0..600 {
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
async fn contested_queue_executes_each_task_exactly_once() {
    let kv: SharedKv = Arc::new(MemoryKv::new());
    let scheduler = Scheduler::new(kv.clone(), TaskKeyspace::default());
    let registry = Arc::new(TaskRegistry::new());

    let executions: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let def = {
        let executions = executions.clone();
        TaskDefinition::from_fn("count", move |ctx, _input| {
            let executions = executions.clone();
            async move {
                *executions.lock().unwrap().entry(ctx.task_id.to_string()).or_insert(0) += 1;
                // linger so the two workers genuinely contend
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(Value::Null)
            }
        })
    };
    registry.register(def.clone());

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(scheduler.enqueue(&def, json!({ "n": i })).await.unwrap());
    }

    let w1 = Worker::new(kv.clone(), TaskKeyspace::default(), registry.clone(), fast_config(3)).spawn();
    let w2 = Worker::new(kv.clone(), TaskKeyspace::default(), registry.clone(), fast_config(3)).spawn();

    for id in &ids {
        wait_for_status(&scheduler, *id, TaskStatus::Completed).await;
    }

    // the lease guarantees at most one execution per task
    let executions = executions.lock().unwrap();
    assert_eq!(executions.len(), 20);
    for (task_id, count) in executions.iter() {
        assert_eq!(*count, 1, "task {task_id} ran {count} times");
    }
    drop(executions);
    assert_eq!(scheduler.queue_depth().await.unwrap().total(), 0);

    w1.stop().await;
    w2.stop().await;
}

#[tokio::test]
async fn dlq_retry_round_trips_through_the_pool() {
    let kv: SharedKv = Arc::new(MemoryKv::new());
    let scheduler = Scheduler::new(kv.clone(), TaskKeyspace::default());
    let registry = Arc::new(TaskRegistry::new());

    let should_fail = Arc::new(AtomicBool::new(true));
    let def = {
        let should_fail = should_fail.clone();
        TaskDefinition::from_fn("fragile", move |_ctx, _input| {
            let should_fail = should_fail.clone();
            async move {
                if should_fail.load(Ordering::SeqCst) {
                    Err(TaskError::failed("broken dependency"))
                } else {
                    Ok(json!({"ok": true}))
                }
            }
        })
        .retry(RetryPolicy::fixed(Duration::from_millis(5), 2))
    };
    registry.register(def.clone());

    let original = scheduler.enqueue(&def, json!({"payload": 7})).await.unwrap();
    let worker = Worker::new(kv.clone(), TaskKeyspace::default(), registry.clone(), fast_config(1)).spawn();

    wait_for_status(&scheduler, original, TaskStatus::Dead).await;
    assert_eq!(scheduler.dlq().count().await.unwrap(), 1);

    // operator fixes the dependency and replays the DLQ
    should_fail.store(false, Ordering::SeqCst);
    let replayed = scheduler.dlq().retry(original).await.unwrap();
    assert_ne!(replayed, original, "the original id is not resurrected");

    let task = wait_for_status(&scheduler, replayed, TaskStatus::Completed).await;
    assert_eq!(task.input, json!({"payload": 7}), "input survives the round trip");
    assert_eq!(task.attempt, 0, "replayed clone starts from attempt zero");
    assert_eq!(scheduler.dlq().count().await.unwrap(), 0);

    worker.stop().await;
}

#[tokio::test]
async fn scheduled_tasks_wait_for_their_time() {
    let kv: SharedKv = Arc::new(MemoryKv::new());
    let scheduler = Scheduler::new(kv.clone(), TaskKeyspace::default());
    let registry = Arc::new(TaskRegistry::new());

    let def = TaskDefinition::from_fn("delayed", |_ctx, _input| async { Ok(Value::Null) });
    registry.register(def.clone());

    let id = scheduler
        .schedule(&def, json!({}), concave_tasks::ScheduleSpec::delay(Duration::from_millis(120)))
        .await
        .unwrap();
    let worker = Worker::new(kv, TaskKeyspace::default(), registry, fast_config(1)).spawn();

    // not picked up before its time
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.get_task(id).await.unwrap().unwrap().status, TaskStatus::Scheduled);

    let task = wait_for_status(&scheduler, id, TaskStatus::Completed).await;
    assert!(task.started_at.unwrap() >= task.created_at + chrono::Duration::milliseconds(100));

    worker.stop().await;
}
