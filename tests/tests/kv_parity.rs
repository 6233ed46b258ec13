//! The coordination plane is pluggable: every suite-critical behavior must
//! hold over both the in-process store and the sled-backed store.

use concave_core::changelog::{Changelog, ChangelogConfig, NewChange};
use concave_kv::{MemoryKv, SetOptions, SharedKv, SledKv};
use concave_proto::JsonObject;
use concave_tasks::{Scheduler, TaskDefinition, TaskKeyspace, TaskStatus};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

fn object(value: serde_json::Value) -> JsonObject {
    match value {
        serde_json::Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

fn backends() -> Vec<(&'static str, SharedKv)> {
    vec![
        ("memory", Arc::new(MemoryKv::new()) as SharedKv),
        ("sled", Arc::new(SledKv::temporary().unwrap()) as SharedKv),
    ]
}

#[tokio::test]
async fn lock_semantics_match_across_backends() {
    for (label, kv) in backends() {
        assert!(kv.set("lock:x", "w1", SetOptions::nx_ex(Duration::from_secs(5))).await.unwrap(), "{label}");
        assert!(!kv.set("lock:x", "w2", SetOptions::nx_ex(Duration::from_secs(5))).await.unwrap(), "{label}");
        assert_eq!(kv.get("lock:x").await.unwrap().as_deref(), Some("w1"), "{label}");
        assert!(kv.del("lock:x").await.unwrap(), "{label}");
        assert!(kv.set("lock:x", "w2", SetOptions::nx_ex(Duration::from_secs(5))).await.unwrap(), "{label}");
    }
}

#[tokio::test]
async fn queue_ordering_matches_across_backends() {
    for (label, kv) in backends() {
        kv.zadd("queue:test", 300.0, "c").await.unwrap();
        kv.zadd("queue:test", 100.0, "a").await.unwrap();
        kv.zadd("queue:test", 200.0, "b").await.unwrap();
        assert_eq!(kv.zrange("queue:test", 0, -1).await.unwrap(), vec!["a", "b", "c"], "{label}");
        assert_eq!(kv.zrangebyscore("queue:test", 0.0, 250.0, None).await.unwrap(), vec!["a", "b"], "{label}");
    }
}

#[tokio::test]
async fn scheduler_round_trip_on_both_backends() {
    for (label, kv) in backends() {
        let scheduler = Scheduler::new(kv, TaskKeyspace::default());
        let def = TaskDefinition::from_fn("parity", |_ctx, _input| async { Ok(Value::Null) });

        let id = scheduler.enqueue(&def, json!({"k": 1})).await.unwrap();
        let task = scheduler.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Scheduled, "{label}");
        assert_eq!(task.input, json!({"k": 1}), "{label}");
        assert_eq!(scheduler.queue_depth().await.unwrap().total(), 1, "{label}");

        assert!(scheduler.cancel(id).await.unwrap(), "{label}");
        assert_eq!(scheduler.queue_depth().await.unwrap().total(), 0, "{label}");
    }
}

#[tokio::test]
async fn changelog_mirror_survives_restart_on_sled() {
    let kv: SharedKv = Arc::new(SledKv::temporary().unwrap());

    let log = Changelog::with_kv(kv.clone(), ChangelogConfig::with_max_entries(10));
    for i in 1..=3 {
        log.append(NewChange::create("todos", &format!("t{i}"), object(json!({"id": format!("t{i}")})))).await;
    }

    // same sled handle, fresh changelog: simulates a process restart
    let restored = Changelog::with_kv(kv, ChangelogConfig::with_max_entries(10));
    assert_eq!(restored.hydrate().await.unwrap(), 3);
    assert_eq!(restored.current_seq(), 3);
    let entries = restored.get_since(Some("todos"), 1);
    assert_eq!(entries.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3]);
}
