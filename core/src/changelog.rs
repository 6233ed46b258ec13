//! Append-only, monotonically sequenced log of resource mutations with
//! bounded retention. The in-process ring is the source of truth for
//! reads; a KV, when configured, mirrors it for durability and for
//! waking up sibling processes.

use chrono::Utc;
use concave_kv::{Batch, SharedKv};
use concave_proto::{ChangeEntry, ChangeKind, JsonObject, Seq};
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ChangelogConfig {
    /// Retain at most this many entries; older entries are pruned.
    pub max_entries: usize,
    /// Ordered-set key mirroring the ring in the KV.
    pub kv_key: String,
    /// Pub/sub channel on which appended entries are announced.
    pub notify_channel: String,
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        Self { max_entries: 1024, kv_key: "concave:changelog".to_string(), notify_channel: "concave:changelog:notify".to_string() }
    }
}

impl ChangelogConfig {
    pub fn with_max_entries(max_entries: usize) -> Self { Self { max_entries, ..Self::default() } }
}

/// A mutation about to be recorded; the changelog assigns its `seq`.
#[derive(Debug, Clone)]
pub struct NewChange {
    pub resource: String,
    pub kind: ChangeKind,
    pub object_id: String,
    pub object: Option<JsonObject>,
    pub previous_object: Option<JsonObject>,
}

impl NewChange {
    pub fn create(resource: &str, object_id: &str, object: JsonObject) -> Self {
        Self {
            resource: resource.to_string(),
            kind: ChangeKind::Create,
            object_id: object_id.to_string(),
            object: Some(object),
            previous_object: None,
        }
    }

    pub fn update(resource: &str, object_id: &str, object: JsonObject, previous_object: Option<JsonObject>) -> Self {
        Self { resource: resource.to_string(), kind: ChangeKind::Update, object_id: object_id.to_string(), object: Some(object), previous_object }
    }

    pub fn delete(resource: &str, object_id: &str) -> Self {
        Self { resource: resource.to_string(), kind: ChangeKind::Delete, object_id: object_id.to_string(), object: None, previous_object: None }
    }
}

struct Ring {
    entries: VecDeque<ChangeEntry>,
    /// Smallest seq still available for catch-up. Stays 0 until the first
    /// prune, meaning the full history since genesis is present.
    min_available: Seq,
}

pub struct Changelog {
    ring: std::sync::Mutex<Ring>,
    seq: AtomicU64,
    kv: Option<SharedKv>,
    degraded: AtomicBool,
    config: ChangelogConfig,
}

impl Changelog {
    pub fn new(config: ChangelogConfig) -> Self {
        Self {
            ring: std::sync::Mutex::new(Ring { entries: VecDeque::new(), min_available: 0 }),
            seq: AtomicU64::new(0),
            kv: None,
            degraded: AtomicBool::new(false),
            config,
        }
    }

    pub fn with_kv(kv: SharedKv, config: ChangelogConfig) -> Self {
        Self {
            ring: std::sync::Mutex::new(Ring { entries: VecDeque::new(), min_available: 0 }),
            seq: AtomicU64::new(0),
            kv: Some(kv),
            degraded: AtomicBool::new(false),
            config,
        }
    }

    /// Restore the ring from the KV mirror after a restart so that
    /// reconnecting subscribers can still catch up.
    pub async fn hydrate(&self) -> Result<usize, concave_kv::KvError> {
        let Some(kv) = &self.kv else { return Ok(0) };

        let members = kv.zrange(&self.config.kv_key, 0, -1).await?;
        let mut entries: Vec<ChangeEntry> = Vec::with_capacity(members.len());
        for member in &members {
            match serde_json::from_str::<ChangeEntry>(member) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("skipping corrupt changelog entry during hydrate: {e}"),
            }
        }
        entries.sort_by_key(|entry| entry.seq);

        let count = entries.len();
        let mut ring = self.lock_ring();
        if let Some(last) = entries.last() {
            self.seq.store(last.seq, Ordering::SeqCst);
            let first_seq = entries[0].seq;
            // Entries reaching back to seq 1 mean nothing was ever lost.
            ring.min_available = if first_seq <= 1 { 0 } else { first_seq };
        }
        ring.entries = entries.into();
        Ok(count)
    }

    fn lock_ring(&self) -> std::sync::MutexGuard<'_, Ring> { self.ring.lock().expect("changelog lock poisoned") }

    /// Record a mutation. Never fails: a KV error flips the log into
    /// degraded (process-local) mode so same-process subscribers keep
    /// receiving events; durability consumers detect the gap through
    /// `needs_invalidation`.
    pub async fn append(&self, change: NewChange) -> Seq {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = ChangeEntry {
            seq,
            resource: change.resource,
            kind: change.kind,
            object_id: change.object_id,
            object: change.object,
            previous_object: change.previous_object,
            timestamp: Utc::now(),
        };

        let pruned = {
            let mut ring = self.lock_ring();
            // Concurrent appends may race between seq allocation and the
            // ring lock; insert in seq position to keep the ring ordered.
            let position = ring.entries.iter().rposition(|e| e.seq < entry.seq).map(|p| p + 1).unwrap_or(0);
            if position == ring.entries.len() {
                ring.entries.push_back(entry.clone());
            } else {
                ring.entries.insert(position, entry.clone());
            }

            let mut pruned = Vec::new();
            while ring.entries.len() > self.config.max_entries {
                if let Some(old) = ring.entries.pop_front() {
                    pruned.push(old);
                }
            }
            if !pruned.is_empty() {
                ring.min_available = ring.entries.front().map(|e| e.seq).unwrap_or(seq + 1);
            }
            pruned
        };

        self.mirror_to_kv(&entry, &pruned).await;
        seq
    }

    async fn mirror_to_kv(&self, entry: &ChangeEntry, pruned: &[ChangeEntry]) {
        let Some(kv) = &self.kv else { return };
        if self.degraded.load(Ordering::Relaxed) {
            return;
        }

        let encoded = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                warn!("failed to encode changelog entry {}: {e}", entry.seq);
                return;
            }
        };

        let mut batch = Batch::new().zadd(&self.config.kv_key, entry.seq as f64, &encoded);
        for old in pruned {
            if let Ok(json) = serde_json::to_string(old) {
                batch = batch.zrem(&self.config.kv_key, json);
            }
        }

        if let Err(e) = kv.exec(batch).await {
            // Soft failure of durability, not correctness: keep serving
            // this process's subscribers from the ring.
            self.degraded.store(true, Ordering::Relaxed);
            warn!("changelog degraded to process-local storage: {e}");
            return;
        }

        if let Err(e) = kv.publish(&self.config.notify_channel, &encoded).await {
            debug!("changelog notify publish failed: {e}");
        }
    }

    /// Entries with `seq > since`, optionally restricted to one resource.
    /// Resource partitioning is a view: global `seq` order is preserved.
    pub fn get_since(&self, resource: Option<&str>, since: Seq) -> Vec<ChangeEntry> {
        let ring = self.lock_ring();
        ring.entries
            .iter()
            .filter(|entry| entry.seq > since)
            .filter(|entry| resource.map_or(true, |r| entry.resource == r))
            .cloned()
            .collect()
    }

    pub fn min_available_seq(&self) -> Seq { self.lock_ring().min_available }

    pub fn current_seq(&self) -> Seq { self.seq.load(Ordering::SeqCst) }

    /// True when the log has truncated past the requested cursor and the
    /// consumer must discard state and resnapshot.
    pub fn needs_invalidation(&self, since: Seq) -> bool { since < self.min_available_seq() }

    /// Drop all retained entries. Sequence numbering continues; consumers
    /// behind the wipe point will be invalidated.
    pub async fn clear(&self) {
        {
            let mut ring = self.lock_ring();
            ring.entries.clear();
            ring.min_available = self.current_seq();
        }
        if let Some(kv) = &self.kv {
            if let Err(e) = kv.del(&self.config.kv_key).await {
                warn!("failed to clear changelog mirror: {e}");
            }
        }
    }

    pub fn len(&self) -> usize { self.lock_ring().entries.len() }

    pub fn is_empty(&self) -> bool { self.lock_ring().entries.is_empty() }

    pub fn is_degraded(&self) -> bool { self.degraded.load(Ordering::Relaxed) }

    pub fn notify_channel(&self) -> &str { &self.config.notify_channel }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use concave_kv::{KeyValue, KvError, MemoryKv, PubSubReceiver, SetOptions, ZRangeLimit};
    use serde_json::json;
    use std::{collections::HashMap, sync::Arc, time::Duration};

    fn object(id: &str) -> JsonObject {
        match json!({ "id": id }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn append_then_get_since_zero_returns_all_in_order() {
        let log = Changelog::new(ChangelogConfig::default());
        for id in ["a", "b", "c"] {
            log.append(NewChange::create("todos", id, object(id))).await;
        }
        let entries = log.get_since(None, 0);
        assert_eq!(entries.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(log.current_seq(), 3);
        assert_eq!(log.min_available_seq(), 0);
        assert!(!log.needs_invalidation(0));
    }

    #[tokio::test]
    async fn pruning_bumps_min_available() {
        let log = Changelog::new(ChangelogConfig::with_max_entries(3));
        for id in ["a", "b", "c", "d", "e"] {
            log.append(NewChange::create("todos", id, object(id))).await;
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.min_available_seq(), 3);
        assert!(log.needs_invalidation(1));
        assert!(!log.needs_invalidation(4));
        // retained entries all have seq >= min_available
        assert!(log.get_since(None, 0).iter().all(|e| e.seq >= 3));
    }

    #[tokio::test]
    async fn resource_partitioning_is_a_view() {
        let log = Changelog::new(ChangelogConfig::default());
        log.append(NewChange::create("todos", "t1", object("t1"))).await;
        log.append(NewChange::create("notes", "n1", object("n1"))).await;
        log.append(NewChange::delete("todos", "t1")).await;

        let todos = log.get_since(Some("todos"), 0);
        assert_eq!(todos.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(todos[1].kind, ChangeKind::Delete);
    }

    #[tokio::test]
    async fn kv_mirror_and_hydrate() {
        let kv: SharedKv = Arc::new(MemoryKv::new());
        let log = Changelog::with_kv(kv.clone(), ChangelogConfig::with_max_entries(2));
        for id in ["a", "b", "c"] {
            log.append(NewChange::create("todos", id, object(id))).await;
        }
        assert_eq!(kv.zcard("concave:changelog").await.unwrap(), 2);

        // a fresh process restores from the mirror
        let restored = Changelog::with_kv(kv, ChangelogConfig::with_max_entries(2));
        assert_eq!(restored.hydrate().await.unwrap(), 2);
        assert_eq!(restored.current_seq(), 3);
        assert_eq!(restored.min_available_seq(), 2);
        assert_eq!(restored.get_since(None, 0).len(), 2);
    }

    /// KV that fails every operation, standing in for an unreachable store.
    struct UnavailableKv;

    #[async_trait]
    impl KeyValue for UnavailableKv {
        async fn set(&self, _: &str, _: &str, _: SetOptions) -> Result<bool, KvError> { Err(KvError::Unavailable("down".into())) }
        async fn get(&self, _: &str) -> Result<Option<String>, KvError> { Err(KvError::Unavailable("down".into())) }
        async fn del(&self, _: &str) -> Result<bool, KvError> { Err(KvError::Unavailable("down".into())) }
        async fn expire(&self, _: &str, _: Duration) -> Result<bool, KvError> { Err(KvError::Unavailable("down".into())) }
        async fn sadd(&self, _: &str, _: &str) -> Result<bool, KvError> { Err(KvError::Unavailable("down".into())) }
        async fn srem(&self, _: &str, _: &str) -> Result<bool, KvError> { Err(KvError::Unavailable("down".into())) }
        async fn smembers(&self, _: &str) -> Result<Vec<String>, KvError> { Err(KvError::Unavailable("down".into())) }
        async fn zadd(&self, _: &str, _: f64, _: &str) -> Result<bool, KvError> { Err(KvError::Unavailable("down".into())) }
        async fn zrem(&self, _: &str, _: &str) -> Result<bool, KvError> { Err(KvError::Unavailable("down".into())) }
        async fn zrange(&self, _: &str, _: isize, _: isize) -> Result<Vec<String>, KvError> {
            Err(KvError::Unavailable("down".into()))
        }
        async fn zrangebyscore(&self, _: &str, _: f64, _: f64, _: Option<ZRangeLimit>) -> Result<Vec<String>, KvError> {
            Err(KvError::Unavailable("down".into()))
        }
        async fn zcard(&self, _: &str) -> Result<usize, KvError> { Err(KvError::Unavailable("down".into())) }
        async fn hset(&self, _: &str, _: &str, _: &str) -> Result<(), KvError> { Err(KvError::Unavailable("down".into())) }
        async fn hmset(&self, _: &str, _: &[(String, String)]) -> Result<(), KvError> { Err(KvError::Unavailable("down".into())) }
        async fn hgetall(&self, _: &str) -> Result<HashMap<String, String>, KvError> { Err(KvError::Unavailable("down".into())) }
        async fn exec(&self, _: concave_kv::Batch) -> Result<(), KvError> { Err(KvError::Unavailable("down".into())) }
        async fn publish(&self, _: &str, _: &str) -> Result<usize, KvError> { Err(KvError::Unavailable("down".into())) }
        async fn subscribe(&self, _: &str) -> Result<PubSubReceiver, KvError> { Err(KvError::Unavailable("down".into())) }
        async fn unsubscribe(&self, _: &str, _: u64) -> Result<(), KvError> { Err(KvError::Unavailable("down".into())) }
    }

    #[tokio::test]
    async fn clear_wipes_history_but_keeps_numbering() {
        let log = Changelog::new(ChangelogConfig::default());
        for id in ["a", "b", "c"] {
            log.append(NewChange::create("todos", id, object(id))).await;
        }
        log.clear().await;

        assert!(log.is_empty());
        assert_eq!(log.current_seq(), 3);
        // consumers behind the wipe point must resnapshot; one exactly at
        // the head is unaffected
        assert!(log.needs_invalidation(2));
        assert!(!log.needs_invalidation(3));

        let seq = log.append(NewChange::create("todos", "d", object("d"))).await;
        assert_eq!(seq, 4, "sequence numbering continues after clear");
    }

    #[tokio::test]
    async fn kv_failure_degrades_but_appends_succeed() {
        let log = Changelog::with_kv(Arc::new(UnavailableKv), ChangelogConfig::default());
        let seq = log.append(NewChange::create("todos", "a", object("a"))).await;
        assert_eq!(seq, 1);
        assert!(log.is_degraded());
        // subsequent appends keep working in-process
        log.append(NewChange::create("todos", "b", object("b"))).await;
        assert_eq!(log.get_since(None, 0).len(), 2);
    }
}
