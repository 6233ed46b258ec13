use async_trait::async_trait;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    time::{Duration, Instant},
};
use tokio::sync::mpsc;

use crate::{Batch, BatchOp, KeyValue, KvError, PubSubReceiver, SetOptions, ZRangeLimit};

/// f64 wrapper giving zset scores a total order for the BTreeSet index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Score(pub f64);

impl Eq for Score {}
impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}
impl Ord for Score {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering { self.0.total_cmp(&other.0) }
}

#[derive(Default)]
struct ZSet {
    by_member: HashMap<String, f64>,
    ordered: BTreeSet<(Score, String)>,
}

impl ZSet {
    fn insert(&mut self, score: f64, member: &str) -> bool {
        if let Some(old) = self.by_member.insert(member.to_string(), score) {
            self.ordered.remove(&(Score(old), member.to_string()));
            self.ordered.insert((Score(score), member.to_string()));
            false
        } else {
            self.ordered.insert((Score(score), member.to_string()));
            true
        }
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.by_member.remove(member) {
            Some(score) => {
                self.ordered.remove(&(Score(score), member.to_string()));
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, ZSet>,
    hashes: HashMap<String, HashMap<String, String>>,
    subscribers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<String>)>>,
    next_subscriber: u64,
}

impl Inner {
    /// Drop the key if its TTL elapsed; returns the live value, if any.
    fn live_string(&mut self, key: &str) -> Option<&String> {
        if let Some((_, Some(deadline))) = self.strings.get(key) {
            if *deadline <= Instant::now() {
                self.strings.remove(key);
                return None;
            }
        }
        self.strings.get(key).map(|(value, _)| value)
    }

    fn apply(&mut self, op: BatchOp) {
        match op {
            BatchOp::Set { key, value, ex } => {
                let deadline = ex.map(|ttl| Instant::now() + ttl);
                self.strings.insert(key, (value, deadline));
            }
            BatchOp::Del { key } => {
                self.strings.remove(&key);
                self.sets.remove(&key);
                self.zsets.remove(&key);
                self.hashes.remove(&key);
            }
            BatchOp::SAdd { key, member } => {
                self.sets.entry(key).or_default().insert(member);
            }
            BatchOp::SRem { key, member } => {
                if let Some(set) = self.sets.get_mut(&key) {
                    set.remove(&member);
                }
            }
            BatchOp::ZAdd { key, score, member } => {
                self.zsets.entry(key).or_default().insert(score, &member);
            }
            BatchOp::ZRem { key, member } => {
                if let Some(zset) = self.zsets.get_mut(&key) {
                    zset.remove(&member);
                }
            }
            BatchOp::HSet { key, field, value } => {
                self.hashes.entry(key).or_default().insert(field, value);
            }
            BatchOp::HDel { key, field } => {
                if let Some(hash) = self.hashes.get_mut(&key) {
                    hash.remove(&field);
                }
            }
        }
    }
}

/// Purely in-process [`KeyValue`]: a single short-lock mutex over plain
/// maps. No durability; pub/sub is immediate within the process.
#[derive(Default)]
pub struct MemoryKv {
    inner: std::sync::Mutex<Inner>,
}

impl MemoryKv {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> { self.inner.lock().expect("memory kv lock poisoned") }
}

#[async_trait]
impl KeyValue for MemoryKv {
    async fn set(&self, key: &str, value: &str, opts: SetOptions) -> Result<bool, KvError> {
        let mut inner = self.lock();
        if opts.nx && inner.live_string(key).is_some() {
            return Ok(false);
        }
        let deadline = opts.ex.map(|ttl| Instant::now() + ttl);
        inner.strings.insert(key.to_string(), (value.to_string(), deadline));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> { Ok(self.lock().live_string(key).cloned()) }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut inner = self.lock();
        let existed = inner.strings.remove(key).is_some()
            | inner.sets.remove(key).is_some()
            | inner.zsets.remove(key).is_some()
            | inner.hashes.remove(key).is_some();
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut inner = self.lock();
        if inner.live_string(key).is_none() {
            return Ok(false);
        }
        let deadline = Some(Instant::now() + ttl);
        if let Some(entry) = inner.strings.get_mut(key) {
            entry.1 = deadline;
        }
        Ok(true)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError> {
        Ok(self.lock().sets.entry(key.to_string()).or_default().insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        Ok(self.lock().sets.get_mut(key).map(|set| set.remove(member)).unwrap_or(false))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        Ok(self.lock().sets.get(key).map(|set| set.iter().cloned().collect()).unwrap_or_default())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool, KvError> {
        Ok(self.lock().zsets.entry(key.to_string()).or_default().insert(score, member))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        Ok(self.lock().zsets.get_mut(key).map(|zset| zset.remove(member)).unwrap_or(false))
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError> {
        let inner = self.lock();
        let Some(zset) = inner.zsets.get(key) else { return Ok(Vec::new()) };
        let len = zset.ordered.len() as isize;
        let clamp = |index: isize| -> isize {
            let index = if index < 0 { len + index } else { index };
            index.clamp(0, len)
        };
        let start = clamp(start);
        let stop = clamp(stop) + 1; // inclusive stop
        if start >= stop {
            return Ok(Vec::new());
        }
        Ok(zset.ordered.iter().skip(start as usize).take((stop - start) as usize).map(|(_, member)| member.clone()).collect())
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64, limit: Option<ZRangeLimit>) -> Result<Vec<String>, KvError> {
        let inner = self.lock();
        let Some(zset) = inner.zsets.get(key) else { return Ok(Vec::new()) };
        let range = zset.ordered.iter().filter(|(score, _)| score.0 >= min && score.0 <= max).map(|(_, member)| member.clone());
        Ok(match limit {
            Some(limit) => range.skip(limit.offset).take(limit.count).collect(),
            None => range.collect(),
        })
    }

    async fn zcard(&self, key: &str) -> Result<usize, KvError> {
        Ok(self.lock().zsets.get(key).map(|zset| zset.ordered.len()).unwrap_or(0))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        self.lock().hashes.entry(key.to_string()).or_default().insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hmset(&self, key: &str, entries: &[(String, String)]) -> Result<(), KvError> {
        let mut inner = self.lock();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in entries {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        Ok(self.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn exec(&self, batch: Batch) -> Result<(), KvError> {
        let mut inner = self.lock();
        for op in batch.ops {
            inner.apply(op);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, KvError> {
        let mut inner = self.lock();
        let Some(subscribers) = inner.subscribers.get_mut(channel) else { return Ok(0) };
        // Prune receivers that have been dropped.
        subscribers.retain(|(_, tx)| tx.send(message.to_string()).is_ok());
        Ok(subscribers.len())
    }

    async fn subscribe(&self, channel: &str) -> Result<PubSubReceiver, KvError> {
        let mut inner = self.lock();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscribers.entry(channel.to_string()).or_default().push((id, tx));
        Ok(PubSubReceiver { id, rx })
    }

    async fn unsubscribe(&self, channel: &str, id: u64) -> Result<(), KvError> {
        let mut inner = self.lock();
        if let Some(subscribers) = inner.subscribers.get_mut(channel) {
            subscribers.retain(|(sub_id, _)| *sub_id != id);
        }
        Ok(())
    }
}
