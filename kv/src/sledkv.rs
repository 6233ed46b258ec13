use async_trait::async_trait;
use std::{
    collections::HashMap,
    ops::Deref,
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::mpsc;

use crate::{Batch, BatchOp, KeyValue, KvError, PubSubReceiver, SetOptions, ZRangeLimit};

/// Durable [`KeyValue`] backed by a single sled tree with prefixed
/// composite keys. Pub/sub is process-local (sled has no wire protocol);
/// cross-process consumers rely on the polling fallback.
///
/// Keys and members must not contain NUL, which is used as the composite
/// separator.
pub struct SledKv {
    tree: sled::Tree,
    // Serializes compound read-modify-write sequences (NX set, zset dual
    // index). sled is in-process, so a coarse mutex is sufficient.
    write_lock: std::sync::Mutex<()>,
    subscribers: std::sync::Mutex<SubscriberMap>,
}

#[derive(Default)]
struct SubscriberMap {
    channels: HashMap<String, Vec<(u64, mpsc::UnboundedSender<String>)>>,
    next_id: u64,
}

fn now_ms() -> u64 { SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64 }

/// Order-preserving f64 encoding: the usual sign-flip trick so byte order
/// matches numeric order across negatives and positives.
fn encode_score(score: f64) -> [u8; 8] {
    let bits = score.to_bits();
    let bits = if bits & (1 << 63) != 0 { !bits } else { bits | (1 << 63) };
    bits.to_be_bytes()
}

fn string_key(key: &str) -> Vec<u8> { [b"k:", key.as_bytes()].concat() }

fn set_prefix(key: &str) -> Vec<u8> { [b"s:", key.as_bytes(), b"\0"].concat() }

fn zorder_prefix(key: &str) -> Vec<u8> { [b"zo:", key.as_bytes(), b"\0"].concat() }

fn zmember_prefix(key: &str) -> Vec<u8> { [b"zs:", key.as_bytes(), b"\0"].concat() }

fn hash_prefix(key: &str) -> Vec<u8> { [b"h:", key.as_bytes(), b"\0"].concat() }

fn encode_string_value(value: &str, ex: Option<Duration>) -> Vec<u8> {
    let deadline = ex.map(|ttl| now_ms() + ttl.as_millis() as u64).unwrap_or(0);
    let mut out = deadline.to_be_bytes().to_vec();
    out.extend_from_slice(value.as_bytes());
    out
}

/// Split a stored string value into (live, value); expired values are
/// reported dead but left for the caller to remove.
fn decode_string_value(raw: &[u8]) -> Option<String> {
    let deadline = u64::from_be_bytes(raw[..8].try_into().ok()?);
    if deadline != 0 && deadline <= now_ms() {
        return None;
    }
    String::from_utf8(raw[8..].to_vec()).ok()
}

impl SledKv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let db = sled::open(path)?;
        Ok(Self::from_db(db))
    }

    /// Ephemeral store for tests, mirroring sled's temporary config.
    pub fn temporary() -> Result<Self, KvError> {
        let db = sled::Config::new().temporary(true).flush_every_ms(None).open()?;
        Ok(Self::from_db(db))
    }

    fn from_db(db: sled::Db) -> Self {
        let tree = db.deref().clone();
        Self { tree, write_lock: std::sync::Mutex::new(()), subscribers: std::sync::Mutex::new(SubscriberMap::default()) }
    }

    fn live_string(&self, key: &str) -> Result<Option<String>, KvError> {
        match self.tree.get(string_key(key))? {
            Some(raw) => match decode_string_value(&raw) {
                Some(value) => Ok(Some(value)),
                None => {
                    self.tree.remove(string_key(key))?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn remove_prefix(&self, prefix: &[u8]) -> Result<bool, KvError> {
        let mut removed = false;
        for item in self.tree.scan_prefix(prefix) {
            let (key, _) = item?;
            self.tree.remove(key)?;
            removed = true;
        }
        Ok(removed)
    }

    fn zadd_locked(&self, key: &str, score: f64, member: &str) -> Result<bool, KvError> {
        let member_key = [zmember_prefix(key), member.as_bytes().to_vec()].concat();
        let fresh = match self.tree.get(&member_key)? {
            Some(old_score) => {
                let old_order = [zorder_prefix(key), old_score.to_vec(), member.as_bytes().to_vec()].concat();
                self.tree.remove(old_order)?;
                false
            }
            None => true,
        };
        let encoded = encode_score(score);
        self.tree.insert(member_key, encoded.to_vec())?;
        let order_key = [zorder_prefix(key), encoded.to_vec(), member.as_bytes().to_vec()].concat();
        self.tree.insert(order_key, sled::IVec::default())?;
        Ok(fresh)
    }

    fn zrem_locked(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let member_key = [zmember_prefix(key), member.as_bytes().to_vec()].concat();
        match self.tree.remove(&member_key)? {
            Some(score) => {
                let order_key = [zorder_prefix(key), score.to_vec(), member.as_bytes().to_vec()].concat();
                self.tree.remove(order_key)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Ordered members with decoded scores.
    fn zscan(&self, key: &str) -> Result<Vec<(f64, String)>, KvError> {
        let prefix = zorder_prefix(key);
        let mut members = Vec::new();
        for item in self.tree.scan_prefix(&prefix) {
            let (raw_key, _) = item?;
            let rest = &raw_key[prefix.len()..];
            let score_bytes: [u8; 8] = rest[..8].try_into().map_err(|_| KvError::Storage("corrupt zset key".into()))?;
            let bits = u64::from_be_bytes(score_bytes);
            let bits = if bits & (1 << 63) != 0 { bits & !(1 << 63) } else { !bits };
            let member = String::from_utf8_lossy(&rest[8..]).into_owned();
            members.push((f64::from_bits(bits), member));
        }
        Ok(members)
    }

    fn apply_locked(&self, op: BatchOp) -> Result<(), KvError> {
        match op {
            BatchOp::Set { key, value, ex } => {
                self.tree.insert(string_key(&key), encode_string_value(&value, ex))?;
            }
            BatchOp::Del { key } => {
                self.tree.remove(string_key(&key))?;
                self.remove_prefix(&set_prefix(&key))?;
                self.remove_prefix(&zorder_prefix(&key))?;
                self.remove_prefix(&zmember_prefix(&key))?;
                self.remove_prefix(&hash_prefix(&key))?;
            }
            BatchOp::SAdd { key, member } => {
                self.tree.insert([set_prefix(&key), member.into_bytes()].concat(), sled::IVec::default())?;
            }
            BatchOp::SRem { key, member } => {
                self.tree.remove([set_prefix(&key), member.into_bytes()].concat())?;
            }
            BatchOp::ZAdd { key, score, member } => {
                self.zadd_locked(&key, score, &member)?;
            }
            BatchOp::ZRem { key, member } => {
                self.zrem_locked(&key, &member)?;
            }
            BatchOp::HSet { key, field, value } => {
                self.tree.insert([hash_prefix(&key), field.into_bytes()].concat(), value.into_bytes())?;
            }
            BatchOp::HDel { key, field } => {
                self.tree.remove([hash_prefix(&key), field.into_bytes()].concat())?;
            }
        }
        Ok(())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> { self.write_lock.lock().expect("sled kv lock poisoned") }
}

#[async_trait]
impl KeyValue for SledKv {
    async fn set(&self, key: &str, value: &str, opts: SetOptions) -> Result<bool, KvError> {
        let _guard = self.guard();
        if opts.nx && self.live_string(key)?.is_some() {
            return Ok(false);
        }
        self.tree.insert(string_key(key), encode_string_value(value, opts.ex))?;
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> { self.live_string(key) }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let _guard = self.guard();
        let mut removed = self.tree.remove(string_key(key))?.is_some();
        removed |= self.remove_prefix(&set_prefix(key))?;
        removed |= self.remove_prefix(&zorder_prefix(key))?;
        removed |= self.remove_prefix(&zmember_prefix(key))?;
        removed |= self.remove_prefix(&hash_prefix(key))?;
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let _guard = self.guard();
        match self.live_string(key)? {
            Some(value) => {
                self.tree.insert(string_key(key), encode_string_value(&value, Some(ttl)))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let _guard = self.guard();
        let raw = [set_prefix(key), member.as_bytes().to_vec()].concat();
        Ok(self.tree.insert(raw, sled::IVec::default())?.is_none())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let _guard = self.guard();
        let raw = [set_prefix(key), member.as_bytes().to_vec()].concat();
        Ok(self.tree.remove(raw)?.is_some())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        let prefix = set_prefix(key);
        let mut members = Vec::new();
        for item in self.tree.scan_prefix(&prefix) {
            let (raw_key, _) = item?;
            members.push(String::from_utf8_lossy(&raw_key[prefix.len()..]).into_owned());
        }
        Ok(members)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool, KvError> {
        let _guard = self.guard();
        self.zadd_locked(key, score, member)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let _guard = self.guard();
        self.zrem_locked(key, member)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError> {
        let members = self.zscan(key)?;
        let len = members.len() as isize;
        let clamp = |index: isize| -> isize {
            let index = if index < 0 { len + index } else { index };
            index.clamp(0, len)
        };
        let start = clamp(start);
        let stop = clamp(stop) + 1;
        if start >= stop {
            return Ok(Vec::new());
        }
        Ok(members.into_iter().skip(start as usize).take((stop - start) as usize).map(|(_, member)| member).collect())
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64, limit: Option<ZRangeLimit>) -> Result<Vec<String>, KvError> {
        let members = self.zscan(key)?;
        let range = members.into_iter().filter(|(score, _)| *score >= min && *score <= max).map(|(_, member)| member);
        Ok(match limit {
            Some(limit) => range.skip(limit.offset).take(limit.count).collect(),
            None => range.collect(),
        })
    }

    async fn zcard(&self, key: &str) -> Result<usize, KvError> { Ok(self.tree.scan_prefix(zmember_prefix(key)).count()) }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        let _guard = self.guard();
        self.tree.insert([hash_prefix(key), field.as_bytes().to_vec()].concat(), value.as_bytes())?;
        Ok(())
    }

    async fn hmset(&self, key: &str, entries: &[(String, String)]) -> Result<(), KvError> {
        let _guard = self.guard();
        for (field, value) in entries {
            self.tree.insert([hash_prefix(key), field.as_bytes().to_vec()].concat(), value.as_bytes())?;
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let prefix = hash_prefix(key);
        let mut entries = HashMap::new();
        for item in self.tree.scan_prefix(&prefix) {
            let (raw_key, raw_value) = item?;
            let field = String::from_utf8_lossy(&raw_key[prefix.len()..]).into_owned();
            entries.insert(field, String::from_utf8_lossy(&raw_value).into_owned());
        }
        Ok(entries)
    }

    async fn exec(&self, batch: Batch) -> Result<(), KvError> {
        let _guard = self.guard();
        for op in batch.ops {
            self.apply_locked(op)?;
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, KvError> {
        let mut subscribers = self.subscribers.lock().expect("sled kv subscribers lock poisoned");
        let Some(channel_subs) = subscribers.channels.get_mut(channel) else { return Ok(0) };
        channel_subs.retain(|(_, tx)| tx.send(message.to_string()).is_ok());
        Ok(channel_subs.len())
    }

    async fn subscribe(&self, channel: &str) -> Result<PubSubReceiver, KvError> {
        let mut subscribers = self.subscribers.lock().expect("sled kv subscribers lock poisoned");
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        subscribers.channels.entry(channel.to_string()).or_default().push((id, tx));
        Ok(PubSubReceiver { id, rx })
    }

    async fn unsubscribe(&self, channel: &str, id: u64) -> Result<(), KvError> {
        let mut subscribers = self.subscribers.lock().expect("sled kv subscribers lock poisoned");
        if let Some(channel_subs) = subscribers.channels.get_mut(channel) {
            channel_subs.retain(|(sub_id, _)| *sub_id != id);
        }
        Ok(())
    }
}
