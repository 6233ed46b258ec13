//! The coordination plane. Everything cross-process in Concave (changelog
//! durability, task queues, leases, bus wake-ups) goes through the
//! [`KeyValue`] trait. Two implementations ship: [`MemoryKv`] for purely
//! in-process operation and [`SledKv`] for embedded durability.

mod error;
mod memory;
mod sledkv;

pub use error::KvError;
pub use memory::MemoryKv;
pub use sledkv::SledKv;

use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Options for [`KeyValue::set`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Only set if the key is absent (set-if-not-exists).
    pub nx: bool,
    /// Time-to-live; the key expires after this duration.
    pub ex: Option<Duration>,
}

impl SetOptions {
    pub fn nx_ex(ttl: Duration) -> Self { Self { nx: true, ex: Some(ttl) } }

    pub fn ex(ttl: Duration) -> Self { Self { nx: false, ex: Some(ttl) } }
}

/// Offset/count limit for [`KeyValue::zrangebyscore`].
#[derive(Debug, Clone, Copy)]
pub struct ZRangeLimit {
    pub offset: usize,
    pub count: usize,
}

impl ZRangeLimit {
    pub fn first(count: usize) -> Self { Self { offset: 0, count } }
}

/// A batch of mutations applied atomically by [`KeyValue::exec`].
#[derive(Debug, Default)]
pub struct Batch {
    pub(crate) ops: Vec<BatchOp>,
}

#[derive(Debug)]
pub(crate) enum BatchOp {
    Set { key: String, value: String, ex: Option<Duration> },
    Del { key: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    ZAdd { key: String, score: f64, member: String },
    ZRem { key: String, member: String },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
}

impl Batch {
    pub fn new() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.ops.is_empty() }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Set { key: key.into(), value: value.into(), ex: None });
        self
    }

    pub fn set_ex(mut self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> Self {
        self.ops.push(BatchOp::Set { key: key.into(), value: value.into(), ex: Some(ttl) });
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Del { key: key.into() });
        self
    }

    pub fn sadd(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SAdd { key: key.into(), member: member.into() });
        self
    }

    pub fn srem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SRem { key: key.into(), member: member.into() });
        self
    }

    pub fn zadd(mut self, key: impl Into<String>, score: f64, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::ZAdd { key: key.into(), score, member: member.into() });
        self
    }

    pub fn zrem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::ZRem { key: key.into(), member: member.into() });
        self
    }

    pub fn hset(mut self, key: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(BatchOp::HSet { key: key.into(), field: field.into(), value: value.into() });
        self
    }

    pub fn hdel(mut self, key: impl Into<String>, field: impl Into<String>) -> Self {
        self.ops.push(BatchOp::HDel { key: key.into(), field: field.into() });
        self
    }
}

/// A pub/sub registration. Messages arrive on `rx`; pass `id` back to
/// [`KeyValue::unsubscribe`] to detach explicitly (dropping the receiver
/// detaches lazily on the next publish).
pub struct PubSubReceiver {
    pub id: u64,
    pub rx: tokio::sync::mpsc::UnboundedReceiver<String>,
}

/// Minimal key-value surface the core depends on. Modeled after the
/// operations a Redis-compatible store provides; see each implementation
/// for its durability and visibility guarantees.
#[async_trait]
pub trait KeyValue: Send + Sync + 'static {
    /// Set a string key. Returns `false` when `nx` was requested and the
    /// key already existed (and was not overwritten).
    async fn set(&self, key: &str, value: &str, opts: SetOptions) -> Result<bool, KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn del(&self, key: &str) -> Result<bool, KvError>;

    /// Reset the TTL on an existing key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError>;

    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError>;

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool, KvError>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError>;

    /// Members by rank, Redis-style: negative indices count from the end,
    /// `stop` is inclusive.
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError>;

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64, limit: Option<ZRangeLimit>) -> Result<Vec<String>, KvError>;

    async fn zcard(&self, key: &str) -> Result<usize, KvError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;

    async fn hmset(&self, key: &str, entries: &[(String, String)]) -> Result<(), KvError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError>;

    /// Apply a batch atomically.
    async fn exec(&self, batch: Batch) -> Result<(), KvError>;

    /// Publish to a channel; returns the number of receivers notified.
    async fn publish(&self, channel: &str, message: &str) -> Result<usize, KvError>;

    async fn subscribe(&self, channel: &str) -> Result<PubSubReceiver, KvError>;

    async fn unsubscribe(&self, channel: &str, id: u64) -> Result<(), KvError>;
}

/// Shared handle alias used throughout the workspace.
pub type SharedKv = Arc<dyn KeyValue>;
