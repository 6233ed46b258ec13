use concave_kv::{SetOptions, SharedKv};
use concave_proto::{TaskId, WorkerId};
use std::time::Duration;

use crate::{error::TaskError, store::TaskKeyspace};

/// Exclusive worker ownership of a task, asserted by a short-lived KV
/// record. Held iff `get(lock:<id>) == worker_id`. Set-if-absent with TTL
/// is the only coordination primitive needed to prevent dual execution.
#[derive(Clone)]
pub struct LeaseManager {
    kv: SharedKv,
    keyspace: TaskKeyspace,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(kv: SharedKv, keyspace: TaskKeyspace, ttl: Duration) -> Self { Self { kv, keyspace, ttl } }

    pub fn ttl(&self) -> Duration { self.ttl }

    pub async fn acquire(&self, task_id: TaskId, worker_id: WorkerId) -> Result<bool, TaskError> {
        let acquired =
            self.kv.set(&self.keyspace.lock(task_id), &worker_id.to_string(), SetOptions::nx_ex(self.ttl)).await?;
        Ok(acquired)
    }

    /// Extend the lease while executing. Fails when another worker stole
    /// the lease or the key expired; the caller must abort the handler.
    pub async fn extend(&self, task_id: TaskId, worker_id: WorkerId) -> Result<bool, TaskError> {
        let key = self.keyspace.lock(task_id);
        match self.kv.get(&key).await? {
            Some(holder) if holder == worker_id.to_string() => Ok(self.kv.expire(&key, self.ttl).await?),
            _ => Ok(false),
        }
    }

    /// Release only if still held by this worker.
    pub async fn release(&self, task_id: TaskId, worker_id: WorkerId) -> Result<bool, TaskError> {
        let key = self.keyspace.lock(task_id);
        match self.kv.get(&key).await? {
            Some(holder) if holder == worker_id.to_string() => Ok(self.kv.del(&key).await?),
            _ => Ok(false),
        }
    }

    pub async fn holder(&self, task_id: TaskId) -> Result<Option<String>, TaskError> {
        Ok(self.kv.get(&self.keyspace.lock(task_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concave_kv::MemoryKv;
    use std::sync::Arc;

    fn manager(ttl: Duration) -> LeaseManager {
        LeaseManager::new(Arc::new(MemoryKv::new()), TaskKeyspace::default(), ttl)
    }

    #[tokio::test]
    async fn at_most_one_holder() {
        let lease = manager(Duration::from_secs(5));
        let task = TaskId::new();
        let (w1, w2) = (WorkerId::new(), WorkerId::new());

        assert!(lease.acquire(task, w1).await.unwrap());
        assert!(!lease.acquire(task, w2).await.unwrap());
        assert_eq!(lease.holder(task).await.unwrap(), Some(w1.to_string()));

        // only the holder may extend or release
        assert!(lease.extend(task, w1).await.unwrap());
        assert!(!lease.extend(task, w2).await.unwrap());
        assert!(!lease.release(task, w2).await.unwrap());
        assert!(lease.release(task, w1).await.unwrap());
        assert!(lease.acquire(task, w2).await.unwrap());
    }

    #[tokio::test]
    async fn expiry_releases_the_claim() {
        let lease = manager(Duration::from_millis(20));
        let task = TaskId::new();
        let (w1, w2) = (WorkerId::new(), WorkerId::new());

        assert!(lease.acquire(task, w1).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        // w1's lease lapsed: w2 can steal, and w1's extend now fails
        assert!(lease.acquire(task, w2).await.unwrap());
        assert!(!lease.extend(task, w1).await.unwrap());
    }
}
