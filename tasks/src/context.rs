use chrono::{DateTime, Utc};
use concave_proto::{TaskId, WorkerId};
use tokio_util::sync::CancellationToken;

/// Execution context handed to a task handler. The cancellation token
/// fires on lease loss, timeout teardown or scheduler shutdown; a
/// well-behaved handler observes it and returns promptly.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub attempt: u32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub worker_id: WorkerId,
    pub cancellation: CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool { self.cancellation.is_cancelled() }

    /// Resolves when the task is cancelled.
    pub async fn cancelled(&self) { self.cancellation.cancelled().await }
}
