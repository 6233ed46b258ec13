use concave_kv::KvError;
use concave_proto::TaskId;
use thiserror::Error;

use crate::record::TaskStatus;

#[derive(Debug, Error)]
pub enum TaskError {
    /// The handler returned an error. Retried per policy.
    #[error("task failed: {0}")]
    Failed(String),

    /// The handler exceeded its timeout. Same treatment as a failure.
    #[error("task timed out")]
    Timeout,

    /// The handler was cancelled (lease lost or scheduler shutdown). The
    /// task is requeued immediately with `attempt` unchanged.
    #[error("task cancelled")]
    Cancelled,

    /// Input or output schema mismatch. Non-retryable unless the retry
    /// policy's `retry_on` explicitly accepts it.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("no definition registered for task name: {0}")]
    UnknownDefinition(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("corrupt task record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Kv(#[from] KvError),
}

impl TaskError {
    /// Collapse an arbitrary handler error into the failure variant.
    pub fn failed(message: impl std::fmt::Display) -> Self { TaskError::Failed(message.to_string()) }
}
