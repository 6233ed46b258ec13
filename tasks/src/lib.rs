//! Durable task scheduling over a key-value store: priority queues, leased
//! claims with heartbeats, retry with backoff, idempotency, dead-letter
//! handling and recurring schedules.

pub mod context;
pub mod definition;
pub mod dlq;
pub mod error;
pub mod lease;
pub mod record;
pub mod recurring;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use context::TaskContext;
pub use definition::{TaskDefinition, TaskHandler};
pub use dlq::{DeadLetterEntry, DeadLetterQueue};
pub use error::TaskError;
pub use lease::LeaseManager;
pub use record::{PriorityBucket, TaskRecord, TaskStatus};
pub use recurring::{Recurrence, RecurringSchedule};
pub use retry::{Backoff, RetryOn, RetryPolicy};
pub use scheduler::{QueueDepth, ScheduleSpec, Scheduler, TaskFilter};
pub use store::{TaskKeyspace, TaskStore};
pub use worker::{TaskRegistry, Worker, WorkerConfig, WorkerHandle};
