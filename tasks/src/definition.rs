use async_trait::async_trait;
use serde_json::Value;
use std::{future::Future, sync::Arc, time::Duration};

use crate::{context::TaskContext, error::TaskError, retry::RetryPolicy};

pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;
pub type IdempotencyKeyFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn run(&self, ctx: TaskContext, input: Value) -> Result<Value, TaskError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext, input: Value) -> Result<Value, TaskError> { (self.0)(ctx, input).await }
}

/// A registered task type: handler plus execution policy.
#[derive(Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub(crate) handler: Arc<dyn TaskHandler>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    /// 0-100; determines the queue bucket.
    pub priority: u8,
    /// Per-process cap on concurrently running instances of this type.
    pub max_concurrency: Option<usize>,
    /// Re-enqueues of the same name within this window are absorbed by
    /// the already-queued task.
    pub debounce: Option<Duration>,
    pub(crate) input_validator: Option<Validator>,
    pub(crate) output_validator: Option<Validator>,
    pub(crate) idempotency_key: Option<IdempotencyKeyFn>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, handler: impl TaskHandler) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            priority: 50,
            max_concurrency: None,
            debounce: None,
            input_validator: None,
            output_validator: None,
            idempotency_key: None,
        }
    }

    /// Definition from an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TaskContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self::new(name, FnHandler(handler))
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(100);
        self
    }

    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce = Some(window);
        self
    }

    pub fn input_validator(mut self, validator: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static) -> Self {
        self.input_validator = Some(Arc::new(validator));
        self
    }

    pub fn output_validator(mut self, validator: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static) -> Self {
        self.output_validator = Some(Arc::new(validator));
        self
    }

    pub fn idempotency_key(mut self, derive: impl Fn(&Value) -> String + Send + Sync + 'static) -> Self {
        self.idempotency_key = Some(Arc::new(derive));
        self
    }

    pub(crate) fn validate_input(&self, input: &Value) -> Result<(), TaskError> {
        match &self.input_validator {
            Some(validator) => validator(input).map_err(TaskError::Validation),
            None => Ok(()),
        }
    }

    pub(crate) fn validate_output(&self, output: &Value) -> Result<(), TaskError> {
        match &self.output_validator {
            Some(validator) => validator(output).map_err(TaskError::Validation),
            None => Ok(()),
        }
    }

    pub(crate) fn derive_idempotency_key(&self, input: &Value) -> Option<String> {
        self.idempotency_key.as_ref().map(|derive| derive(input))
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("priority", &self.priority)
            .field("max_concurrency", &self.max_concurrency)
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}
