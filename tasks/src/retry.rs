use rand::Rng;
use std::{sync::Arc, time::Duration};

use crate::error::TaskError;

#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// `min(initial * 2^(n-1), max)` for attempt number `n`.
    Exponential { initial: Duration, max: Duration },
    /// `min(initial * n, max)`.
    Linear { initial: Duration, max: Duration },
    Fixed { delay: Duration },
}

/// Which errors are worth retrying.
#[derive(Clone)]
pub enum RetryOn {
    Any,
    /// Everything except validation mismatches (the default).
    NonValidation,
    Custom(Arc<dyn Fn(&TaskError) -> bool + Send + Sync>),
}

impl std::fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryOn::Any => write!(f, "Any"),
            RetryOn::NonValidation => write!(f, "NonValidation"),
            RetryOn::Custom(_) => write!(f, "Custom"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub max_attempts: u32,
    pub retry_on: RetryOn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::Exponential { initial: Duration::from_secs(1), max: Duration::from_secs(60) },
            max_attempts: 3,
            retry_on: RetryOn::NonValidation,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self { backoff: Backoff::Exponential { initial, max }, max_attempts, retry_on: RetryOn::NonValidation }
    }

    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self { backoff: Backoff::Fixed { delay }, max_attempts, retry_on: RetryOn::NonValidation }
    }

    /// `attempt_number` is 1-based (`n = attempt + 1`).
    pub fn should_retry(&self, error: &TaskError, attempt_number: u32) -> bool {
        if attempt_number >= self.max_attempts {
            return false;
        }
        match &self.retry_on {
            RetryOn::Any => true,
            RetryOn::NonValidation => !matches!(error, TaskError::Validation(_)),
            RetryOn::Custom(accept) => accept(error),
        }
    }

    /// Base delay for attempt `n`, before jitter.
    pub fn base_delay(&self, attempt_number: u32) -> Duration {
        let n = attempt_number.max(1);
        match self.backoff {
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(n - 1);
                initial.saturating_mul(factor).min(max)
            }
            Backoff::Linear { initial, max } => initial.saturating_mul(n).min(max),
            Backoff::Fixed { delay } => delay,
        }
    }

    /// Delay with 10-20% additive jitter.
    pub fn delay(&self, attempt_number: u32) -> Duration {
        let base = self.base_delay(attempt_number);
        let jitter = rand::thread_rng().gen_range(0.10..=0.20);
        base + base.mul_f64(jitter)
    }
}
