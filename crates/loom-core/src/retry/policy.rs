//! Retry policy: decides whether to retry and how long to back off.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::domain::{ErrorKind, Result, TaskError, TaskQueueError};

/// Retry policy for a single task invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (`0` = exactly one attempt).
    pub max_retries: u32,

    /// Base backoff unit for the first retry.
    pub retry_delay: Duration,

    /// Relative jitter in `[0, 1)`.
    pub jitter_factor: f64,

    /// Error kinds that are worth retrying. Anything else fails immediately.
    pub retry_on: HashSet<ErrorKind>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
            jitter_factor: 0.0,
            retry_on: HashSet::new(),
        }
    }

    /// Single attempt, nothing is retried.
    pub fn no_retry() -> Self {
        Self::new(0, Duration::from_secs(1))
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    pub fn retry_on(mut self, kind: ErrorKind) -> Self {
        self.retry_on.insert(kind);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_delay.is_zero() {
            return Err(TaskQueueError::Configuration(
                "retry_delay must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter_factor) {
            return Err(TaskQueueError::Configuration(format!(
                "jitter_factor must be in [0, 1), got {}",
                self.jitter_factor
            )));
        }
        Ok(())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn is_retryable(&self, error: &TaskError) -> bool {
        self.retry_on.contains(error.kind())
    }

    /// Backoff before the retry that follows `attempt` (1-indexed), without jitter.
    ///
    /// delay = retry_delay * 2^(attempt - 1)
    /// - attempt 1: retry_delay
    /// - attempt 2: retry_delay * 2
    /// - attempt 3: retry_delay * 4
    /// Very large attempts saturate at `Duration::MAX`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if self.retry_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.retry_delay.as_secs_f64() * 2f64.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// `base_delay` perturbed by a uniform factor in `[-jitter, +jitter]`.
    pub fn delay_with_jitter<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_factor <= 0.0 {
            return base;
        }
        let factor = 1.0 + rng.gen_range(-self.jitter_factor..=self.jitter_factor);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
            .with_jitter(0.1)
            .retry_on(ErrorKind::Transient)
            .retry_on(ErrorKind::Timeout)
            .retry_on(ErrorKind::Infrastructure)
    }
}
