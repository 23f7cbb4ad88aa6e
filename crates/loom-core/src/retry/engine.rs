//! RetryEngine - 1 回の呼び出しを retry 付きで実行する
//!
//! State transitions:
//! - Idle -> Attempting -> Succeeded
//! - Idle -> Attempting -> Retrying -> Attempting (loop while budget remains)
//! - Idle -> Attempting -> Exhausted
//!
//! backoff の sleep は呼び出し元の task をそのまま止める（並行スケジューラではない）。

use std::future::Future;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use super::policy::RetryPolicy;
use crate::callback::Callback;
use crate::domain::{Result, TaskError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Attempting,
    Retrying,
    Succeeded,
    Exhausted,
}

impl RetryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RetryState::Succeeded | RetryState::Exhausted)
    }
}

/// Runs one operation under a `RetryPolicy`.
///
/// Hooks are passed in already resolved; exactly one of them fires per
/// `execute` call. The random source is injectable for deterministic tests.
pub struct RetryEngine<R = StdRng> {
    policy: RetryPolicy,
    rng: R,
    on_success: Option<Callback>,
    on_failure: Option<Callback>,
    context_name: String,
    state: RetryState,
    attempts: u32,
    delays: Vec<Duration>,
}

impl RetryEngine<StdRng> {
    pub fn new(policy: RetryPolicy) -> Result<Self> {
        Self::with_rng(policy, StdRng::from_entropy())
    }
}

impl<R: Rng> RetryEngine<R> {
    pub fn with_rng(policy: RetryPolicy, rng: R) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            rng,
            on_success: None,
            on_failure: None,
            context_name: String::from("retry"),
            state: RetryState::Idle,
            attempts: 0,
            delays: Vec::new(),
        })
    }

    pub fn on_success(mut self, hook: Option<Callback>) -> Self {
        self.on_success = hook;
        self
    }

    pub fn on_failure(mut self, hook: Option<Callback>) -> Self {
        self.on_failure = hook;
        self
    }

    /// Label used in log records only.
    pub fn context(mut self, name: impl Into<String>) -> Self {
        self.context_name = name.into();
        self
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Backoff delays actually slept, in order.
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Execute `op` until it succeeds, fails with a non-retryable error, or the
    /// budget (`max_retries + 1` attempts) runs out.
    ///
    /// The returned error is the last one observed, unchanged.
    pub async fn execute<F, Fut>(&mut self, mut op: F) -> Result<Value, TaskError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, TaskError>>,
    {
        self.state = RetryState::Idle;
        self.attempts = 0;
        self.delays.clear();

        loop {
            self.attempts += 1;
            self.state = RetryState::Attempting;

            let error = match op().await {
                Ok(value) => {
                    self.state = RetryState::Succeeded;
                    tracing::debug!(
                        context = %self.context_name,
                        attempt = self.attempts,
                        "attempt succeeded"
                    );
                    if let Some(hook) = &self.on_success {
                        hook(Some(&value), None);
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let retryable = self.policy.is_retryable(&error);
            if retryable && self.attempts <= self.policy.max_retries {
                self.state = RetryState::Retrying;
                let delay = self.policy.delay_with_jitter(self.attempts, &mut self.rng);
                self.delays.push(delay);
                tracing::warn!(
                    context = %self.context_name,
                    attempt = self.attempts,
                    max_attempts = self.policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            self.state = RetryState::Exhausted;
            tracing::error!(
                context = %self.context_name,
                attempt = self.attempts,
                retryable,
                error = %error,
                "giving up"
            );
            if let Some(hook) = &self.on_failure {
                hook(None, Some(&error));
            }
            return Err(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<(Option<Value>, Option<TaskError>)>>>;

    fn recorder() -> (Calls, Callback) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let hook: Callback = Arc::new(move |result, error| {
            sink.lock()
                .unwrap()
                .push((result.cloned(), error.cloned()));
        });
        (calls, hook)
    }

    fn value_error_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(100)).retry_on(ErrorKind::InvalidInput)
    }

    fn engine(policy: RetryPolicy) -> (RetryEngine, Calls, Calls) {
        let (successes, on_success) = recorder();
        let (failures, on_failure) = recorder();
        let engine = RetryEngine::with_rng(policy, StdRng::seed_from_u64(7))
            .unwrap()
            .on_success(Some(on_success))
            .on_failure(Some(on_failure));
        (engine, successes, failures)
    }

    #[tokio::test(start_paused = true)]
    async fn fails_once_then_succeeds() {
        let (mut engine, successes, failures) = engine(value_error_policy(1));
        let calls = AtomicU32::new(0);

        let result = engine
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(TaskError::new(ErrorKind::InvalidInput, "first"))
                    } else {
                        Ok(json!("ok"))
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), json!("ok"));
        assert_eq!(engine.attempts(), 2);
        assert_eq!(engine.state(), RetryState::Succeeded);
        assert_eq!(*successes.lock().unwrap(), vec![(Some(json!("ok")), None)]);
        assert!(failures.lock().unwrap().is_empty());
        assert_eq!(engine.delays(), &[Duration::from_millis(100)]);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_exhausts_budget() {
        let (mut engine, successes, failures) = engine(value_error_policy(1));
        let calls = AtomicU32::new(0);

        let err = engine
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TaskError::new(ErrorKind::InvalidInput, "always")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.state(), RetryState::Exhausted);
        assert_eq!(err, TaskError::new(ErrorKind::InvalidInput, "always"));
        assert!(successes.lock().unwrap().is_empty());
        assert_eq!(*failures.lock().unwrap(), vec![(None, Some(err))]);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_max_retries_plus_one() {
        for max_retries in [0, 1, 4] {
            let (mut engine, _, failures) = engine(value_error_policy(max_retries));
            let calls = AtomicU32::new(0);
            let _ = engine
                .execute(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TaskError::new(ErrorKind::InvalidInput, "x")) }
                })
                .await;
            assert_eq!(calls.load(Ordering::SeqCst), max_retries + 1);
            assert_eq!(failures.lock().unwrap().len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_fails_immediately() {
        let (mut engine, _, failures) = engine(value_error_policy(5));
        let calls = AtomicU32::new(0);
        let raised = TaskError::permanent("schema mismatch");

        let err = engine
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                let raised = raised.clone();
                async move { Err(raised) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err, raised);
        assert_eq!(*failures.lock().unwrap(), vec![(None, Some(raised))]);
        assert!(engine.delays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_failures() {
        let (mut engine, successes, failures) = engine(value_error_policy(4));
        let calls = AtomicU32::new(0);

        let result = engine
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(TaskError::new(ErrorKind::InvalidInput, "not yet"))
                    } else {
                        Ok(json!(n))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, json!(3));
        assert_eq!(engine.attempts(), 4);
        assert_eq!(successes.lock().unwrap().len(), 1);
        assert!(failures.lock().unwrap().is_empty());
        assert_eq!(
            engine.delays(),
            &[
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn jittered_delays_stay_in_band() {
        let policy = value_error_policy(3).with_jitter(0.5);
        let mut engine = RetryEngine::with_rng(policy.clone(), StdRng::seed_from_u64(99)).unwrap();

        let _ = engine
            .execute(|| async { Err(TaskError::new(ErrorKind::InvalidInput, "x")) })
            .await;

        assert_eq!(engine.delays().len(), 3);
        for (i, delay) in engine.delays().iter().enumerate() {
            let base = policy.base_delay(i as u32 + 1).as_secs_f64();
            let d = delay.as_secs_f64();
            assert!(d >= base * 0.5 - 1e-9 && d <= base * 1.5 + 1e-9);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn absent_hooks_are_skipped() {
        let mut engine = RetryEngine::new(RetryPolicy::no_retry()).unwrap();
        let err = engine
            .execute(|| async { Err(TaskError::transient("down")) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Transient);
        assert_eq!(engine.attempts(), 1);
    }

    #[test]
    fn invalid_policy_is_rejected_at_construction() {
        let policy = RetryPolicy::new(1, Duration::ZERO);
        assert!(RetryEngine::new(policy).is_err());
    }
}
