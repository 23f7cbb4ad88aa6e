//! Executor - 1 つの job を実行する
//!
//! # フロー
//! 1. TaskTable から task 本体を引く
//! 2. Invocation の hook を lazy な Callback に包む（解決は発火時）
//! 3. RetryEngine で本体を実行 → Result<Value, TaskError>
//!
//! 結果の保存は呼び出し側（worker / backend）の責任。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::callback::{Callback, CallbackRef, CallbackRegistry};
use crate::domain::{ErrorKind, Invocation, JobId, TaskError};
use crate::ports::TaskFn;
use crate::retry::{RetryEngine, RetryPolicy};

/// Task bodies known to this process (task name -> body).
///
/// Unlike a build-once registry, tasks can be defined while workers run, so
/// the table is `RwLock` guarded.
#[derive(Default)]
pub struct TaskTable {
    tasks: RwLock<HashMap<String, Arc<dyn TaskFn>>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define (or redefine) a task body; last definition wins.
    pub fn define(&self, name: &str, body: Arc<dyn TaskFn>) {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if tasks.insert(name.to_string(), body).is_some() {
            tracing::debug!(task = name, "task redefined");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskFn>> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        tasks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        tasks.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Executor runs one job body under its retry policy and fires its hooks.
#[derive(Clone)]
pub struct Executor {
    tasks: Arc<TaskTable>,
    callbacks: Arc<CallbackRegistry>,
}

impl Executor {
    pub fn new(tasks: Arc<TaskTable>, callbacks: Arc<CallbackRegistry>) -> Self {
        Self { tasks, callbacks }
    }

    pub fn tasks(&self) -> &Arc<TaskTable> {
        &self.tasks
    }

    /// Execute one job to completion (all attempts included).
    pub async fn run(&self, job_id: JobId, task: &str, invocation: &Invocation) -> Result<Value, TaskError> {
        let policy = invocation.retry.clone().unwrap_or_else(RetryPolicy::no_retry);
        let on_failure = self.lazy_hook(job_id, "on_failure", &invocation.on_failure);
        let mut engine = match RetryEngine::new(policy) {
            Ok(engine) => engine,
            Err(err) => {
                // 実行はしないが、失敗 hook はちょうど 1 回発火させる
                let err = TaskError::new(ErrorKind::InvalidInput, err.to_string());
                tracing::warn!(%job_id, task, error = %err, "job rejected before execution");
                if let Some(hook) = &on_failure {
                    hook(None, Some(&err));
                }
                return Err(err);
            }
        }
        .context(format!("{task}/{job_id}"))
        .on_success(self.lazy_hook(job_id, "on_success", &invocation.on_success))
        .on_failure(on_failure);

        let body = self.tasks.get(task);
        let args = invocation.args.clone();

        tracing::debug!(%job_id, task, "executing job");
        let outcome = engine
            .execute(|| {
                let body = body.clone();
                let args = args.clone();
                let task = task.to_string();
                async move {
                    match body {
                        Some(body) => body.call(args).await,
                        None => Err(TaskError::permanent(format!(
                            "task '{task}' is not defined in this worker"
                        ))),
                    }
                }
            })
            .await;

        match &outcome {
            Ok(_) => tracing::info!(%job_id, task, attempts = engine.attempts(), "job finished"),
            Err(err) => tracing::warn!(%job_id, task, attempts = engine.attempts(), error = %err, "job failed"),
        }
        outcome
    }

    /// Wrap a hook reference so it is resolved when it fires.
    ///
    /// Resolution failures are logged and swallowed; they never change the job
    /// outcome.
    fn lazy_hook(&self, job_id: JobId, hook: &'static str, reference: &CallbackRef) -> Option<Callback> {
        if reference.is_absent() {
            return None;
        }
        let callbacks = Arc::clone(&self.callbacks);
        let reference = reference.clone();
        Some(Arc::new(move |result: Option<&Value>, error: Option<&TaskError>| {
            match callbacks.resolve(&reference) {
                Ok(Some(callback)) => callback(result, error),
                Ok(None) => {}
                Err(err) => tracing::error!(
                    %job_id,
                    hook,
                    reference = %reference.describe(),
                    error = %err,
                    "callback resolution failed"
                ),
            }
        }))
    }
}
