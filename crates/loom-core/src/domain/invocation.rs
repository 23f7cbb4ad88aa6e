//! Invocation: what a caller hands to `enqueue_task` / `schedule_task_*`.
//!
//! Positional and keyword arguments are JSON values so they can cross the
//! worker boundary. Hooks are `CallbackRef`s, resolved only when they fire.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::callback::CallbackRef;
use crate::retry::RetryPolicy;

/// `*args, **kwargs` of a task call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }
}

/// Arguments plus per-call options.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub args: TaskArgs,

    /// How long the backend keeps the result after the job finishes.
    pub result_ttl: Option<Duration>,

    /// Wrap the task body in the retry engine.
    pub retry: Option<RetryPolicy>,

    pub on_success: CallbackRef,
    pub on_failure: CallbackRef,
}

impl Invocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_args(args: TaskArgs) -> Self {
        Self {
            args,
            ..Self::default()
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args = self.args.arg(value);
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args = self.args.kwarg(key, value);
        self
    }

    pub fn result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = Some(ttl);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn on_success(mut self, hook: impl Into<CallbackRef>) -> Self {
        self.on_success = hook.into();
        self
    }

    pub fn on_failure(mut self, hook: impl Into<CallbackRef>) -> Self {
        self.on_failure = hook.into();
        self
    }
}
