//! Task body port.
//!
//! Task bodies are looked up by name on the worker side; only the name and the
//! JSON arguments travel with a job.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{TaskArgs, TaskError};

/// TaskFn は task 本体
///
/// # 使用例
/// ```ignore
/// struct Extract;
///
/// #[async_trait]
/// impl TaskFn for Extract {
///     async fn call(&self, args: TaskArgs) -> Result<Value, TaskError> {
///         Ok(json!({ "rows": 10 }))
///     }
/// }
/// ```
#[async_trait]
pub trait TaskFn: Send + Sync {
    async fn call(&self, args: TaskArgs) -> Result<Value, TaskError>;
}

/// Adapter so plain async closures can be used as task bodies.
pub struct FnTask<F>(F);

#[async_trait]
impl<F, Fut> TaskFn for FnTask<F>
where
    F: Fn(TaskArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    async fn call(&self, args: TaskArgs) -> Result<Value, TaskError> {
        (self.0)(args).await
    }
}

pub fn task_fn<F, Fut>(f: F) -> Arc<dyn TaskFn>
where
    F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    Arc::new(FnTask(f))
}

/// Opaque handle returned by `define_task`; carries the backend-side task name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn closure_task_receives_args() {
        let body = task_fn(|args: TaskArgs| async move {
            let n = args.args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(n * 2))
        });

        let result = body.call(TaskArgs::new().arg(21)).await.unwrap();
        assert_eq!(result, json!(42));
    }
}
