//! Errors - エラー型と分類
//!
//! - `TaskQueueError`: facade / adapter / driver の失敗（設定・接続・プロトコル誤用）
//! - `TaskError`: タスク本体の失敗（retry の判定対象）
//! - `CallbackError`: callback 参照の登録・解決の失敗

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ErrorKind は task 本体のエラー分類
///
/// RetryPolicy の `retry_on` はこの分類の集合で、含まれないものは即座に失敗扱い。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 一時的なエラー（リトライ推奨）
    Transient,
    /// 恒久的なエラー（リトライ無意味）
    Permanent,
    Timeout,
    /// インフラエラー（DB / broker の障害）
    Infrastructure,
    InvalidInput,
    Other(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => f.write_str("transient"),
            ErrorKind::Permanent => f.write_str("permanent"),
            ErrorKind::Timeout => f.write_str("timeout"),
            ErrorKind::Infrastructure => f.write_str("infrastructure"),
            ErrorKind::InvalidInput => f.write_str("invalid_input"),
            ErrorKind::Other(name) => f.write_str(name),
        }
    }
}

/// Failure raised by a task body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    kind: ErrorKind,
    message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Callback の登録・解決エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackError {
    #[error("invalid callback registration under name '{0}'")]
    DuplicateOrInvalidCallback(String),

    #[error("cannot resolve callback '{reference}': {reason}")]
    Resolution { reference: String, reason: String },

    #[error("invalid callback reference type: {0}")]
    InvalidCallbackType(String),
}

/// Facade / adapter level error.
#[derive(Debug, Error)]
pub enum TaskQueueError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown backend type '{0}'")]
    UnknownBackendType(String),

    #[error("cannot connect to backend at {uri}: {reason}")]
    BackendConnection { uri: String, reason: String },

    #[error("task '{0}' is not defined")]
    TaskNotDefined(String),

    #[error("worker is not running")]
    WorkerNotRunning,

    #[error("worker is already running")]
    WorkerAlreadyRunning,

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Callback(#[from] CallbackError),
}

pub type Result<T, E = TaskQueueError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_display_includes_kind() {
        let err = TaskError::new(ErrorKind::InvalidInput, "bad row");
        assert_eq!(err.to_string(), "invalid_input: bad row");

        let err = TaskError::new(ErrorKind::Other("ValueError".into()), "boom");
        assert_eq!(err.to_string(), "ValueError: boom");
    }

    #[test]
    fn callback_error_converts_into_task_queue_error() {
        let err: TaskQueueError = CallbackError::InvalidCallbackType("number".into()).into();
        assert!(matches!(err, TaskQueueError::Callback(_)));
        assert!(err.to_string().contains("number"));
    }
}
