//! Status views returned by `get_task`, `list_schedules` and `worker_monitor`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::TaskError;
use super::ids::{JobId, ScheduleId};
use crate::config::BackendType;

/// Job state as tracked by a backend.
///
/// State transitions:
/// - Scheduled -> Queued -> Running -> Finished
/// - Queued -> Running -> Failed
/// - Queued | Scheduled -> Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Queued,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Finished | JobState::Failed | JobState::Cancelled
        )
    }
}

/// Non-blocking answer of `get_task`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Ready(Value),
    Failed(TaskError),
    Pending,
    NotFound,
}

impl TaskResult {
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskResult::Pending)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, TaskResult::Ready(_) | TaskResult::Failed(_))
    }
}

/// How long a backend keeps a finished job's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultRetention {
    /// Drop the record as soon as the job finishes.
    Discard,
    /// Keep it for a bounded time.
    For(std::time::Duration),
    /// Keep it until the first read.
    UntilRead,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    pub id: ScheduleId,
    pub task: String,
    pub trigger: String,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_job: Option<JobId>,
    pub runs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub queued: usize,
    pub scheduled: usize,
    pub running: usize,
    pub finished: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub backend: BackendType,
    pub running: bool,
    pub workers: usize,
    pub jobs: JobCounts,
}
