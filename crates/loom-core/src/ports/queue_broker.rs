//! QueueBroker port - 単一接続の work-queue（rq / huey 用）
//!
//! Broker は job の配送と結果の保持だけを担当する。スケジュールは
//! 「遅延投入」: 期限が来た delayed entry を broker が queue に push する。
//! recurring trigger は次回分を自分で再登録する。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::{
    Invocation, JobCounts, JobId, JobState, Result, ResultRetention, ScheduleId, ScheduleInfo,
    TaskError, Trigger,
};

/// A job sitting on a queue.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: JobId,
    pub task: String,
    pub invocation: Invocation,
    pub retention: ResultRetention,
    pub schedule: Option<ScheduleId>,
}

/// Delayed submission: pushed to the queue once `run_at` passes.
#[derive(Debug, Clone)]
pub struct DelayedEntry {
    pub schedule: ScheduleId,
    pub task: String,
    pub invocation: Invocation,
    pub retention: ResultRetention,
    pub trigger: Trigger,
    pub run_at: DateTime<Utc>,
}

/// Broker-side view of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub state: JobState,
    pub outcome: Option<Result<Value, TaskError>>,
}

/// QueueBroker は rq / huey の backend 接続
///
/// `queue` は論理キュー名（rq の queue 名、huey の consumer 名）。
#[async_trait]
pub trait QueueBroker: Send + Sync {
    async fn push(&self, queue: &str, job: QueuedJob) -> Result<()>;

    async fn push_delayed(&self, queue: &str, entry: DelayedEntry) -> Result<()>;

    /// Wait until a job is ready, mark it running and hand it out.
    async fn lease(&self, queue: &str) -> Result<QueuedJob>;

    async fn complete(&self, job_id: &JobId, outcome: Result<Value, TaskError>) -> Result<()>;

    /// Look up a job. With `consume`, a finished `UntilRead` record is removed.
    async fn job(&self, job_id: &JobId, consume: bool) -> Result<Option<JobSnapshot>>;

    /// Cancel a job that has not started yet.
    async fn cancel(&self, job_id: &JobId) -> Result<bool>;

    async fn remove_delayed(&self, schedule: &ScheduleId) -> Result<bool>;

    async fn schedules(&self, queue: &str) -> Result<Vec<ScheduleInfo>>;

    async fn counts(&self, queue: &str) -> Result<JobCounts>;

    /// Release this connection; later calls fail.
    async fn close(&self);
}
