//! DataStore port - apscheduler の永続状態（task / schedule / job / result）
//!
//! schedule の正本はここ。scheduler loop は期限の来た schedule を acquire して
//! job を作り、次回発火時刻を書き戻す。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::{
    Invocation, JobCounts, JobId, JobState, Result, ResultRetention, ScheduleId, ScheduleInfo,
    TaskError, Trigger,
};

#[derive(Debug, Clone)]
pub struct ScheduleRecord {
    pub id: ScheduleId,
    pub task: String,
    pub trigger: Trigger,
    pub invocation: Invocation,
    pub retention: ResultRetention,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_job: Option<JobId>,
    pub runs: u64,
}

impl ScheduleRecord {
    pub fn info(&self) -> ScheduleInfo {
        ScheduleInfo {
            id: self.id,
            task: self.task.clone(),
            trigger: self.trigger.to_string(),
            next_fire_at: self.next_fire_at,
            last_job: self.last_job,
            runs: self.runs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub task: String,
    pub invocation: Invocation,
    pub retention: ResultRetention,
    pub schedule: Option<ScheduleId>,
    pub state: JobState,
    pub outcome: Option<Result<Value, TaskError>>,
}

impl JobRecord {
    pub fn new(id: JobId, task: impl Into<String>, invocation: Invocation, retention: ResultRetention) -> Self {
        Self {
            id,
            task: task.into(),
            invocation,
            retention,
            schedule: None,
            state: JobState::Queued,
            outcome: None,
        }
    }
}

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn add_task(&self, name: &str) -> Result<()>;

    async fn has_task(&self, name: &str) -> Result<bool>;

    async fn add_schedule(&self, schedule: ScheduleRecord) -> Result<()>;

    async fn remove_schedule(&self, id: &ScheduleId) -> Result<bool>;

    async fn schedules(&self) -> Result<Vec<ScheduleRecord>>;

    /// Schedules whose `next_fire_at <= now`. Acquired schedules are not
    /// handed out again until released.
    async fn acquire_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>>;

    /// Write back after firing; `next_fire_at = None` removes the schedule.
    async fn release_schedule(
        &self,
        id: &ScheduleId,
        next_fire_at: Option<DateTime<Utc>>,
        last_job: Option<JobId>,
    ) -> Result<()>;

    /// Earliest `next_fire_at` across schedules, for the scheduler's sleep.
    async fn next_fire_time(&self) -> Result<Option<DateTime<Utc>>>;

    async fn add_job(&self, job: JobRecord) -> Result<()>;

    /// Oldest queued job, marked running.
    async fn acquire_job(&self) -> Result<Option<JobRecord>>;

    async fn release_job(&self, id: &JobId, outcome: Result<Value, TaskError>) -> Result<()>;

    async fn job(&self, id: &JobId) -> Result<Option<JobRecord>>;

    async fn cancel_job(&self, id: &JobId) -> Result<bool>;

    async fn counts(&self) -> Result<JobCounts>;

    async fn close(&self);
}
