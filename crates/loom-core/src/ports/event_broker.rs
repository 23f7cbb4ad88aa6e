//! EventBroker port - worker 間の通知バス
//!
//! 状態は持たない。DataStore への書き込みの後に publish して、
//! scheduler / worker を起こすためだけに使う。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::{JobId, Result, ScheduleId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    TaskAdded { task: String },
    ScheduleAdded { schedule: ScheduleId },
    ScheduleRemoved { schedule: ScheduleId },
    JobAdded { job: JobId },
    JobReleased { job: JobId, succeeded: bool },
}

#[async_trait]
pub trait EventBroker: Send + Sync {
    async fn publish(&self, event: SchedulerEvent) -> Result<()>;

    fn subscribe(&self) -> Result<broadcast::Receiver<SchedulerEvent>>;

    async fn close(&self);
}
