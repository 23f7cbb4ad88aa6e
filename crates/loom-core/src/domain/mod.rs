//! Domain model (IDs, errors, invocations, triggers, status views).

pub mod errors;
pub mod ids;
pub mod invocation;
pub mod status;
pub mod trigger;

pub use self::errors::{CallbackError, ErrorKind, Result, TaskError, TaskQueueError};
pub use self::ids::{JobId, ParseIdError, ScheduleId};
pub use self::invocation::{Invocation, TaskArgs};
pub use self::status::{
    JobCounts, JobState, ResultRetention, ScheduleInfo, TaskResult, WorkerStatus,
};
pub use self::trigger::{CronExpr, Trigger};
