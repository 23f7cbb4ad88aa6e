//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部の job 実行エンジン（Redis queue, SQL store, pub/sub など）への
//! インターフェースで、adapter はこの trait だけを見る。
//! 同梱の実装は `impls`（memory://）のみ。

pub mod clock;
pub mod data_store;
pub mod event_broker;
pub mod id_generator;
pub mod queue_broker;
pub mod task;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::data_store::{DataStore, JobRecord, ScheduleRecord};
pub use self::event_broker::{EventBroker, SchedulerEvent};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::queue_broker::{DelayedEntry, JobSnapshot, QueueBroker, QueuedJob};
pub use self::task::{FnTask, TaskFn, TaskHandle, task_fn};
