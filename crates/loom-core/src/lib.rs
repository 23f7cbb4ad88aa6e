//! loom-core
//!
//! Backend-agnostic task queue facade.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, errors, invocation, trigger, status）
//! - **config**: 設定（TaskQueueConfiguration, BackendFamily, URI 組み立て）
//! - **callback**: hook の参照と解決（CallbackRegistry, ModuleLoader）
//! - **retry**: RetryPolicy と RetryEngine
//! - **ports**: 抽象化レイヤー（QueueBroker, DataStore, EventBroker, Clock, IdGenerator, TaskFn）
//! - **impls**: 実装（Connector と memory:// driver）
//! - **app**: Executor, WorkerGroup, SchedulerLoop
//! - **backend**: adapter（rq / huey / apscheduler）
//! - **manager**: WorkerManager（facade）
//! - **observability**: tracing の初期化

pub mod app;
pub mod backend;
pub mod callback;
pub mod config;
pub mod domain;
pub mod impls;
pub mod manager;
pub mod observability;
pub mod ports;
pub mod retry;

// 主要な型を再エクスポート
pub use self::backend::{Backend, BackendContext};
pub use self::callback::{Callback, CallbackRef, CallbackRegistry};
pub use self::config::{BackendType, TaskQueueConfiguration};
pub use self::domain::{
    ErrorKind, Invocation, JobId, Result, ScheduleId, TaskArgs, TaskError, TaskQueueError,
    TaskResult, WorkerStatus,
};
pub use self::manager::{WorkerManager, WorkerManagerBuilder};
pub use self::ports::{TaskFn, TaskHandle, task_fn};
pub use self::retry::{RetryEngine, RetryPolicy};
