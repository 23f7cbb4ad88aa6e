//! WorkerManager - 設定から adapter を 1 つ選んで、全操作をそのまま転送する
//!
//! # 使用例
//! ```ignore
//! let manager = WorkerManager::from_value(json!({
//!     "type": "rq",
//!     "uri": "memory://default",
//! }))?;
//! let add = manager.define_task("add", task_fn(add)).await?;
//! let job = manager.enqueue_task(&add, Invocation::new().arg(1).arg(2)).await?;
//! ```
//!
//! variant ごとの違い（結果の保持、二重起動の扱いなど）は隠さない。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::backend::{
    Backend, BackendContext, LightweightQueueBackend, PersistentSchedulerBackend, WorkQueueBackend,
};
use crate::callback::CallbackRegistry;
use crate::config::{BackendType, TaskQueueConfiguration};
use crate::domain::{Invocation, JobId, Result, ScheduleId, ScheduleInfo, TaskResult, WorkerStatus};
use crate::impls::Connector;
use crate::ports::{Clock, IdGenerator, TaskFn, TaskHandle};

pub struct WorkerManagerBuilder {
    config: TaskQueueConfiguration,
    ctx: BackendContext,
}

impl WorkerManagerBuilder {
    pub fn with_callbacks(mut self, callbacks: Arc<CallbackRegistry>) -> Self {
        self.ctx.callbacks = callbacks;
        self
    }

    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.ctx.connector = connector;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ctx = self.ctx.with_clock(clock);
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ctx = self.ctx.with_ids(ids);
        self
    }

    /// Validate the configuration and connect the selected adapter.
    pub fn build(self) -> Result<WorkerManager> {
        self.config.validate()?;
        let callbacks = Arc::clone(&self.ctx.callbacks);
        let backend: Box<dyn Backend> = match &self.config {
            TaskQueueConfiguration::Rq(config) => Box::new(WorkQueueBackend::connect(config, self.ctx)?),
            TaskQueueConfiguration::Huey(config) => {
                Box::new(LightweightQueueBackend::connect(config, self.ctx)?)
            }
            TaskQueueConfiguration::ApScheduler(config) => {
                Box::new(PersistentSchedulerBackend::connect(config, self.ctx)?)
            }
        };
        tracing::info!(backend = %backend.backend_type(), "worker manager ready");
        Ok(WorkerManager {
            config: self.config,
            callbacks,
            backend,
        })
    }
}

/// Facade over one backend adapter.
pub struct WorkerManager {
    config: TaskQueueConfiguration,
    callbacks: Arc<CallbackRegistry>,
    backend: Box<dyn Backend>,
}

impl WorkerManager {
    pub fn builder(config: TaskQueueConfiguration) -> WorkerManagerBuilder {
        WorkerManagerBuilder {
            config,
            ctx: BackendContext::default(),
        }
    }

    pub fn new(config: TaskQueueConfiguration) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Build from a JSON object; an unknown `type` is `UnknownBackendType`.
    pub fn from_value(value: Value) -> Result<Self> {
        Self::new(TaskQueueConfiguration::from_value(value)?)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Self::new(TaskQueueConfiguration::from_json_str(raw)?)
    }

    pub fn backend_type(&self) -> BackendType {
        self.backend.backend_type()
    }

    pub fn config(&self) -> &TaskQueueConfiguration {
        &self.config
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub async fn define_task(&self, name: &str, body: Arc<dyn TaskFn>) -> Result<TaskHandle> {
        self.backend.define_task(name, body).await
    }

    pub async fn enqueue_task(&self, task: &TaskHandle, invocation: Invocation) -> Result<JobId> {
        self.backend.enqueue_task(task, invocation).await
    }

    pub async fn schedule_task_at(
        &self,
        task: &TaskHandle,
        run_at: DateTime<Utc>,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        self.backend.schedule_task_at(task, run_at, invocation).await
    }

    pub async fn schedule_task_in(
        &self,
        task: &TaskHandle,
        delay: Duration,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        self.backend.schedule_task_in(task, delay, invocation).await
    }

    pub async fn schedule_task_cron(
        &self,
        task: &TaskHandle,
        expression: &str,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        self.backend.schedule_task_cron(task, expression, invocation).await
    }

    pub async fn schedule_task_interval(
        &self,
        task: &TaskHandle,
        every: Duration,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        self.backend.schedule_task_interval(task, every, invocation).await
    }

    pub async fn get_task(&self, job_id: &JobId) -> Result<TaskResult> {
        self.backend.get_task(job_id).await
    }

    pub async fn cancel_task(&self, job_id: &JobId) -> Result<bool> {
        self.backend.cancel_task(job_id).await
    }

    pub async fn remove_schedule(&self, schedule_id: &ScheduleId) -> Result<bool> {
        self.backend.remove_schedule(schedule_id).await
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleInfo>> {
        self.backend.list_schedules().await
    }

    pub async fn worker_start(&self, workers: usize) -> Result<()> {
        self.backend.worker_start(workers).await
    }

    pub async fn worker_stop(&self) -> Result<()> {
        self.backend.worker_stop().await
    }

    pub async fn worker_monitor(&self) -> Result<WorkerStatus> {
        self.backend.worker_monitor().await
    }
}
