//! Lightweight-queue adapter (`huey`).
//!
//! Tasks belong to the consumer: a task `add` defined on consumer `etl` is
//! stored as `etl.add`, and only handles defined on this adapter can be
//! enqueued. Results are kept until the first read unless `result_ttl` is set.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::queue::{QueueCore, QueueFlavor};
use super::{Backend, BackendContext, RestartPolicy};
use crate::config::{BackendType, HueyConfig};
use crate::domain::{Invocation, JobId, Result, ResultRetention, ScheduleId, ScheduleInfo, TaskResult, WorkerStatus};
use crate::ports::{TaskFn, TaskHandle};

pub struct LightweightQueueBackend {
    consumer: String,
    core: QueueCore,
}

impl LightweightQueueBackend {
    pub fn connect(config: &HueyConfig, ctx: BackendContext) -> Result<Self> {
        let flavor = QueueFlavor {
            backend: BackendType::Huey,
            queue: config.consumer_name.clone(),
            namespace: Some(config.consumer_name.clone()),
            default_retention: ResultRetention::UntilRead,
            on_running: RestartPolicy::Ignore,
        };
        Ok(Self {
            consumer: config.consumer_name.clone(),
            core: QueueCore::connect(flavor, &config.uri, ctx)?,
        })
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}

#[async_trait]
impl Backend for LightweightQueueBackend {
    fn backend_type(&self) -> BackendType {
        self.core.backend_type()
    }

    async fn define_task(&self, name: &str, body: Arc<dyn TaskFn>) -> Result<TaskHandle> {
        self.core.define_task(name, body).await
    }

    async fn enqueue_task(&self, task: &TaskHandle, invocation: Invocation) -> Result<JobId> {
        self.core.enqueue_task(task, invocation).await
    }

    async fn schedule_task_at(
        &self,
        task: &TaskHandle,
        run_at: DateTime<Utc>,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        self.core.schedule_task_at(task, run_at, invocation).await
    }

    async fn schedule_task_in(
        &self,
        task: &TaskHandle,
        delay: Duration,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        self.core.schedule_task_in(task, delay, invocation).await
    }

    async fn schedule_task_cron(
        &self,
        task: &TaskHandle,
        expression: &str,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        self.core.schedule_task_cron(task, expression, invocation).await
    }

    async fn schedule_task_interval(
        &self,
        task: &TaskHandle,
        every: Duration,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        self.core.schedule_task_interval(task, every, invocation).await
    }

    /// A finished result without TTL is consumed by this call.
    async fn get_task(&self, job_id: &JobId) -> Result<TaskResult> {
        self.core.get_task(job_id, true).await
    }

    async fn cancel_task(&self, job_id: &JobId) -> Result<bool> {
        self.core.cancel_task(job_id).await
    }

    async fn remove_schedule(&self, schedule_id: &ScheduleId) -> Result<bool> {
        self.core.remove_schedule(schedule_id).await
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleInfo>> {
        self.core.list_schedules().await
    }

    async fn worker_start(&self, workers: usize) -> Result<()> {
        self.core.worker_start(workers).await
    }

    async fn worker_stop(&self) -> Result<()> {
        self.core.worker_stop().await
    }

    async fn worker_monitor(&self) -> Result<WorkerStatus> {
        self.core.worker_monitor().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{add_task, isolated_context, wait_done};
    use crate::domain::{ErrorKind, TaskError, TaskQueueError};
    use crate::ports::task_fn;
    use serde_json::json;

    fn backend(consumer: &str, ctx: BackendContext) -> LightweightQueueBackend {
        LightweightQueueBackend::connect(&HueyConfig::new("memory://huey", consumer), ctx).unwrap()
    }

    #[tokio::test]
    async fn tasks_are_namespaced_by_consumer() {
        let huey = backend("etl", isolated_context());
        let handle = huey.define_task("add", add_task()).await.unwrap();
        assert_eq!(handle.name(), "etl.add");
        assert_eq!(huey.consumer(), "etl");
    }

    #[tokio::test]
    async fn handle_from_another_consumer_is_not_defined() {
        let ctx = isolated_context();
        let etl = backend("etl", ctx.clone());
        let mail = backend("mail", ctx);
        let add = etl.define_task("add", add_task()).await.unwrap();

        assert!(matches!(
            mail.enqueue_task(&add, Invocation::new()).await,
            Err(TaskQueueError::TaskNotDefined(name)) if name == "etl.add"
        ));
    }

    #[tokio::test]
    async fn result_is_consumed_by_first_read() {
        let huey = backend("etl", isolated_context());
        let add = huey.define_task("add", add_task()).await.unwrap();
        huey.worker_start(1).await.unwrap();

        let job = huey.enqueue_task(&add, Invocation::new().arg(4).arg(4)).await.unwrap();
        assert_eq!(wait_done(&huey, &job).await, TaskResult::Ready(json!(8)));
        assert_eq!(huey.get_task(&job).await.unwrap(), TaskResult::NotFound);
        huey.worker_stop().await.unwrap();
    }

    #[tokio::test]
    async fn ttl_result_survives_reads() {
        let huey = backend("etl", isolated_context());
        let add = huey.define_task("add", add_task()).await.unwrap();
        huey.worker_start(1).await.unwrap();

        let job = huey
            .enqueue_task(&add, Invocation::new().arg(1).result_ttl(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(wait_done(&huey, &job).await, TaskResult::Ready(json!(1)));
        assert_eq!(huey.get_task(&job).await.unwrap(), TaskResult::Ready(json!(1)));
        huey.worker_stop().await.unwrap();
    }

    #[tokio::test]
    async fn failure_is_reported_once() {
        let huey = backend("etl", isolated_context());
        let boom = huey
            .define_task(
                "boom",
                task_fn(|_args| async move {
                    Err::<serde_json::Value, _>(TaskError::new(ErrorKind::InvalidInput, "bad"))
                }),
            )
            .await
            .unwrap();
        huey.worker_start(1).await.unwrap();

        let job = huey.enqueue_task(&boom, Invocation::new()).await.unwrap();
        match wait_done(&huey, &job).await {
            TaskResult::Failed(err) => assert_eq!(err.kind(), &ErrorKind::InvalidInput),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(huey.get_task(&job).await.unwrap(), TaskResult::NotFound);
        huey.worker_stop().await.unwrap();
    }

    #[tokio::test]
    async fn interval_schedule_fires_repeatedly() {
        let huey = backend("etl", isolated_context());
        let add = huey.define_task("add", add_task()).await.unwrap();
        huey.schedule_task_interval(&add, Duration::from_millis(30), Invocation::new())
            .await
            .unwrap();
        huey.worker_start(1).await.unwrap();

        let mut runs = 0;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            runs = huey.list_schedules().await.unwrap()[0].runs;
            if runs >= 2 {
                break;
            }
        }
        assert!(runs >= 2, "interval should fire more than once, fired {runs}");
        huey.worker_stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_then_start_recovers() {
        let huey = backend("etl", isolated_context());
        huey.worker_start(1).await.unwrap();
        huey.worker_stop().await.unwrap();
        assert!(matches!(
            huey.define_task("add", add_task()).await,
            Err(TaskQueueError::WorkerNotRunning)
        ));
        huey.worker_start(1).await.unwrap();
        assert!(huey.define_task("add", add_task()).await.is_ok());
        huey.worker_stop().await.unwrap();
    }
}
