//! Work-queue adapter (`rq`).
//!
//! One broker connection, one named queue. Results are kept only when the
//! invocation asks for a `result_ttl`; otherwise a finished job is forgotten
//! and `get_task` answers `NotFound`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::queue::{QueueCore, QueueFlavor};
use super::{Backend, BackendContext, RestartPolicy};
use crate::config::{BackendType, RqConfig};
use crate::domain::{Invocation, JobId, Result, ResultRetention, ScheduleId, ScheduleInfo, TaskResult, WorkerStatus};
use crate::ports::{TaskFn, TaskHandle};

pub struct WorkQueueBackend {
    core: QueueCore,
}

impl WorkQueueBackend {
    /// Connect to the broker named by `config.uri`.
    pub fn connect(config: &RqConfig, ctx: BackendContext) -> Result<Self> {
        let flavor = QueueFlavor {
            backend: BackendType::Rq,
            queue: config.queue.clone(),
            namespace: None,
            default_retention: ResultRetention::Discard,
            on_running: RestartPolicy::Ignore,
        };
        Ok(Self {
            core: QueueCore::connect(flavor, &config.uri, ctx)?,
        })
    }
}

#[async_trait]
impl Backend for WorkQueueBackend {
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

    async fn get_task(&self, job_id: &JobId) -> Result<TaskResult> {
        self.core.get_task(job_id, false).await
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
    use crate::domain::TaskQueueError;
    use serde_json::json;

    fn backend() -> WorkQueueBackend {
        WorkQueueBackend::connect(&RqConfig::new("memory://rq"), isolated_context()).unwrap()
    }

    #[tokio::test]
    async fn result_is_kept_only_with_ttl() {
        let rq = backend();
        let add = rq.define_task("add", add_task()).await.unwrap();
        rq.worker_start(1).await.unwrap();

        let kept = rq
            .enqueue_task(&add, Invocation::new().arg(1).arg(2).result_ttl(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(wait_done(&rq, &kept).await, TaskResult::Ready(json!(3)));
        // reading does not consume
        assert_eq!(rq.get_task(&kept).await.unwrap(), TaskResult::Ready(json!(3)));

        let dropped = rq.enqueue_task(&add, Invocation::new().arg(1)).await.unwrap();
        assert_eq!(wait_done(&rq, &dropped).await, TaskResult::NotFound);

        rq.worker_stop().await.unwrap();
    }

    #[tokio::test]
    async fn queued_job_is_pending_until_workers_run() {
        let rq = backend();
        let add = rq.define_task("add", add_task()).await.unwrap();
        let job = rq.enqueue_task(&add, Invocation::new()).await.unwrap();
        assert_eq!(rq.get_task(&job).await.unwrap(), TaskResult::Pending);

        let status = rq.worker_monitor().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.jobs.queued, 1);
    }

    #[tokio::test]
    async fn undefined_handle_is_rejected() {
        let rq = backend();
        let err = rq
            .enqueue_task(&TaskHandle::new("nope"), Invocation::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskQueueError::TaskNotDefined(name) if name == "nope"));
    }

    #[tokio::test]
    async fn operations_fail_after_stop_until_restart() {
        let rq = backend();
        let add = rq.define_task("add", add_task()).await.unwrap();
        rq.worker_start(2).await.unwrap();
        rq.worker_stop().await.unwrap();
        rq.worker_stop().await.unwrap();

        assert!(matches!(
            rq.enqueue_task(&add, Invocation::new()).await,
            Err(TaskQueueError::WorkerNotRunning)
        ));
        assert!(matches!(rq.worker_monitor().await, Err(TaskQueueError::WorkerNotRunning)));

        rq.worker_start(1).await.unwrap();
        let job = rq
            .enqueue_task(&add, Invocation::new().arg(5).result_ttl(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(wait_done(&rq, &job).await, TaskResult::Ready(json!(5)));
        rq.worker_stop().await.unwrap();
    }

    #[tokio::test]
    async fn double_start_keeps_the_first_pool() {
        let rq = backend();
        rq.worker_start(2).await.unwrap();
        rq.worker_start(4).await.unwrap();
        assert_eq!(rq.worker_monitor().await.unwrap().workers, 2);
        rq.worker_stop().await.unwrap();
    }

    #[tokio::test]
    async fn delayed_job_runs_after_delay() {
        let rq = backend();
        let add = rq.define_task("add", add_task()).await.unwrap();
        let schedule = rq
            .schedule_task_in(
                &add,
                Duration::from_millis(50),
                Invocation::new().arg(2).arg(2).result_ttl(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        assert_eq!(rq.list_schedules().await.unwrap()[0].id, schedule);

        rq.worker_start(1).await.unwrap();
        let mut fired = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if rq.list_schedules().await.unwrap().is_empty() {
                fired = true;
                break;
            }
        }
        assert!(fired, "one-shot schedule should be consumed");
        assert_eq!(rq.worker_monitor().await.unwrap().jobs.scheduled, 0);
        rq.worker_stop().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_and_remove_schedule() {
        let rq = backend();
        let add = rq.define_task("add", add_task()).await.unwrap();
        let job = rq.enqueue_task(&add, Invocation::new()).await.unwrap();
        assert!(rq.cancel_task(&job).await.unwrap());
        assert_eq!(rq.get_task(&job).await.unwrap(), TaskResult::NotFound);

        let schedule = rq
            .schedule_task_cron(&add, "*/5 * * * *", Invocation::new())
            .await
            .unwrap();
        assert!(rq.remove_schedule(&schedule).await.unwrap());
        assert!(!rq.remove_schedule(&schedule).await.unwrap());
    }

    #[tokio::test]
    async fn bad_cron_is_invalid_schedule() {
        let rq = backend();
        let add = rq.define_task("add", add_task()).await.unwrap();
        assert!(matches!(
            rq.schedule_task_cron(&add, "not a cron", Invocation::new()).await,
            Err(TaskQueueError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn unreachable_backend_fails_at_construction() {
        let err = WorkQueueBackend::connect(&RqConfig::new("redis://localhost:6379/0"), isolated_context())
            .err()
            .unwrap();
        assert!(matches!(err, TaskQueueError::BackendConnection { .. }));
    }
}
