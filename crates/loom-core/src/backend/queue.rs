//! Queue-broker adapter core shared by `rq` and `huey`.
//!
//! The two variants differ only in their `QueueFlavor`: task naming, result
//! retention and whether a finished result is consumed by reading it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{BackendContext, Connections, Lifecycle, RestartPolicy, after, first_fire, validate_invocation};
use crate::app::{ClaimedJob, Executor, JobSource, TaskTable, WorkerGroup};
use crate::config::BackendType;
use crate::domain::{
    Invocation, JobId, JobState, Result, ResultRetention, ScheduleId, ScheduleInfo, TaskError,
    TaskQueueError, TaskResult, Trigger, WorkerStatus,
};
use crate::ports::{DelayedEntry, JobSnapshot, QueueBroker, QueuedJob, TaskFn, TaskHandle};

#[derive(Clone)]
pub(crate) struct BrokerConnection(pub(crate) Arc<dyn QueueBroker>);

#[async_trait]
impl Connections for BrokerConnection {
    async fn close(&self) {
        self.0.close().await;
    }
}

/// Variant-specific knobs.
pub(crate) struct QueueFlavor {
    pub(crate) backend: BackendType,
    pub(crate) queue: String,
    /// Prefix for task names (`<prefix>.<task>`).
    pub(crate) namespace: Option<String>,
    /// Retention when the invocation sets no `result_ttl`.
    pub(crate) default_retention: ResultRetention,
    pub(crate) on_running: RestartPolicy,
}

impl QueueFlavor {
    fn retention(&self, invocation: &Invocation) -> ResultRetention {
        invocation
            .result_ttl
            .map_or(self.default_retention, ResultRetention::For)
    }

    fn task_name(&self, name: &str) -> String {
        match &self.namespace {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.to_string(),
        }
    }
}

pub(crate) struct QueueCore {
    flavor: QueueFlavor,
    uri: String,
    ctx: BackendContext,
    executor: Executor,
    lifecycle: Lifecycle<BrokerConnection>,
}

impl QueueCore {
    pub(crate) fn connect(flavor: QueueFlavor, uri: &str, ctx: BackendContext) -> Result<Self> {
        let broker = ctx.connector.queue_broker(uri)?;
        let executor = Executor::new(Arc::new(TaskTable::new()), Arc::clone(&ctx.callbacks));
        tracing::info!(backend = %flavor.backend, queue = %flavor.queue, "adapter connected");
        Ok(Self {
            lifecycle: Lifecycle::new(flavor.backend, flavor.on_running, BrokerConnection(broker)),
            flavor,
            uri: uri.to_string(),
            ctx,
            executor,
        })
    }

    pub(crate) fn backend_type(&self) -> BackendType {
        self.flavor.backend
    }

    fn tasks(&self) -> &TaskTable {
        self.executor.tasks()
    }

    fn ensure_defined(&self, task: &TaskHandle) -> Result<()> {
        if self.tasks().contains(task.name()) {
            Ok(())
        } else {
            Err(TaskQueueError::TaskNotDefined(task.name().to_string()))
        }
    }

    async fn broker(&self) -> Result<Arc<dyn QueueBroker>> {
        Ok(self.lifecycle.connection().await?.0)
    }

    pub(crate) async fn define_task(&self, name: &str, body: Arc<dyn TaskFn>) -> Result<TaskHandle> {
        if name.trim().is_empty() {
            return Err(TaskQueueError::Configuration("task name must not be empty".into()));
        }
        self.lifecycle.connection().await?;
        let full = self.flavor.task_name(name);
        self.tasks().define(&full, body);
        tracing::debug!(backend = %self.flavor.backend, task = %full, "task defined");
        Ok(TaskHandle::new(full))
    }

    pub(crate) async fn enqueue_task(&self, task: &TaskHandle, invocation: Invocation) -> Result<JobId> {
        let broker = self.broker().await?;
        self.ensure_defined(task)?;
        validate_invocation(&invocation)?;

        let job = QueuedJob {
            id: self.ctx.ids.generate_job_id(),
            task: task.name().to_string(),
            retention: self.flavor.retention(&invocation),
            invocation,
            schedule: None,
        };
        let id = job.id;
        broker.push(&self.flavor.queue, job).await?;
        tracing::debug!(job_id = %id, task = %task, queue = %self.flavor.queue, "job enqueued");
        Ok(id)
    }

    async fn schedule(
        &self,
        task: &TaskHandle,
        trigger: Trigger,
        run_at: DateTime<Utc>,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        let broker = self.broker().await?;
        self.ensure_defined(task)?;
        validate_invocation(&invocation)?;

        let schedule = self.ctx.ids.generate_schedule_id();
        tracing::debug!(schedule_id = %schedule, task = %task, %trigger, %run_at, "schedule added");
        broker
            .push_delayed(
                &self.flavor.queue,
                DelayedEntry {
                    schedule,
                    task: task.name().to_string(),
                    retention: self.flavor.retention(&invocation),
                    invocation,
                    trigger,
                    run_at,
                },
            )
            .await?;
        Ok(schedule)
    }

    pub(crate) async fn schedule_task_at(
        &self,
        task: &TaskHandle,
        run_at: DateTime<Utc>,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        self.schedule(task, Trigger::Date(run_at), run_at, invocation).await
    }

    pub(crate) async fn schedule_task_in(
        &self,
        task: &TaskHandle,
        delay: Duration,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        let run_at = after(self.ctx.clock.now(), delay)?;
        self.schedule(task, Trigger::Date(run_at), run_at, invocation).await
    }

    pub(crate) async fn schedule_task_cron(
        &self,
        task: &TaskHandle,
        expression: &str,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        let trigger = Trigger::cron(expression)?;
        let run_at = first_fire(&trigger, self.ctx.clock.now())?;
        self.schedule(task, trigger, run_at, invocation).await
    }

    pub(crate) async fn schedule_task_interval(
        &self,
        task: &TaskHandle,
        every: Duration,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        let trigger = Trigger::interval(every)?;
        let run_at = first_fire(&trigger, self.ctx.clock.now())?;
        self.schedule(task, trigger, run_at, invocation).await
    }

    /// `consume` removes a finished `UntilRead` result once it is returned.
    pub(crate) async fn get_task(&self, job_id: &JobId, consume: bool) -> Result<TaskResult> {
        let broker = self.broker().await?;
        Ok(match broker.job(job_id, consume).await? {
            None => TaskResult::NotFound,
            Some(snapshot) => task_result(snapshot),
        })
    }

    pub(crate) async fn cancel_task(&self, job_id: &JobId) -> Result<bool> {
        self.broker().await?.cancel(job_id).await
    }

    pub(crate) async fn remove_schedule(&self, schedule_id: &ScheduleId) -> Result<bool> {
        self.broker().await?.remove_delayed(schedule_id).await
    }

    pub(crate) async fn list_schedules(&self) -> Result<Vec<ScheduleInfo>> {
        self.broker().await?.schedules(&self.flavor.queue).await
    }

    pub(crate) async fn worker_start(&self, workers: usize) -> Result<()> {
        let connector = &self.ctx.connector;
        let queue = self.flavor.queue.clone();
        let executor = self.executor.clone();
        self.lifecycle
            .start(
                workers,
                || connector.queue_broker(&self.uri).map(BrokerConnection),
                move |conn, n| {
                    let source = Arc::new(QueueJobSource {
                        broker: Arc::clone(&conn.0),
                        queue,
                    });
                    WorkerGroup::spawn(n, source, executor)
                },
            )
            .await
    }

    pub(crate) async fn worker_stop(&self) -> Result<()> {
        self.lifecycle.stop().await
    }

    pub(crate) async fn worker_monitor(&self) -> Result<WorkerStatus> {
        let (conn, running, workers) = self.lifecycle.snapshot().await?;
        let jobs = conn.0.counts(&self.flavor.queue).await?;
        Ok(WorkerStatus {
            backend: self.flavor.backend,
            running,
            workers,
            jobs,
        })
    }
}

fn task_result(snapshot: JobSnapshot) -> TaskResult {
    match (snapshot.state, snapshot.outcome) {
        (_, Some(Ok(value))) => TaskResult::Ready(value),
        (_, Some(Err(err))) => TaskResult::Failed(err),
        (JobState::Cancelled, None) => TaskResult::NotFound,
        (_, None) => TaskResult::Pending,
    }
}

/// Workers pull from one named queue on the broker.
struct QueueJobSource {
    broker: Arc<dyn QueueBroker>,
    queue: String,
}

#[async_trait]
impl JobSource for QueueJobSource {
    async fn next_job(&self) -> Result<ClaimedJob> {
        let job = self.broker.lease(&self.queue).await?;
        Ok(ClaimedJob {
            id: job.id,
            task: job.task,
            invocation: job.invocation,
        })
    }

    async fn finish(&self, job_id: &JobId, outcome: std::result::Result<Value, TaskError>) -> Result<()> {
        self.broker.complete(job_id, outcome).await
    }
}
