//! Persistent-scheduler adapter (`apscheduler`).
//!
//! All state lives in the data store: task names, schedules, jobs and results.
//! The event broker only wakes sleepers. A second adapter connected to the same
//! store sees (and runs) the schedules added by the first one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;

use super::{Backend, BackendContext, Connections, Lifecycle, RestartPolicy, after, first_fire, validate_invocation};
use crate::app::{ClaimedJob, Executor, JobSource, SchedulerLoop, TaskTable, WorkerGroup};
use crate::config::{ApSchedulerConfig, BackendType};
use crate::domain::{
    Invocation, JobId, JobState, Result, ResultRetention, ScheduleId, ScheduleInfo, TaskError,
    TaskQueueError, TaskResult, Trigger, WorkerStatus,
};
use crate::ports::{DataStore, EventBroker, JobRecord, ScheduleRecord, SchedulerEvent, TaskFn, TaskHandle};

/// Result retention when the invocation sets no `result_ttl`.
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(3600);

/// Longest a worker sleeps between store polls without an event.
const WORKER_IDLE: Duration = Duration::from_millis(250);

#[derive(Clone)]
struct SchedulerConnections {
    store: Arc<dyn DataStore>,
    events: Arc<dyn EventBroker>,
}

#[async_trait]
impl Connections for SchedulerConnections {
    async fn close(&self) {
        self.events.close().await;
        self.store.close().await;
    }
}

pub struct PersistentSchedulerBackend {
    store_uri: String,
    broker_uri: String,
    ctx: BackendContext,
    executor: Executor,
    lifecycle: Lifecycle<SchedulerConnections>,
}

impl PersistentSchedulerBackend {
    pub fn connect(config: &ApSchedulerConfig, ctx: BackendContext) -> Result<Self> {
        let store_uri = config.data_store.resolve_uri()?;
        let broker_uri = config.event_broker_uri()?;
        let conn = open(&ctx, &store_uri, &broker_uri)?;
        let executor = Executor::new(Arc::new(TaskTable::new()), Arc::clone(&ctx.callbacks));
        tracing::info!(backend = %BackendType::ApScheduler, "adapter connected");
        Ok(Self {
            store_uri,
            broker_uri,
            ctx,
            executor,
            lifecycle: Lifecycle::new(BackendType::ApScheduler, RestartPolicy::Reject, conn),
        })
    }

    async fn conn(&self) -> Result<SchedulerConnections> {
        self.lifecycle.connection().await
    }

    async fn ensure_defined(&self, store: &dyn DataStore, task: &TaskHandle) -> Result<()> {
        if store.has_task(task.name()).await? {
            Ok(())
        } else {
            Err(TaskQueueError::TaskNotDefined(task.name().to_string()))
        }
    }

    fn retention(invocation: &Invocation) -> ResultRetention {
        ResultRetention::For(invocation.result_ttl.unwrap_or(DEFAULT_RESULT_TTL))
    }

    async fn add_schedule(
        &self,
        task: &TaskHandle,
        trigger: Trigger,
        next_fire_at: DateTime<Utc>,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        let conn = self.conn().await?;
        self.ensure_defined(conn.store.as_ref(), task).await?;
        validate_invocation(&invocation)?;

        let record = ScheduleRecord {
            id: self.ctx.ids.generate_schedule_id(),
            task: task.name().to_string(),
            trigger,
            retention: Self::retention(&invocation),
            invocation,
            next_fire_at: Some(next_fire_at),
            last_job: None,
            runs: 0,
        };
        let id = record.id;
        tracing::debug!(schedule_id = %id, task = %task, trigger = %record.trigger, %next_fire_at, "schedule added");
        conn.store.add_schedule(record).await?;
        conn.events.publish(SchedulerEvent::ScheduleAdded { schedule: id }).await?;
        Ok(id)
    }
}

fn open(ctx: &BackendContext, store_uri: &str, broker_uri: &str) -> Result<SchedulerConnections> {
    Ok(SchedulerConnections {
        store: ctx.connector.data_store(store_uri)?,
        events: ctx.connector.event_broker(broker_uri)?,
    })
}

#[async_trait]
impl Backend for PersistentSchedulerBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::ApScheduler
    }

    async fn define_task(&self, name: &str, body: Arc<dyn TaskFn>) -> Result<TaskHandle> {
        if name.trim().is_empty() {
            return Err(TaskQueueError::Configuration("task name must not be empty".into()));
        }
        let conn = self.conn().await?;
        conn.store.add_task(name).await?;
        self.executor.tasks().define(name, body);
        conn.events
            .publish(SchedulerEvent::TaskAdded { task: name.to_string() })
            .await?;
        tracing::debug!(task = name, "task defined");
        Ok(TaskHandle::new(name))
    }

    async fn enqueue_task(&self, task: &TaskHandle, invocation: Invocation) -> Result<JobId> {
        let conn = self.conn().await?;
        self.ensure_defined(conn.store.as_ref(), task).await?;
        validate_invocation(&invocation)?;

        let retention = Self::retention(&invocation);
        let job = JobRecord::new(self.ctx.ids.generate_job_id(), task.name(), invocation, retention);
        let id = job.id;
        conn.store.add_job(job).await?;
        conn.events.publish(SchedulerEvent::JobAdded { job: id }).await?;
        tracing::debug!(job_id = %id, task = %task, "job added");
        Ok(id)
    }

    async fn schedule_task_at(
        &self,
        task: &TaskHandle,
        run_at: DateTime<Utc>,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        self.add_schedule(task, Trigger::Date(run_at), run_at, invocation).await
    }

    async fn schedule_task_in(
        &self,
        task: &TaskHandle,
        delay: Duration,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        let run_at = after(self.ctx.clock.now(), delay)?;
        self.add_schedule(task, Trigger::Date(run_at), run_at, invocation).await
    }

    async fn schedule_task_cron(
        &self,
        task: &TaskHandle,
        expression: &str,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        let trigger = Trigger::cron(expression)?;
        let next = first_fire(&trigger, self.ctx.clock.now())?;
        self.add_schedule(task, trigger, next, invocation).await
    }

    async fn schedule_task_interval(
        &self,
        task: &TaskHandle,
        every: Duration,
        invocation: Invocation,
    ) -> Result<ScheduleId> {
        let trigger = Trigger::interval(every)?;
        let next = first_fire(&trigger, self.ctx.clock.now())?;
        self.add_schedule(task, trigger, next, invocation).await
    }

    async fn get_task(&self, job_id: &JobId) -> Result<TaskResult> {
        let conn = self.conn().await?;
        Ok(match conn.store.job(job_id).await? {
            None => TaskResult::NotFound,
            Some(record) => match (record.state, record.outcome) {
                (_, Some(Ok(value))) => TaskResult::Ready(value),
                (_, Some(Err(err))) => TaskResult::Failed(err),
                (JobState::Cancelled, None) => TaskResult::NotFound,
                (_, None) => TaskResult::Pending,
            },
        })
    }

    async fn cancel_task(&self, job_id: &JobId) -> Result<bool> {
        self.conn().await?.store.cancel_job(job_id).await
    }

    async fn remove_schedule(&self, schedule_id: &ScheduleId) -> Result<bool> {
        let conn = self.conn().await?;
        let removed = conn.store.remove_schedule(schedule_id).await?;
        if removed {
            conn.events
                .publish(SchedulerEvent::ScheduleRemoved { schedule: *schedule_id })
                .await?;
        }
        Ok(removed)
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleInfo>> {
        let conn = self.conn().await?;
        Ok(conn.store.schedules().await?.iter().map(ScheduleRecord::info).collect())
    }

    async fn worker_start(&self, workers: usize) -> Result<()> {
        let ctx = self.ctx.clone();
        let executor = self.executor.clone();
        self.lifecycle
            .start(
                workers,
                || open(&self.ctx, &self.store_uri, &self.broker_uri),
                move |conn, n| {
                    let source = Arc::new(StoreJobSource {
                        store: Arc::clone(&conn.store),
                        events: Arc::clone(&conn.events),
                    });
                    let mut group = WorkerGroup::spawn(n, source, executor);
                    let scheduler = SchedulerLoop::new(
                        Arc::clone(&conn.store),
                        Arc::clone(&conn.events),
                        ctx.ids,
                        ctx.clock,
                    );
                    group.spawn_background(|shutdown| scheduler.run(shutdown));
                    group
                },
            )
            .await
    }

    async fn worker_stop(&self) -> Result<()> {
        self.lifecycle.stop().await
    }

    async fn worker_monitor(&self) -> Result<WorkerStatus> {
        let (conn, running, workers) = self.lifecycle.snapshot().await?;
        Ok(WorkerStatus {
            backend: BackendType::ApScheduler,
            running,
            workers,
            jobs: conn.store.counts().await?,
        })
    }
}

/// Workers acquire jobs from the store and sleep until `JobAdded`.
struct StoreJobSource {
    store: Arc<dyn DataStore>,
    events: Arc<dyn EventBroker>,
}

#[async_trait]
impl JobSource for StoreJobSource {
    async fn next_job(&self) -> Result<ClaimedJob> {
        loop {
            // acquire の前に購読しておけば、その間の JobAdded を取りこぼさない
            let mut events = self.events.subscribe().ok();
            if let Some(job) = self.store.acquire_job().await? {
                return Ok(ClaimedJob {
                    id: job.id,
                    task: job.task,
                    invocation: job.invocation,
                });
            }
            tokio::select! {
                _ = wait_job_added(events.as_mut()) => {}
                _ = tokio::time::sleep(WORKER_IDLE) => {}
            }
        }
    }

    async fn finish(&self, job_id: &JobId, outcome: std::result::Result<Value, TaskError>) -> Result<()> {
        let succeeded = outcome.is_ok();
        self.store.release_job(job_id, outcome).await?;
        self.events
            .publish(SchedulerEvent::JobReleased { job: *job_id, succeeded })
            .await
    }
}

async fn wait_job_added(events: Option<&mut broadcast::Receiver<SchedulerEvent>>) {
    let Some(events) = events else {
        return std::future::pending().await;
    };
    loop {
        match events.recv().await {
            Ok(SchedulerEvent::JobAdded { .. }) | Err(broadcast::error::RecvError::Lagged(_)) => return,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Closed) => return std::future::pending().await,
        }
    }
}
