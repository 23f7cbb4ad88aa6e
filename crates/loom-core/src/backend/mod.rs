//! Backend adapters
//!
//! 3 つの variant が同じ `Backend` trait を実装する:
//! - **WorkQueueBackend** (`rq`): queue broker + 遅延投入
//! - **LightweightQueueBackend** (`huey`): consumer 名前空間の task, 読んだら消える結果
//! - **PersistentSchedulerBackend** (`apscheduler`): data store + event broker, 永続 schedule
//!
//! # Lifecycle
//! Ready → Running (`worker_start`) → Stopped (`worker_stop`) → Running
//!
//! Stopped の間は `worker_start` / `worker_stop` 以外すべて `WorkerNotRunning`。

pub mod apscheduler;
pub mod huey;
mod queue;
pub mod rq;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::app::WorkerGroup;
use crate::callback::CallbackRegistry;
use crate::config::BackendType;
use crate::domain::{
    Invocation, JobId, Result, ScheduleId, ScheduleInfo, TaskQueueError, TaskResult, Trigger,
    WorkerStatus,
};
use crate::impls::Connector;
use crate::ports::{Clock, IdGenerator, SystemClock, TaskFn, TaskHandle, UlidGenerator};

pub use self::apscheduler::PersistentSchedulerBackend;
pub use self::huey::LightweightQueueBackend;
pub use self::rq::WorkQueueBackend;

/// Common adapter contract. Every operation is async and fallible.
#[async_trait]
pub trait Backend: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// Register a task body under `name`; the handle is what callers enqueue.
    async fn define_task(&self, name: &str, body: Arc<dyn TaskFn>) -> Result<TaskHandle>;

    /// Submit for immediate execution.
    async fn enqueue_task(&self, task: &TaskHandle, invocation: Invocation) -> Result<JobId>;

    async fn schedule_task_at(
        &self,
        task: &TaskHandle,
        run_at: DateTime<Utc>,
        invocation: Invocation,
    ) -> Result<ScheduleId>;

    async fn schedule_task_in(
        &self,
        task: &TaskHandle,
        delay: Duration,
        invocation: Invocation,
    ) -> Result<ScheduleId>;

    async fn schedule_task_cron(
        &self,
        task: &TaskHandle,
        expression: &str,
        invocation: Invocation,
    ) -> Result<ScheduleId>;

    async fn schedule_task_interval(
        &self,
        task: &TaskHandle,
        every: Duration,
        invocation: Invocation,
    ) -> Result<ScheduleId>;

    /// Non-blocking status/result query.
    async fn get_task(&self, job_id: &JobId) -> Result<TaskResult>;

    /// Cancel a job that has not started. `false` when it already started or
    /// is unknown.
    async fn cancel_task(&self, job_id: &JobId) -> Result<bool>;

    async fn remove_schedule(&self, schedule_id: &ScheduleId) -> Result<bool>;

    async fn list_schedules(&self) -> Result<Vec<ScheduleInfo>>;

    async fn worker_start(&self, workers: usize) -> Result<()>;

    async fn worker_stop(&self) -> Result<()>;

    async fn worker_monitor(&self) -> Result<WorkerStatus>;
}

/// Shared dependencies handed to every adapter.
#[derive(Clone)]
pub struct BackendContext {
    pub connector: Connector,
    pub callbacks: Arc<CallbackRegistry>,
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
}

impl BackendContext {
    pub fn new(connector: Connector, callbacks: Arc<CallbackRegistry>) -> Self {
        Self {
            connector,
            callbacks,
            ids: Arc::new(UlidGenerator::default()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }
}

impl Default for BackendContext {
    fn default() -> Self {
        Self::new(Connector::new(), Arc::new(CallbackRegistry::new()))
    }
}

/// Set of connections an adapter owns; closed on `worker_stop`.
#[async_trait]
pub(crate) trait Connections: Clone + Send + Sync + 'static {
    async fn close(&self);
}

/// What `worker_start` does when the pool already runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RestartPolicy {
    /// Log a warning and keep the running pool.
    Ignore,
    /// Fail with `WorkerAlreadyRunning`.
    Reject,
}

enum Phase {
    Ready,
    Running(WorkerGroup),
    Stopped,
}

struct LifecycleState<C> {
    phase: Phase,
    conn: C,
}

/// Adapter lifecycle plus the connections it guards.
pub(crate) struct Lifecycle<C> {
    backend: BackendType,
    on_running: RestartPolicy,
    state: Mutex<LifecycleState<C>>,
}

impl<C: Connections> Lifecycle<C> {
    pub(crate) fn new(backend: BackendType, on_running: RestartPolicy, conn: C) -> Self {
        Self {
            backend,
            on_running,
            state: Mutex::new(LifecycleState {
                phase: Phase::Ready,
                conn,
            }),
        }
    }

    /// Current connections; fails while stopped.
    pub(crate) async fn connection(&self) -> Result<C> {
        let state = self.state.lock().await;
        match &state.phase {
            Phase::Stopped => Err(TaskQueueError::WorkerNotRunning),
            Phase::Ready | Phase::Running(_) => Ok(state.conn.clone()),
        }
    }

    /// `(connections, running, workers)`; fails while stopped.
    pub(crate) async fn snapshot(&self) -> Result<(C, bool, usize)> {
        let state = self.state.lock().await;
        match &state.phase {
            Phase::Stopped => Err(TaskQueueError::WorkerNotRunning),
            Phase::Ready => Ok((state.conn.clone(), false, 0)),
            Phase::Running(group) => Ok((state.conn.clone(), true, group.workers())),
        }
    }

    pub(crate) async fn start<R, S>(&self, workers: usize, reconnect: R, spawn: S) -> Result<()>
    where
        R: FnOnce() -> Result<C>,
        S: FnOnce(&C, usize) -> WorkerGroup,
    {
        if workers == 0 {
            return Err(TaskQueueError::Configuration(
                "worker count must be at least 1".into(),
            ));
        }
        let mut state = self.state.lock().await;
        let stopped = match &state.phase {
            Phase::Running(_) => {
                return match self.on_running {
                    RestartPolicy::Ignore => {
                        tracing::warn!(backend = %self.backend, "workers already running; start ignored");
                        Ok(())
                    }
                    RestartPolicy::Reject => Err(TaskQueueError::WorkerAlreadyRunning),
                };
            }
            Phase::Stopped => true,
            Phase::Ready => false,
        };
        if stopped {
            state.conn = reconnect()?;
            tracing::debug!(backend = %self.backend, "reconnected");
        }
        let group = spawn(&state.conn, workers);
        state.phase = Phase::Running(group);
        tracing::info!(backend = %self.backend, workers, "workers started");
        Ok(())
    }

    /// Stop workers and close connections; a second call is a no-op.
    pub(crate) async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut state.phase, Phase::Stopped) {
            Phase::Stopped => {
                tracing::debug!(backend = %self.backend, "already stopped");
                return Ok(());
            }
            Phase::Running(group) => group.shutdown_and_join().await,
            Phase::Ready => {}
        }
        state.conn.close().await;
        tracing::info!(backend = %self.backend, "workers stopped, connections closed");
        Ok(())
    }
}

/// Reject invocations that could never run as requested.
pub(crate) fn validate_invocation(invocation: &Invocation) -> Result<()> {
    if let Some(policy) = &invocation.retry {
        policy.validate()?;
    }
    if invocation.result_ttl.is_some_and(|ttl| ttl.is_zero()) {
        return Err(TaskQueueError::Configuration(
            "result_ttl must be positive".into(),
        ));
    }
    Ok(())
}

/// First fire time of a new schedule.
pub(crate) fn first_fire(trigger: &Trigger, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    trigger
        .first_fire(now)
        .ok_or_else(|| TaskQueueError::InvalidSchedule(format!("{trigger} never fires")))
}

/// Absolute time `delay` from `now`.
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>> {
    let delta = crate::domain::trigger::to_delta(delay)?;
    now.checked_add_signed(delta)
        .ok_or_else(|| TaskQueueError::InvalidSchedule(format!("delay {delay:?} out of range")))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Noop;

    #[async_trait]
    impl Connections for Noop {
        async fn close(&self) {}
    }

    fn empty_group(_: &Noop, _: usize) -> WorkerGroup {
        struct Idle;

        #[async_trait]
        impl crate::app::JobSource for Idle {
            async fn next_job(&self) -> Result<crate::app::ClaimedJob> {
                std::future::pending().await
            }

            async fn finish(
                &self,
                _job_id: &JobId,
                _outcome: std::result::Result<serde_json::Value, crate::domain::TaskError>,
            ) -> Result<()> {
                Ok(())
            }
        }

        let tasks = Arc::new(crate::app::TaskTable::new());
        let executor = crate::app::Executor::new(tasks, Arc::new(CallbackRegistry::new()));
        WorkerGroup::spawn(1, Arc::new(Idle), executor)
    }

    #[tokio::test]
    async fn stopped_lifecycle_rejects_until_restarted() {
        let lifecycle = Lifecycle::new(BackendType::Rq, RestartPolicy::Ignore, Noop);
        lifecycle.start(1, || Ok(Noop), empty_group).await.unwrap();
        lifecycle.stop().await.unwrap();
        lifecycle.stop().await.unwrap();

        assert!(matches!(
            lifecycle.connection().await,
            Err(TaskQueueError::WorkerNotRunning)
        ));
        lifecycle.start(1, || Ok(Noop), empty_group).await.unwrap();
        assert!(lifecycle.connection().await.is_ok());
        lifecycle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn restart_policy_decides_double_start() {
        let ignore = Lifecycle::new(BackendType::Huey, RestartPolicy::Ignore, Noop);
        ignore.start(1, || Ok(Noop), empty_group).await.unwrap();
        assert!(ignore.start(2, || Ok(Noop), empty_group).await.is_ok());
        let (_, running, workers) = ignore.snapshot().await.unwrap();
        assert!(running);
        assert_eq!(workers, 1);
        ignore.stop().await.unwrap();

        let reject = Lifecycle::new(BackendType::ApScheduler, RestartPolicy::Reject, Noop);
        reject.start(1, || Ok(Noop), empty_group).await.unwrap();
        assert!(matches!(
            reject.start(1, || Ok(Noop), empty_group).await,
            Err(TaskQueueError::WorkerAlreadyRunning)
        ));
        reject.stop().await.unwrap();
    }

    #[tokio::test]
    async fn zero_workers_is_rejected() {
        let lifecycle = Lifecycle::new(BackendType::Rq, RestartPolicy::Ignore, Noop);
        assert!(matches!(
            lifecycle.start(0, || Ok(Noop), empty_group).await,
            Err(TaskQueueError::Configuration(_))
        ));
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let invocation = Invocation::new().result_ttl(Duration::ZERO);
        assert!(validate_invocation(&invocation).is_err());
        assert!(validate_invocation(&Invocation::new()).is_ok());
    }
}
