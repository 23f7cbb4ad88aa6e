//! SchedulerLoop - 永続 schedule から job を生成する
//!
//! # フロー
//! 1. DataStore::acquire_due_schedules(now) で期限の来た schedule を確保
//! 2. job を DataStore に追加し、`JobAdded` を publish
//! 3. trigger から次回時刻を計算（取りこぼした分は 1 回にまとめる）
//! 4. release_schedule で書き戻し（次回が無ければ削除）

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use super::worker::shutdown_signalled;
use crate::domain::Result;
use crate::ports::{Clock, DataStore, EventBroker, IdGenerator, JobRecord, ScheduleRecord, SchedulerEvent};

/// Longest sleep between two ticks when nothing is due.
const MAX_IDLE: Duration = Duration::from_secs(1);

pub struct SchedulerLoop {
    store: Arc<dyn DataStore>,
    events: Arc<dyn EventBroker>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl SchedulerLoop {
    pub fn new(
        store: Arc<dyn DataStore>,
        events: Arc<dyn EventBroker>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            events,
            ids,
            clock,
        }
    }

    /// Fire every due schedule once. Returns how many jobs were spawned.
    pub async fn tick(&self) -> Result<usize> {
        let now = self.clock.now();
        let due = self.store.acquire_due_schedules(now).await?;
        let mut spawned = 0;
        for schedule in due {
            match self.fire(&schedule).await {
                Ok(()) => spawned += 1,
                Err(err) => {
                    tracing::error!(schedule_id = %schedule.id, error = %err, "failed to fire schedule");
                    // 次の tick で再挑戦できるよう、時刻は変えずに返す
                    self.store
                        .release_schedule(&schedule.id, schedule.next_fire_at, None)
                        .await?;
                }
            }
        }
        Ok(spawned)
    }

    async fn fire(&self, schedule: &ScheduleRecord) -> Result<()> {
        let now = self.clock.now();
        let mut job = JobRecord::new(
            self.ids.generate_job_id(),
            schedule.task.clone(),
            schedule.invocation.clone(),
            schedule.retention,
        );
        job.schedule = Some(schedule.id);
        let job_id = job.id;

        self.store.add_job(job).await?;
        self.events.publish(SchedulerEvent::JobAdded { job: job_id }).await?;

        let previous = schedule.next_fire_at.unwrap_or(now);
        let next = schedule.trigger.next_fire(previous, now);
        tracing::debug!(
            schedule_id = %schedule.id,
            %job_id,
            task = %schedule.task,
            next_fire_at = ?next,
            "schedule fired"
        );
        self.store.release_schedule(&schedule.id, next, Some(job_id)).await?;
        if next.is_none() {
            self.events
                .publish(SchedulerEvent::ScheduleRemoved { schedule: schedule.id })
                .await?;
        }
        Ok(())
    }

    /// Run until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut events = match self.events.subscribe() {
            Ok(events) => Some(events),
            Err(err) => {
                tracing::warn!(error = %err, "scheduler runs without event wakeups");
                None
            }
        };
        tracing::debug!("scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = self.tick().await {
                tracing::error!(error = %err, "scheduler tick failed");
            }

            let wait = match self.store.next_fire_time().await {
                Ok(Some(at)) => (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO).min(MAX_IDLE),
                Ok(None) | Err(_) => MAX_IDLE,
            };

            tokio::select! {
                stop = shutdown_signalled(&mut shutdown) => {
                    if stop {
                        break;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
                _ = wait_schedule_event(events.as_mut()) => {}
            }
        }
        tracing::debug!("scheduler stopped");
    }
}

/// Resolves on a schedule-related event; never resolves without a receiver.
async fn wait_schedule_event(events: Option<&mut broadcast::Receiver<SchedulerEvent>>) {
    let Some(events) = events else {
        return std::future::pending().await;
    };
    loop {
        match events.recv().await {
            Ok(SchedulerEvent::ScheduleAdded { .. }) => return,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => return std::future::pending().await,
        }
    }
}
