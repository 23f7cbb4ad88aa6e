//! In-memory data store (`memory://<name>`) for the persistent scheduler.
//!
//! Every adapter connected to the same name sees the same tasks, schedules and
//! jobs, which is what lets one process add a schedule and another run it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::domain::{
    JobCounts, JobId, JobState, Result, ResultRetention, ScheduleId, TaskError, TaskQueueError,
};
use crate::ports::{DataStore, JobRecord, ScheduleRecord};

struct StoredJob {
    record: JobRecord,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct StoreState {
    tasks: HashSet<String>,
    schedules: HashMap<ScheduleId, ScheduleRecord>,
    /// Schedules handed to a scheduler and not yet released.
    acquired: HashSet<ScheduleId>,
    jobs: HashMap<JobId, StoredJob>,
    /// FIFO of queued job ids.
    pending: VecDeque<JobId>,
}

impl StoreState {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.jobs
            .retain(|_, job| job.expires_at.is_none_or(|at| at > now));
    }
}

pub struct MemoryStoreServer {
    state: Mutex<StoreState>,
}

impl MemoryStoreServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StoreState::default()),
        })
    }

    pub fn connect(self: &Arc<Self>) -> MemoryDataStore {
        MemoryDataStore {
            server: Arc::clone(self),
            closed: AtomicBool::new(false),
        }
    }
}

pub struct MemoryDataStore {
    server: Arc<MemoryStoreServer>,
    closed: AtomicBool,
}

impl MemoryDataStore {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TaskQueueError::Backend("data store connection closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn add_task(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.server.state.lock().await.tasks.insert(name.to_string());
        Ok(())
    }

    async fn has_task(&self, name: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.server.state.lock().await.tasks.contains(name))
    }

    async fn add_schedule(&self, schedule: ScheduleRecord) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.server.state.lock().await;
        state.schedules.insert(schedule.id, schedule);
        Ok(())
    }

    async fn remove_schedule(&self, id: &ScheduleId) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.server.state.lock().await;
        state.acquired.remove(id);
        Ok(state.schedules.remove(id).is_some())
    }

    async fn schedules(&self) -> Result<Vec<ScheduleRecord>> {
        self.ensure_open()?;
        let state = self.server.state.lock().await;
        let mut records: Vec<ScheduleRecord> = state.schedules.values().cloned().collect();
        records.sort_by_key(|record| (record.next_fire_at, record.id));
        Ok(records)
    }

    async fn acquire_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>> {
        self.ensure_open()?;
        let mut state = self.server.state.lock().await;
        let due: Vec<ScheduleRecord> = state
            .schedules
            .values()
            .filter(|record| !state.acquired.contains(&record.id))
            .filter(|record| record.next_fire_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        for record in &due {
            state.acquired.insert(record.id);
        }
        Ok(due)
    }

    async fn release_schedule(
        &self,
        id: &ScheduleId,
        next_fire_at: Option<DateTime<Utc>>,
        last_job: Option<JobId>,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.server.state.lock().await;
        state.acquired.remove(id);
        match next_fire_at {
            Some(next) => {
                if let Some(record) = state.schedules.get_mut(id) {
                    record.next_fire_at = Some(next);
                    if last_job.is_some() {
                        record.last_job = last_job;
                        record.runs += 1;
                    }
                }
            }
            None => {
                state.schedules.remove(id);
            }
        }
        Ok(())
    }

    async fn next_fire_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.ensure_open()?;
        let state = self.server.state.lock().await;
        Ok(state
            .schedules
            .values()
            .filter(|record| !state.acquired.contains(&record.id))
            .filter_map(|record| record.next_fire_at)
            .min())
    }

    async fn add_job(&self, job: JobRecord) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.server.state.lock().await;
        let id = job.id;
        state.jobs.insert(
            id,
            StoredJob {
                record: job,
                expires_at: None,
            },
        );
        state.pending.push_back(id);
        Ok(())
    }

    async fn acquire_job(&self) -> Result<Option<JobRecord>> {
        self.ensure_open()?;
        let mut state = self.server.state.lock().await;
        while let Some(id) = state.pending.pop_front() {
            if let Some(stored) = state.jobs.get_mut(&id) {
                if stored.record.state == JobState::Queued {
                    stored.record.state = JobState::Running;
                    return Ok(Some(stored.record.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn release_job(&self, id: &JobId, outcome: Result<Value, TaskError>) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.server.state.lock().await;
        let Some(stored) = state.jobs.get_mut(id) else {
            return Ok(());
        };
        if stored.record.retention == ResultRetention::Discard {
            state.jobs.remove(id);
            return Ok(());
        }
        stored.record.state = if outcome.is_ok() {
            JobState::Finished
        } else {
            JobState::Failed
        };
        stored.record.outcome = Some(outcome);
        if let ResultRetention::For(ttl) = stored.record.retention {
            stored.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn job(&self, id: &JobId) -> Result<Option<JobRecord>> {
        self.ensure_open()?;
        let mut state = self.server.state.lock().await;
        state.purge_expired();
        Ok(state.jobs.get(id).map(|stored| stored.record.clone()))
    }

    async fn cancel_job(&self, id: &JobId) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.server.state.lock().await;
        let queued = state
            .jobs
            .get(id)
            .is_some_and(|stored| stored.record.state == JobState::Queued);
        if !queued {
            return Ok(false);
        }
        state.jobs.remove(id);
        state.pending.retain(|pending| pending != id);
        Ok(true)
    }

    async fn counts(&self) -> Result<JobCounts> {
        self.ensure_open()?;
        let mut state = self.server.state.lock().await;
        state.purge_expired();
        let mut counts = JobCounts {
            scheduled: state.schedules.len(),
            ..JobCounts::default()
        };
        for stored in state.jobs.values() {
            match stored.record.state {
                JobState::Queued => counts.queued += 1,
                JobState::Running => counts.running += 1,
                JobState::Finished => counts.finished += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Scheduled | JobState::Cancelled => {}
            }
        }
        Ok(counts)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
