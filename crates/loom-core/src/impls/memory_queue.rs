//! In-memory queue broker (`memory://<name>`).
//!
//! One `MemoryQueueServer` plays the role of a broker process; every
//! `connect()` returns a fresh `MemoryQueueBroker` handle onto it, so closing a
//! handle releases that connection without wiping shared state.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::{
    JobCounts, JobId, JobState, Result, ResultRetention, ScheduleId, ScheduleInfo, TaskError,
    TaskQueueError,
};
use crate::ports::{Clock, DelayedEntry, IdGenerator, JobSnapshot, QueueBroker, QueuedJob};

/// Upper bound for one idle wait inside `lease`.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Delayed entry for the priority queue.
///
/// We use Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct DueEntry {
    run_at: DateTime<Utc>,
    schedule: ScheduleId,
}

impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering: earlier times have higher priority
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.schedule.cmp(&self.schedule))
    }
}

struct DelayedState {
    queue: String,
    entry: DelayedEntry,
    last_job: Option<JobId>,
    runs: u64,
}

struct StoredJob {
    queue: String,
    job: QueuedJob,
    state: JobState,
    outcome: Option<Result<Value, TaskError>>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct ServerState {
    /// Ready queues (JobIds only), per queue name.
    ready: HashMap<String, VecDeque<JobId>>,

    /// All job records (single source of truth for jobs).
    jobs: HashMap<JobId, StoredJob>,

    delayed: HashMap<ScheduleId, DelayedState>,
    due: BinaryHeap<DueEntry>,
}

impl ServerState {
    fn enqueue(&mut self, queue: &str, job: QueuedJob) {
        let id = job.id;
        self.jobs.insert(
            id,
            StoredJob {
                queue: queue.to_string(),
                job,
                state: JobState::Queued,
                outcome: None,
                expires_at: None,
            },
        );
        self.ready.entry(queue.to_string()).or_default().push_back(id);
    }

    /// Move delayed entries whose time has come onto their queue.
    fn promote_due(&mut self, now: DateTime<Utc>, ids: &dyn IdGenerator) -> usize {
        let mut promoted = 0;
        while let Some(head) = self.due.peek() {
            if head.run_at > now {
                break; // Heap is sorted, so we can stop
            }
            let Some(head) = self.due.pop() else { break };

            let Some(state) = self.delayed.get_mut(&head.schedule) else {
                continue; // removed
            };
            if state.entry.run_at != head.run_at {
                continue; // stale heap entry
            }

            let job = QueuedJob {
                id: ids.generate_job_id(),
                task: state.entry.task.clone(),
                invocation: state.entry.invocation.clone(),
                retention: state.entry.retention,
                schedule: Some(head.schedule),
            };
            state.last_job = Some(job.id);
            state.runs += 1;
            let queue = state.queue.clone();

            match state.entry.trigger.next_fire(head.run_at, now) {
                Some(next) => {
                    state.entry.run_at = next;
                    self.due.push(DueEntry {
                        run_at: next,
                        schedule: head.schedule,
                    });
                }
                None => {
                    self.delayed.remove(&head.schedule);
                }
            }

            tracing::debug!(job_id = %job.id, schedule_id = %head.schedule, queue = %queue, "delayed job is due");
            self.enqueue(&queue, job);
            promoted += 1;
        }
        promoted
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.jobs
            .retain(|_, job| job.expires_at.is_none_or(|at| at > now));
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        self.due.peek().map(|entry| entry.run_at)
    }
}

/// Shared broker state behind every `memory://<name>` connection.
pub struct MemoryQueueServer {
    state: Mutex<ServerState>,
    notify: Notify,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl MemoryQueueServer {
    pub fn new(ids: Arc<dyn IdGenerator>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState::default()),
            notify: Notify::new(),
            ids,
            clock,
        })
    }

    pub fn connect(self: &Arc<Self>) -> MemoryQueueBroker {
        MemoryQueueBroker {
            server: Arc::clone(self),
            closed: AtomicBool::new(false),
        }
    }
}

/// One connection to a `MemoryQueueServer`.
pub struct MemoryQueueBroker {
    server: Arc<MemoryQueueServer>,
    closed: AtomicBool,
}

impl MemoryQueueBroker {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TaskQueueError::Backend("connection closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBroker for MemoryQueueBroker {
    async fn push(&self, queue: &str, job: QueuedJob) -> Result<()> {
        self.ensure_open()?;
        {
            let mut state = self.server.state.lock().await;
            state.enqueue(queue, job);
        }
        // Notify waiting workers
        self.server.notify.notify_one();
        Ok(())
    }

    async fn push_delayed(&self, queue: &str, entry: DelayedEntry) -> Result<()> {
        self.ensure_open()?;
        {
            let mut state = self.server.state.lock().await;
            state.due.push(DueEntry {
                run_at: entry.run_at,
                schedule: entry.schedule,
            });
            state.delayed.insert(
                entry.schedule,
                DelayedState {
                    queue: queue.to_string(),
                    entry,
                    last_job: None,
                    runs: 0,
                },
            );
        }
        self.server.notify.notify_one();
        Ok(())
    }

    async fn lease(&self, queue: &str) -> Result<QueuedJob> {
        loop {
            self.ensure_open()?;
            let next_wake = {
                let mut state = self.server.state.lock().await;
                let now = self.server.clock.now();
                if state.promote_due(now, self.server.ids.as_ref()) > 0 {
                    // 他の queue の worker も起こす
                    self.server.notify.notify_waiters();
                }

                let leased = state.ready.get_mut(queue).and_then(VecDeque::pop_front);
                if let Some(job_id) = leased {
                    if let Some(stored) = state.jobs.get_mut(&job_id) {
                        stored.state = JobState::Running;
                        return Ok(stored.job.clone());
                    }
                    continue;
                }

                state
                    .next_due()
                    .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            };

            // Wait for notification OR next delayed entry
            let wait = next_wake.map_or(IDLE_POLL, |d| d.min(IDLE_POLL));
            tokio::select! {
                _ = self.server.notify.notified() => {},
                _ = tokio::time::sleep(wait) => {},
            }
        }
    }

    async fn complete(&self, job_id: &JobId, outcome: Result<Value, TaskError>) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.server.state.lock().await;
        let Some(stored) = state.jobs.get_mut(job_id) else {
            return Ok(());
        };
        match stored.job.retention {
            ResultRetention::Discard => {
                state.jobs.remove(job_id);
            }
            retention => {
                stored.state = if outcome.is_ok() {
                    JobState::Finished
                } else {
                    JobState::Failed
                };
                stored.outcome = Some(outcome);
                if let ResultRetention::For(ttl) = retention {
                    stored.expires_at = Some(Instant::now() + ttl);
                }
            }
        }
        Ok(())
    }

    async fn job(&self, job_id: &JobId, consume: bool) -> Result<Option<JobSnapshot>> {
        self.ensure_open()?;
        let mut state = self.server.state.lock().await;
        state.purge_expired();
        let Some(stored) = state.jobs.get(job_id) else {
            return Ok(None);
        };
        let snapshot = JobSnapshot {
            state: stored.state,
            outcome: stored.outcome.clone(),
        };
        if consume
            && stored.state.is_terminal()
            && stored.job.retention == ResultRetention::UntilRead
        {
            state.jobs.remove(job_id);
        }
        Ok(Some(snapshot))
    }

    async fn cancel(&self, job_id: &JobId) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.server.state.lock().await;
        let queue = match state.jobs.get(job_id) {
            Some(stored) if stored.state == JobState::Queued => stored.queue.clone(),
            _ => return Ok(false),
        };
        if let Some(ready) = state.ready.get_mut(&queue) {
            ready.retain(|id| id != job_id);
        }
        state.jobs.remove(job_id);
        Ok(true)
    }

    async fn remove_delayed(&self, schedule: &ScheduleId) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.server.state.lock().await;
        // heap 側の entry は promote 時に stale として捨てられる
        Ok(state.delayed.remove(schedule).is_some())
    }

    async fn schedules(&self, queue: &str) -> Result<Vec<ScheduleInfo>> {
        self.ensure_open()?;
        let state = self.server.state.lock().await;
        let mut infos: Vec<ScheduleInfo> = state
            .delayed
            .iter()
            .filter(|(_, delayed)| delayed.queue == queue)
            .map(|(id, delayed)| ScheduleInfo {
                id: *id,
                task: delayed.entry.task.clone(),
                trigger: delayed.entry.trigger.to_string(),
                next_fire_at: Some(delayed.entry.run_at),
                last_job: delayed.last_job,
                runs: delayed.runs,
            })
            .collect();
        infos.sort_by_key(|info| info.next_fire_at);
        Ok(infos)
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts> {
        self.ensure_open()?;
        let mut state = self.server.state.lock().await;
        state.purge_expired();
        let mut counts = JobCounts::default();
        for stored in state.jobs.values().filter(|job| job.queue == queue) {
            match stored.state {
                JobState::Queued => counts.queued += 1,
                JobState::Running => counts.running += 1,
                JobState::Finished => counts.finished += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Scheduled | JobState::Cancelled => {}
            }
        }
        counts.scheduled = state
            .delayed
            .values()
            .filter(|delayed| delayed.queue == queue)
            .count();
        Ok(counts)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.server.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Invocation, Trigger};
    use crate::ports::{SystemClock, UlidGenerator};
    use chrono::TimeDelta;
    use serde_json::json;

    fn server() -> Arc<MemoryQueueServer> {
        MemoryQueueServer::new(Arc::new(UlidGenerator::default()), Arc::new(SystemClock))
    }

    fn job(retention: ResultRetention) -> QueuedJob {
        QueuedJob {
            id: UlidGenerator::default().generate_job_id(),
            task: "echo".into(),
            invocation: Invocation::new(),
            retention,
            schedule: None,
        }
    }

    #[tokio::test]
    async fn push_then_lease_marks_running() {
        let broker = server().connect();
        let queued = job(ResultRetention::UntilRead);
        let id = queued.id;
        broker.push("default", queued).await.unwrap();

        let leased = broker.lease("default").await.unwrap();
        assert_eq!(leased.id, id);
        let snapshot = broker.job(&id, false).await.unwrap().unwrap();
        assert_eq!(snapshot.state, JobState::Running);
    }

    #[tokio::test]
    async fn discard_retention_drops_record_on_completion() {
        let broker = server().connect();
        let queued = job(ResultRetention::Discard);
        let id = queued.id;
        broker.push("default", queued).await.unwrap();
        broker.lease("default").await.unwrap();

        broker.complete(&id, Ok(json!(1))).await.unwrap();
        assert!(broker.job(&id, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn until_read_is_consumed_once() {
        let broker = server().connect();
        let queued = job(ResultRetention::UntilRead);
        let id = queued.id;
        broker.push("q", queued).await.unwrap();
        broker.lease("q").await.unwrap();
        broker.complete(&id, Ok(json!("done"))).await.unwrap();

        let first = broker.job(&id, true).await.unwrap().unwrap();
        assert_eq!(first.outcome, Some(Ok(json!("done"))));
        assert!(broker.job(&id, true).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_retention_expires() {
        let broker = server().connect();
        let queued = job(ResultRetention::For(Duration::from_secs(10)));
        let id = queued.id;
        broker.push("q", queued).await.unwrap();
        broker.lease("q").await.unwrap();
        broker.complete(&id, Err(TaskError::permanent("x"))).await.unwrap();

        assert_eq!(
            broker.job(&id, true).await.unwrap().unwrap().state,
            JobState::Failed
        );
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(broker.job(&id, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_delayed_entry_is_promoted() {
        let broker = server().connect();
        let schedule = UlidGenerator::default().generate_schedule_id();
        let past = Utc::now() - TimeDelta::seconds(1);
        broker
            .push_delayed(
                "q",
                DelayedEntry {
                    schedule,
                    task: "echo".into(),
                    invocation: Invocation::new(),
                    retention: ResultRetention::Discard,
                    trigger: Trigger::Date(past),
                    run_at: past,
                },
            )
            .await
            .unwrap();

        let leased = broker.lease("q").await.unwrap();
        assert_eq!(leased.schedule, Some(schedule));
        // one-shot: removed after firing
        assert!(broker.schedules("q").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recurring_entry_is_reinserted() {
        let broker = server().connect();
        let schedule = UlidGenerator::default().generate_schedule_id();
        let past = Utc::now() - TimeDelta::milliseconds(10);
        broker
            .push_delayed(
                "q",
                DelayedEntry {
                    schedule,
                    task: "echo".into(),
                    invocation: Invocation::new(),
                    retention: ResultRetention::Discard,
                    trigger: Trigger::interval(Duration::from_secs(60)).unwrap(),
                    run_at: past,
                },
            )
            .await
            .unwrap();

        let leased = broker.lease("q").await.unwrap();
        let infos = broker.schedules("q").await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].runs, 1);
        assert_eq!(infos[0].last_job, Some(leased.id));
        assert!(infos[0].next_fire_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn cancel_only_queued_jobs() {
        let broker = server().connect();
        let first = job(ResultRetention::UntilRead);
        let second = job(ResultRetention::UntilRead);
        let (first_id, second_id) = (first.id, second.id);
        broker.push("q", first).await.unwrap();
        broker.push("q", second).await.unwrap();

        broker.lease("q").await.unwrap(); // first is running now
        assert!(!broker.cancel(&first_id).await.unwrap());
        assert!(broker.cancel(&second_id).await.unwrap());
        assert_eq!(broker.counts("q").await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn closed_handle_rejects_calls_but_server_survives() {
        let server = server();
        let first = server.connect();
        first.push("q", job(ResultRetention::UntilRead)).await.unwrap();
        first.close().await;
        assert!(matches!(
            first.counts("q").await,
            Err(TaskQueueError::Backend(_))
        ));

        let second = server.connect();
        assert_eq!(second.counts("q").await.unwrap().queued, 1);
    }
}
