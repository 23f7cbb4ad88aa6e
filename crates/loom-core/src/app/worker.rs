use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::executor::Executor;
use crate::domain::{Invocation, JobId, Result, TaskError};

/// Back-off after a failed `next_job` before asking the source again.
const SOURCE_ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// A job handed to a worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: JobId,
    pub task: String,
    pub invocation: Invocation,
}

/// Where workers get jobs from and report outcomes to.
///
/// `next_job` may wait; the worker races it against shutdown.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn next_job(&self) -> Result<ClaimedJob>;

    async fn finish(&self, job_id: &JobId, outcome: std::result::Result<Value, TaskError>) -> Result<()>;
}

/// Worker group handle.
/// - `request_shutdown()` でワーカー全体が止まる
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
/// - drop しただけでも shutdown が送られる（join はしない）
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    workers: usize,
}

impl WorkerGroup {
    /// Spawn `n` workers.
    pub fn spawn(n: usize, source: Arc<dyn JobSource>, executor: Executor) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let source = Arc::clone(&source);
            let executor = executor.clone();
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker_id, source, executor, &mut rx).await;
            });
            joins.push(join);
        }

        Self {
            shutdown_tx,
            joins,
            workers: n,
        }
    }

    /// Spawn an extra background loop (e.g. the scheduler) that shares this
    /// group's shutdown signal. It does not count as a worker.
    pub fn spawn_background<F, Fut>(&mut self, f: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let rx = self.shutdown_tx.subscribe();
        self.joins.push(tokio::spawn(f(rx)));
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Request shutdown for all workers.
    /// In-flight jobs run to completion; no new job is taken.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(mut self) {
        self.request_shutdown();
        for join in std::mem::take(&mut self.joins) {
            if let Err(err) = join.await {
                tracing::error!(error = %err, "worker task panicked");
            }
        }
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        self.request_shutdown();
    }
}

/// Wait for the next shutdown signal. A dropped sender counts as shutdown.
pub(crate) async fn shutdown_signalled(shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    match shutdown_rx.changed().await {
        Ok(()) => *shutdown_rx.borrow(),
        Err(_) => true,
    }
}

async fn worker_loop(
    worker_id: usize,
    source: Arc<dyn JobSource>,
    executor: Executor,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    tracing::debug!(worker_id, "worker started");
    loop {
        // shutdown が来ていたら抜ける
        if *shutdown_rx.borrow() {
            break;
        }

        // next_job は「待つ」可能性があるので select で shutdown と競合させる
        let claimed = tokio::select! {
            stop = shutdown_signalled(shutdown_rx) => {
                if stop {
                    break;
                }
                continue;
            }
            claimed = source.next_job() => claimed,
        };

        let job = match claimed {
            Ok(job) => job,
            Err(err) => {
                tracing::warn!(worker_id, error = %err, "failed to fetch next job");
                tokio::select! {
                    stop = shutdown_signalled(shutdown_rx) => {
                        if stop {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(SOURCE_ERROR_BACKOFF) => {}
                }
                continue;
            }
        };

        // ここから先は job 実行（retry の sleep も含めて await がある）
        let outcome = executor.run(job.id, &job.task, &job.invocation).await;

        if let Err(err) = source.finish(&job.id, outcome).await {
            tracing::error!(worker_id, job_id = %job.id, error = %err, "failed to record job outcome");
        }
    }
    tracing::debug!(worker_id, "worker stopped");
}
