//! Worker pool driving a job to completion.
//!
//! `JobRunner::run` spawns up to `parallelism` worker tasks, each
//! looping claim → process → complete/fail until the job has no work
//! left. A shared tenant semaphore, when configured, caps concurrent
//! item processing across jobs; workers suspend on it rather than
//! being rejected.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::metrics::{MetricSink, NullSink, names};

use super::{JobError, JobItem, JobStore, Result};

/// What a handler produced for one item.
#[derive(Clone, Debug)]
pub enum ItemOutcome {
    Success { output: Value, cost_minor: u64 },
    Failure { error: String },
}

/// Processes one claimed item.
#[async_trait]
pub trait ItemHandler: Send + Sync {
    async fn process(&self, item: &JobItem) -> ItemOutcome;
}

/// Blanket adapter so closures work as handlers in tests.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> ItemHandler for FnHandler<F>
where
    F: Fn(&JobItem) -> ItemOutcome + Send + Sync,
{
    async fn process(&self, item: &JobItem) -> ItemOutcome {
        (self.0)(item)
    }
}

/// Summary of a finished job drive.
#[derive(Clone, Copy, Debug, Default)]
pub struct JobOutcome {
    pub completed: u64,
    pub failed: u64,
    pub claim_conflicts: u64,
}

#[derive(Debug, Error, Diagnostic)]
pub enum WorkerError {
    #[error(transparent)]
    #[diagnostic(code(replayweave::jobs::worker::store))]
    Store(#[from] JobError),

    #[error("worker task panicked: {message}")]
    #[diagnostic(code(replayweave::jobs::worker::join))]
    Join { message: String },
}

/// Drives workers against a job store.
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    metrics: Arc<dyn MetricSink>,
    tenant_semaphore: Option<Arc<Semaphore>>,
}

impl JobRunner {
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            metrics: Arc::new(NullSink),
            tenant_semaphore: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Cap concurrent item processing across every job sharing this
    /// semaphore (per-tenant backpressure).
    #[must_use]
    pub fn with_tenant_semaphore(mut self, semaphore: Arc<Semaphore>) -> Self {
        self.tenant_semaphore = Some(semaphore);
        self
    }

    /// Run `parallelism` workers until the job has no claimable work.
    #[instrument(skip(self, handler), err)]
    pub async fn run(
        &self,
        job_id: &str,
        parallelism: usize,
        handler: Arc<dyn ItemHandler>,
    ) -> std::result::Result<JobOutcome, WorkerError> {
        let parallelism = parallelism.max(1);
        let mut tasks = Vec::with_capacity(parallelism);
        for worker_index in 0..parallelism {
            let store = Arc::clone(&self.store);
            let handler = Arc::clone(&handler);
            let metrics = Arc::clone(&self.metrics);
            let semaphore = self.tenant_semaphore.clone();
            let job_id = job_id.to_string();
            let worker_id = format!("{job_id}-w{worker_index}");
            tasks.push(tokio::spawn(async move {
                drive_worker(&store, &job_id, &worker_id, handler, metrics, semaphore).await
            }));
        }

        let mut outcome = JobOutcome::default();
        for joined in join_all(tasks).await {
            let per_worker = joined.map_err(|e| WorkerError::Join {
                message: e.to_string(),
            })??;
            outcome.completed += per_worker.completed;
            outcome.failed += per_worker.failed;
            outcome.claim_conflicts += per_worker.claim_conflicts;
        }
        Ok(outcome)
    }

    /// One reclamation sweep with the store's threshold; callers
    /// schedule this on a timer.
    pub async fn reclaim_once(&self) -> Result<u64> {
        self.store.reclaim_stale(Utc::now()).await
    }
}

async fn drive_worker(
    store: &Arc<dyn JobStore>,
    job_id: &str,
    worker_id: &str,
    handler: Arc<dyn ItemHandler>,
    metrics: Arc<dyn MetricSink>,
    semaphore: Option<Arc<Semaphore>>,
) -> std::result::Result<JobOutcome, WorkerError> {
    let mut outcome = JobOutcome::default();
    loop {
        store.heartbeat(worker_id).await?;
        let Some(item) = store.claim_next(worker_id, job_id).await? else {
            break;
        };
        debug!(worker_id, item_index = item.item_index, "claimed item");

        // Backpressure: suspend (not reject) when the tenant cap is hit.
        let _permit = match &semaphore {
            Some(s) => Some(s.clone().acquire_owned().await.map_err(|e| {
                WorkerError::Join {
                    message: format!("semaphore closed: {e}"),
                }
            })?),
            None => None,
        };

        match handler.process(&item).await {
            ItemOutcome::Success { output, cost_minor } => {
                match store
                    .complete_item(worker_id, &item.item_id, output, cost_minor)
                    .await
                {
                    Ok(()) => outcome.completed += 1,
                    Err(JobError::ClaimLost { .. }) => {
                        // Someone reclaimed the item mid-flight; the
                        // result is discarded and the worker moves on.
                        warn!(worker_id, item_id = %item.item_id, "claim lost on complete");
                        metrics.counter(names::CLAIM_CONFLICTS, &[], 1);
                        outcome.claim_conflicts += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            ItemOutcome::Failure { error } => {
                match store.fail_item(worker_id, &item.item_id, &error).await {
                    Ok(()) => outcome.failed += 1,
                    Err(JobError::ClaimLost { .. }) => {
                        warn!(worker_id, item_id = %item.item_id, "claim lost on fail");
                        metrics.counter(names::CLAIM_CONFLICTS, &[], 1);
                        outcome.claim_conflicts += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, JobSpec};
    use serde_json::json;

    #[tokio::test]
    async fn pool_drains_all_items() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let job_id = store
            .create_job(JobSpec::new((0..10).map(|i| json!(i)).collect()).with_parallelism(3))
            .await
            .unwrap();
        let runner = JobRunner::new(Arc::clone(&store));
        let outcome = runner
            .run(
                &job_id,
                3,
                Arc::new(FnHandler(|item: &JobItem| ItemOutcome::Success {
                    output: json!({"doubled": item.item_index * 2}),
                    cost_minor: 1,
                })),
            )
            .await
            .unwrap();
        assert_eq!(outcome.completed, 10);
        assert_eq!(outcome.failed, 0);
        let job = store.job(&job_id).await.unwrap();
        assert!(job.is_complete());
        assert_eq!(job.spent_minor, 10);
    }
}
