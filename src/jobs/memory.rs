//! In-process job store.
//!
//! A single mutex over the whole store makes the claim primitive
//! trivially atomic: the scan-and-mark of `claim_next` happens under
//! one critical section, which satisfies the at-most-one-claim
//! invariant under any number of concurrent workers. Ledger calls run
//! outside the lock.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::policy::ledger::BudgetLedger;

use super::{
    DEFAULT_HEARTBEAT_TIMEOUT_SECS, Job, JobError, JobItem, JobItemStatus, JobSpec, JobStore,
    Result,
};

#[derive(Default)]
struct Inner {
    jobs: FxHashMap<String, Job>,
    items: FxHashMap<String, JobItem>,
    reservations: FxHashMap<String, String>,
    heartbeats: FxHashMap<String, DateTime<Utc>>,
}

/// Mutex-protected job store for tests and single-node deployments.
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
    ledger: Option<Arc<dyn BudgetLedger>>,
    heartbeat_timeout: Duration,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ledger: None,
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
        }
    }

    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn BudgetLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    #[must_use]
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Verify the worker still holds the claim; returns the agent and
    /// reservation for ledger settlement.
    fn take_claim(
        inner: &mut Inner,
        worker_id: &str,
        item_id: &str,
    ) -> Result<(String, Option<String>)> {
        let item = inner
            .items
            .get(item_id)
            .ok_or_else(|| JobError::ItemNotFound {
                item_id: item_id.to_string(),
            })?;
        let holds_claim = item.worker_id.as_deref() == Some(worker_id)
            && matches!(item.status, JobItemStatus::Claimed | JobItemStatus::Running);
        if !holds_claim {
            return Err(JobError::ClaimLost {
                worker_id: worker_id.to_string(),
                item_id: item_id.to_string(),
            });
        }
        let reservation = inner.reservations.get(item_id).cloned();
        Ok((item.job_id.clone(), reservation))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, spec: JobSpec) -> Result<String> {
        let job_id = Uuid::new_v4().to_string();
        if spec.items.is_empty() {
            return Err(JobError::EmptyJob { job_id });
        }

        // Reserve before publishing the job so a denied budget leaves
        // no orphan rows.
        let mut reservations: Vec<Option<String>> = vec![None; spec.items.len()];
        if let (Some(agent), Some(ledger)) = (spec.agent_id.as_deref(), self.ledger.as_ref()) {
            if spec.per_item_minor > 0 {
                for slot in reservations.iter_mut() {
                    *slot = Some(ledger.reserve(agent, spec.per_item_minor).await?);
                }
            }
        }

        let now = Utc::now();
        let total = spec.items.len() as u64;
        let mut inner = self.lock();
        inner.jobs.insert(
            job_id.clone(),
            Job {
                job_id: job_id.clone(),
                parallelism: spec.parallelism,
                total_items: total,
                completed_items: 0,
                failed_items: 0,
                per_item_minor: spec.per_item_minor,
                reserved_minor: spec.per_item_minor * total,
                spent_minor: 0,
                agent_id: spec.agent_id.clone(),
                created_at: now,
            },
        );
        for (index, (input, reservation)) in
            spec.items.into_iter().zip(reservations).enumerate()
        {
            let item_id = Uuid::new_v4().to_string();
            if let Some(reservation_id) = reservation {
                inner.reservations.insert(item_id.clone(), reservation_id);
            }
            inner.items.insert(
                item_id.clone(),
                JobItem {
                    item_id,
                    job_id: job_id.clone(),
                    item_index: index as u64,
                    input,
                    output: None,
                    worker_id: None,
                    status: JobItemStatus::Pending,
                    claimed_at: None,
                    completed_at: None,
                    error: None,
                },
            );
        }
        Ok(job_id)
    }

    async fn claim_next(&self, worker_id: &str, job_id: &str) -> Result<Option<JobItem>> {
        let mut inner = self.lock();
        if !inner.jobs.contains_key(job_id) {
            return Err(JobError::JobNotFound {
                job_id: job_id.to_string(),
            });
        }
        // Whole scan-and-mark under one lock: this is the claim
        // atomicity the contract requires.
        let candidate = inner
            .items
            .values()
            .filter(|i| i.job_id == job_id && i.status == JobItemStatus::Pending)
            .min_by_key(|i| i.item_index)
            .map(|i| i.item_id.clone());
        let Some(item_id) = candidate else {
            return Ok(None);
        };
        let item = inner
            .items
            .get_mut(&item_id)
            .ok_or_else(|| JobError::ItemNotFound {
                item_id: item_id.clone(),
            })?;
        item.status = JobItemStatus::Claimed;
        item.worker_id = Some(worker_id.to_string());
        item.claimed_at = Some(Utc::now());
        Ok(Some(item.clone()))
    }

    async fn complete_item(
        &self,
        worker_id: &str,
        item_id: &str,
        output: Value,
        actual_cost_minor: u64,
    ) -> Result<()> {
        let (reservation, agent_id) = {
            let mut inner = self.lock();
            let (job_id, reservation) = Self::take_claim(&mut inner, worker_id, item_id)?;
            let item = inner
                .items
                .get_mut(item_id)
                .ok_or_else(|| JobError::ItemNotFound {
                    item_id: item_id.to_string(),
                })?;
            item.status = JobItemStatus::Completed;
            item.output = Some(output);
            item.completed_at = Some(Utc::now());
            let agent_id = match inner.jobs.get_mut(&job_id) {
                Some(job) => {
                    job.completed_items += 1;
                    job.spent_minor += actual_cost_minor;
                    job.agent_id.clone()
                }
                None => None,
            };
            inner.reservations.remove(item_id);
            (reservation, agent_id)
        };
        if let (Some(agent), Some(reservation_id), Some(ledger)) =
            (agent_id, reservation, self.ledger.as_ref())
        {
            ledger.settle(&agent, &reservation_id, actual_cost_minor).await?;
        }
        Ok(())
    }

    async fn fail_item(&self, worker_id: &str, item_id: &str, error: &str) -> Result<()> {
        let (reservation, agent_id) = {
            let mut inner = self.lock();
            let (job_id, reservation) = Self::take_claim(&mut inner, worker_id, item_id)?;
            let item = inner
                .items
                .get_mut(item_id)
                .ok_or_else(|| JobError::ItemNotFound {
                    item_id: item_id.to_string(),
                })?;
            item.status = JobItemStatus::Failed;
            item.error = Some(error.to_string());
            item.completed_at = Some(Utc::now());
            let agent_id = match inner.jobs.get_mut(&job_id) {
                Some(job) => {
                    job.failed_items += 1;
                    job.reserved_minor = job.reserved_minor.saturating_sub(job.per_item_minor);
                    job.agent_id.clone()
                }
                None => None,
            };
            inner.reservations.remove(item_id);
            (reservation, agent_id)
        };
        if let (Some(agent), Some(reservation_id), Some(ledger)) =
            (agent_id, reservation, self.ledger.as_ref())
        {
            ledger.refund(&agent, &reservation_id).await?;
        }
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        self.lock()
            .heartbeats
            .insert(worker_id.to_string(), Utc::now());
        Ok(())
    }

    async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now
            - chrono::Duration::from_std(self.heartbeat_timeout).unwrap_or_else(|_| {
                chrono::Duration::seconds(DEFAULT_HEARTBEAT_TIMEOUT_SECS as i64)
            });
        let mut inner = self.lock();
        let dead_worker = |worker: &str, heartbeats: &FxHashMap<String, DateTime<Utc>>| {
            heartbeats.get(worker).map(|t| *t < cutoff).unwrap_or(true)
        };
        let stale: Vec<String> = inner
            .items
            .values()
            .filter(|i| {
                matches!(i.status, JobItemStatus::Claimed | JobItemStatus::Running)
                    && i.worker_id
                        .as_deref()
                        .map(|w| dead_worker(w, &inner.heartbeats))
                        .unwrap_or(true)
            })
            .map(|i| i.item_id.clone())
            .collect();
        let count = stale.len() as u64;
        for item_id in stale {
            if let Some(item) = inner.items.get_mut(&item_id) {
                item.status = JobItemStatus::Pending;
                item.worker_id = None;
                item.claimed_at = None;
            }
        }
        Ok(count)
    }

    async fn job(&self, job_id: &str) -> Result<Job> {
        self.lock()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    async fn items(&self, job_id: &str) -> Result<Vec<JobItem>> {
        let inner = self.lock();
        if !inner.jobs.contains_key(job_id) {
            return Err(JobError::JobNotFound {
                job_id: job_id.to_string(),
            });
        }
        let mut items: Vec<JobItem> = inner
            .items
            .values()
            .filter(|i| i.job_id == job_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.item_index);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn claims_lowest_index_first() {
        let store = InMemoryJobStore::new();
        let job_id = store
            .create_job(JobSpec::new(vec![json!(0), json!(1), json!(2)]))
            .await
            .unwrap();
        let first = store.claim_next("w1", &job_id).await.unwrap().unwrap();
        assert_eq!(first.item_index, 0);
        let second = store.claim_next("w2", &job_id).await.unwrap().unwrap();
        assert_eq!(second.item_index, 1);
    }

    #[tokio::test]
    async fn complete_after_reclaim_is_claim_lost() {
        let store =
            InMemoryJobStore::new().with_heartbeat_timeout(Duration::from_secs(0));
        let job_id = store
            .create_job(JobSpec::new(vec![json!(0)]))
            .await
            .unwrap();
        let item = store.claim_next("w1", &job_id).await.unwrap().unwrap();
        // No heartbeat recorded for w1, so the claim is immediately stale.
        let reclaimed = store.reclaim_stale(Utc::now()).await.unwrap();
        assert_eq!(reclaimed, 1);
        let err = store
            .complete_item("w1", &item.item_id, json!({}), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ClaimLost { .. }));
    }

    #[tokio::test]
    async fn terminal_statuses_stick() {
        let store = InMemoryJobStore::new();
        let job_id = store
            .create_job(JobSpec::new(vec![json!(0)]))
            .await
            .unwrap();
        let item = store.claim_next("w1", &job_id).await.unwrap().unwrap();
        store
            .complete_item("w1", &item.item_id, json!({"ok": true}), 3)
            .await
            .unwrap();
        // Completed items are invisible to reclamation and re-claims.
        store.heartbeat("w1").await.unwrap();
        assert_eq!(store.reclaim_stale(Utc::now()).await.unwrap(), 0);
        assert!(store.claim_next("w2", &job_id).await.unwrap().is_none());
        let job = store.job(&job_id).await.unwrap();
        assert_eq!(job.completed_items, 1);
        assert_eq!(job.spent_minor, 3);
        assert!(job.is_complete());
    }
}
