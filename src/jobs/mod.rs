//! Bulk job scheduling with at-most-once item claims.
//!
//! A job is a batch of items distributed to a pool of workers. The
//! store's claim primitive is the heart of the contract: `claim_next`
//! atomically moves exactly one pending item to `claimed` for the
//! calling worker, lowest `item_index` first, and no item is ever held
//! by two workers at once.
//!
//! Workers heartbeat while they hold claims. `reclaim_stale` returns
//! items whose worker went silent past the threshold to `pending`;
//! the original worker's late `complete_item` is then rejected with
//! `ClaimLost`, which is non-fatal — workers just claim the next item.
//!
//! Budgets run through the abstract ledger: job creation reserves
//! `per_item_minor` per item, completion settles the actual cost, and
//! failure refunds the hold.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod worker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::policy::ledger::LedgerError;

pub use memory::InMemoryJobStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobStore;
pub use worker::{ItemHandler, ItemOutcome, JobOutcome, JobRunner};

/// Default heartbeat-staleness threshold before reclamation.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 60;

/// Lifecycle of one job item. `Completed` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobItemStatus {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
}

impl JobItemStatus {
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "claimed" => Self::Claimed,
            "running" => Self::Running,
            "completed" => Self::Completed,
            _ => Self::Failed,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One unit of bulk work.
#[derive(Clone, Debug)]
pub struct JobItem {
    pub item_id: String,
    pub job_id: String,
    pub item_index: u64,
    pub input: Value,
    pub output: Option<Value>,
    pub worker_id: Option<String>,
    pub status: JobItemStatus,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Aggregate state of a job.
#[derive(Clone, Debug)]
pub struct Job {
    pub job_id: String,
    pub parallelism: usize,
    pub total_items: u64,
    pub completed_items: u64,
    pub failed_items: u64,
    pub per_item_minor: u64,
    pub reserved_minor: u64,
    pub spent_minor: u64,
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// A job is done when every item reached a terminal status.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed_items + self.failed_items >= self.total_items
    }
}

/// Parameters for [`JobStore::create_job`].
#[derive(Clone, Debug)]
pub struct JobSpec {
    pub items: Vec<Value>,
    pub parallelism: usize,
    pub per_item_minor: u64,
    /// Ledger account charged for the job, when budgets apply.
    pub agent_id: Option<String>,
}

impl JobSpec {
    #[must_use]
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items,
            parallelism: 1,
            per_item_minor: 0,
            agent_id: None,
        }
    }

    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    #[must_use]
    pub fn with_per_item_minor(mut self, per_item_minor: u64) -> Self {
        self.per_item_minor = per_item_minor;
        self
    }

    #[must_use]
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

/// Errors from job store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum JobError {
    #[error("job not found: {job_id}")]
    #[diagnostic(code(replayweave::jobs::job_not_found))]
    JobNotFound { job_id: String },

    #[error("job item not found: {item_id}")]
    #[diagnostic(code(replayweave::jobs::item_not_found))]
    ItemNotFound { item_id: String },

    /// The worker's claim was revoked (reclaimed or never held); the
    /// attempted write is rejected.
    #[error("worker `{worker_id}` no longer holds the claim on item `{item_id}`")]
    #[diagnostic(
        code(replayweave::jobs::claim_lost),
        help("The item was reclaimed after a heartbeat timeout; claim another item.")
    )]
    ClaimLost { worker_id: String, item_id: String },

    #[error("job `{job_id}` has no items")]
    #[diagnostic(code(replayweave::jobs::empty_job))]
    EmptyJob { job_id: String },

    #[error(transparent)]
    #[diagnostic(code(replayweave::jobs::ledger))]
    Ledger(#[from] LedgerError),

    #[error("backend error: {message}")]
    #[diagnostic(code(replayweave::jobs::backend))]
    Backend { message: String },

    #[error(transparent)]
    #[diagnostic(code(replayweave::jobs::serde))]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, JobError>;

/// Storage and claim primitive for bulk jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job from a spec, reserving budget for every item.
    async fn create_job(&self, spec: JobSpec) -> Result<String>;

    /// Atomically claim one pending item for `worker_id`, lowest
    /// `item_index` first. `None` means no pending item right now.
    async fn claim_next(&self, worker_id: &str, job_id: &str) -> Result<Option<JobItem>>;

    /// Record a successful item. Settles the item's budget hold.
    /// Rejected with [`JobError::ClaimLost`] if the claim was revoked.
    async fn complete_item(
        &self,
        worker_id: &str,
        item_id: &str,
        output: Value,
        actual_cost_minor: u64,
    ) -> Result<()>;

    /// Record a failed item. Refunds the item's budget hold. Same
    /// claim-revocation rule as `complete_item`.
    async fn fail_item(&self, worker_id: &str, item_id: &str, error: &str) -> Result<()>;

    /// Record liveness for a worker.
    async fn heartbeat(&self, worker_id: &str) -> Result<()>;

    /// Return stale claimed/running items to `pending`. An item is
    /// stale when its worker's last heartbeat is older than the
    /// configured threshold relative to `now`. Returns the count.
    async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Aggregate job state.
    async fn job(&self, job_id: &str) -> Result<Job>;

    /// All items of a job, ordered by `item_index`.
    async fn items(&self, job_id: &str) -> Result<Vec<JobItem>>;
}
