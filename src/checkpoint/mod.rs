//! Checkpoint store: durable resume-after-crash snapshots.
//!
//! A checkpoint captures everything a run needs to continue after a
//! crash: the next step index, the accumulated step outputs, and the
//! run status. Saves are idempotent upserts keyed by `run_id` — a row's
//! `created_at` is set once and never mutated, `updated_at` only moves
//! forward, and the content hash is always recomputed server-side from
//! the supplied outputs (callers never pass it).
//!
//! # Design Principles
//!
//! - **Atomicity**: a save is all-or-nothing.
//! - **Idempotency**: re-saving the same payload yields the same
//!   content hash and advances only `updated_at`.
//! - **Isolation**: concurrent savers of the same run must not corrupt
//!   `created_at`; the store's own concurrency control serializes them.
//! - **Non-blocking**: the interface is async end-to-end, so slow
//!   store I/O suspends the calling task instead of the scheduler.

#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::canonical;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCheckpointStore;

/// Lifecycle status stored on a checkpoint row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CheckpointStatus {
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl CheckpointStatus {
    /// Persisted string form.
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }

    /// Decode a persisted status; unknown strings land on `Failed`
    /// so a corrupt row is never mistaken for resumable work.
    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "paused" => Self::Paused,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    /// Whether the engine may pick the run back up.
    #[must_use]
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

/// A durable snapshot of one run.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub run_id: String,
    pub workflow_id: String,
    pub next_step_index: usize,
    /// 16-hex-character prefix of SHA-256 over the canonical JSON of
    /// the outputs map.
    pub last_result_hash: String,
    pub step_outputs: FxHashMap<String, Value>,
    pub status: CheckpointStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Errors from checkpoint store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    #[error("backend error: {message}")]
    #[diagnostic(
        code(replayweave::checkpoint::backend),
        help("Check backend connectivity and permissions; backend message: {message}.")
    )]
    Backend { message: String },

    #[error("checkpoint serialization failed: {0}")]
    #[diagnostic(code(replayweave::checkpoint::serde))]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Compute the content hash the store records for an outputs map.
///
/// Exposed so tests and callers can predict `last_result_hash` without
/// a round-trip.
#[must_use]
pub fn outputs_hash(step_outputs: &FxHashMap<String, Value>) -> String {
    let map: serde_json::Map<String, Value> = step_outputs
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    canonical::content_hash16(&Value::Object(map))
}

/// Durable storage for run checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Upsert the checkpoint for `run_id` and return the recomputed
    /// content hash. Preserves `created_at` on existing rows.
    async fn save(
        &self,
        run_id: &str,
        workflow_id: &str,
        next_step_index: usize,
        step_outputs: &FxHashMap<String, Value>,
        status: CheckpointStatus,
    ) -> Result<String>;

    /// Load the checkpoint for `run_id`, if any.
    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>>;

    /// Remove the checkpoint; returns whether a row existed.
    async fn delete(&self, run_id: &str) -> Result<bool>;

    /// Checkpoints with status `running`, oldest first, up to `limit`.
    async fn list_running(&self, limit: u32) -> Result<Vec<Checkpoint>>;
}

/// Volatile store for tests and ephemeral runs. Stores the latest
/// checkpoint per run id.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    inner: Mutex<FxHashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<String, Checkpoint>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(
        &self,
        run_id: &str,
        workflow_id: &str,
        next_step_index: usize,
        step_outputs: &FxHashMap<String, Value>,
        status: CheckpointStatus,
    ) -> Result<String> {
        let hash = outputs_hash(step_outputs);
        let now = Utc::now();
        let mut map = self.lock();
        match map.get_mut(run_id) {
            Some(existing) => {
                existing.workflow_id = workflow_id.to_string();
                existing.next_step_index = next_step_index;
                existing.last_result_hash = hash.clone();
                existing.step_outputs = step_outputs.clone();
                existing.status = status;
                // Monotonic even if the wall clock stalls between saves.
                existing.updated_at = existing.updated_at.max(now);
            }
            None => {
                map.insert(
                    run_id.to_string(),
                    Checkpoint {
                        run_id: run_id.to_string(),
                        workflow_id: workflow_id.to_string(),
                        next_step_index,
                        last_result_hash: hash.clone(),
                        step_outputs: step_outputs.clone(),
                        status,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(hash)
    }

    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.lock().get(run_id).cloned())
    }

    async fn delete(&self, run_id: &str) -> Result<bool> {
        Ok(self.lock().remove(run_id).is_some())
    }

    async fn list_running(&self, limit: u32) -> Result<Vec<Checkpoint>> {
        let map = self.lock();
        let mut running: Vec<Checkpoint> = map
            .values()
            .filter(|c| c.status == CheckpointStatus::Running)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        running.truncate(limit as usize);
        Ok(running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(v: i64) -> FxHashMap<String, Value> {
        let mut m = FxHashMap::default();
        m.insert("a".to_string(), json!({"v": v}));
        m
    }

    #[tokio::test]
    async fn upsert_preserves_created_at() {
        let store = InMemoryCheckpointStore::new();
        store
            .save("r1", "wf", 1, &outputs(1), CheckpointStatus::Running)
            .await
            .unwrap();
        let first = store.load("r1").await.unwrap().unwrap();
        store
            .save("r1", "wf", 2, &outputs(2), CheckpointStatus::Running)
            .await
            .unwrap();
        let second = store.load("r1").await.unwrap().unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.next_step_index, 2);
    }

    #[tokio::test]
    async fn same_payload_same_hash() {
        let store = InMemoryCheckpointStore::new();
        let h1 = store
            .save("r1", "wf", 1, &outputs(1), CheckpointStatus::Running)
            .await
            .unwrap();
        let h2 = store
            .save("r1", "wf", 1, &outputs(1), CheckpointStatus::Running)
            .await
            .unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
    }

    #[tokio::test]
    async fn list_running_filters_status() {
        let store = InMemoryCheckpointStore::new();
        store
            .save("r1", "wf", 1, &outputs(1), CheckpointStatus::Running)
            .await
            .unwrap();
        store
            .save("r2", "wf", 1, &outputs(1), CheckpointStatus::Completed)
            .await
            .unwrap();
        let running = store.list_running(10).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].run_id, "r1");
    }
}
