/*!
SQLite checkpoint store

Durable implementation of the `CheckpointStore` trait backed by a
SQLite pool.

## Behavior

- `save` is a single upsert on `run_id`; `ON CONFLICT ... DO UPDATE`
  leaves `created_at` untouched, so the creation timestamp survives
  concurrent resumers by construction.
- `updated_at` takes `MAX(old, new)` on conflict, keeping it
  monotonically non-decreasing per run even across clock skew between
  writer processes.
- The content hash is recomputed here from the supplied outputs map;
  callers never provide it.
- When the `sqlite-migrations` feature is enabled (default), embedded
  migrations (`sqlx::migrate!("./migrations")`) run on connect;
  disabling the feature assumes external migration orchestration.

## Schema

`workflow_checkpoints(run_id PK, workflow_id, next_step_index,
last_result_hash, step_outputs_json, status, created_at, updated_at)`
*/

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde_json::Value;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::instrument;

use super::{Checkpoint, CheckpointError, CheckpointStatus, CheckpointStore, Result, outputs_hash};

/// SQLite-backed checkpoint store.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointStore").finish()
    }
}

impl SqliteCheckpointStore {
    /// Connect (or create) a SQLite database at `database_url`.
    /// Example URL: `"sqlite://replayweave.db"`.
    #[must_use = "store must be used to persist checkpoints"]
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| CheckpointError::Backend {
                message: format!("connect error: {e}"),
            })?;
        #[cfg(feature = "sqlite-migrations")]
        {
            if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
                return Err(CheckpointError::Backend {
                    message: format!("migration failure: {e}"),
                });
            }
        }
        Ok(Self { pool })
    }

    /// Build a store over an existing pool (shared with the job store).
    #[must_use]
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_checkpoint(row: &SqliteRow) -> Result<Checkpoint> {
        let run_id: String = row.get("run_id");
        let workflow_id: String = row.get("workflow_id");
        let next_step_index: i64 = row.get("next_step_index");
        let last_result_hash: String = row.get("last_result_hash");
        let step_outputs_json: String = row.get("step_outputs_json");
        let status: String = row.get("status");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");

        let outputs: FxHashMap<String, Value> = serde_json::from_str(&step_outputs_json)?;
        Ok(Checkpoint {
            run_id,
            workflow_id,
            next_step_index: next_step_index.max(0) as usize,
            last_result_hash,
            step_outputs: outputs,
            status: CheckpointStatus::decode(&status),
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
        })
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait::async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    #[instrument(skip(self, step_outputs), err)]
    async fn save(
        &self,
        run_id: &str,
        workflow_id: &str,
        next_step_index: usize,
        step_outputs: &FxHashMap<String, Value>,
        status: CheckpointStatus,
    ) -> Result<String> {
        let hash = outputs_hash(step_outputs);
        let outputs_json = serde_json::to_string(step_outputs)?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO workflow_checkpoints (
                run_id,
                workflow_id,
                next_step_index,
                last_result_hash,
                step_outputs_json,
                status,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(run_id) DO UPDATE SET
                workflow_id = excluded.workflow_id,
                next_step_index = excluded.next_step_index,
                last_result_hash = excluded.last_result_hash,
                step_outputs_json = excluded.step_outputs_json,
                status = excluded.status,
                updated_at = MAX(workflow_checkpoints.updated_at, excluded.updated_at)
            "#,
        )
        .bind(run_id)
        .bind(workflow_id)
        .bind(next_step_index as i64)
        .bind(&hash)
        .bind(&outputs_json)
        .bind(status.encode())
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointError::Backend {
            message: format!("upsert checkpoint: {e}"),
        })?;

        Ok(hash)
    }

    #[instrument(skip(self), err)]
    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, workflow_id, next_step_index, last_result_hash,
                   step_outputs_json, status, created_at, updated_at
            FROM workflow_checkpoints
            WHERE run_id = ?1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CheckpointError::Backend {
            message: format!("select checkpoint: {e}"),
        })?;

        row.as_ref().map(Self::row_to_checkpoint).transpose()
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, run_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflow_checkpoints WHERE run_id = ?1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CheckpointError::Backend {
                message: format!("delete checkpoint: {e}"),
            })?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn list_running(&self, limit: u32) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, workflow_id, next_step_index, last_result_hash,
                   step_outputs_json, status, created_at, updated_at
            FROM workflow_checkpoints
            WHERE status = 'running'
            ORDER BY updated_at ASC
            LIMIT ?1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CheckpointError::Backend {
            message: format!("list running: {e}"),
        })?;

        rows.iter().map(Self::row_to_checkpoint).collect()
    }
}
