/*!
SQLite job store

Durable `JobStore` backed by a SQLite pool.

## Claim algorithm

SQLite has no `SELECT ... FOR UPDATE SKIP LOCKED`, so the claim is a
CAS loop: pick the lowest-index pending item, then

```sql
UPDATE job_items SET status = 'claimed', worker_id = ?, claimed_at = ?
WHERE id = ? AND status = 'pending'
```

A zero-row update means another worker won the race; the loop retries
with the next candidate. The conditional update is the atomicity
anchor — only one worker's update can flip a given row out of
`pending`, so no item is ever held by two workers.

The complete/fail paths use the same conditional-update shape keyed on
`worker_id`, which is what rejects writes after reclamation
(`ClaimLost`).
*/

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

use crate::policy::ledger::BudgetLedger;

use super::{
    DEFAULT_HEARTBEAT_TIMEOUT_SECS, Job, JobError, JobItem, JobItemStatus, JobSpec, JobStore,
    Result,
};

/// SQLite-backed job store.
pub struct SqliteJobStore {
    pool: SqlitePool,
    ledger: Option<Arc<dyn BudgetLedger>>,
    heartbeat_timeout: Duration,
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore").finish()
    }
}

impl SqliteJobStore {
    /// Connect (or create) a SQLite database at `database_url`.
    #[must_use = "store must be used to schedule jobs"]
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| JobError::Backend {
                message: format!("connect error: {e}"),
            })?;
        #[cfg(feature = "sqlite-migrations")]
        {
            if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
                return Err(JobError::Backend {
                    message: format!("migration failure: {e}"),
                });
            }
        }
        Ok(Self {
            pool,
            ledger: None,
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
        })
    }

    /// Build a store over an existing pool (shared with checkpoints).
    #[must_use]
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
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

    fn row_to_item(row: &SqliteRow) -> Result<JobItem> {
        let input_json: String = row.get("input_json");
        let output_json: Option<String> = row.get("output_json");
        let status: String = row.get("status");
        let claimed_at: Option<String> = row.get("claimed_at");
        let completed_at: Option<String> = row.get("completed_at");
        let item_index: i64 = row.get("item_index");
        Ok(JobItem {
            item_id: row.get("id"),
            job_id: row.get("job_id"),
            item_index: item_index.max(0) as u64,
            input: serde_json::from_str(&input_json)?,
            output: output_json.as_deref().map(serde_json::from_str).transpose()?,
            worker_id: row.get("worker_id"),
            status: JobItemStatus::decode(&status),
            claimed_at: claimed_at.as_deref().map(parse_ts),
            completed_at: completed_at.as_deref().map(parse_ts),
            error: row.get("error_text"),
        })
    }

    async fn item_context(&self, item_id: &str) -> Result<(String, Option<String>, Option<String>)> {
        let row = sqlx::query(
            r#"
            SELECT i.job_id, i.reservation_id, j.agent_id
            FROM job_items i JOIN jobs j ON j.id = i.job_id
            WHERE i.id = ?1
            "#,
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend("item context"))?
        .ok_or_else(|| JobError::ItemNotFound {
            item_id: item_id.to_string(),
        })?;
        Ok((row.get("job_id"), row.get("reservation_id"), row.get("agent_id")))
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn backend(op: &'static str) -> impl Fn(sqlx::Error) -> JobError {
    move |e| JobError::Backend {
        message: format!("{op}: {e}"),
    }
}

#[async_trait::async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, spec), err)]
    async fn create_job(&self, spec: JobSpec) -> Result<String> {
        let job_id = Uuid::new_v4().to_string();
        if spec.items.is_empty() {
            return Err(JobError::EmptyJob { job_id });
        }

        let mut reservations: Vec<Option<String>> = vec![None; spec.items.len()];
        if let (Some(agent), Some(ledger)) = (spec.agent_id.as_deref(), self.ledger.as_ref()) {
            if spec.per_item_minor > 0 {
                for slot in reservations.iter_mut() {
                    *slot = Some(ledger.reserve(agent, spec.per_item_minor).await?);
                }
            }
        }

        let now = Utc::now().to_rfc3339();
        let total = spec.items.len() as i64;
        let mut tx = self.pool.begin().await.map_err(backend("tx begin"))?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, status, parallelism, total_items, per_item_minor,
                              reserved_minor, agent_id, created_at)
            VALUES (?1, 'active', ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&job_id)
        .bind(spec.parallelism as i64)
        .bind(total)
        .bind(spec.per_item_minor as i64)
        .bind((spec.per_item_minor * spec.items.len() as u64) as i64)
        .bind(&spec.agent_id)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(backend("insert job"))?;

        for (index, (input, reservation)) in
            spec.items.iter().zip(reservations.iter()).enumerate()
        {
            let input_json = serde_json::to_string(input)?;
            sqlx::query(
                r#"
                INSERT INTO job_items (id, job_id, item_index, input_json, status, reservation_id)
                VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&job_id)
            .bind(index as i64)
            .bind(&input_json)
            .bind(reservation)
            .execute(&mut *tx)
            .await
            .map_err(backend("insert item"))?;
        }

        tx.commit().await.map_err(backend("tx commit"))?;
        Ok(job_id)
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, worker_id: &str, job_id: &str) -> Result<Option<JobItem>> {
        loop {
            let candidate: Option<String> = sqlx::query_scalar(
                r#"
                SELECT id FROM job_items
                WHERE job_id = ?1 AND status = 'pending'
                ORDER BY item_index ASC
                LIMIT 1
                "#,
            )
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend("select pending"))?;

            let Some(item_id) = candidate else {
                return Ok(None);
            };

            let result = sqlx::query(
                r#"
                UPDATE job_items
                SET status = 'claimed', worker_id = ?1, claimed_at = ?2
                WHERE id = ?3 AND status = 'pending'
                "#,
            )
            .bind(worker_id)
            .bind(Utc::now().to_rfc3339())
            .bind(&item_id)
            .execute(&self.pool)
            .await
            .map_err(backend("claim update"))?;

            if result.rows_affected() == 0 {
                // Lost the race; another worker flipped the row first.
                continue;
            }

            let row = sqlx::query(
                r#"
                SELECT id, job_id, item_index, input_json, output_json, worker_id,
                       status, claimed_at, completed_at, error_text
                FROM job_items WHERE id = ?1
                "#,
            )
            .bind(&item_id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend("fetch claimed"))?;
            return Ok(Some(Self::row_to_item(&row)?));
        }
    }

    #[instrument(skip(self, output), err)]
    async fn complete_item(
        &self,
        worker_id: &str,
        item_id: &str,
        output: Value,
        actual_cost_minor: u64,
    ) -> Result<()> {
        let (job_id, reservation, agent_id) = self.item_context(item_id).await?;
        let output_json = serde_json::to_string(&output)?;

        let result = sqlx::query(
            r#"
            UPDATE job_items
            SET status = 'completed', output_json = ?1, completed_at = ?2
            WHERE id = ?3 AND worker_id = ?4 AND status IN ('claimed', 'running')
            "#,
        )
        .bind(&output_json)
        .bind(Utc::now().to_rfc3339())
        .bind(item_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(backend("complete update"))?;

        if result.rows_affected() == 0 {
            return Err(JobError::ClaimLost {
                worker_id: worker_id.to_string(),
                item_id: item_id.to_string(),
            });
        }

        sqlx::query(
            r#"
            UPDATE jobs
            SET completed_items = completed_items + 1,
                spent_minor = spent_minor + ?1
            WHERE id = ?2
            "#,
        )
        .bind(actual_cost_minor as i64)
        .bind(&job_id)
        .execute(&self.pool)
        .await
        .map_err(backend("job counters"))?;

        if let (Some(agent), Some(reservation_id), Some(ledger)) =
            (agent_id, reservation, self.ledger.as_ref())
        {
            ledger.settle(&agent, &reservation_id, actual_cost_minor).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn fail_item(&self, worker_id: &str, item_id: &str, error: &str) -> Result<()> {
        let (job_id, reservation, agent_id) = self.item_context(item_id).await?;

        let result = sqlx::query(
            r#"
            UPDATE job_items
            SET status = 'failed', error_text = ?1, completed_at = ?2
            WHERE id = ?3 AND worker_id = ?4 AND status IN ('claimed', 'running')
            "#,
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(item_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(backend("fail update"))?;

        if result.rows_affected() == 0 {
            return Err(JobError::ClaimLost {
                worker_id: worker_id.to_string(),
                item_id: item_id.to_string(),
            });
        }

        sqlx::query(
            r#"
            UPDATE jobs
            SET failed_items = failed_items + 1,
                reserved_minor = MAX(reserved_minor - per_item_minor, 0)
            WHERE id = ?1
            "#,
        )
        .bind(&job_id)
        .execute(&self.pool)
        .await
        .map_err(backend("job counters"))?;

        if let (Some(agent), Some(reservation_id), Some(ledger)) =
            (agent_id, reservation, self.ledger.as_ref())
        {
            ledger.refund(&agent, &reservation_id).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_workers (worker_id, last_heartbeat)
            VALUES (?1, ?2)
            ON CONFLICT(worker_id) DO UPDATE SET last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(worker_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend("heartbeat"))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = (now
            - chrono::Duration::from_std(self.heartbeat_timeout).unwrap_or_else(|_| {
                chrono::Duration::seconds(DEFAULT_HEARTBEAT_TIMEOUT_SECS as i64)
            }))
        .to_rfc3339();

        // Workers with no heartbeat row at all also count as dead.
        let result = sqlx::query(
            r#"
            UPDATE job_items
            SET status = 'pending', worker_id = NULL, claimed_at = NULL
            WHERE status IN ('claimed', 'running')
              AND (
                worker_id IS NULL
                OR worker_id NOT IN (SELECT worker_id FROM job_workers WHERE last_heartbeat >= ?1)
              )
            "#,
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await
        .map_err(backend("reclaim"))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn job(&self, job_id: &str) -> Result<Job> {
        let row = sqlx::query(
            r#"
            SELECT id, parallelism, total_items, completed_items, failed_items,
                   per_item_minor, reserved_minor, spent_minor, agent_id, created_at
            FROM jobs WHERE id = ?1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend("select job"))?
        .ok_or_else(|| JobError::JobNotFound {
            job_id: job_id.to_string(),
        })?;

        let parallelism: i64 = row.get("parallelism");
        let total_items: i64 = row.get("total_items");
        let completed_items: i64 = row.get("completed_items");
        let failed_items: i64 = row.get("failed_items");
        let per_item_minor: i64 = row.get("per_item_minor");
        let reserved_minor: i64 = row.get("reserved_minor");
        let spent_minor: i64 = row.get("spent_minor");
        let created_at: String = row.get("created_at");
        Ok(Job {
            job_id: row.get("id"),
            parallelism: parallelism.max(1) as usize,
            total_items: total_items.max(0) as u64,
            completed_items: completed_items.max(0) as u64,
            failed_items: failed_items.max(0) as u64,
            per_item_minor: per_item_minor.max(0) as u64,
            reserved_minor: reserved_minor.max(0) as u64,
            spent_minor: spent_minor.max(0) as u64,
            agent_id: row.get("agent_id"),
            created_at: parse_ts(&created_at),
        })
    }

    #[instrument(skip(self), err)]
    async fn items(&self, job_id: &str) -> Result<Vec<JobItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, item_index, input_json, output_json, worker_id,
                   status, claimed_at, completed_at, error_text
            FROM job_items
            WHERE job_id = ?1
            ORDER BY item_index ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend("select items"))?;
        rows.iter().map(Self::row_to_item).collect()
    }
}
