//! Job scheduler: at-most-once claims under contention, heartbeats,
//! reclamation, budget settlement.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use replayweave::jobs::{
    InMemoryJobStore, ItemOutcome, JobError, JobItemStatus, JobRunner, JobSpec, JobStore,
    worker::FnHandler,
};
use replayweave::policy::{BudgetLedger, InMemoryLedger};
use serde_json::json;

#[tokio::test]
async fn hundred_items_twenty_workers_no_duplicates() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let job_id = store
        .create_job(JobSpec::new((0..100).map(|i| json!({"n": i})).collect()).with_parallelism(20))
        .await
        .unwrap();

    let runner = JobRunner::new(Arc::clone(&store));
    let outcome = runner
        .run(
            &job_id,
            20,
            Arc::new(FnHandler(|item: &replayweave::jobs::JobItem| {
                ItemOutcome::Success {
                    output: json!({"echo": item.input.clone()}),
                    cost_minor: 1,
                }
            })),
        )
        .await
        .unwrap();

    assert_eq!(outcome.completed, 100);
    assert_eq!(outcome.failed, 0);

    let items = store.items(&job_id).await.unwrap();
    assert_eq!(items.len(), 100);
    assert!(items.iter().all(|i| i.status == JobItemStatus::Completed));
    // Every item completed exactly once, each by exactly one worker.
    let indices: HashSet<u64> = items.iter().map(|i| i.item_index).collect();
    assert_eq!(indices.len(), 100);
    assert!(items.iter().all(|i| i.worker_id.is_some()));

    let job = store.job(&job_id).await.unwrap();
    assert_eq!(job.completed_items, 100);
    assert!(job.is_complete());
}

#[tokio::test]
async fn raw_contention_never_double_claims() {
    let store = Arc::new(InMemoryJobStore::new());
    let job_id = store
        .create_job(JobSpec::new((0..25).map(|i| json!(i)).collect()))
        .await
        .unwrap();

    // Twice as many claimers as items.
    let mut tasks = Vec::new();
    for w in 0..50 {
        let store = Arc::clone(&store);
        let job_id = job_id.clone();
        tasks.push(tokio::spawn(async move {
            let worker_id = format!("w{w}");
            store.claim_next(&worker_id, &job_id).await.unwrap()
        }));
    }
    let mut claimed = Vec::new();
    for task in tasks {
        if let Some(item) = task.await.unwrap() {
            claimed.push(item);
        }
    }

    assert_eq!(claimed.len(), 25);
    let unique: HashSet<String> = claimed.iter().map(|i| i.item_id.clone()).collect();
    assert_eq!(unique.len(), 25);
}

#[tokio::test]
async fn claims_follow_item_index_order() {
    let store = InMemoryJobStore::new();
    let job_id = store
        .create_job(JobSpec::new(vec![json!("x"), json!("y"), json!("z")]))
        .await
        .unwrap();
    let a = store.claim_next("w", &job_id).await.unwrap().unwrap();
    let b = store.claim_next("w", &job_id).await.unwrap().unwrap();
    let c = store.claim_next("w", &job_id).await.unwrap().unwrap();
    assert_eq!((a.item_index, b.item_index, c.item_index), (0, 1, 2));
    assert!(store.claim_next("w", &job_id).await.unwrap().is_none());
}

#[tokio::test]
async fn stale_claims_are_reclaimed_and_late_writes_rejected() {
    let store = InMemoryJobStore::new().with_heartbeat_timeout(Duration::from_millis(10));
    let job_id = store
        .create_job(JobSpec::new(vec![json!(1)]))
        .await
        .unwrap();

    store.heartbeat("w1").await.unwrap();
    let item = store.claim_next("w1", &job_id).await.unwrap().unwrap();

    // Heartbeat ages past the threshold.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let reclaimed = store.reclaim_stale(Utc::now()).await.unwrap();
    assert_eq!(reclaimed, 1);

    // The original worker's in-flight completion is rejected.
    let err = store
        .complete_item("w1", &item.item_id, json!({}), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::ClaimLost { .. }));

    // Another worker picks the item back up and completes it.
    store.heartbeat("w2").await.unwrap();
    let item = store.claim_next("w2", &job_id).await.unwrap().unwrap();
    store
        .complete_item("w2", &item.item_id, json!({"ok": true}), 2)
        .await
        .unwrap();
}

#[tokio::test]
async fn live_heartbeats_prevent_reclamation() {
    let store = InMemoryJobStore::new().with_heartbeat_timeout(Duration::from_secs(60));
    let job_id = store
        .create_job(JobSpec::new(vec![json!(1)]))
        .await
        .unwrap();
    store.heartbeat("w1").await.unwrap();
    store.claim_next("w1", &job_id).await.unwrap().unwrap();
    assert_eq!(store.reclaim_stale(Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn budgets_reserve_settle_and_refund() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.set_budget("tenant", 100);
    let store = InMemoryJobStore::new().with_ledger(Arc::clone(&ledger) as Arc<dyn BudgetLedger>);

    let job_id = store
        .create_job(
            JobSpec::new(vec![json!(1), json!(2)])
                .with_per_item_minor(10)
                .with_agent("tenant"),
        )
        .await
        .unwrap();
    let job = store.job(&job_id).await.unwrap();
    assert_eq!(job.reserved_minor, 20);

    let first = store.claim_next("w", &job_id).await.unwrap().unwrap();
    store
        .complete_item("w", &first.item_id, json!({}), 7)
        .await
        .unwrap();
    assert_eq!(ledger.spent("tenant"), 7);

    let second = store.claim_next("w", &job_id).await.unwrap().unwrap();
    store.fail_item("w", &second.item_id, "boom").await.unwrap();
    // The failed item's hold was refunded, not spent.
    assert_eq!(ledger.spent("tenant"), 7);

    let job = store.job(&job_id).await.unwrap();
    assert_eq!(job.completed_items, 1);
    assert_eq!(job.failed_items, 1);
    assert_eq!(job.spent_minor, 7);
}

#[tokio::test]
async fn denied_reservation_fails_job_creation() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.set_budget("tenant", 5);
    let store = InMemoryJobStore::new().with_ledger(Arc::clone(&ledger) as Arc<dyn BudgetLedger>);
    let err = store
        .create_job(
            JobSpec::new(vec![json!(1), json!(2)])
                .with_per_item_minor(10)
                .with_agent("tenant"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Ledger(_)));
}

#[tokio::test]
async fn mixed_outcomes_tally_correctly() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let job_id = store
        .create_job(JobSpec::new((0..10).map(|i| json!(i)).collect()).with_parallelism(4))
        .await
        .unwrap();

    let runner = JobRunner::new(Arc::clone(&store));
    let outcome = runner
        .run(
            &job_id,
            4,
            Arc::new(FnHandler(|item: &replayweave::jobs::JobItem| {
                if item.item_index % 3 == 0 {
                    ItemOutcome::Failure {
                        error: "unlucky".to_string(),
                    }
                } else {
                    ItemOutcome::Success {
                        output: json!(null),
                        cost_minor: 0,
                    }
                }
            })),
        )
        .await
        .unwrap();

    assert_eq!(outcome.completed, 6);
    assert_eq!(outcome.failed, 4);
    let job = store.job(&job_id).await.unwrap();
    assert!(job.is_complete());
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use replayweave::jobs::SqliteJobStore;

    fn db_url(dir: &tempfile::TempDir, name: &str) -> String {
        format!("sqlite://{}?mode=rwc", dir.path().join(name).display())
    }

    #[tokio::test]
    async fn sqlite_contention_never_double_claims() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteJobStore::connect(&db_url(&dir, "jobs.db")).await.unwrap());
        let job_id = store
            .create_job(JobSpec::new((0..20).map(|i| json!(i)).collect()))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for w in 0..40 {
            let store = Arc::clone(&store);
            let job_id = job_id.clone();
            tasks.push(tokio::spawn(async move {
                store.claim_next(&format!("w{w}"), &job_id).await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            if let Some(item) = task.await.unwrap() {
                ids.push(item.item_id);
            }
        }
        assert_eq!(ids.len(), 20);
        let unique: HashSet<String> = ids.into_iter().collect();
        assert_eq!(unique.len(), 20);
    }

    #[tokio::test]
    async fn sqlite_complete_rejects_revoked_claims() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::connect(&db_url(&dir, "jobs2.db"))
            .await
            .unwrap()
            .with_heartbeat_timeout(Duration::from_millis(10));
        let job_id = store
            .create_job(JobSpec::new(vec![json!(1)]))
            .await
            .unwrap();
        let item = store.claim_next("w1", &job_id).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.reclaim_stale(Utc::now()).await.unwrap(), 1);
        let err = store
            .complete_item("w1", &item.item_id, json!({}), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ClaimLost { .. }));
    }
}
