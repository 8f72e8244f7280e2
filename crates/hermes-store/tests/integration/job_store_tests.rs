use std::time::Duration;

use redis::AsyncCommands;
use serde_json::json;
use uuid::Uuid;

use hermes_core::error::AppError;
use hermes_core::job::{CreateJobRequest, Job, JobStatus};
use hermes_core::traits::JobStore;
use hermes_store::RedisJobStore;

use crate::integration::common::{setup_redis, test_job};

const RETENTION: Duration = Duration::from_secs(48 * 3600);

#[tokio::test]
async fn create_and_get_roundtrip() {
    let (_client, manager, _container) = setup_redis().await;
    let store = RedisJobStore::new(manager, RETENTION);

    let job = Job::create(
        CreateJobRequest::new(
            "alice",
            "db-01",
            json!({
                "queries": ["select 1"],
                "onerror": "insert into audit values ('failed')"
            }),
        )
        .with_timeout(600),
    )
    .unwrap();
    store.create(&job).await.unwrap();

    let loaded = store.get(job.id).await.unwrap();
    assert_eq!(loaded.id, job.id);
    assert_eq!(loaded.user, "alice");
    assert_eq!(loaded.host, "db-01");
    assert_eq!(loaded.status, JobStatus::Pending);
    assert_eq!(loaded.timeout, Some(600));
    assert!(loaded.query.is_fallback());
    assert_eq!(loaded.created_at, job.created_at);
    assert!(loaded.started_at.is_none());
}

#[tokio::test]
async fn get_missing_job_is_not_found() {
    let (_client, manager, _container) = setup_redis().await;
    let store = RedisJobStore::new(manager, RETENTION);

    let id = Uuid::new_v4();
    let err = store.get(id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(missing) if missing == id));
}

#[tokio::test]
async fn finished_record_gains_retention_ttl() {
    let (_client, mut manager, _container) = setup_redis().await;
    let store = RedisJobStore::new(manager.clone(), RETENTION);

    let job = test_job("alice", "db-01", json!("select 1"));
    store.create(&job).await.unwrap();
    store
        .set_status(job.id, JobStatus::Running, None)
        .await
        .unwrap();
    store.set_status(job.id, JobStatus::Done, None).await.unwrap();

    let ttl: i64 = manager.ttl(format!("job:{}", job.id)).await.unwrap();
    assert!(ttl > 0 && ttl <= RETENTION.as_secs() as i64);
}

#[tokio::test]
async fn cancelled_record_is_kept_without_expiry() {
    let (_client, mut manager, _container) = setup_redis().await;
    let store = RedisJobStore::new(manager.clone(), RETENTION);

    let job = test_job("alice", "db-01", json!("select 1"));
    store.create(&job).await.unwrap();
    store
        .set_status(job.id, JobStatus::Cancelled, None)
        .await
        .unwrap();

    let ttl: i64 = manager.ttl(format!("job:{}", job.id)).await.unwrap();
    assert_eq!(ttl, -1);
}

#[tokio::test]
async fn requeued_multi_statement_job_stays_live() {
    let (_client, mut manager, _container) = setup_redis().await;
    let store = RedisJobStore::new(manager.clone(), RETENTION);

    let job = test_job("alice", "db-01", json!(["select 1", "select 2"]));
    store.create(&job).await.unwrap();
    store
        .set_status(job.id, JobStatus::Running, None)
        .await
        .unwrap();

    // First statement done: overall status folds back to pending.
    let updated = store.set_status(job.id, JobStatus::Done, None).await.unwrap();
    assert_eq!(updated.status, JobStatus::Pending);

    let ttl: i64 = manager.ttl(format!("job:{}", job.id)).await.unwrap();
    assert_eq!(ttl, -1);
}

#[tokio::test]
async fn update_clears_optional_fields_that_went_unset() {
    let (_client, manager, _container) = setup_redis().await;
    let store = RedisJobStore::new(manager, RETENTION);

    let job = test_job("alice", "db-01", json!("select 1"));
    store.create(&job).await.unwrap();
    store
        .set_status(job.id, JobStatus::Running, None)
        .await
        .unwrap();
    store
        .set_status(job.id, JobStatus::Failed, Some("relation does not exist"))
        .await
        .unwrap();

    let mut failed = store.get(job.id).await.unwrap();
    assert!(failed.failed_reason.is_some());

    failed.failed_reason = None;
    store.update(&failed).await.unwrap();

    let reloaded = store.get(job.id).await.unwrap();
    assert!(reloaded.failed_reason.is_none());
}

#[tokio::test]
async fn update_missing_job_is_not_found() {
    let (_client, manager, _container) = setup_redis().await;
    let store = RedisJobStore::new(manager, RETENTION);

    let job = test_job("alice", "db-01", json!("select 1"));
    let err = store.update(&job).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn set_status_rejects_invalid_transition() {
    let (_client, manager, _container) = setup_redis().await;
    let store = RedisJobStore::new(manager, RETENTION);

    let job = test_job("alice", "db-01", json!("select 1"));
    store.create(&job).await.unwrap();

    let err = store
        .set_status(job.id, JobStatus::Done, None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Cannot set status from pending to done");
}

#[tokio::test]
async fn racing_terminal_writers_yield_exactly_one_winner() {
    let (_client, manager, _container) = setup_redis().await;
    let store = RedisJobStore::new(manager, RETENTION);

    let job = test_job("alice", "db-01", json!("select 1"));
    store.create(&job).await.unwrap();
    store
        .set_status(job.id, JobStatus::Running, None)
        .await
        .unwrap();

    // Runner finishing and canceller cancelling at the same moment: the
    // guarded write lets exactly one transition land, the loser re-reads
    // the terminal record and fails the transition table.
    let (done_store, cancel_store) = (store.clone(), store.clone());
    let id = job.id;
    let done = tokio::spawn(async move {
        done_store.set_status(id, JobStatus::Done, None).await
    });
    let cancelled = tokio::spawn(async move {
        cancel_store.set_status(id, JobStatus::Cancelled, None).await
    });
    let done = done.await.unwrap();
    let cancelled = cancelled.await.unwrap();

    assert!(done.is_ok() != cancelled.is_ok());
    let final_status = store.get(id).await.unwrap().status;
    if done.is_ok() {
        assert_eq!(final_status, JobStatus::Done);
        assert!(matches!(
            cancelled.unwrap_err(),
            AppError::InvalidTransition { .. }
        ));
    } else {
        assert_eq!(final_status, JobStatus::Cancelled);
        assert!(matches!(
            done.unwrap_err(),
            AppError::InvalidTransition { .. }
        ));
    }
}

#[tokio::test]
async fn list_returns_user_jobs_and_prunes_expired_entries() {
    let (_client, mut manager, _container) = setup_redis().await;
    let store = RedisJobStore::new(manager.clone(), RETENTION);

    let kept = test_job("alice", "db-01", json!("select 1"));
    let expired = test_job("alice", "db-01", json!("select 2"));
    let other = test_job("bob", "db-01", json!("select 3"));
    store.create(&kept).await.unwrap();
    store.create(&expired).await.unwrap();
    store.create(&other).await.unwrap();

    // Simulate retention expiry of one record.
    let _: i64 = manager.del(format!("job:{}", expired.id)).await.unwrap();

    let ids = store.list("alice").await.unwrap();
    assert_eq!(ids, vec![kept.id]);

    // The stale index entry is gone, not just skipped.
    let remaining: Vec<String> = manager.lrange("user:alice:jobs", 0, -1).await.unwrap();
    assert_eq!(remaining, vec![kept.id.to_string()]);
}
