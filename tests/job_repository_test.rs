//! Job queue behaviour against a real SQLite database

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::create_test_db;
use serde_json::{json, Map};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use steward_core::steward::types::{
    ExecutionResult, JobStatus, NewJob, RunFilters, JOB_TYPE_NOOP, JOB_TYPE_POLICY_TUNE,
};
use steward_core::storage::jobs::{JobRepository, LEADER_LOCK_KEY};
use steward_core::StewardError;

fn noop_job(priority: i64, max_attempts: i64) -> NewJob {
    NewJob {
        job_type: JOB_TYPE_NOOP.to_string(),
        priority,
        max_attempts,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_leader_lock_is_exclusive_until_expiry() {
    let (_dir, db) = create_test_db().await;
    let repo = JobRepository::new(db);
    let ttl = Duration::from_secs(60);

    assert!(repo.acquire_leader_lock(LEADER_LOCK_KEY, "a", ttl).await.unwrap());
    assert!(!repo.acquire_leader_lock(LEADER_LOCK_KEY, "b", ttl).await.unwrap());
    // Re-acquiring refreshes the holder's own lease
    assert!(repo.acquire_leader_lock(LEADER_LOCK_KEY, "a", ttl).await.unwrap());

    assert!(!repo.release_leader_lock(LEADER_LOCK_KEY, "b").await.unwrap());
    assert!(repo.release_leader_lock(LEADER_LOCK_KEY, "a").await.unwrap());
    assert!(repo.acquire_leader_lock(LEADER_LOCK_KEY, "b", ttl).await.unwrap());
}

#[tokio::test]
async fn test_expired_leader_lock_can_be_taken_over() {
    let (_dir, db) = create_test_db().await;
    let repo = JobRepository::new(db);

    assert!(repo
        .acquire_leader_lock(LEADER_LOCK_KEY, "crashed", Duration::from_millis(1))
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(repo
        .acquire_leader_lock(LEADER_LOCK_KEY, "successor", Duration::from_secs(60))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_claim_orders_by_priority_and_leases() {
    let (_dir, db) = create_test_db().await;
    let repo = JobRepository::new(db);

    let low = repo.insert_job(noop_job(1, 3)).await.unwrap().unwrap();
    let high = repo.insert_job(noop_job(100, 3)).await.unwrap().unwrap();
    let mid = repo.insert_job(noop_job(50, 3)).await.unwrap().unwrap();

    let claimed = repo
        .claim_jobs("worker-1", 10, Duration::from_secs(30))
        .await
        .unwrap();
    let ids: Vec<_> = claimed.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![high, mid, low]);
    for job in &claimed {
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.locked_by.as_deref(), Some("worker-1"));
        assert!(job.lease_expires_at.unwrap() > Utc::now());
    }

    // Nothing left to claim
    assert!(repo
        .claim_jobs("worker-2", 10, Duration::from_secs(30))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_future_jobs_are_not_claimed() {
    let (_dir, db) = create_test_db().await;
    let repo = JobRepository::new(db);
    let mut job = noop_job(10, 3);
    job.run_after = Some(Utc::now() + ChronoDuration::minutes(5));
    repo.insert_job(job).await.unwrap();

    assert!(repo
        .claim_jobs("w", 10, Duration::from_secs(30))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(repo.count_queued_jobs().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_share_a_job() {
    let (_dir, db) = create_test_db().await;
    let repo = Arc::new(JobRepository::new(db));
    for i in 0..40 {
        repo.insert_job(noop_job(i % 3, 3)).await.unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..4 {
        let repo = Arc::clone(&repo);
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let batch = repo
                    .claim_jobs(&format!("worker-{}", w), 3, Duration::from_secs(30))
                    .await
                    .unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|j| j.id));
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "job {} claimed twice", id);
        }
    }
    assert_eq!(total, 40);
}

#[tokio::test]
async fn test_idempotency_key_deduplicates() {
    let (_dir, db) = create_test_db().await;
    let repo = JobRepository::new(db);

    assert!(repo.enqueue_policy_tune_job(3, "steward:policy_tune:w1").await.unwrap());
    assert!(!repo.enqueue_policy_tune_job(3, "steward:policy_tune:w1").await.unwrap());
    assert!(repo.enqueue_policy_tune_job(3, "steward:policy_tune:w2").await.unwrap());
    assert_eq!(repo.count_queued_jobs().await.unwrap(), 2);

    let claimed = repo.claim_jobs("w", 10, Duration::from_secs(30)).await.unwrap();
    assert!(claimed.iter().all(|j| j.job_type == JOB_TYPE_POLICY_TUNE));
    assert!(claimed.iter().all(|j| j.priority == 20));
}

#[tokio::test]
async fn test_retryable_failure_requeues_with_backoff() {
    let (_dir, db) = create_test_db().await;
    let repo = JobRepository::new(db);
    let id = repo.insert_job(noop_job(1, 3)).await.unwrap().unwrap();
    let job = repo.claim_jobs("w", 1, Duration::from_secs(30)).await.unwrap().remove(0);
    let run = repo.create_run(&job, "steward", "m").await.unwrap();

    let before = Utc::now();
    let err = StewardError::Database("connection reset".into());
    let (status, run_after) = repo.mark_failure(&job, &run, &err, true).await.unwrap();
    assert_eq!(status, JobStatus::Queued);
    assert!(run_after >= before + ChronoDuration::seconds(1));

    let stored = repo.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
    assert_eq!(stored.attempt_count, 1);
    assert!(stored.locked_by.is_none());
    assert!(stored.last_error.unwrap().contains("connection reset"));

    let runs = repo.list_runs(RunFilters::default()).await.unwrap();
    assert_eq!(runs[0].error_class.as_deref(), Some("store_error"));
}

#[tokio::test]
async fn test_validation_failure_dead_letters_immediately() {
    let (_dir, db) = create_test_db().await;
    let repo = JobRepository::new(db);
    let id = repo.insert_job(noop_job(1, 5)).await.unwrap().unwrap();
    let job = repo.claim_jobs("w", 1, Duration::from_secs(30)).await.unwrap().remove(0);
    let run = repo.create_run(&job, "steward", "m").await.unwrap();

    let err = StewardError::Validation("missing payload".into());
    let (status, _) = repo
        .mark_failure(&job, &run, &err, err.is_retryable())
        .await
        .unwrap();
    assert_eq!(status, JobStatus::DeadLetter);
    assert_eq!(repo.get_job(id).await.unwrap().unwrap().status, JobStatus::DeadLetter);

    let health = repo.queue_health().await.unwrap();
    assert_eq!(health.dead_letter_total, 1);
}

#[tokio::test]
async fn test_last_attempt_dead_letters() {
    let (_dir, db) = create_test_db().await;
    let repo = JobRepository::new(db);
    repo.insert_job(noop_job(1, 1)).await.unwrap();
    let job = repo.claim_jobs("w", 1, Duration::from_secs(30)).await.unwrap().remove(0);
    let run = repo.create_run(&job, "steward", "m").await.unwrap();

    let err = StewardError::Timeout(Duration::from_secs(30));
    let (status, _) = repo.mark_failure(&job, &run, &err, true).await.unwrap();
    assert_eq!(status, JobStatus::DeadLetter);
}

#[tokio::test]
async fn test_stale_running_jobs_are_recovered() {
    let (_dir, db) = create_test_db().await;
    let repo = JobRepository::new(db);
    let retry_id = repo.insert_job(noop_job(2, 3)).await.unwrap().unwrap();
    let dead_id = repo.insert_job(noop_job(1, 1)).await.unwrap().unwrap();
    let claimed = repo.claim_jobs("crashed", 10, Duration::from_millis(1)).await.unwrap();
    assert_eq!(claimed.len(), 2);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let recovered = repo.recover_stale_running_jobs(Utc::now()).await.unwrap();
    assert_eq!(recovered, 2);

    let retry = repo.get_job(retry_id).await.unwrap().unwrap();
    assert_eq!(retry.status, JobStatus::Queued);
    assert!(retry.locked_by.is_none());
    assert!(retry.last_error.is_some());
    assert_eq!(
        repo.get_job(dead_id).await.unwrap().unwrap().status,
        JobStatus::DeadLetter
    );
}

#[tokio::test]
async fn test_live_leases_are_not_recovered() {
    let (_dir, db) = create_test_db().await;
    let repo = JobRepository::new(db);
    repo.insert_job(noop_job(1, 3)).await.unwrap();
    repo.claim_jobs("alive", 1, Duration::from_secs(60)).await.unwrap();
    assert_eq!(repo.recover_stale_running_jobs(Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_retry_and_cancel() {
    let (_dir, db) = create_test_db().await;
    let repo = JobRepository::new(db);
    let id = repo.insert_job(noop_job(1, 3)).await.unwrap().unwrap();

    // Queued jobs cannot be retried, only cancelled
    assert!(!repo.retry_job(id).await.unwrap());
    assert!(repo.cancel_job(id).await.unwrap());
    let cancelled = repo.get_job(id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());

    assert!(!repo.cancel_job(id).await.unwrap());
    assert!(repo.retry_job(id).await.unwrap());
    assert_eq!(repo.get_job(id).await.unwrap().unwrap().status, JobStatus::Queued);
}

#[tokio::test]
async fn test_success_is_audited_and_redacted() {
    let (_dir, db) = create_test_db().await;
    let repo = JobRepository::new(db);
    let mut payload = Map::new();
    payload.insert("api_key".into(), json!("sk-live-1234567890abcdef"));
    let id = repo
        .insert_job(NewJob {
            job_type: JOB_TYPE_NOOP.into(),
            payload,
            max_attempts: 3,
            ..Default::default()
        })
        .await
        .unwrap()
        .unwrap();
    let job = repo.claim_jobs("w", 1, Duration::from_secs(30)).await.unwrap().remove(0);
    let run = repo.create_run(&job, "steward", "m").await.unwrap();
    assert!(!run.input_snapshot.to_string().contains("sk-live"));

    repo.append_event(
        id,
        Some(run.id),
        "decision_emitted",
        json!({"note": "retry with Bearer abcdefgh12345"}),
    )
    .await
    .unwrap();
    let result = ExecutionResult::new("noop").with_output(json!({"token": "abc"}));
    repo.mark_succeeded(&job, &run, &result).await.unwrap();

    assert_eq!(repo.get_job(id).await.unwrap().unwrap().status, JobStatus::Succeeded);
    let events = repo.list_events(id, 0, 0).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(!events[0].data.to_string().contains("abcdefgh12345"));
    assert_eq!(events[0].data["_redacted"], true);

    let runs = repo.list_runs(RunFilters::default()).await.unwrap();
    let output = runs[0].output_snapshot.clone().unwrap();
    assert_eq!(output["decision"], "noop");
    assert_eq!(output["token"], "REDACTED");
}

#[tokio::test]
async fn test_late_completion_after_takeover_is_rejected() {
    let (_dir, db) = create_test_db().await;
    let repo = JobRepository::new(db);
    let id = repo.insert_job(noop_job(1, 3)).await.unwrap().unwrap();

    let stale = repo
        .claim_jobs("slow-worker", 1, Duration::from_millis(1))
        .await
        .unwrap()
        .remove(0);
    let stale_run = repo.create_run(&stale, "steward", "m").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(repo.recover_stale_running_jobs(Utc::now()).await.unwrap(), 1);

    let current = repo
        .claim_jobs("new-owner", 1, Duration::from_secs(60))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(current.id, id);

    let err = StewardError::Validation("late".into());
    let late = repo.mark_failure(&stale, &stale_run, &err, false).await;
    assert!(matches!(late, Err(StewardError::LeaseLost(job_id)) if job_id == id));
    let late = repo
        .mark_succeeded(&stale, &stale_run, &ExecutionResult::new("noop"))
        .await;
    assert!(matches!(late, Err(StewardError::LeaseLost(_))));
    assert!(!repo.renew_lease(&stale, Duration::from_secs(60)).await.unwrap());

    let stored = repo.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.locked_by.as_deref(), Some("new-owner"));
    assert_eq!(stored.attempt_count, 0);

    // The current owner still finishes normally
    assert!(repo.renew_lease(&current, Duration::from_secs(60)).await.unwrap());
    let run = repo.create_run(&current, "steward", "m").await.unwrap();
    repo.mark_succeeded(&current, &run, &ExecutionResult::new("noop"))
        .await
        .unwrap();
    assert_eq!(repo.get_job(id).await.unwrap().unwrap().status, JobStatus::Succeeded);
}

#[tokio::test]
async fn test_unknown_status_is_a_read_error() {
    let (_dir, db) = create_test_db().await;
    let repo = JobRepository::new(db.clone());
    let id = repo.insert_job(noop_job(1, 3)).await.unwrap().unwrap();

    let target = id.to_string();
    db.interact(move |conn| {
        conn.execute(
            "UPDATE steward_jobs SET status = 'bogus' WHERE id = ?1",
            [target],
        )?;
        Ok(())
    })
    .await
    .unwrap();

    assert!(repo.get_job(id).await.is_err());
    assert!(repo
        .claim_jobs("w", 10, Duration::from_secs(30))
        .await
        .unwrap()
        .is_empty());
}
