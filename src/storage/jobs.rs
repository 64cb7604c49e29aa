//! Durable job queue: leader lock, leased claims, retry and dead-letter
//!
//! All coordination between workers goes through the database. Claims run in
//! an `IMMEDIATE` transaction, so concurrent claimers serialise on SQLite's
//! write lock and each sees only rows still `queued`; a claimed job carries a
//! lease, and any `running` job whose lease has lapsed is recoverable by
//! [`JobRepository::recover_stale_running_jobs`].

use super::{
    duration_millis, from_millis, json_col, opt_from_millis, opt_uuid_col, parsed_col, to_millis,
    uuid_col, uuid_list_col, uuid_list_json, Database,
};
use crate::error::{Result, StewardError};
use crate::redaction::{redact, redact_map};
use crate::steward::types::{
    ExecutionResult, Event, FailureBreakdown, Job, JobStatus, MetricsSummary, NewJob,
    ProjectQueueDepth, QueueHealthSummary, Run, RunFilters, RunStatus, JOB_TYPE_AUTO_MERGE,
    JOB_TYPE_DERIVE, JOB_TYPE_POLICY_TUNE, SCHEMA_VERSION,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use rusqlite::{params, params_from_iter, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Advisory key for the singleton steward leader
pub const LEADER_LOCK_KEY: i64 = 84_201_001;

pub const AUTO_MERGE_PRIORITY: i64 = 100;
pub const DERIVE_PRIORITY: i64 = 50;
pub const POLICY_TUNE_PRIORITY: i64 = 20;

const JOB_COLUMNS: &str = "id, job_type, project_id, source_memory_ids, trigger_reason, payload, \
     status, priority, attempt_count, max_attempts, run_after, locked_by, locked_at, \
     lease_expires_at, last_error, idempotency_key, cancelled_at, created_at, updated_at";

const RUN_COLUMNS: &str = "r.id, r.job_id, j.job_type, j.project_id, r.provider, r.model, \
     r.input_snapshot, r.output_snapshot, r.prompt_tokens, r.completion_tokens, r.total_tokens, \
     r.latency_ms, r.status, r.error_class, r.error_message, r.created_at, r.completed_at";

const DEFAULT_RUN_PAGE: i64 = 50;
const DEFAULT_EVENT_PAGE: i64 = 200;

/// Exponential retry delay with jitter
///
/// The base is `2^(attempt-1)` seconds, capped at `2^6`; jitter is uniform
/// over `[0, base/4)`.
pub fn backoff_with_jitter(attempt: i64) -> Duration {
    let attempt = attempt.max(1);
    let base_ms: u64 = 1000u64 << (attempt - 1).min(6);
    let jitter_ms = rand::thread_rng().gen_range(0..base_ms / 4);
    Duration::from_millis(base_ms + jitter_ms)
}

#[derive(Debug, Clone)]
pub struct JobRepository {
    db: Database,
}

impl JobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Try to take the singleton lock `key` for `holder`
    ///
    /// Succeeds when the lock is free, already held by `holder` (which
    /// refreshes the lease), or held by someone whose lease expired.
    pub async fn acquire_leader_lock(&self, key: i64, holder: &str, ttl: Duration) -> Result<bool> {
        let holder = holder.to_string();
        let now = Utc::now();
        let expires = now + chrono_duration(ttl);
        self.db
            .interact(move |conn| {
                let changed = conn.execute(
                    "INSERT INTO steward_leader_locks (lock_key, holder, acquired_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (lock_key) DO UPDATE
                        SET holder = excluded.holder,
                            acquired_at = CASE WHEN steward_leader_locks.holder = excluded.holder
                                               THEN steward_leader_locks.acquired_at
                                               ELSE excluded.acquired_at END,
                            expires_at = excluded.expires_at
                        WHERE steward_leader_locks.holder = excluded.holder
                           OR steward_leader_locks.expires_at < ?3",
                    params![key, holder, to_millis(now), to_millis(expires)],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    /// Release `key` if `holder` owns it; returns whether a lock was dropped
    pub async fn release_leader_lock(&self, key: i64, holder: &str) -> Result<bool> {
        let holder = holder.to_string();
        self.db
            .interact(move |conn| {
                let changed = conn.execute(
                    "DELETE FROM steward_leader_locks WHERE lock_key = ?1 AND holder = ?2",
                    params![key, holder],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    /// Requeue or dead-letter `running` jobs whose lease expired before `stale_before`
    pub async fn recover_stale_running_jobs(&self, stale_before: DateTime<Utc>) -> Result<usize> {
        let cutoff = to_millis(stale_before);
        let now = to_millis(Utc::now());
        let recovered = self
            .db
            .interact(move |conn| {
                Ok(conn.execute(
                    "UPDATE steward_jobs
                     SET status = CASE WHEN attempt_count + 1 >= max_attempts
                                       THEN 'dead_letter' ELSE 'queued' END,
                         run_after = CASE WHEN attempt_count + 1 >= max_attempts
                                          THEN run_after ELSE ?2 END,
                         last_error = COALESCE(last_error, 'recovered stale running job'),
                         locked_by = NULL,
                         locked_at = NULL,
                         lease_expires_at = NULL,
                         updated_at = ?2
                     WHERE status = 'running'
                       AND lease_expires_at IS NOT NULL
                       AND lease_expires_at < ?1",
                    params![cutoff, now],
                )?)
            })
            .await?;
        if recovered > 0 {
            info!("Recovered {} stale running jobs", recovered);
        }
        Ok(recovered)
    }

    /// Atomically claim up to `batch_size` eligible jobs for `worker_id`
    ///
    /// Jobs come back ordered by priority (highest first), then creation time.
    pub async fn claim_jobs(
        &self,
        worker_id: &str,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<Job>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let worker_id = worker_id.to_string();
        let lease_ms = duration_millis(lease);

        let mut jobs = self
            .db
            .interact(move |conn| {
                let now = to_millis(Utc::now());
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let jobs = {
                    let sql = format!(
                        "UPDATE steward_jobs
                         SET status = 'running',
                             locked_by = ?1,
                             locked_at = ?2,
                             lease_expires_at = ?3,
                             updated_at = ?2
                         WHERE id IN (
                             SELECT id FROM steward_jobs
                             WHERE status = 'queued' AND run_after <= ?2
                             ORDER BY priority DESC, created_at ASC, rowid ASC
                             LIMIT ?4
                         )
                         RETURNING {}",
                        JOB_COLUMNS
                    );
                    let mut stmt = tx.prepare(&sql)?;
                    let rows = stmt.query_map(
                        params![worker_id, now, now.saturating_add(lease_ms), batch_size as i64],
                        row_to_job,
                    )?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };
                tx.commit()?;
                Ok(jobs)
            })
            .await?;

        // RETURNING does not preserve the subquery order
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        if !jobs.is_empty() {
            debug!("Claimed {} jobs", jobs.len());
        }
        Ok(jobs)
    }

    /// Insert a queued job; `None` when the idempotency key already exists
    pub async fn insert_job(&self, job: NewJob) -> Result<Option<Uuid>> {
        self.db
            .interact(move |conn| {
                let tx = conn.transaction()?;
                let id = insert_job_tx(&tx, &job, to_millis(Utc::now()))?;
                tx.commit()?;
                Ok(id)
            })
            .await
    }

    /// Turn high-similarity pending suggestions into auto-merge jobs
    ///
    /// Stops once `max_queued_total` jobs are queued and skips projects that
    /// already hold `max_queued_per_project`. Returns the number of jobs
    /// actually inserted.
    pub async fn enqueue_auto_merge_jobs(
        &self,
        threshold: f64,
        max_attempts: i64,
        limit: usize,
        max_queued_total: usize,
        max_queued_per_project: usize,
    ) -> Result<usize> {
        let inserted = self
            .db
            .interact(move |conn| {
                let now = to_millis(Utc::now());
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let mut queued_total: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM steward_jobs WHERE status = 'queued'",
                    [],
                    |row| row.get(0),
                )?;
                let mut per_project: HashMap<String, i64> = {
                    let mut stmt = tx.prepare(
                        "SELECT project_id, COUNT(*) FROM steward_jobs
                         WHERE status = 'queued' AND project_id IS NOT NULL
                         GROUP BY project_id",
                    )?;
                    let rows = stmt.query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?;
                    rows.collect::<rusqlite::Result<HashMap<_, _>>>()?
                };

                let candidates: Vec<(Uuid, Uuid, Uuid, f64, Option<String>)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, memory_a_id, memory_b_id, similarity, project_id
                         FROM consolidation_suggestions
                         WHERE status = 'pending' AND similarity >= ?1
                         ORDER BY similarity DESC, created_at ASC
                         LIMIT ?2",
                    )?;
                    let rows = stmt.query_map(params![threshold, limit as i64], |row| {
                        Ok((
                            uuid_col(row, 0)?,
                            uuid_col(row, 1)?,
                            uuid_col(row, 2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    })?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };

                let mut inserted = 0usize;
                for (suggestion_id, a, b, similarity, project_id) in candidates {
                    if queued_total >= max_queued_total as i64 {
                        warn!(
                            "Auto-merge enqueue stopped by backpressure (queued_total: {}, max: {})",
                            queued_total, max_queued_total
                        );
                        break;
                    }
                    if let Some(project) = &project_id {
                        if per_project.get(project).copied().unwrap_or(0)
                            >= max_queued_per_project as i64
                        {
                            debug!("Skipping auto-merge enqueue for saturated project {}", project);
                            continue;
                        }
                    }

                    let job = NewJob {
                        job_type: JOB_TYPE_AUTO_MERGE.to_string(),
                        project_id: project_id.clone(),
                        source_memory_ids: vec![a, b],
                        trigger_reason: Some("pending_suggestion_high_similarity".to_string()),
                        payload: object(json!({
                            "suggestion_id": suggestion_id.to_string(),
                            "similarity": similarity,
                            "memory_a_id": a.to_string(),
                            "memory_b_id": b.to_string(),
                            "merge_strategy": "smart_merge",
                        })),
                        priority: AUTO_MERGE_PRIORITY,
                        max_attempts,
                        run_after: None,
                        idempotency_key: Some(format!("steward:auto_merge_suggestion:{}", suggestion_id)),
                    };
                    if insert_job_tx(&tx, &job, now)?.is_some() {
                        inserted += 1;
                        queued_total += 1;
                        if let Some(project) = project_id {
                            *per_project.entry(project).or_insert(0) += 1;
                        }
                    }
                }

                tx.commit()?;
                Ok(inserted)
            })
            .await?;
        if inserted > 0 {
            debug!("Enqueued {} auto-merge jobs", inserted);
        }
        Ok(inserted)
    }

    /// Queue a derivation over `source_ids`; returns false on an idempotent repeat
    pub async fn enqueue_derive_job(
        &self,
        project_id: Option<String>,
        source_ids: Vec<Uuid>,
        payload: Map<String, Value>,
        max_attempts: i64,
        idempotency_key: &str,
    ) -> Result<bool> {
        let job = NewJob {
            job_type: JOB_TYPE_DERIVE.to_string(),
            project_id,
            source_memory_ids: source_ids,
            trigger_reason: Some("post_merge_derivation".to_string()),
            payload,
            priority: DERIVE_PRIORITY,
            max_attempts: max_attempts.max(1),
            run_after: None,
            idempotency_key: Some(idempotency_key.to_string()),
        };
        Ok(self.insert_job(job).await?.is_some())
    }

    pub async fn enqueue_policy_tune_job(
        &self,
        max_attempts: i64,
        idempotency_key: &str,
    ) -> Result<bool> {
        let key = if idempotency_key.is_empty() {
            format!("steward:policy_tune:{}", Utc::now().to_rfc3339())
        } else {
            idempotency_key.to_string()
        };
        let job = NewJob {
            job_type: JOB_TYPE_POLICY_TUNE.to_string(),
            trigger_reason: Some("periodic_self_learn".to_string()),
            priority: POLICY_TUNE_PRIORITY,
            max_attempts: max_attempts.max(1),
            idempotency_key: Some(key),
            ..Default::default()
        };
        Ok(self.insert_job(job).await?.is_some())
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        self.db
            .interact(move |conn| {
                let sql = format!("SELECT {} FROM steward_jobs WHERE id = ?1", JOB_COLUMNS);
                Ok(conn
                    .query_row(&sql, params![id.to_string()], row_to_job)
                    .optional()?)
            })
            .await
    }

    pub async fn count_queued_jobs(&self) -> Result<i64> {
        self.db
            .interact(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM steward_jobs WHERE status = 'queued'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
    }

    /// Put a failed, dead-lettered or cancelled job back on the queue now
    pub async fn retry_job(&self, id: Uuid) -> Result<bool> {
        let now = to_millis(Utc::now());
        let changed = self
            .db
            .interact(move |conn| {
                Ok(conn.execute(
                    "UPDATE steward_jobs
                     SET status = 'queued', run_after = ?2, locked_by = NULL, locked_at = NULL,
                         lease_expires_at = NULL, updated_at = ?2
                     WHERE id = ?1 AND status IN ('failed', 'dead_letter', 'cancelled')",
                    params![id.to_string(), now],
                )?)
            })
            .await?;
        if changed > 0 {
            info!("Job {} requeued by operator", id);
        }
        Ok(changed > 0)
    }

    /// Cancel a queued or running job
    ///
    /// A worker already executing the job is not interrupted; the job simply
    /// stops being eligible for future claims.
    pub async fn cancel_job(&self, id: Uuid) -> Result<bool> {
        let now = to_millis(Utc::now());
        let changed = self
            .db
            .interact(move |conn| {
                Ok(conn.execute(
                    "UPDATE steward_jobs
                     SET status = 'cancelled', cancelled_at = ?2, locked_by = NULL, locked_at = NULL,
                         lease_expires_at = NULL, updated_at = ?2
                     WHERE id = ?1 AND status IN ('queued', 'running')",
                    params![id.to_string(), now],
                )?)
            })
            .await?;
        if changed > 0 {
            info!("Job {} cancelled", id);
        }
        Ok(changed > 0)
    }

    /// Extend the lease on a claimed job; false when `job`'s claimant no
    /// longer holds it
    pub async fn renew_lease(&self, job: &Job, lease: Duration) -> Result<bool> {
        let job_id = job.id.to_string();
        let owner = job.locked_by.clone();
        let lease_ms = duration_millis(lease);
        self.db
            .interact(move |conn| {
                let now = to_millis(Utc::now());
                let changed = conn.execute(
                    "UPDATE steward_jobs
                     SET lease_expires_at = ?3, updated_at = ?4
                     WHERE id = ?1 AND status = 'running' AND locked_by IS ?2",
                    params![job_id, owner, now.saturating_add(lease_ms), now],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    /// Open the audit record for one execution attempt
    pub async fn create_run(&self, job: &Job, provider: &str, model: &str) -> Result<Run> {
        let run = Run {
            id: Uuid::new_v4(),
            job_id: Some(job.id),
            job_type: Some(job.job_type.clone()),
            project_id: job.project_id.clone(),
            provider: non_empty(provider),
            model: non_empty(model),
            input_snapshot: redact(&json!({
                "schema_version": SCHEMA_VERSION,
                "job_type": job.job_type,
                "project_id": job.project_id,
                "payload": job.payload,
                "source_memory_ids": job.source_memory_ids,
            })),
            output_snapshot: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            latency_ms: None,
            status: RunStatus::Running,
            error_class: None,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        };

        let row = run.clone();
        self.db
            .interact(move |conn| {
                conn.execute(
                    "INSERT INTO steward_runs (id, job_id, provider, model, input_snapshot, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        row.id.to_string(),
                        row.job_id.map(|id| id.to_string()),
                        row.provider,
                        row.model,
                        row.input_snapshot.to_string(),
                        row.status.as_str(),
                        to_millis(row.created_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(run)
    }

    /// Append a redacted audit event
    pub async fn append_event(
        &self,
        job_id: Uuid,
        run_id: Option<Uuid>,
        event_type: &str,
        data: Value,
    ) -> Result<()> {
        let data = match data {
            Value::Object(map) => Value::Object(redact_map(&map)),
            Value::Null => json!({}),
            other => redact(&other),
        };
        let event_type = event_type.to_string();
        self.db
            .interact(move |conn| {
                conn.execute(
                    "INSERT INTO steward_events (id, job_id, run_id, event_type, data, schema_version, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        Uuid::new_v4().to_string(),
                        job_id.to_string(),
                        run_id.map(|id| id.to_string()),
                        event_type,
                        data.to_string(),
                        SCHEMA_VERSION,
                        to_millis(Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Finalize a run as succeeded and release the job
    pub async fn mark_succeeded(&self, job: &Job, run: &Run, result: &ExecutionResult) -> Result<()> {
        let mut output = result.output.clone();
        if !result.side_effects.is_empty() {
            output.insert("side_effects".into(), Value::Array(result.side_effects.clone()));
        }
        if !result.decision.is_empty() {
            output.insert("decision".into(), Value::String(result.decision.clone()));
        }
        let output = Value::Object(redact_map(&output)).to_string();
        let metrics = result.metrics.clone().unwrap_or_default();
        let job_id = job.id.to_string();
        let run_id = run.id.to_string();
        let owner = job.locked_by.clone();

        let released = self
            .db
            .interact(move |conn| {
                let now = to_millis(Utc::now());
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE steward_runs
                     SET output_snapshot = ?2,
                         provider = COALESCE(?3, provider),
                         model = COALESCE(?4, model),
                         prompt_tokens = COALESCE(?5, prompt_tokens),
                         completion_tokens = COALESCE(?6, completion_tokens),
                         total_tokens = COALESCE(?7, total_tokens),
                         latency_ms = COALESCE(?8, latency_ms),
                         status = 'succeeded',
                         completed_at = ?9
                     WHERE id = ?1",
                    params![
                        run_id,
                        output,
                        non_empty(&metrics.provider),
                        non_empty(&metrics.model),
                        metrics.prompt_tokens,
                        metrics.completion_tokens,
                        metrics.total_tokens,
                        metrics.latency_ms,
                        now,
                    ],
                )?;
                let released = tx.execute(
                    "UPDATE steward_jobs
                     SET status = 'succeeded', locked_by = NULL, locked_at = NULL,
                         lease_expires_at = NULL, updated_at = ?2
                     WHERE id = ?1 AND status = 'running' AND locked_by IS ?3",
                    params![job_id, now, owner],
                )?;
                tx.commit()?;
                Ok(released > 0)
            })
            .await?;
        if !released {
            warn!(
                "Job {} is no longer leased to {:?}, success not recorded on the job",
                job.id, job.locked_by
            );
            return Err(StewardError::LeaseLost(job.id));
        }
        Ok(())
    }

    /// Record a failed attempt and decide the job's next state
    ///
    /// Non-retryable errors, or a failure that uses up the last attempt,
    /// dead-letter the job. Otherwise it is requeued after
    /// [`backoff_with_jitter`]. Returns the new status and the time the job
    /// becomes eligible again (now, for dead-lettered jobs).
    ///
    /// Only the worker still holding the job's lease may move it; anyone else
    /// gets [`StewardError::LeaseLost`] and the job row is left untouched.
    pub async fn mark_failure(
        &self,
        job: &Job,
        run: &Run,
        err: &StewardError,
        retryable: bool,
    ) -> Result<(JobStatus, DateTime<Utc>)> {
        let now = Utc::now();
        let error_class = err.class().to_string();
        let error_message = err.to_string();
        let next_attempt = job.attempt_count + 1;
        let dead = !retryable || next_attempt >= job.max_attempts;
        let run_after = if dead {
            now
        } else {
            now + chrono_duration(backoff_with_jitter(next_attempt))
        };
        let status = if dead {
            JobStatus::DeadLetter
        } else {
            JobStatus::Queued
        };

        let job_id = job.id.to_string();
        let run_id = run.id.to_string();
        let owner = job.locked_by.clone();
        let released = self
            .db
            .interact(move |conn| {
                let now_ms = to_millis(now);
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE steward_runs
                     SET status = 'failed', error_class = ?2, error_message = ?3, completed_at = ?4
                     WHERE id = ?1",
                    params![run_id, error_class, error_message, now_ms],
                )?;
                let released = if dead {
                    tx.execute(
                        "UPDATE steward_jobs
                         SET status = 'dead_letter', attempt_count = ?2, last_error = ?3,
                             locked_by = NULL, locked_at = NULL, lease_expires_at = NULL, updated_at = ?4
                         WHERE id = ?1 AND status = 'running' AND locked_by IS ?5",
                        params![job_id, next_attempt, error_message, now_ms, owner],
                    )?
                } else {
                    tx.execute(
                        "UPDATE steward_jobs
                         SET status = 'queued', attempt_count = ?2, run_after = ?3, last_error = ?4,
                             locked_by = NULL, locked_at = NULL, lease_expires_at = NULL, updated_at = ?5
                         WHERE id = ?1 AND status = 'running' AND locked_by IS ?6",
                        params![
                            job_id,
                            next_attempt,
                            to_millis(run_after),
                            error_message,
                            now_ms,
                            owner
                        ],
                    )?
                };
                tx.commit()?;
                Ok(released > 0)
            })
            .await?;

        if !released {
            warn!(
                "Job {} is no longer leased to {:?}, failure not recorded on the job: {}",
                job.id, job.locked_by, err
            );
            return Err(StewardError::LeaseLost(job.id));
        }

        if dead {
            warn!(
                "Job {} ({}) dead-lettered after {} attempts: {}",
                job.id, job.job_type, next_attempt, err
            );
        } else {
            info!(
                "Job {} ({}) requeued for {} after attempt {}",
                job.id,
                job.job_type,
                run_after.to_rfc3339(),
                next_attempt
            );
        }
        Ok((status, run_after))
    }

    /// Runs newest first
    pub async fn list_runs(&self, filters: RunFilters) -> Result<Vec<Run>> {
        self.db
            .interact(move |conn| {
                let mut conditions = Vec::new();
                let mut args: Vec<String> = Vec::new();
                for (column, value) in [
                    ("r.status", &filters.status),
                    ("j.job_type", &filters.job_type),
                    ("j.project_id", &filters.project_id),
                    ("r.model", &filters.model),
                ] {
                    if let Some(value) = value {
                        args.push(value.clone());
                        conditions.push(format!("{} = ?{}", column, args.len()));
                    }
                }
                let where_clause = if conditions.is_empty() {
                    String::new()
                } else {
                    format!("WHERE {}", conditions.join(" AND "))
                };
                let limit = if filters.limit <= 0 {
                    DEFAULT_RUN_PAGE
                } else {
                    filters.limit
                };
                let sql = format!(
                    "SELECT {} FROM steward_runs r
                     LEFT JOIN steward_jobs j ON j.id = r.job_id
                     {}
                     ORDER BY r.created_at DESC, r.rowid DESC
                     LIMIT {} OFFSET {}",
                    RUN_COLUMNS,
                    where_clause,
                    limit,
                    filters.offset.max(0)
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(args.iter()), row_to_run)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }

    /// Events for a job, oldest first
    pub async fn list_events(&self, job_id: Uuid, limit: i64, offset: i64) -> Result<Vec<Event>> {
        let limit = if limit <= 0 { DEFAULT_EVENT_PAGE } else { limit };
        self.db
            .interact(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, job_id, run_id, event_type, data, schema_version, created_at
                     FROM steward_events
                     WHERE job_id = ?1
                     ORDER BY created_at ASC, rowid ASC
                     LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt.query_map(
                    params![job_id.to_string(), limit, offset.max(0)],
                    |row| {
                        Ok(Event {
                            id: uuid_col(row, 0)?,
                            job_id: opt_uuid_col(row, 1)?,
                            run_id: opt_uuid_col(row, 2)?,
                            event_type: row.get(3)?,
                            data: json_col(row, 4, json!({}))?,
                            schema_version: row.get(5)?,
                            created_at: from_millis(row.get(6)?),
                        })
                    },
                )?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }

    pub async fn queue_health(&self) -> Result<QueueHealthSummary> {
        let day_ago = to_millis(Utc::now() - ChronoDuration::hours(24));
        self.db
            .interact(move |conn| {
                let queued_total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM steward_jobs WHERE status = 'queued'",
                    [],
                    |row| row.get(0),
                )?;
                let dead_letter_total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM steward_jobs WHERE status = 'dead_letter'",
                    [],
                    |row| row.get(0),
                )?;
                let average_latency: f64 = conn.query_row(
                    "SELECT COALESCE(AVG(latency_ms), 0) FROM steward_runs
                     WHERE latency_ms IS NOT NULL AND completed_at >= ?1",
                    params![day_ago],
                    |row| row.get(0),
                )?;
                let mut stmt = conn.prepare(
                    "SELECT project_id, COUNT(*) AS c FROM steward_jobs
                     WHERE status = 'queued' AND project_id IS NOT NULL
                     GROUP BY project_id
                     ORDER BY c DESC, project_id ASC
                     LIMIT 5",
                )?;
                let top = stmt
                    .query_map([], |row| {
                        Ok(ProjectQueueDepth {
                            project_id: row.get(0)?,
                            count: row.get(1)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                Ok(QueueHealthSummary {
                    queued_total,
                    queued_by_project_top: top,
                    dead_letter_total,
                    average_processing_latency_ms: average_latency.round() as i64,
                })
            })
            .await
    }

    pub async fn metrics_summary(&self) -> Result<MetricsSummary> {
        let now = Utc::now();
        let hour_ago = to_millis(now - ChronoDuration::hours(1));
        let day_ago = to_millis(now - ChronoDuration::hours(24));
        self.db
            .interact(move |conn| {
                let runs_last_hour: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM steward_runs WHERE created_at >= ?1",
                    params![hour_ago],
                    |row| row.get(0),
                )?;
                let (succeeded, total): (i64, i64) = conn.query_row(
                    "SELECT COALESCE(SUM(CASE WHEN status = 'succeeded' THEN 1 ELSE 0 END), 0), COUNT(*)
                     FROM steward_runs WHERE created_at >= ?1",
                    params![day_ago],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                let average_tokens_per_run: f64 = conn.query_row(
                    "SELECT COALESCE(AVG(total_tokens), 0) FROM steward_runs
                     WHERE total_tokens IS NOT NULL AND created_at >= ?1",
                    params![day_ago],
                    |row| row.get(0),
                )?;

                let latencies: Vec<i64> = {
                    let mut stmt = conn.prepare(
                        "SELECT latency_ms FROM steward_runs
                         WHERE latency_ms IS NOT NULL AND created_at >= ?1
                         ORDER BY latency_ms ASC",
                    )?;
                    let rows = stmt.query_map(params![day_ago], |row| row.get(0))?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };

                let top_failure_reasons = {
                    let mut stmt = conn.prepare(
                        "SELECT COALESCE(error_class, 'unknown') AS reason, COUNT(*) AS c
                         FROM steward_runs
                         WHERE status = 'failed' AND created_at >= ?1
                         GROUP BY 1
                         ORDER BY c DESC
                         LIMIT 5",
                    )?;
                    let rows = stmt.query_map(params![day_ago], |row| {
                        Ok(FailureBreakdown {
                            reason: row.get(0)?,
                            count: row.get(1)?,
                        })
                    })?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };

                Ok(MetricsSummary {
                    runs_last_hour,
                    success_rate: if total > 0 {
                        succeeded as f64 / total as f64
                    } else {
                        0.0
                    },
                    average_tokens_per_run,
                    p95_latency_ms: percentile_nearest_rank(&latencies, 0.95),
                    top_failure_reasons,
                })
            })
            .await
    }

    /// Delete runs and events older than the given number of days
    ///
    /// A value of zero or less leaves that table untouched.
    pub async fn cleanup_retention(
        &self,
        run_log_days: i64,
        event_log_days: i64,
    ) -> Result<(usize, usize)> {
        let now = Utc::now();
        let run_cutoff = (run_log_days > 0).then(|| to_millis(now - ChronoDuration::days(run_log_days)));
        let event_cutoff =
            (event_log_days > 0).then(|| to_millis(now - ChronoDuration::days(event_log_days)));
        self.db
            .interact(move |conn| {
                let runs = match run_cutoff {
                    Some(cutoff) => conn.execute(
                        "DELETE FROM steward_runs WHERE created_at < ?1",
                        params![cutoff],
                    )?,
                    None => 0,
                };
                let events = match event_cutoff {
                    Some(cutoff) => conn.execute(
                        "DELETE FROM steward_events WHERE created_at < ?1",
                        params![cutoff],
                    )?,
                    None => 0,
                };
                Ok((runs, events))
            })
            .await
    }
}

/// Insert inside an open transaction; `None` on idempotency-key conflict
fn insert_job_tx(tx: &Transaction<'_>, job: &NewJob, now: i64) -> Result<Option<Uuid>> {
    let id = Uuid::new_v4();
    let changed = tx.execute(
        "INSERT INTO steward_jobs
            (id, job_type, project_id, source_memory_ids, trigger_reason, payload, status,
             priority, attempt_count, max_attempts, run_after, idempotency_key, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7, 0, ?8, ?9, ?10, ?11, ?11)
         ON CONFLICT (idempotency_key) DO NOTHING",
        params![
            id.to_string(),
            job.job_type,
            job.project_id,
            uuid_list_json(&job.source_memory_ids),
            job.trigger_reason,
            Value::Object(job.payload.clone()).to_string(),
            job.priority,
            job.max_attempts.max(1),
            job.run_after.map(to_millis).unwrap_or(now),
            job.idempotency_key,
            now,
        ],
    )?;
    Ok((changed > 0).then_some(id))
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let payload = match json_col(row, 5, json!({}))? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok(Job {
        id: uuid_col(row, 0)?,
        job_type: row.get(1)?,
        project_id: row.get(2)?,
        source_memory_ids: uuid_list_col(row, 3)?,
        trigger_reason: row.get(4)?,
        payload,
        status: parsed_col(row, 6)?,
        priority: row.get(7)?,
        attempt_count: row.get(8)?,
        max_attempts: row.get(9)?,
        run_after: from_millis(row.get(10)?),
        locked_by: row.get(11)?,
        locked_at: opt_from_millis(row.get(12)?),
        lease_expires_at: opt_from_millis(row.get(13)?),
        last_error: row.get(14)?,
        idempotency_key: row.get(15)?,
        cancelled_at: opt_from_millis(row.get(16)?),
        created_at: from_millis(row.get(17)?),
        updated_at: from_millis(row.get(18)?),
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let status: String = row.get(12)?;
    let output: Option<String> = row.get(7)?;
    Ok(Run {
        id: uuid_col(row, 0)?,
        job_id: opt_uuid_col(row, 1)?,
        job_type: row.get(2)?,
        project_id: row.get(3)?,
        provider: row.get(4)?,
        model: row.get(5)?,
        input_snapshot: json_col(row, 6, json!({}))?,
        output_snapshot: output.and_then(|s| serde_json::from_str(&s).ok()),
        prompt_tokens: row.get(8)?,
        completion_tokens: row.get(9)?,
        total_tokens: row.get(10)?,
        latency_ms: row.get(11)?,
        status: RunStatus::parse(&status),
        error_class: row.get(13)?,
        error_message: row.get(14)?,
        created_at: from_millis(row.get(15)?),
        completed_at: opt_from_millis(row.get(16)?),
    })
}

/// Nearest-rank percentile over an ascending slice; 0 when empty
fn percentile_nearest_rank(sorted: &[i64], p: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn chrono_duration(d: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(duration_millis(d))
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
