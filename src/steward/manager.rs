//! Steward manager: leader election, scheduling and job execution
//!
//! One process at a time holds the leader lock and drives the tick: it
//! recovers abandoned jobs, enqueues new work from pending suggestions and
//! the self-learning schedule, claims a batch and executes it. Every
//! execution attempt is audited as a run plus an ordered list of events.

use super::auto_merge::AutoMergeExecutor;
use super::breaker::{BreakerSnapshot, CircuitBreaker};
use super::derivation::DerivationExecutor;
use super::executor::Registry;
use super::payload::JobPayload;
use super::policy_tuner::PolicyTuneExecutor;
use super::types::{
    Event, ExecutionResult, Job, JobStatus, LivePolicy, MetricsSummary, ModelMetrics, PolicyChange,
    PolicyKey, PolicyValues, QueueHealthSummary, Run, RunFilters, JOB_TYPE_AUTO_MERGE,
    JOB_TYPE_DERIVE, JOB_TYPE_POLICY_TUNE, SCHEMA_VERSION,
};
use crate::config::StewardConfig;
use crate::error::{Result, StewardError};
use crate::memory::MemoryService;
use crate::services::decision::MergeDecider;
use crate::storage::consolidation::ConsolidationRepository;
use crate::storage::jobs::{JobRepository, LEADER_LOCK_KEY};
use crate::storage::policy::PolicyRepository;
use crate::storage::Database;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Provider recorded on every run
pub const RUN_PROVIDER: &str = "steward";

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const DEFAULT_POLICY_PAGE: i64 = 50;

#[derive(Debug, Clone, Serialize)]
pub struct Backpressure {
    pub max_queued_total: usize,
    pub max_queued_per_project: usize,
}

/// Operator-facing view of the manager
#[derive(Debug, Clone, Serialize)]
pub struct StewardStatus {
    pub enabled: bool,
    pub dry_run: bool,
    pub paused: bool,
    pub is_leader: bool,
    pub worker_id: String,
    pub tick_interval_secs: u64,
    pub model: String,
    pub health: QueueHealthSummary,
    pub startup_recovered_stale_jobs: usize,
    pub circuit_breaker: BreakerSnapshot,
    pub backpressure: Backpressure,
    pub auto_merge_threshold: f64,
    pub derivation_min_confidence: f64,
    pub derivation_min_novelty: f64,
}

#[derive(Debug, Default)]
struct ManagerState {
    is_leader: bool,
    startup_recovered_stale_jobs: usize,
    health: QueueHealthSummary,
    last_policy_eval: Option<DateTime<Utc>>,
    last_retention_sweep: Option<DateTime<Utc>>,
}

struct Inner {
    config: StewardConfig,
    worker_id: String,
    jobs: JobRepository,
    policy_repo: PolicyRepository,
    registry: Registry,
    breaker: Arc<CircuitBreaker>,
    policy: LivePolicy,
    state: Mutex<ManagerState>,
}

/// Handle to the steward; cheap to share behind an `Arc`
pub struct Manager {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// Build a manager and register the auto-merge, derivation and
    /// policy-tune executors
    ///
    /// `decider` is only consulted when the conflict guard is enabled.
    pub fn new(
        db: Database,
        memory: Arc<dyn MemoryService>,
        config: StewardConfig,
        decider: Option<Arc<dyn MergeDecider>>,
    ) -> Self {
        let jobs = JobRepository::new(db.clone());
        let policy_repo = PolicyRepository::new(db.clone());
        let consolidation = ConsolidationRepository::new(db);
        let breaker = Arc::new(CircuitBreaker::from_config(&config.breaker));
        let policy = LivePolicy::new(PolicyValues {
            auto_merge_threshold: config.auto_merge_threshold,
            derivation_min_confidence: config.derivation.min_confidence,
            derivation_min_novelty: config.derivation.min_novelty,
            dry_run: config.dry_run,
            paused: false,
        });

        let mut auto_merge = AutoMergeExecutor::new(
            jobs.clone(),
            consolidation,
            Arc::clone(&memory),
            policy.clone(),
            Arc::clone(&breaker),
        );
        match decider {
            Some(decider) if config.llm_conflict_guard_enabled => {
                auto_merge = auto_merge.with_conflict_guard(decider);
            }
            None if config.llm_conflict_guard_enabled => {
                warn!("LLM conflict guard enabled but no decision client configured");
            }
            _ => {}
        }

        let mut registry = Registry::new();
        registry.register(JOB_TYPE_AUTO_MERGE, Arc::new(auto_merge));
        registry.register(
            JOB_TYPE_DERIVE,
            Arc::new(DerivationExecutor::new(
                policy_repo.clone(),
                memory,
                config.derivation.clone(),
                policy.clone(),
            )),
        );
        registry.register(
            JOB_TYPE_POLICY_TUNE,
            Arc::new(PolicyTuneExecutor::new(
                policy_repo.clone(),
                policy.clone(),
                config.self_learn.min_sample_size,
            )),
        );

        let worker_id = format!("steward-{}", Uuid::new_v4());
        debug!(
            "Steward {} registered executors: {:?}",
            worker_id,
            registry.job_types()
        );

        Self {
            inner: Arc::new(Inner {
                config,
                worker_id,
                jobs,
                policy_repo,
                registry,
                breaker,
                policy,
                state: Mutex::new(ManagerState::default()),
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Shared handle to the live thresholds and mode flags
    pub fn policy(&self) -> LivePolicy {
        self.inner.policy.clone()
    }

    /// Spawn the scheduling loop; does nothing when the steward is disabled
    pub async fn start(&self) {
        if !self.inner.config.enabled {
            info!("Steward disabled, not starting");
            return;
        }
        if let Err(e) = self.inner.reload_policy().await {
            warn!("Failed to load policy history, using configured values: {}", e);
        }
        let mut task = self.task.lock().await;
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        *task = Some(tokio::spawn(async move {
            inner.run_loop(cancel).await;
        }));
        info!(
            "Steward {} started (tick every {}s, dry_run={})",
            self.inner.worker_id,
            self.inner.config.tick_interval.as_secs(),
            self.inner.policy.snapshot().await.dry_run
        );
    }

    /// Cancel the loop, wait for it and give up leadership
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            handle
                .await
                .map_err(|e| StewardError::Other(format!("Failed to stop steward task: {}", e)))?;
        }
        self.inner.release_leader_lock().await;
        info!("Steward {} stopped", self.inner.worker_id);
        Ok(())
    }

    /// Perform a single tick on demand
    pub async fn run_once(&self) -> Result<()> {
        self.inner.tick().await
    }

    /// Execute one already-claimed job
    pub async fn execute_job(&self, job: Job) -> Result<()> {
        self.inner.execute_job(job).await
    }

    pub async fn status(&self) -> StewardStatus {
        self.inner.status().await
    }

    pub async fn set_mode(&self, paused: bool, dry_run: bool) -> StewardStatus {
        self.inner
            .policy
            .update(|p| {
                p.paused = paused;
                p.dry_run = dry_run;
            })
            .await;
        info!("Steward mode set: paused={}, dry_run={}", paused, dry_run);
        self.inner.status().await
    }

    /// Apply the latest recorded value of every tunable to the live policy
    ///
    /// Keys without history keep their configured value. Runs at the start of
    /// every tick, so changes recorded by another process take effect on the
    /// next tick.
    pub async fn reload_policy(&self) -> Result<PolicyValues> {
        self.inner.reload_policy().await
    }

    /// Revert the latest change of `policy_key` and apply the reverted value
    pub async fn rollback_policy(&self, policy_key: &str) -> Result<PolicyChange> {
        let key: PolicyKey = policy_key.parse()?;
        let change = self.inner.policy_repo.rollback_latest(key.as_str()).await?;
        if let Some(value) = change.new_value {
            self.inner.policy.update(|p| p.set(key, value)).await;
        }
        Ok(change)
    }

    pub async fn list_policy_changes(
        &self,
        policy_key: Option<String>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<PolicyChange>> {
        let limit = if limit <= 0 { DEFAULT_POLICY_PAGE } else { limit };
        self.inner
            .policy_repo
            .list_policy_changes(policy_key, limit, offset)
            .await
    }

    pub async fn retry_job(&self, id: Uuid) -> Result<()> {
        if !self.inner.jobs.retry_job(id).await? {
            return Err(StewardError::NotFound(format!("no retryable job {}", id)));
        }
        Ok(())
    }

    pub async fn cancel_job(&self, id: Uuid) -> Result<()> {
        if !self.inner.jobs.cancel_job(id).await? {
            return Err(StewardError::NotFound(format!("no cancellable job {}", id)));
        }
        Ok(())
    }

    pub async fn list_runs(&self, filters: RunFilters) -> Result<Vec<Run>> {
        self.inner.jobs.list_runs(filters).await
    }

    pub async fn list_events(&self, job_id: Uuid, limit: i64, offset: i64) -> Result<Vec<Event>> {
        self.inner.jobs.list_events(job_id, limit, offset).await
    }

    pub async fn metrics(&self) -> Result<MetricsSummary> {
        self.inner.jobs.metrics_summary().await
    }

    /// Re-read queue health and update the snapshot reported by `status`
    pub async fn queue_health(&self) -> Result<QueueHealthSummary> {
        let health = self.inner.jobs.queue_health().await?;
        self.inner.state.lock().await.health = health.clone();
        Ok(health)
    }
}

impl Inner {
    async fn reload_policy(&self) -> Result<PolicyValues> {
        let mut recorded = Vec::new();
        for key in PolicyKey::ALL {
            if let Some(change) = self.policy_repo.find_latest_policy_change(key.as_str()).await? {
                if let Some(value) = change.new_value {
                    recorded.push((key, value));
                }
            }
        }
        Ok(self
            .policy
            .update(|p| {
                for (key, value) in recorded {
                    if p.get(key) != value {
                        debug!("Policy {} loaded from history: {} -> {}", key, p.get(key), value);
                        p.set(key, value);
                    }
                }
                p.clone()
            })
            .await)
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        if self.try_become_leader().await {
            match self.jobs.recover_stale_running_jobs(Utc::now()).await {
                Ok(n) => self.state.lock().await.startup_recovered_stale_jobs = n,
                Err(e) => warn!("Startup stale-job recovery failed: {}", e),
            }
        }

        let mut timer = interval(self.config.tick_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Steward loop received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("Steward tick failed: {}", e);
                    }
                }
            }
        }
    }

    async fn try_become_leader(&self) -> bool {
        let acquired = match self
            .jobs
            .acquire_leader_lock(LEADER_LOCK_KEY, &self.worker_id, self.config.leader_ttl())
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!("Leader lock acquisition failed: {}", e);
                false
            }
        };
        let mut state = self.state.lock().await;
        if acquired && !state.is_leader {
            info!("Steward {} acquired leadership", self.worker_id);
        } else if !acquired && state.is_leader {
            warn!("Steward {} lost leadership", self.worker_id);
        }
        state.is_leader = acquired;
        acquired
    }

    async fn release_leader_lock(&self) {
        let mut state = self.state.lock().await;
        if !state.is_leader {
            return;
        }
        match self
            .jobs
            .release_leader_lock(LEADER_LOCK_KEY, &self.worker_id)
            .await
        {
            Ok(_) => info!("Steward {} released leadership", self.worker_id),
            Err(e) => warn!("Leader lock release failed: {}", e),
        }
        state.is_leader = false;
    }

    async fn tick(&self) -> Result<()> {
        if self.policy.snapshot().await.paused {
            debug!("Steward paused, skipping tick");
            return Ok(());
        }
        // Also refreshes the lease when already leader.
        if !self.try_become_leader().await {
            return Ok(());
        }
        let policy = self.reload_policy().await?;

        self.jobs.recover_stale_running_jobs(Utc::now()).await?;

        let max_attempts = i64::from(self.config.max_attempts);
        if self.config.auto_merge_from_suggestions {
            match self
                .jobs
                .enqueue_auto_merge_jobs(
                    policy.auto_merge_threshold,
                    max_attempts,
                    self.config.claim_batch_size * 4,
                    self.config.max_queued_total(),
                    self.config.max_queued_per_project(),
                )
                .await
            {
                Ok(0) => {}
                Ok(n) => debug!("Enqueued {} auto-merge jobs", n),
                Err(e) => warn!("Failed to enqueue auto-merge jobs: {}", e),
            }
        }

        self.maybe_enqueue_policy_tune(max_attempts).await;
        self.maybe_run_retention_cleanup().await;

        let claimed = self
            .jobs
            .claim_jobs(
                &self.worker_id,
                self.config.claim_batch_size,
                self.config.lease_duration(),
            )
            .await?;
        if !claimed.is_empty() {
            debug!("Claimed {} jobs", claimed.len());
        }
        let lease = self.config.lease_duration();
        for (i, job) in claimed.into_iter().enumerate() {
            // Earlier jobs in the batch may have outlived the leader lease
            if i > 0 && !self.try_become_leader().await {
                warn!(
                    "Steward {} lost leadership mid-batch, leaving remaining jobs to recovery",
                    self.worker_id
                );
                break;
            }
            match self.jobs.renew_lease(&job, lease).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Lease on job {} was taken over, skipping", job.id);
                    continue;
                }
                Err(e) => {
                    warn!("Failed to renew lease on job {}: {}", job.id, e);
                    continue;
                }
            }
            let (id, job_type) = (job.id, job.job_type.clone());
            if let Err(e) = self.execute_job(job).await {
                error!("Bookkeeping for job {} ({}) failed: {}", id, job_type, e);
            }
        }

        self.refresh_health().await;
        Ok(())
    }

    async fn maybe_enqueue_policy_tune(&self, max_attempts: i64) {
        let self_learn = &self.config.self_learn;
        if !self_learn.enabled || self_learn.eval_interval.is_zero() {
            return;
        }
        let now = Utc::now();
        let eval_interval =
            ChronoDuration::from_std(self_learn.eval_interval).unwrap_or(ChronoDuration::hours(24));
        let due = match self.state.lock().await.last_policy_eval {
            None => true,
            Some(last) => now - last >= eval_interval,
        };
        if !due {
            return;
        }

        let max_queued_total = self.config.max_queued_total();
        match self.jobs.count_queued_jobs().await {
            Err(e) => {
                warn!("Failed to read queue depth before policy tune: {}", e);
                return;
            }
            Ok(queued) if queued >= max_queued_total as i64 => {
                warn!(
                    "Skipping policy tune enqueue, {} jobs queued (max {})",
                    queued, max_queued_total
                );
                return;
            }
            Ok(_) => {}
        }

        let window = now.duration_trunc(eval_interval).unwrap_or(now);
        let key = format!(
            "steward:policy_tune:{}",
            window.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        match self.jobs.enqueue_policy_tune_job(max_attempts, &key).await {
            Ok(inserted) => {
                if inserted {
                    debug!("Enqueued policy tune job {}", key);
                }
                self.state.lock().await.last_policy_eval = Some(now);
            }
            Err(e) => warn!("Failed to enqueue policy tune job: {}", e),
        }
    }

    async fn maybe_run_retention_cleanup(&self) {
        let retention = &self.config.retention;
        if retention.run_log_days <= 0 && retention.event_log_days <= 0 {
            return;
        }
        let now = Utc::now();
        let due = match self.state.lock().await.last_retention_sweep {
            None => true,
            Some(last) => (now - last).to_std().unwrap_or_default() >= RETENTION_SWEEP_INTERVAL,
        };
        if !due {
            return;
        }

        match self
            .jobs
            .cleanup_retention(retention.run_log_days, retention.event_log_days)
            .await
        {
            Ok((runs, events)) => {
                self.state.lock().await.last_retention_sweep = Some(now);
                if runs > 0 || events > 0 {
                    info!(
                        "Retention cleanup deleted {} runs and {} events",
                        runs, events
                    );
                }
            }
            Err(e) => warn!("Retention cleanup failed: {}", e),
        }
    }

    async fn refresh_health(&self) {
        match self.jobs.queue_health().await {
            Ok(health) => self.state.lock().await.health = health,
            Err(e) => warn!("Failed to refresh queue health: {}", e),
        }
    }

    fn breaker_applies(&self, job: &Job) -> bool {
        self.config.llm_conflict_guard_enabled && job.job_type == JOB_TYPE_AUTO_MERGE
    }

    async fn emit(&self, job: &Job, run: &Run, event_type: &str, data: Value) {
        if let Err(e) = self
            .jobs
            .append_event(job.id, Some(run.id), event_type, data)
            .await
        {
            warn!("Failed to append {} event for job {}: {}", event_type, job.id, e);
        }
    }

    async fn dispatch(&self, job: &Job) -> Result<ExecutionResult> {
        let payload = JobPayload::from_job(job)?;
        self.registry
            .executor_for(&job.job_type)
            .execute(job, &payload)
            .await
    }

    /// Run `job` through its executor and record the outcome
    ///
    /// Executor failures are recorded on the job (requeue or dead-letter)
    /// and do not surface as errors; only failures of the bookkeeping itself
    /// are returned.
    async fn execute_job(&self, job: Job) -> Result<()> {
        let started = Instant::now();
        let dry_run = self.policy.snapshot().await.dry_run;
        let run = self
            .jobs
            .create_run(&job, RUN_PROVIDER, &self.config.model)
            .await?;

        self.emit(
            &job,
            &run,
            "job_claimed",
            json!({"worker_id": self.worker_id, "attempt_count": job.attempt_count}),
        )
        .await;
        self.emit(
            &job,
            &run,
            "run_started",
            json!({"schema_version": SCHEMA_VERSION, "dry_run": dry_run}),
        )
        .await;
        self.emit(
            &job,
            &run,
            "input_prepared",
            json!({
                "job_type": job.job_type,
                "project_id": job.project_id,
                "source_memory_ids": job.source_memory_ids,
            }),
        )
        .await;

        let outcome = match tokio::time::timeout(self.config.request_timeout, self.dispatch(&job))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(StewardError::Timeout(self.config.request_timeout)),
        };

        let mut result = match outcome {
            Ok(result) => result,
            Err(err) => {
                if self.breaker_applies(&job) {
                    self.breaker.record_failure().await;
                }
                let (status, requeued_for) = match self
                    .jobs
                    .mark_failure(&job, &run, &err, err.is_retryable())
                    .await
                {
                    Err(StewardError::LeaseLost(_)) => {
                        warn!("Job {} failed after its lease was lost: {}", job.id, err);
                        return Ok(());
                    }
                    other => other?,
                };
                let requeued_for = (status == JobStatus::Queued)
                    .then(|| requeued_for.to_rfc3339_opts(SecondsFormat::Millis, true));
                self.emit(
                    &job,
                    &run,
                    "job_failed",
                    json!({"status": status.as_str(), "requeued_for": requeued_for}),
                )
                .await;
                warn!("Job {} ({}) failed: {}", job.id, job.job_type, err);
                return Ok(());
            }
        };

        let model_metrics = result.metrics.clone();
        if self.breaker_applies(&job) && model_metrics.is_some() {
            self.breaker.record_success().await;
        }
        let latency_ms = started.elapsed().as_millis() as i64;
        match result.metrics.as_mut() {
            Some(metrics) if metrics.latency_ms.is_none() => metrics.latency_ms = Some(latency_ms),
            Some(_) => {}
            None => {
                result.metrics = Some(ModelMetrics {
                    latency_ms: Some(latency_ms),
                    ..Default::default()
                })
            }
        }
        let latency_ms = result
            .metrics
            .as_ref()
            .and_then(|m| m.latency_ms)
            .unwrap_or(latency_ms);

        if let Some(metrics) = model_metrics {
            self.emit(
                &job,
                &run,
                "model_called",
                json!({
                    "provider": metrics.provider,
                    "model": metrics.model,
                    "prompt_tokens": metrics.prompt_tokens,
                    "completion_tokens": metrics.completion_tokens,
                    "total_tokens": metrics.total_tokens,
                    "latency_ms": metrics.latency_ms.unwrap_or(latency_ms),
                }),
            )
            .await;
            self.emit(
                &job,
                &run,
                "model_returned",
                json!({"decision": result.decision}),
            )
            .await;
        }

        self.emit(
            &job,
            &run,
            "decision_emitted",
            json!({"decision": result.decision, "side_effects": result.side_effects}),
        )
        .await;

        if dry_run {
            result.output.insert("dry_run".to_string(), Value::Bool(true));
            self.emit(&job, &run, "write_attempted", json!({"dry_run": true}))
                .await;
            self.emit(
                &job,
                &run,
                "write_skipped",
                json!({"reason": "dry_run", "side_effects": result.side_effects}),
            )
            .await;
        } else {
            self.emit(&job, &run, "write_attempted", json!({"dry_run": false}))
                .await;
            self.emit(
                &job,
                &run,
                "write_applied",
                json!({"decision": result.decision, "side_effects": result.side_effects}),
            )
            .await;
        }

        match self.jobs.mark_succeeded(&job, &run, &result).await {
            Err(StewardError::LeaseLost(_)) => {
                warn!(
                    "Job {} finished after its lease was lost, leaving it to the new owner",
                    job.id
                );
                return Ok(());
            }
            other => other?,
        }

        let summary = json!({"decision": result.decision, "latency_ms": latency_ms});
        self.emit(&job, &run, "run_succeeded", summary.clone()).await;
        self.emit(&job, &run, "job_completed", summary).await;
        debug!(
            "Job {} ({}) completed: {} in {}ms",
            job.id, job.job_type, result.decision, latency_ms
        );
        Ok(())
    }

    async fn status(&self) -> StewardStatus {
        let policy = self.policy.snapshot().await;
        let circuit_breaker = self.breaker.snapshot().await;
        let state = self.state.lock().await;
        StewardStatus {
            enabled: self.config.enabled,
            dry_run: policy.dry_run,
            paused: policy.paused,
            is_leader: state.is_leader,
            worker_id: self.worker_id.clone(),
            tick_interval_secs: self.config.tick_interval.as_secs(),
            model: self.config.model.clone(),
            health: state.health.clone(),
            startup_recovered_stale_jobs: state.startup_recovered_stale_jobs,
            circuit_breaker,
            backpressure: Backpressure {
                max_queued_total: self.config.max_queued_total(),
                max_queued_per_project: self.config.max_queued_per_project(),
            },
            auto_merge_threshold: policy.auto_merge_threshold,
            derivation_min_confidence: policy.derivation_min_confidence,
            derivation_min_novelty: policy.derivation_min_novelty,
        }
    }
}
