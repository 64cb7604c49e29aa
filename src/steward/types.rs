//! Steward job queue, audit and policy types

use crate::error::{Result, StewardError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const JOB_TYPE_AUTO_MERGE: &str = "auto_merge_from_suggestion";
pub const JOB_TYPE_DERIVE: &str = "derive_memories";
pub const JOB_TYPE_POLICY_TUNE: &str = "policy_tune";
pub const JOB_TYPE_NOOP: &str = "noop";

/// Version stamped on run input snapshots and events
pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    DeadLetter,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::DeadLetter | JobStatus::Cancelled
        )
    }
}

impl FromStr for JobStatus {
    type Err = StewardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "dead_letter" => Ok(JobStatus::DeadLetter),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(StewardError::Validation(format!("unknown job status: {}", other))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "succeeded" => RunStatus::Succeeded,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }
}

/// A unit of scheduled background work
///
/// A `Running` job always carries a lease expiry; once that passes the job is
/// considered abandoned and stale-job recovery may requeue it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub project_id: Option<String>,
    pub source_memory_ids: Vec<Uuid>,
    pub trigger_reason: Option<String>,
    pub payload: Map<String, Value>,
    pub status: JobStatus,
    pub priority: i64,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub run_after: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub idempotency_key: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for inserting a job
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub job_type: String,
    pub project_id: Option<String>,
    pub source_memory_ids: Vec<Uuid>,
    pub trigger_reason: Option<String>,
    pub payload: Map<String, Value>,
    pub priority: i64,
    pub max_attempts: i64,
    /// Defaults to now
    pub run_after: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

/// One audited execution attempt of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub job_type: Option<String>,
    pub project_id: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub input_snapshot: Value,
    pub output_snapshot: Option<Value>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub latency_ms: Option<i64>,
    pub status: RunStatus,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
    pub event_type: String,
    pub data: Value,
    pub schema_version: i64,
    pub created_at: DateTime<Utc>,
}

/// Token and latency figures reported by a model call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub provider: String,
    pub model: String,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub latency_ms: Option<i64>,
}

/// What an executor reports back for a successfully handled job
///
/// Skips ("correctly decided not to act") are successes with a descriptive
/// `decision`; only errors feed the retry path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub decision: String,
    pub metadata: Map<String, Value>,
    pub output: Map<String, Value>,
    pub side_effects: Vec<Value>,
    pub metrics: Option<ModelMetrics>,
}

impl ExecutionResult {
    pub fn new(decision: impl Into<String>) -> Self {
        Self {
            decision: decision.into(),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        if let Value::Object(map) = output {
            self.output = map;
        }
        self
    }

    pub fn with_side_effect(mut self, effect: Value) -> Self {
        self.side_effects.push(effect);
        self
    }

    pub fn with_metrics(mut self, metrics: ModelMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationStatus {
    Accepted,
    Skipped,
}

impl DerivationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DerivationStatus::Accepted => "accepted",
            DerivationStatus::Skipped => "skipped",
        }
    }
}

/// Record of a synthesized memory candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Derivation {
    pub id: Uuid,
    pub source_memory_ids: Vec<Uuid>,
    pub derived_memory_id: Option<Uuid>,
    pub derivation_type: String,
    pub confidence: Option<f64>,
    pub novelty: Option<f64>,
    pub status: DerivationStatus,
    pub model: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Tunable thresholds the policy tuner may adjust
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyKey {
    #[serde(rename = "auto_merge_threshold")]
    AutoMergeThreshold,
    #[serde(rename = "derivation.min_confidence")]
    DerivationMinConfidence,
    #[serde(rename = "derivation.min_novelty")]
    DerivationMinNovelty,
}

impl PolicyKey {
    pub const ALL: [PolicyKey; 3] = [
        PolicyKey::AutoMergeThreshold,
        PolicyKey::DerivationMinConfidence,
        PolicyKey::DerivationMinNovelty,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKey::AutoMergeThreshold => "auto_merge_threshold",
            PolicyKey::DerivationMinConfidence => "derivation.min_confidence",
            PolicyKey::DerivationMinNovelty => "derivation.min_novelty",
        }
    }
}

impl FromStr for PolicyKey {
    type Err = StewardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto_merge_threshold" => Ok(PolicyKey::AutoMergeThreshold),
            "derivation.min_confidence" => Ok(PolicyKey::DerivationMinConfidence),
            "derivation.min_novelty" => Ok(PolicyKey::DerivationMinNovelty),
            other => Err(StewardError::Validation(format!("unknown policy key: {}", other))),
        }
    }
}

impl std::fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only threshold adjustment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyChange {
    pub id: Uuid,
    pub policy_key: String,
    pub prior_value: Option<f64>,
    pub new_value: Option<f64>,
    pub reason: Option<String>,
    pub sample_size: Option<i64>,
    pub evidence: Value,
    pub changed_by: String,
    pub rollback_of_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Filters for listing runs; a `limit` of 0 means the default page size
#[derive(Debug, Clone, Default)]
pub struct RunFilters {
    pub status: Option<String>,
    pub job_type: Option<String>,
    pub project_id: Option<String>,
    pub model: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureBreakdown {
    pub reason: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub runs_last_hour: i64,
    pub success_rate: f64,
    pub average_tokens_per_run: f64,
    pub p95_latency_ms: i64,
    pub top_failure_reasons: Vec<FailureBreakdown>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectQueueDepth {
    pub project_id: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueHealthSummary {
    pub queued_total: i64,
    pub queued_by_project_top: Vec<ProjectQueueDepth>,
    pub dead_letter_total: i64,
    pub average_processing_latency_ms: i64,
}

/// Live tunables and mode flags shared between the manager and executors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyValues {
    pub auto_merge_threshold: f64,
    pub derivation_min_confidence: f64,
    pub derivation_min_novelty: f64,
    pub dry_run: bool,
    pub paused: bool,
}

impl PolicyValues {
    pub fn get(&self, key: PolicyKey) -> f64 {
        match key {
            PolicyKey::AutoMergeThreshold => self.auto_merge_threshold,
            PolicyKey::DerivationMinConfidence => self.derivation_min_confidence,
            PolicyKey::DerivationMinNovelty => self.derivation_min_novelty,
        }
    }

    pub fn set(&mut self, key: PolicyKey, value: f64) {
        match key {
            PolicyKey::AutoMergeThreshold => self.auto_merge_threshold = value,
            PolicyKey::DerivationMinConfidence => self.derivation_min_confidence = value,
            PolicyKey::DerivationMinNovelty => self.derivation_min_novelty = value,
        }
    }
}

/// Lock-guarded handle to [`PolicyValues`]
///
/// Readers take a copy; writers go through [`LivePolicy::update`] so each
/// read-modify-write happens in a single critical section.
#[derive(Debug, Clone)]
pub struct LivePolicy {
    inner: Arc<RwLock<PolicyValues>>,
}

impl LivePolicy {
    pub fn new(values: PolicyValues) -> Self {
        Self {
            inner: Arc::new(RwLock::new(values)),
        }
    }

    pub async fn snapshot(&self) -> PolicyValues {
        self.inner.read().await.clone()
    }

    pub async fn update<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut PolicyValues) -> T,
    {
        let mut guard = self.inner.write().await;
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::DeadLetter,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }

    #[test]
    fn test_policy_key_serde_names() {
        let json = serde_json::to_string(&PolicyKey::DerivationMinNovelty).unwrap();
        assert_eq!(json, "\"derivation.min_novelty\"");
        assert!("bogus".parse::<PolicyKey>().is_err());
    }

    #[tokio::test]
    async fn test_live_policy_update() {
        let policy = LivePolicy::new(PolicyValues {
            auto_merge_threshold: 0.92,
            derivation_min_confidence: 0.8,
            derivation_min_novelty: 0.2,
            dry_run: true,
            paused: false,
        });
        let prior = policy
            .update(|p| {
                let prior = p.get(PolicyKey::AutoMergeThreshold);
                p.set(PolicyKey::AutoMergeThreshold, 0.93);
                prior
            })
            .await;
        assert_eq!(prior, 0.92);
        assert_eq!(policy.snapshot().await.auto_merge_threshold, 0.93);
    }

    #[test]
    fn test_execution_result_builder() {
        let result = ExecutionResult::new("merged")
            .with_output(serde_json::json!({"a": 1}))
            .with_side_effect(serde_json::json!({"type": "merge_applied"}));
        assert_eq!(result.output["a"], 1);
        assert_eq!(result.side_effects.len(), 1);
        assert!(result.metrics.is_none());
    }
}
