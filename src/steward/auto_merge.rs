//! Auto-merge of pending consolidation suggestions
//!
//! Every attempt re-reads the suggestion and both memories, so a retried or
//! duplicated job sees the pair's current state and skips instead of merging
//! twice.

use super::breaker::CircuitBreaker;
use super::executor::Executor;
use super::payload::{AutoMergePayload, JobPayload};
use super::types::{ExecutionResult, Job, LivePolicy};
use crate::error::{Result, StewardError};
use crate::memory::MemoryService;
use crate::services::decision::{DecisionKind, MergeDecider, MergeDecision, MergeDecisionInput};
use crate::steward::types::ModelMetrics;
use crate::storage::consolidation::{ConsolidationRepository, SuggestionSnapshot};
use crate::storage::jobs::JobRepository;
use crate::types::{MemoryId, SuggestionStatus};
use async_trait::async_trait;
use serde_json::{json, Map};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Actor recorded on merges performed by this executor
pub const MERGE_ACTOR: &str = "steward:auto_merge";

/// Minimum model confidence for a merge to proceed when the guard is on
pub const GUARD_MIN_CONFIDENCE: f64 = 0.85;

const POST_MERGE_DERIVE_ATTEMPTS: i64 = 3;

pub struct AutoMergeExecutor {
    jobs: JobRepository,
    consolidation: ConsolidationRepository,
    memory: Arc<dyn MemoryService>,
    policy: LivePolicy,
    decider: Option<Arc<dyn MergeDecider>>,
    breaker: Arc<CircuitBreaker>,
}

impl AutoMergeExecutor {
    pub fn new(
        jobs: JobRepository,
        consolidation: ConsolidationRepository,
        memory: Arc<dyn MemoryService>,
        policy: LivePolicy,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            jobs,
            consolidation,
            memory,
            policy,
            decider: None,
            breaker,
        }
    }

    /// Consult `decider` before merging
    pub fn with_conflict_guard(mut self, decider: Arc<dyn MergeDecider>) -> Self {
        self.decider = Some(decider);
        self
    }

    async fn dismiss(&self, suggestion_id: Uuid, dry_run: bool) {
        if dry_run {
            return;
        }
        if let Err(e) = self
            .memory
            .update_suggestion_status(suggestion_id, SuggestionStatus::Dismissed)
            .await
        {
            warn!("Failed to dismiss suggestion {}: {}", suggestion_id, e);
        }
    }

    /// Ask the decision model about the pair; `None` means "fall through"
    async fn consult_guard(
        &self,
        snapshot: &SuggestionSnapshot,
        payload: &AutoMergePayload,
    ) -> Option<(MergeDecision, ModelMetrics)> {
        let decider = self.decider.as_ref()?;
        if !self.breaker.allow_request().await {
            debug!("Decision model skipped, circuit breaker open");
            return None;
        }

        let suggestion = &snapshot.suggestion;
        let pair = match self.memory.get(suggestion.memory_a_id).await.ok().flatten() {
            Some(a) => self
                .memory
                .get(suggestion.memory_b_id)
                .await
                .ok()
                .flatten()
                .map(|b| (a, b)),
            None => None,
        };
        let Some((a, b)) = pair else {
            self.breaker.release_trial().await;
            return None;
        };

        let mut strategy_hints = BTreeMap::new();
        strategy_hints.insert(
            "default".to_string(),
            payload.merge_strategy.as_str().to_string(),
        );
        let input = MergeDecisionInput {
            memory_a_title: a.title,
            memory_a_content: a.content,
            memory_a_tags: a.tags,
            memory_b_title: b.title,
            memory_b_content: b.content,
            memory_b_tags: b.tags,
            similarity: suggestion.similarity,
            strategy_hints,
        };

        match decider.decide_merge(&input).await {
            Ok(result) => Some(result),
            Err(e) => {
                self.breaker.record_failure().await;
                warn!(
                    "Decision model failed for suggestion {}, using deterministic merge: {}",
                    suggestion.id, e
                );
                None
            }
        }
    }

    async fn enqueue_post_merge_derivation(&self, snapshot: &SuggestionSnapshot) -> Result<()> {
        let suggestion = &snapshot.suggestion;
        let (a, b) = (suggestion.memory_a_id.0, suggestion.memory_b_id.0);
        let mut payload = Map::new();
        payload.insert(
            "source_memory_ids".to_string(),
            json!([a.to_string(), b.to_string()]),
        );
        payload.insert("trigger".to_string(), json!("auto_merge_from_suggestion"));

        self.jobs
            .enqueue_derive_job(
                suggestion.project_id.clone(),
                vec![a, b],
                payload,
                POST_MERGE_DERIVE_ATTEMPTS,
                &format!("steward:derive:post_merge:{}", suggestion.id),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Executor for AutoMergeExecutor {
    async fn execute(&self, _job: &Job, payload: &JobPayload) -> Result<ExecutionResult> {
        let JobPayload::AutoMerge(payload) = payload else {
            return Err(StewardError::Validation(
                "auto-merge job without an auto-merge payload".to_string(),
            ));
        };
        let sid = payload.suggestion_id;

        let Some(snapshot) = self.consolidation.suggestion_snapshot(sid).await? else {
            return Ok(ExecutionResult::new("skip_missing_suggestion")
                .with_output(json!({"suggestion_id": sid, "skip_reason": "missing_suggestion"}))
                .with_side_effect(json!({
                    "type": "suggestion_skip",
                    "suggestion_id": sid,
                    "reason": "missing_suggestion",
                })));
        };

        if snapshot.suggestion.status != SuggestionStatus::Pending {
            return Ok(ExecutionResult::new("skip_non_pending")
                .with_output(json!({
                    "suggestion_id": sid,
                    "status": snapshot.suggestion.status.as_str(),
                }))
                .with_side_effect(json!({
                    "type": "suggestion_skip",
                    "suggestion_id": sid,
                    "reason": "non_pending",
                })));
        }

        let dry_run = self.policy.snapshot().await.dry_run;

        if snapshot.is_stale() {
            self.dismiss(sid, dry_run).await;
            return Ok(ExecutionResult::new("skip_stale_pair")
                .with_output(json!({"suggestion_id": sid, "skip_reason": "stale_pair"}))
                .with_side_effect(json!({
                    "type": "suggestion_dismissed",
                    "suggestion_id": sid,
                    "reason": "stale_pair",
                })));
        }

        if snapshot.has_project_mismatch() {
            self.dismiss(sid, dry_run).await;
            return Ok(ExecutionResult::new("skip_project_mismatch")
                .with_output(json!({"suggestion_id": sid, "skip_reason": "project_mismatch"}))
                .with_side_effect(json!({
                    "type": "suggestion_dismissed",
                    "suggestion_id": sid,
                    "reason": "project_mismatch",
                })));
        }

        let mut guard_metrics = None;
        if let Some((decision, metrics)) = self.consult_guard(&snapshot, payload).await {
            let blocked = decision.has_conflict
                || decision.confidence < GUARD_MIN_CONFIDENCE
                || decision.decision != DecisionKind::Merge;
            if blocked {
                self.dismiss(sid, dry_run).await;
                info!(
                    "Decision model blocked merge of suggestion {} ({}, confidence {:.2})",
                    sid,
                    decision.decision.as_str(),
                    decision.confidence
                );
                return Ok(ExecutionResult::new("llm_skip")
                    .with_output(json!({
                        "suggestion_id": sid,
                        "skip_reason": "llm_conflict_or_low_confidence",
                        "llm_decision": decision,
                    }))
                    .with_side_effect(json!({
                        "type": "suggestion_dismissed",
                        "suggestion_id": sid,
                        "reason": "llm_guard",
                    }))
                    .with_metrics(metrics));
            }
            guard_metrics = Some(metrics);
        }

        let target: MemoryId = snapshot.suggestion.memory_a_id;
        let source: MemoryId = snapshot.suggestion.memory_b_id;
        let similarity = snapshot.suggestion.similarity;
        let strategy = payload.merge_strategy;

        if dry_run {
            let result = ExecutionResult::new("dry_run_merge")
                .with_output(json!({
                    "suggestion_id": sid,
                    "target_id": target,
                    "source_ids": [source],
                    "strategy": strategy.as_str(),
                    "similarity": similarity,
                }))
                .with_side_effect(json!({
                    "type": "merge_skipped",
                    "reason": "dry_run",
                    "suggestion_id": sid,
                }));
            return Ok(with_guard_metrics(result, guard_metrics));
        }

        let merged = self
            .memory
            .consolidate_memories(target, &[source], strategy, MERGE_ACTOR)
            .await?;
        self.memory
            .update_suggestion_status(sid, SuggestionStatus::Accepted)
            .await?;
        info!(
            "Merged suggestion {}: {} into {} ({})",
            sid, source, target, strategy
        );

        let result = ExecutionResult::new("merged")
            .with_output(json!({
                "suggestion_id": sid,
                "merged_target": target,
                "merged_source": source,
                "result_memory": merged,
                "similarity": similarity,
                "merge_strategy": strategy.as_str(),
            }))
            .with_side_effect(json!({
                "type": "merge_applied",
                "target_id": target,
                "source_id": source,
            }))
            .with_side_effect(json!({
                "type": "suggestion_accepted",
                "suggestion_id": sid,
            }));

        self.enqueue_post_merge_derivation(&snapshot).await?;
        Ok(with_guard_metrics(result, guard_metrics))
    }
}

fn with_guard_metrics(result: ExecutionResult, metrics: Option<ModelMetrics>) -> ExecutionResult {
    match metrics {
        Some(metrics) => result.with_metrics(metrics),
        None => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MockMemoryService;
    use crate::services::decision::MockMergeDecider;
    use crate::steward::types::{JobStatus, PolicyValues, JOB_TYPE_AUTO_MERGE};
    use crate::storage::Database;
    use crate::types::{DuplicatePair, Memory, MemoryScope, MemoryState, MemoryType, MergeStrategy};
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn memory(id: MemoryId) -> Memory {
        let now = Utc::now();
        Memory {
            id,
            title: "Pool sizing".to_string(),
            content: "eight connections".to_string(),
            summary: None,
            embedding: None,
            memory_type: MemoryType::General,
            scope: MemoryScope::Project,
            project_id: None,
            agent_source: None,
            tags: vec![],
            importance: 0.5,
            ttl_seconds: None,
            access_count: 0,
            created_at: now,
            updated_at: now,
            expires_at: None,
            version: 1,
            merged_from: vec![],
            state: MemoryState::Active,
        }
    }

    fn job() -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            job_type: JOB_TYPE_AUTO_MERGE.to_string(),
            project_id: None,
            source_memory_ids: vec![],
            trigger_reason: None,
            payload: Map::new(),
            status: JobStatus::Running,
            priority: 100,
            attempt_count: 0,
            max_attempts: 3,
            run_after: now,
            locked_by: None,
            locked_at: None,
            lease_expires_at: None,
            last_error: None,
            idempotency_key: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn live_policy() -> LivePolicy {
        LivePolicy::new(PolicyValues {
            auto_merge_threshold: 0.92,
            derivation_min_confidence: 0.8,
            derivation_min_novelty: 0.2,
            dry_run: false,
            paused: false,
        })
    }

    /// A pending suggestion whose memories are not in the store; the
    /// snapshot then reports neither staleness nor a project mismatch
    async fn setup() -> (TempDir, Database, Uuid) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("auto_merge.db")).await.unwrap();
        let repo = ConsolidationRepository::new(db.clone());
        repo.upsert_suggestion(&DuplicatePair::new(MemoryId::new(), MemoryId::new(), 0.96, None))
            .await
            .unwrap();
        let (pending, _) = repo
            .list_suggestions(None, SuggestionStatus::Pending, 10, 0)
            .await
            .unwrap();
        (dir, db, pending[0].id)
    }

    fn payload(suggestion_id: Uuid) -> JobPayload {
        JobPayload::AutoMerge(AutoMergePayload {
            suggestion_id,
            merge_strategy: MergeStrategy::SmartMerge,
        })
    }

    #[tokio::test]
    async fn test_open_breaker_skips_decider_and_merges() {
        let (_dir, db, sid) = setup().await;

        let mut memory_service = MockMemoryService::new();
        memory_service
            .expect_consolidate_memories()
            .times(1)
            .returning(|target, _, _, _| Ok(memory(target)));
        memory_service
            .expect_update_suggestion_status()
            .withf(|_, status| *status == SuggestionStatus::Accepted)
            .times(1)
            .returning(|_, _| Ok(true));

        let mut decider = MockMergeDecider::new();
        decider.expect_decide_merge().times(0);

        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(60)));
        breaker.record_failure().await;

        let jobs = JobRepository::new(db.clone());
        let executor = AutoMergeExecutor::new(
            jobs.clone(),
            ConsolidationRepository::new(db.clone()),
            Arc::new(memory_service),
            live_policy(),
            breaker,
        )
        .with_conflict_guard(Arc::new(decider));

        let result = executor.execute(&job(), &payload(sid)).await.unwrap();
        assert_eq!(result.decision, "merged");
        assert!(result.metrics.is_none());
        assert_eq!(jobs.count_queued_jobs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_needs_review_verdict_dismisses() {
        let (_dir, db, sid) = setup().await;

        let mut memory_service = MockMemoryService::new();
        memory_service
            .expect_get()
            .times(2)
            .returning(|id| Ok(Some(memory(id))));
        memory_service.expect_consolidate_memories().times(0);
        memory_service
            .expect_update_suggestion_status()
            .withf(|_, status| *status == SuggestionStatus::Dismissed)
            .times(1)
            .returning(|_, _| Ok(true));

        let mut decider = MockMergeDecider::new();
        decider.expect_decide_merge().times(1).returning(|input| {
            assert_eq!(input.strategy_hints["default"], "smart_merge");
            Ok((
                MergeDecision {
                    is_duplicate: true,
                    has_conflict: false,
                    decision: DecisionKind::NeedsReview,
                    confidence: 0.9,
                    recommended_strategy: "smart_merge".to_string(),
                    merged_title: String::new(),
                    merged_content: String::new(),
                    reason_codes: vec![],
                },
                ModelMetrics {
                    provider: "ollama".to_string(),
                    model: "qwen2.5:3b".to_string(),
                    ..Default::default()
                },
            ))
        });

        let executor = AutoMergeExecutor::new(
            JobRepository::new(db.clone()),
            ConsolidationRepository::new(db.clone()),
            Arc::new(memory_service),
            live_policy(),
            Arc::new(CircuitBreaker::new(3, Duration::from_secs(60))),
        )
        .with_conflict_guard(Arc::new(decider));

        let result = executor.execute(&job(), &payload(sid)).await.unwrap();
        assert_eq!(result.decision, "llm_skip");
        assert_eq!(result.output["llm_decision"]["decision"], "needs_review");
        assert_eq!(result.metrics.unwrap().provider, "ollama");
    }

    #[tokio::test]
    async fn test_wrong_payload_variant_is_validation_error() {
        let (_dir, db, _sid) = setup().await;
        let executor = AutoMergeExecutor::new(
            JobRepository::new(db.clone()),
            ConsolidationRepository::new(db),
            Arc::new(MockMemoryService::new()),
            live_policy(),
            Arc::new(CircuitBreaker::new(3, Duration::from_secs(60))),
        );
        let err = executor.execute(&job(), &JobPayload::PolicyTune).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
