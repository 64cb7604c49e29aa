//! Derivation executor: synthesizes new memories from existing ones
//!
//! Candidates are produced deterministically from the first source memory
//! and go through the normal store path, so write-time dedup applies to
//! them like to any other input.

use super::executor::Executor;
use super::payload::JobPayload;
use super::types::{Derivation, DerivationStatus, ExecutionResult, Job, LivePolicy};
use crate::config::DerivationConfig;
use crate::error::{Result, StewardError};
use crate::memory::MemoryService;
use crate::storage::policy::PolicyRepository;
use crate::types::{Memory, MemoryId, MemoryScope, MemoryType, StoreRequest, REL_DERIVED_FROM};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Model name recorded on derivation rows
const DERIVATION_MODEL: &str = "deterministic";
const DERIVED_IMPORTANCE: f32 = 0.7;
const DERIVED_FROM_STRENGTH: f32 = 0.9;
const SUMMARY_MAX_CHARS: usize = 400;

/// A memory the executor proposes to create
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedCandidate {
    pub title: String,
    pub content: String,
    pub memory_type: MemoryType,
    pub tags: Vec<String>,
    pub confidence: f64,
    pub novelty: f64,
}

/// Build up to `max_candidates` candidates from the first source
///
/// The first candidate is a decision summary, the second a workflow summary.
pub fn derive_candidates(sources: &[Memory], max_candidates: usize) -> Vec<DerivedCandidate> {
    let Some(base) = sources.first() else {
        return vec![];
    };
    if max_candidates == 0 {
        return vec![];
    }

    let trimmed = base.content.trim();
    let mut summary: String = trimmed.chars().take(SUMMARY_MAX_CHARS).collect();
    if summary.is_empty() {
        summary = base.title.clone();
    }

    let mut out = vec![DerivedCandidate {
        title: format!("Derived decision: {}", base.title),
        content: format!("Derived from steward synthesis.\n\nSource summary:\n{}", summary),
        memory_type: MemoryType::Decision,
        tags: vec!["derivation".to_string(), "decision".to_string()],
        confidence: 0.85,
        novelty: 0.30,
    }];
    if max_candidates > 1 {
        out.push(DerivedCandidate {
            title: format!("Derived workflow: {}", base.title),
            content: format!(
                "Workflow candidate derived from source memory content.\n\n{}",
                summary
            ),
            memory_type: MemoryType::Workflow,
            tags: vec!["derivation".to_string(), "workflow".to_string()],
            confidence: 0.80,
            novelty: 0.25,
        });
    }
    out.truncate(max_candidates);
    out
}

pub struct DerivationExecutor {
    policy_repo: PolicyRepository,
    memory: Arc<dyn MemoryService>,
    config: DerivationConfig,
    policy: LivePolicy,
}

impl DerivationExecutor {
    pub fn new(
        policy_repo: PolicyRepository,
        memory: Arc<dyn MemoryService>,
        config: DerivationConfig,
        policy: LivePolicy,
    ) -> Self {
        Self {
            policy_repo,
            memory,
            config,
            policy,
        }
    }

    async fn record(&self, derivation: Derivation) {
        if let Err(e) = self.policy_repo.store_derivation(&derivation).await {
            warn!("Failed to record derivation {}: {}", derivation.id, e);
        }
    }
}

fn derivation_row(
    source_ids: &[Uuid],
    candidate: &DerivedCandidate,
    derived_memory_id: Option<Uuid>,
    status: DerivationStatus,
    payload: Value,
) -> Derivation {
    let now = Utc::now();
    Derivation {
        id: Uuid::new_v4(),
        source_memory_ids: source_ids.to_vec(),
        derived_memory_id,
        derivation_type: candidate.memory_type.as_str().to_string(),
        confidence: Some(candidate.confidence),
        novelty: Some(candidate.novelty),
        status,
        model: Some(DERIVATION_MODEL.to_string()),
        payload,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl Executor for DerivationExecutor {
    async fn execute(&self, _job: &Job, payload: &JobPayload) -> Result<ExecutionResult> {
        if !self.config.enabled {
            return Ok(ExecutionResult::new("derive_disabled").with_output(json!({"enabled": false})));
        }
        let JobPayload::Derive(payload) = payload else {
            return Err(StewardError::Validation(
                "derivation job without a derivation payload".to_string(),
            ));
        };
        let source_ids = &payload.source_memory_ids;
        if source_ids.is_empty() {
            return Ok(ExecutionResult::new("derive_no_sources").with_output(json!({"created": 0})));
        }

        let mut sources = Vec::with_capacity(source_ids.len());
        for id in source_ids {
            match self.memory.get(MemoryId(*id)).await {
                Ok(Some(memory)) => sources.push(memory),
                Ok(None) => debug!("Derivation source {} not found, skipping", id),
                Err(e) => warn!("Failed to load derivation source {}: {}", id, e),
            }
        }
        if sources.is_empty() {
            return Ok(
                ExecutionResult::new("derive_missing_sources").with_output(json!({"created": 0}))
            );
        }

        let policy = self.policy.snapshot().await;
        let max_candidates = self.config.max_candidates.max(1) as usize;
        let candidates = derive_candidates(&sources, max_candidates);

        let mut created: Vec<Uuid> = vec![];
        let mut result = ExecutionResult::new("derived");
        for candidate in &candidates {
            if candidate.confidence < policy.derivation_min_confidence
                || candidate.novelty < policy.derivation_min_novelty
            {
                self.record(derivation_row(
                    source_ids,
                    candidate,
                    None,
                    DerivationStatus::Skipped,
                    json!({"reason": "threshold", "title": candidate.title}),
                ))
                .await;
                result = result.with_side_effect(json!({
                    "type": "derivation_skipped",
                    "reason": "threshold",
                    "title": candidate.title,
                }));
                continue;
            }

            let mut tags = vec!["derived".to_string(), "steward".to_string()];
            tags.extend(candidate.tags.iter().cloned());
            let request = StoreRequest {
                title: candidate.title.clone(),
                content: candidate.content.clone(),
                summary: None,
                memory_type: candidate.memory_type,
                scope: MemoryScope::Project,
                project_id: sources[0].project_id.clone(),
                agent_source: Some("steward-derive".to_string()),
                tags,
                importance: DERIVED_IMPORTANCE,
                ttl_seconds: None,
            };

            let stored = match self.memory.store(request).await {
                Ok(stored) => stored,
                Err(e) => {
                    warn!("Failed to store derived memory {:?}: {}", candidate.title, e);
                    result = result.with_side_effect(json!({
                        "type": "derivation_failed",
                        "title": candidate.title,
                    }));
                    continue;
                }
            };
            let derived_id = stored.memory.id;
            created.push(derived_id.0);

            self.record(derivation_row(
                source_ids,
                candidate,
                Some(derived_id.0),
                DerivationStatus::Accepted,
                json!({"title": candidate.title, "store_action": stored.action.as_str()}),
            ))
            .await;

            for source in source_ids {
                if let Err(e) = self
                    .memory
                    .create_relationship(
                        derived_id,
                        MemoryId(*source),
                        REL_DERIVED_FROM,
                        DERIVED_FROM_STRENGTH,
                    )
                    .await
                {
                    warn!("Failed to link {} to source {}: {}", derived_id, source, e);
                }
            }
            result = result.with_side_effect(json!({
                "type": "derivation_created",
                "derived_memory_id": derived_id,
            }));
        }

        info!(
            "Derivation over {} sources created {} memories",
            source_ids.len(),
            created.len()
        );
        Ok(result.with_output(json!({
            "created_memory_ids": created,
            "source_memory_ids": source_ids,
        })))
    }
}
