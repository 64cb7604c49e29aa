//! Self-learning policy tuner
//!
//! Looks at the last day of suggestion and derivation outcomes and nudges at
//! most one threshold per cycle by a small bounded step. Every change lands
//! in the policy history first, then in the live policy.

use super::executor::Executor;
use super::payload::JobPayload;
use super::types::{ExecutionResult, Job, LivePolicy, PolicyChange, PolicyKey, PolicyValues};
use crate::error::Result;
use crate::storage::policy::{PolicyRepository, PolicyTuningEvidence};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

pub const SELF_LEARN_ACTOR: &str = "steward:self_learn";

const MERGE_THRESHOLD_BOUNDS: (f64, f64) = (0.90, 0.97);
const MIN_CONFIDENCE_BOUNDS: (f64, f64) = (0.70, 0.90);
const MIN_NOVELTY_BOUNDS: (f64, f64) = (0.15, 0.40);

/// Current threshold values the tuner starts from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TunerInputs {
    pub auto_merge_threshold: f64,
    pub derivation_min_confidence: f64,
    pub derivation_min_novelty: f64,
    pub min_sample_size: i64,
}

impl TunerInputs {
    pub fn from_policy(policy: &PolicyValues, min_sample_size: i64) -> Self {
        Self {
            auto_merge_threshold: policy.auto_merge_threshold,
            derivation_min_confidence: policy.derivation_min_confidence,
            derivation_min_novelty: policy.derivation_min_novelty,
            min_sample_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyProposal {
    pub key: PolicyKey,
    pub prior: f64,
    pub next: f64,
    pub reason: String,
    pub sample_size: i64,
    pub evidence: Value,
}

fn ratio(a: i64, b: i64) -> f64 {
    if b <= 0 {
        0.0
    } else {
        a as f64 / b as f64
    }
}

fn step(value: f64, delta: f64, (lo, hi): (f64, f64)) -> f64 {
    let next = (value + delta).clamp(lo, hi);
    (next * 1e6).round() / 1e6
}

fn differs(a: f64, b: f64) -> bool {
    (a - b).abs() > 1e-9
}

/// Pick the single threshold change warranted by `evidence`, if any
///
/// Rules are tried in order: merge threshold up, merge threshold down,
/// derivation confidence up, derivation novelty down. A rule that would not
/// move its value (already at a bound) falls through to the next one.
pub fn choose_policy_proposal(
    inputs: &TunerInputs,
    evidence: &PolicyTuningEvidence,
) -> Option<PolicyProposal> {
    if evidence.sample_size < inputs.min_sample_size {
        return None;
    }
    let min_n = (inputs.min_sample_size / 2).max(10);
    let suggest_total = evidence.suggest_total();
    let derive_total = evidence.derivation_total();
    let suggest_acceptance = ratio(evidence.accepted_suggest_24h, suggest_total);
    let derive_acceptance = ratio(evidence.accepted_derive_24h, derive_total);
    let healthy = evidence.success_rate_24h > 0.90;

    let proposal = |key: PolicyKey, prior: f64, next: f64, reason: &str, evidence_json: Value| {
        differs(next, prior).then(|| PolicyProposal {
            key,
            prior,
            next,
            reason: reason.to_string(),
            sample_size: evidence.sample_size,
            evidence: evidence_json,
        })
    };

    if suggest_total >= min_n {
        let current = inputs.auto_merge_threshold;
        if suggest_acceptance < 0.35 {
            if let Some(p) = proposal(
                PolicyKey::AutoMergeThreshold,
                current,
                step(current, 0.01, MERGE_THRESHOLD_BOUNDS),
                "low suggestion acceptance; increase merge threshold conservatively",
                json!({
                    "suggest_acceptance_rate": suggest_acceptance,
                    "suggest_total": suggest_total,
                }),
            ) {
                return Some(p);
            }
        }
        if suggest_acceptance > 0.80 && healthy {
            if let Some(p) = proposal(
                PolicyKey::AutoMergeThreshold,
                current,
                step(current, -0.005, MERGE_THRESHOLD_BOUNDS),
                "high suggestion acceptance and healthy runs; cautiously lower merge threshold",
                json!({
                    "suggest_acceptance_rate": suggest_acceptance,
                    "success_rate_24h": evidence.success_rate_24h,
                }),
            ) {
                return Some(p);
            }
        }
    }

    if derive_total >= min_n {
        if derive_acceptance < 0.50 {
            let current = inputs.derivation_min_confidence;
            if let Some(p) = proposal(
                PolicyKey::DerivationMinConfidence,
                current,
                step(current, 0.02, MIN_CONFIDENCE_BOUNDS),
                "low derivation acceptance; tighten min confidence",
                json!({
                    "derivation_acceptance_rate": derive_acceptance,
                    "derivation_total": derive_total,
                }),
            ) {
                return Some(p);
            }
        }
        if derive_acceptance > 0.75 && healthy {
            let current = inputs.derivation_min_novelty;
            if let Some(p) = proposal(
                PolicyKey::DerivationMinNovelty,
                current,
                step(current, -0.01, MIN_NOVELTY_BOUNDS),
                "healthy derivation acceptance; relax min novelty slightly",
                json!({
                    "derivation_acceptance_rate": derive_acceptance,
                    "success_rate_24h": evidence.success_rate_24h,
                }),
            ) {
                return Some(p);
            }
        }
    }

    None
}

pub struct PolicyTuneExecutor {
    policy_repo: PolicyRepository,
    policy: LivePolicy,
    min_sample_size: i64,
}

impl PolicyTuneExecutor {
    pub fn new(policy_repo: PolicyRepository, policy: LivePolicy, min_sample_size: i64) -> Self {
        Self {
            policy_repo,
            policy,
            min_sample_size,
        }
    }
}

#[async_trait]
impl Executor for PolicyTuneExecutor {
    async fn execute(&self, job: &Job, _payload: &JobPayload) -> Result<ExecutionResult> {
        let evidence = self.policy_repo.tuning_evidence().await?;
        let inputs = TunerInputs::from_policy(&self.policy.snapshot().await, self.min_sample_size);

        let Some(proposal) = choose_policy_proposal(&inputs, &evidence) else {
            return Ok(ExecutionResult::new("no_policy_change").with_output(json!({
                "sample_size": evidence.sample_size,
                "success_rate_24h": evidence.success_rate_24h,
                "suggestions_24h": evidence.suggest_total(),
                "derivations_24h": evidence.derivation_total(),
            })));
        };

        let change = self
            .policy_repo
            .insert_policy_change(PolicyChange {
                id: Uuid::new_v4(),
                policy_key: proposal.key.as_str().to_string(),
                prior_value: Some(proposal.prior),
                new_value: Some(proposal.next),
                reason: Some(proposal.reason.clone()),
                sample_size: Some(proposal.sample_size),
                evidence: proposal.evidence.clone(),
                changed_by: SELF_LEARN_ACTOR.to_string(),
                rollback_of_id: None,
                created_at: Utc::now(),
            })
            .await?;
        self.policy
            .update(|p| p.set(proposal.key, proposal.next))
            .await;
        info!(
            "Policy {} tuned from {} to {}: {}",
            proposal.key, proposal.prior, proposal.next, proposal.reason
        );

        Ok(ExecutionResult::new("policy_updated")
            .with_output(json!({
                "history_id": change.id,
                "policy_key": proposal.key.as_str(),
                "prior_value": proposal.prior,
                "new_value": proposal.next,
                "reason": proposal.reason,
                "sample_size": proposal.sample_size,
                "evidence": proposal.evidence,
                "job_id": job.id,
            }))
            .with_side_effect(json!({
                "type": "policy_update",
                "policy_key": proposal.key.as_str(),
                "prior": proposal.prior,
                "next": proposal.next,
            })))
    }
}
