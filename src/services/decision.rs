//! Merge decision client for an Ollama-style `/api/chat` endpoint
//!
//! The model is asked for a strict-JSON verdict on a candidate duplicate
//! pair. A failed or invalid answer from the primary model gets exactly one
//! more attempt on the fallback model.

use crate::config::StewardConfig;
use crate::error::{Result, StewardError};
use crate::steward::types::ModelMetrics;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_MODEL: &str = "qwen2.5:3b";
pub const DEFAULT_FALLBACK_MODEL: &str = "qwen2.5:1.5b";

/// Upper bound on how much of a response body is read
const MAX_RESPONSE_CHARS: usize = 16_000;

const SYSTEM_PROMPT: &str = "Return strict JSON only matching the requested schema. No markdown.";

/// What the model is shown about a candidate pair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeDecisionInput {
    pub memory_a_title: String,
    pub memory_a_content: String,
    pub memory_a_tags: Vec<String>,
    pub memory_b_title: String,
    pub memory_b_content: String,
    pub memory_b_tags: Vec<String>,
    pub similarity: f64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub strategy_hints: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Merge,
    Skip,
    NeedsReview,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Merge => "merge",
            DecisionKind::Skip => "skip",
            DecisionKind::NeedsReview => "needs_review",
        }
    }
}

/// Validated model verdict; `confidence` is always within `[0, 1]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeDecision {
    pub is_duplicate: bool,
    pub has_conflict: bool,
    pub decision: DecisionKind,
    pub confidence: f64,
    pub recommended_strategy: String,
    pub merged_title: String,
    pub merged_content: String,
    pub reason_codes: Vec<String>,
}

/// Wire shape before validation
#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    is_duplicate: bool,
    #[serde(default)]
    has_conflict: bool,
    #[serde(default)]
    decision: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    recommended_strategy: String,
    #[serde(default)]
    merged_title: String,
    #[serde(default)]
    merged_content: String,
    #[serde(default)]
    reason_codes: Option<Vec<String>>,
}

/// Parse and validate the JSON a model returned
pub fn parse_and_validate_decision(raw: &str) -> Result<MergeDecision> {
    let parsed: RawDecision = serde_json::from_str(raw).map_err(|e| {
        StewardError::Validation(format!("parse merge decision json: {}", e))
    })?;

    let decision = match parsed.decision.as_str() {
        "merge" => DecisionKind::Merge,
        "skip" => DecisionKind::Skip,
        "needs_review" => DecisionKind::NeedsReview,
        other => {
            return Err(StewardError::Validation(format!(
                "invalid decision: {:?}",
                other
            )))
        }
    };
    if !(0.0..=1.0).contains(&parsed.confidence) {
        return Err(StewardError::Validation(format!(
            "invalid confidence: {}",
            parsed.confidence
        )));
    }

    Ok(MergeDecision {
        is_duplicate: parsed.is_duplicate,
        has_conflict: parsed.has_conflict,
        decision,
        confidence: parsed.confidence,
        recommended_strategy: if parsed.recommended_strategy.is_empty() {
            "smart_merge".to_string()
        } else {
            parsed.recommended_strategy
        },
        merged_title: parsed.merged_title,
        merged_content: parsed.merged_content,
        reason_codes: parsed.reason_codes.unwrap_or_default(),
    })
}

fn build_prompt(input: &MergeDecisionInput) -> Result<String> {
    Ok(format!(
        "Analyze duplicate merge risk and return JSON with keys: is_duplicate, has_conflict, \
         decision, confidence, recommended_strategy, merged_title, merged_content, reason_codes. \
         Input: {}",
        serde_json::to_string(input)?
    ))
}

/// Anything that can judge a candidate duplicate pair
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MergeDecider: Send + Sync {
    async fn decide_merge(&self, input: &MergeDecisionInput) -> Result<(MergeDecision, ModelMetrics)>;
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: String,
    message: ChatMessage,
    prompt_eval_count: Option<i64>,
    eval_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

/// HTTP decision client with a primary and a fallback model
#[derive(Debug, Clone)]
pub struct DecisionClient {
    client: Client,
    base_url: String,
    model: String,
    fallback_model: String,
}

impl DecisionClient {
    pub fn new(base_url: &str, model: &str, fallback_model: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StewardError::Decision(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: if model.is_empty() {
                DEFAULT_MODEL.to_string()
            } else {
                model.to_string()
            },
            fallback_model: if fallback_model.is_empty() {
                DEFAULT_FALLBACK_MODEL.to_string()
            } else {
                fallback_model.to_string()
            },
        })
    }

    pub fn from_config(config: &StewardConfig) -> Result<Self> {
        Self::new(
            &config.ollama_url,
            &config.model,
            &config.fallback_model,
            config.request_timeout,
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn decide_once(
        &self,
        model: &str,
        input: &MergeDecisionInput,
    ) -> Result<(MergeDecision, ModelMetrics)> {
        let start = Instant::now();
        let body = json!({
            "model": model,
            "stream": false,
            "format": "json",
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_prompt(input)?},
            ],
            "options": {"temperature": 0.1},
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| StewardError::Decision(format!("send llm request: {}", e)))?;

        let status = response.status();
        let bytes = read_capped(response, MAX_RESPONSE_CHARS).await?;
        let text = String::from_utf8_lossy(&bytes);

        if !status.is_success() {
            return Err(StewardError::Decision(format!(
                "ollama chat failed ({}): {}",
                status.as_u16(),
                text
            )));
        }

        let chat: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| StewardError::Decision(format!("decode llm response: {}", e)))?;
        let decision = parse_and_validate_decision(&chat.message.content)?;

        let total_tokens = match (chat.prompt_eval_count, chat.eval_count) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        };
        let metrics = ModelMetrics {
            provider: "ollama".to_string(),
            model: chat.model,
            prompt_tokens: chat.prompt_eval_count,
            completion_tokens: chat.eval_count,
            total_tokens,
            latency_ms: Some(start.elapsed().as_millis() as i64),
        };
        Ok((decision, metrics))
    }
}

/// Read at most `cap` bytes of the body; the rest is never buffered
async fn read_capped(mut response: reqwest::Response, cap: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    while buf.len() < cap {
        let chunk = response
            .chunk()
            .await
            .map_err(|e| StewardError::Decision(format!("read llm response: {}", e)))?;
        match chunk {
            Some(chunk) => {
                let take = chunk.len().min(cap - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            None => break,
        }
    }
    Ok(buf)
}

#[async_trait]
impl MergeDecider for DecisionClient {
    async fn decide_merge(&self, input: &MergeDecisionInput) -> Result<(MergeDecision, ModelMetrics)> {
        match self.decide_once(&self.model, input).await {
            Ok(result) => Ok(result),
            Err(primary_err) => {
                warn!(
                    "Decision model {} failed ({}), retrying with {}",
                    self.model, primary_err, self.fallback_model
                );
                let result = self.decide_once(&self.fallback_model, input).await;
                if result.is_ok() {
                    debug!("Fallback decision model {} succeeded", self.fallback_model);
                }
                result
            }
        }
    }
}
