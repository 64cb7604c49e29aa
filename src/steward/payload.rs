//! Typed job payloads
//!
//! Payloads are stored as free-form JSON objects. Each job type's payload is
//! parsed once, before dispatch, into one of the variants of [`JobPayload`];
//! malformed payloads are validation errors and never reach an executor.

use super::types::{Job, JOB_TYPE_AUTO_MERGE, JOB_TYPE_DERIVE, JOB_TYPE_POLICY_TUNE};
use crate::error::{Result, StewardError};
use crate::types::MergeStrategy;
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    AutoMerge(AutoMergePayload),
    Derive(DerivePayload),
    PolicyTune,
    /// Job types without a registered executor; handled by the no-op fallback
    Other,
}

impl JobPayload {
    pub fn from_job(job: &Job) -> Result<Self> {
        match job.job_type.as_str() {
            JOB_TYPE_AUTO_MERGE => Ok(JobPayload::AutoMerge(AutoMergePayload::parse(&job.payload)?)),
            JOB_TYPE_DERIVE => Ok(JobPayload::Derive(DerivePayload::parse(
                &job.payload,
                &job.source_memory_ids,
            )?)),
            JOB_TYPE_POLICY_TUNE => Ok(JobPayload::PolicyTune),
            _ => Ok(JobPayload::Other),
        }
    }
}

/// Payload of an `auto_merge_from_suggestion` job
#[derive(Debug, Clone, PartialEq)]
pub struct AutoMergePayload {
    pub suggestion_id: Uuid,
    pub merge_strategy: MergeStrategy,
}

impl AutoMergePayload {
    pub fn parse(payload: &Map<String, Value>) -> Result<Self> {
        if payload.is_empty() {
            return Err(StewardError::Validation("missing payload".to_string()));
        }
        let suggestion_id = match payload.get("suggestion_id") {
            None => {
                return Err(StewardError::Validation(
                    "missing payload.suggestion_id".to_string(),
                ))
            }
            Some(Value::String(raw)) => Uuid::parse_str(raw).map_err(|e| {
                StewardError::Validation(format!("invalid payload.suggestion_id: {}", e))
            })?,
            Some(_) => {
                return Err(StewardError::Validation(
                    "invalid payload.suggestion_id type".to_string(),
                ))
            }
        };

        let merge_strategy = match payload.get("merge_strategy").and_then(Value::as_str) {
            None | Some("") => MergeStrategy::default(),
            Some(raw) => raw.parse()?,
        };

        Ok(Self {
            suggestion_id,
            merge_strategy,
        })
    }
}

/// Payload of a `derive_memories` job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivePayload {
    pub source_memory_ids: Vec<Uuid>,
    pub trigger: Option<String>,
}

impl DerivePayload {
    /// `fallback` (the job's own source ids) applies when the payload has no id list
    ///
    /// Non-string entries in `source_memory_ids` are ignored; strings that
    /// are not UUIDs are rejected.
    pub fn parse(payload: &Map<String, Value>, fallback: &[Uuid]) -> Result<Self> {
        let trigger = payload
            .get("trigger")
            .and_then(Value::as_str)
            .map(str::to_string);

        let source_memory_ids = match payload.get("source_memory_ids") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(|raw| {
                    Uuid::parse_str(raw).map_err(|e| {
                        StewardError::Validation(format!(
                            "invalid source_memory_ids entry: {}",
                            e
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            _ => fallback.to_vec(),
        };

        Ok(Self {
            source_memory_ids,
            trigger,
        })
    }
}
