//! Core data types for the shared memory store
//!
//! Memories, relationships and the consolidation bookkeeping the steward
//! operates on. A memory's soft-delete is modelled as an explicit lifecycle
//! state rather than a nullable pointer, so "replaced memories never take
//! part in search or consolidation" can be checked by matching on
//! [`MemoryState`].

use crate::error::{Result, StewardError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for memories
///
/// Wraps a UUID so memory ids cannot be mixed up with job, run or
/// suggestion ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    /// Create a new random memory ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a memory ID from a string
    pub fn from_string(s: &str) -> std::result::Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Memory type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Solution,
    Problem,
    CodePattern,
    Fix,
    Error,
    Workflow,
    Decision,
    General,
    Task,
    Technology,
    Command,
    FileContext,
    Conversation,
    Project,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Solution => "solution",
            MemoryType::Problem => "problem",
            MemoryType::CodePattern => "code_pattern",
            MemoryType::Fix => "fix",
            MemoryType::Error => "error",
            MemoryType::Workflow => "workflow",
            MemoryType::Decision => "decision",
            MemoryType::General => "general",
            MemoryType::Task => "task",
            MemoryType::Technology => "technology",
            MemoryType::Command => "command",
            MemoryType::FileContext => "file_context",
            MemoryType::Conversation => "conversation",
            MemoryType::Project => "project",
        }
    }

    /// Map a stored or user-supplied type name; unknown names become `General`
    pub fn normalize(s: &str) -> Self {
        match s {
            "solution" => MemoryType::Solution,
            "problem" => MemoryType::Problem,
            "code_pattern" => MemoryType::CodePattern,
            "fix" => MemoryType::Fix,
            "error" => MemoryType::Error,
            "workflow" => MemoryType::Workflow,
            "decision" => MemoryType::Decision,
            "task" => MemoryType::Task,
            "technology" => MemoryType::Technology,
            "command" => MemoryType::Command,
            "file_context" => MemoryType::FileContext,
            "conversation" => MemoryType::Conversation,
            "project" => MemoryType::Project,
            _ => MemoryType::General,
        }
    }
}

impl Default for MemoryType {
    fn default() -> Self {
        MemoryType::General
    }
}

/// Visibility scope of a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    Global,
    #[default]
    Project,
}

impl MemoryScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryScope::Global => "global",
            MemoryScope::Project => "project",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "global" {
            MemoryScope::Global
        } else {
            MemoryScope::Project
        }
    }
}

/// Lifecycle of a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum MemoryState {
    #[default]
    Active,
    /// Merged into another memory; kept only until retention cleanup
    Replaced { by: MemoryId },
}

/// A stored memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub title: String,
    pub content: String,
    pub summary: Option<String>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub memory_type: MemoryType,
    pub scope: MemoryScope,
    pub project_id: Option<String>,
    pub agent_source: Option<String>,
    pub tags: Vec<String>,
    pub importance: f32,
    pub ttl_seconds: Option<i64>,
    pub access_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub merged_from: Vec<MemoryId>,
    pub state: MemoryState,
}

impl Memory {
    pub fn is_active(&self) -> bool {
        matches!(self.state, MemoryState::Active)
    }

    pub fn replaced_by(&self) -> Option<MemoryId> {
        match self.state {
            MemoryState::Replaced { by } => Some(by),
            MemoryState::Active => None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Input for storing a new memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreRequest {
    pub title: String,
    pub content: String,
    pub summary: Option<String>,
    pub memory_type: MemoryType,
    pub scope: MemoryScope,
    pub project_id: Option<String>,
    pub agent_source: Option<String>,
    pub tags: Vec<String>,
    pub importance: f32,
    pub ttl_seconds: Option<i64>,
}

/// Partial update of an existing memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub title: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub memory_type: Option<MemoryType>,
    pub tags: Option<Vec<String>>,
    pub importance: Option<f32>,
}

impl UpdateRequest {
    /// Whether the update touches text that feeds the embedding
    pub fn changes_text(&self) -> bool {
        self.title.is_some() || self.content.is_some()
    }
}

/// What the store path did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreAction {
    Created,
    CreatedWithSuggestions,
    /// Merged into an existing near-duplicate
    Updated,
}

impl StoreAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreAction::Created => "created",
            StoreAction::CreatedWithSuggestions => "created_with_suggestions",
            StoreAction::Updated => "updated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreResult {
    pub memory: Memory,
    pub action: StoreAction,
    pub suggestions: Vec<SimilarMemory>,
}

/// A memory together with its similarity to some query vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarMemory {
    pub memory: Memory,
    pub similarity: f64,
}

pub const REL_SUPERSEDES: &str = "SUPERSEDES";
pub const REL_DERIVED_FROM: &str = "DERIVED_FROM";

/// Directed, typed link between two memories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: Uuid,
    pub from_memory_id: MemoryId,
    pub to_memory_id: MemoryId,
    pub relationship: String,
    pub strength: f32,
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Content merge strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    LatestWins,
    Append,
    #[default]
    SmartMerge,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::LatestWins => "latest_wins",
            MergeStrategy::Append => "append",
            MergeStrategy::SmartMerge => "smart_merge",
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = StewardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "latest_wins" => Ok(MergeStrategy::LatestWins),
            "append" => Ok(MergeStrategy::Append),
            "smart_merge" => Ok(MergeStrategy::SmartMerge),
            other => Err(StewardError::Validation(format!(
                "unknown merge strategy: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution state of a duplicate suggestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Accepted,
    Dismissed,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Accepted => "accepted",
            SuggestionStatus::Dismissed => "dismissed",
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, SuggestionStatus::Pending)
    }
}

impl FromStr for SuggestionStatus {
    type Err = StewardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SuggestionStatus::Pending),
            "accepted" => Ok(SuggestionStatus::Accepted),
            "dismissed" => Ok(SuggestionStatus::Dismissed),
            other => Err(StewardError::Validation(format!(
                "unknown suggestion status: {}",
                other
            ))),
        }
    }
}

/// Persisted hint that two memories are likely duplicates
///
/// `memory_a_id < memory_b_id` always holds for stored rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationSuggestion {
    pub id: Uuid,
    pub memory_a_id: MemoryId,
    pub memory_b_id: MemoryId,
    pub similarity: f64,
    pub status: SuggestionStatus,
    pub project_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A pair found by the duplicate scan, not yet persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicatePair {
    pub memory_a_id: MemoryId,
    pub memory_b_id: MemoryId,
    pub similarity: f64,
    pub project_id: Option<String>,
}

impl DuplicatePair {
    /// Build a pair in canonical order
    pub fn new(a: MemoryId, b: MemoryId, similarity: f64, project_id: Option<String>) -> Self {
        let (memory_a_id, memory_b_id) = canonical_pair(a, b);
        Self {
            memory_a_id,
            memory_b_id,
            similarity,
            project_id,
        }
    }
}

/// Order two ids by their string form so (A,B) and (B,A) map to one row
pub fn canonical_pair(a: MemoryId, b: MemoryId) -> (MemoryId, MemoryId) {
    if a.to_string() <= b.to_string() {
        (a, b)
    } else {
        (b, a)
    }
}

/// Immutable record of a completed merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationLog {
    pub id: Uuid,
    pub target_id: MemoryId,
    pub source_ids: Vec<MemoryId>,
    pub merge_strategy: MergeStrategy,
    pub similarity_score: Option<f64>,
    pub content_before: String,
    pub content_after: String,
    pub performed_by: String,
    pub created_at: DateTime<Utc>,
}
