//! Memory service: the operations the steward needs from the memory store
//!
//! Executors only ever touch memories through [`MemoryService`], which keeps
//! them testable against a mock and independent of how memories are stored.

pub mod merge;
pub mod service;

pub use merge::{merge_content, merge_multiple, merge_tags, MergedContent};
pub use service::LocalMemoryService;

use crate::error::Result;
use crate::types::{
    ConsolidationLog, ConsolidationSuggestion, Memory, MemoryId, MergeStrategy, Relationship,
    SimilarMemory, StoreRequest, StoreResult, SuggestionStatus, UpdateRequest,
};
use async_trait::async_trait;
use uuid::Uuid;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MemoryService: Send + Sync {
    /// Load a memory by id, replaced or not
    async fn get(&self, id: MemoryId) -> Result<Option<Memory>>;

    /// Store a new memory, merging it into a near-duplicate when one exists
    async fn store(&self, request: StoreRequest) -> Result<StoreResult>;

    async fn update(&self, id: MemoryId, patch: UpdateRequest) -> Result<Memory>;

    /// Fold `sources` into `target` and mark the sources replaced
    async fn consolidate_memories(
        &self,
        target: MemoryId,
        sources: &[MemoryId],
        strategy: MergeStrategy,
        actor: &str,
    ) -> Result<Memory>;

    async fn create_relationship(
        &self,
        from: MemoryId,
        to: MemoryId,
        relationship: &str,
        strength: f32,
    ) -> Result<Relationship>;

    async fn update_suggestion_status(&self, id: Uuid, status: SuggestionStatus) -> Result<bool>;

    async fn get_suggestions(
        &self,
        project_id: Option<String>,
        status: SuggestionStatus,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ConsolidationSuggestion>, i64)>;

    /// Neighbours of an existing memory in its own project scope
    async fn find_similar_to(
        &self,
        id: MemoryId,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarMemory>>;

    /// Run the duplicate scan; returns the number of suggestions upserted
    async fn scan_for_duplicates(&self) -> Result<usize>;

    /// Hard-delete memories replaced longer ago than the retention window
    async fn cleanup_replaced(&self) -> Result<usize>;

    async fn consolidation_log(
        &self,
        target: Option<MemoryId>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ConsolidationLog>>;
}
