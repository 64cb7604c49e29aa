//! SQLite-backed [`MemoryService`]

use super::merge::{max_importance, merge_content, merge_multiple};
use super::MemoryService;
use crate::config::MemoryConfig;
use crate::error::{Result, StewardError};
use crate::services::embeddings::Embedder;
use crate::storage::consolidation::ConsolidationRepository;
use crate::storage::memories::MemoryRepository;
use crate::storage::Database;
use crate::types::{
    ConsolidationLog, ConsolidationSuggestion, Memory, MemoryId, MemoryState, MergeStrategy,
    Relationship, SimilarMemory, StoreAction, StoreRequest, StoreResult, SuggestionStatus,
    UpdateRequest, REL_SUPERSEDES,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Similar memories considered on the write path
const STORE_SIMILAR_LIMIT: usize = 5;

/// Relationship strength used when the caller passes none
const DEFAULT_RELATIONSHIP_STRENGTH: f32 = 0.5;

pub struct LocalMemoryService {
    memories: MemoryRepository,
    consolidation: ConsolidationRepository,
    embedder: Arc<dyn Embedder>,
    config: MemoryConfig,
}

impl LocalMemoryService {
    pub fn new(db: Database, embedder: Arc<dyn Embedder>, config: MemoryConfig) -> Self {
        Self {
            memories: MemoryRepository::new(db.clone()),
            consolidation: ConsolidationRepository::new(db),
            embedder,
            config,
        }
    }

    pub fn repository(&self) -> &MemoryRepository {
        &self.memories
    }

    async fn embed_text(&self, title: &str, content: &str) -> Result<Vec<f32>> {
        self.embedder.embed(&format!("{} {}", title, content)).await
    }

    /// Merge a store request into an existing near-duplicate
    async fn merge_into_existing(
        &self,
        request: &StoreRequest,
        hit: &SimilarMemory,
    ) -> Result<StoreResult> {
        let existing = &hit.memory;
        let strategy = self.config.consolidation.merge_strategy;
        let merged = merge_content(
            existing,
            &request.title,
            &request.content,
            &request.tags,
            strategy,
        );
        let importance = existing.importance.max(request.importance);
        let embedding = self.embed_text(&merged.title, &merged.content).await?;

        let mut merged_from = Vec::with_capacity(existing.merged_from.len() + 1);
        merged_from.push(existing.id);
        merged_from.extend(existing.merged_from.iter().copied());

        self.memories
            .update_merge_fields(
                existing.id,
                merged.title,
                merged.content.clone(),
                merged.tags,
                importance,
                merged_from,
                Some(embedding),
            )
            .await?;

        let entry = ConsolidationLog {
            id: Uuid::new_v4(),
            target_id: existing.id,
            source_ids: vec![],
            merge_strategy: strategy,
            similarity_score: Some(hit.similarity),
            content_before: existing.content.clone(),
            content_after: merged.content,
            performed_by: "system".to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.consolidation.insert_log(&entry).await {
            warn!("Failed to log auto-merge into {}: {}", existing.id, e);
        }

        if importance >= self.config.promote_importance {
            self.memories.promote_to_long_term(existing.id).await?;
        }

        let updated = self
            .memories
            .get(existing.id)
            .await?
            .ok_or_else(|| StewardError::NotFound(format!("memory {}", existing.id)))?;

        info!(
            "Auto-merged incoming memory into {} (similarity {:.3}, {})",
            existing.id, hit.similarity, strategy
        );
        Ok(StoreResult {
            memory: updated,
            action: StoreAction::Updated,
            suggestions: vec![],
        })
    }

    async fn store_new(&self, request: StoreRequest, embedding: Vec<f32>) -> Result<Memory> {
        let now = Utc::now();
        let (ttl_seconds, expires_at) = if request.importance >= self.config.promote_importance {
            (None, None)
        } else {
            let ttl = request
                .ttl_seconds
                .unwrap_or(self.config.default_ttl_seconds);
            (Some(ttl), Some(now + ChronoDuration::seconds(ttl)))
        };

        let memory = Memory {
            id: MemoryId::new(),
            title: request.title,
            content: request.content,
            summary: request.summary,
            embedding: Some(embedding),
            memory_type: request.memory_type,
            scope: request.scope,
            project_id: request.project_id,
            agent_source: request.agent_source,
            tags: request.tags,
            importance: request.importance,
            ttl_seconds,
            access_count: 0,
            created_at: now,
            updated_at: now,
            expires_at,
            version: 1,
            merged_from: vec![],
            state: MemoryState::Active,
        };
        self.memories.insert(&memory).await?;

        info!(
            "Stored memory {} ({}, importance {:.2}, long_term {})",
            memory.id,
            memory.memory_type.as_str(),
            memory.importance,
            memory.ttl_seconds.is_none()
        );
        Ok(memory)
    }
}

#[async_trait]
impl MemoryService for LocalMemoryService {
    async fn get(&self, id: MemoryId) -> Result<Option<Memory>> {
        self.memories.get(id).await
    }

    async fn store(&self, request: StoreRequest) -> Result<StoreResult> {
        let embedding = self.embed_text(&request.title, &request.content).await?;

        if self.config.consolidation.enabled {
            let similar = match self
                .memories
                .find_similar(
                    &embedding,
                    request.project_id.clone(),
                    self.config.consolidation.suggest_threshold,
                    STORE_SIMILAR_LIMIT,
                )
                .await
            {
                Ok(similar) => similar,
                Err(e) => {
                    warn!("Similarity check failed, storing normally: {}", e);
                    vec![]
                }
            };

            if let Some(best) = similar.first() {
                if best.similarity >= self.config.consolidation.auto_merge_threshold {
                    return self.merge_into_existing(&request, best).await;
                }
                let memory = self.store_new(request, embedding).await?;
                return Ok(StoreResult {
                    memory,
                    action: StoreAction::CreatedWithSuggestions,
                    suggestions: similar,
                });
            }
        }

        let memory = self.store_new(request, embedding).await?;
        Ok(StoreResult {
            memory,
            action: StoreAction::Created,
            suggestions: vec![],
        })
    }

    async fn update(&self, id: MemoryId, patch: UpdateRequest) -> Result<Memory> {
        let mut memory = self
            .memories
            .get(id)
            .await?
            .ok_or_else(|| StewardError::NotFound(format!("memory {}", id)))?;

        let reembed = patch.changes_text();
        if let Some(title) = patch.title {
            memory.title = title;
        }
        if let Some(content) = patch.content {
            memory.content = content;
        }
        if let Some(summary) = patch.summary {
            memory.summary = Some(summary);
        }
        if let Some(memory_type) = patch.memory_type {
            memory.memory_type = memory_type;
        }
        if let Some(tags) = patch.tags {
            memory.tags = tags;
        }
        if let Some(importance) = patch.importance {
            memory.importance = importance;
        }
        if reembed {
            memory.embedding = Some(self.embed_text(&memory.title, &memory.content).await?);
        }
        memory.updated_at = Utc::now();

        self.memories.update(&memory).await?;
        debug!("Updated memory {}", id);
        self.memories
            .get(id)
            .await?
            .ok_or_else(|| StewardError::NotFound(format!("memory {}", id)))
    }

    async fn consolidate_memories(
        &self,
        target_id: MemoryId,
        source_ids: &[MemoryId],
        strategy: MergeStrategy,
        actor: &str,
    ) -> Result<Memory> {
        let actor = if actor.is_empty() { "system" } else { actor };

        let target = self
            .memories
            .get(target_id)
            .await?
            .ok_or_else(|| StewardError::NotFound(format!("target memory {}", target_id)))?;
        if !target.is_active() {
            return Err(StewardError::Validation(format!(
                "target memory is already replaced: {}",
                target_id
            )));
        }

        let mut sources: Vec<Memory> = Vec::with_capacity(source_ids.len());
        for &source_id in source_ids {
            if source_id == target_id {
                continue;
            }
            match self.memories.get(source_id).await? {
                None => warn!("Source memory {} not found, skipping", source_id),
                Some(source) if !source.is_active() => {
                    warn!("Source memory {} already replaced, skipping", source_id)
                }
                Some(source) => sources.push(source),
            }
        }
        if sources.is_empty() {
            return Ok(target);
        }

        let source_refs: Vec<&Memory> = sources.iter().collect();
        let merged = merge_multiple(&target, &source_refs, strategy);
        let importance = max_importance(target.importance, &source_refs);
        let embedding = self.embed_text(&merged.title, &merged.content).await?;

        let actual_source_ids: Vec<MemoryId> = sources.iter().map(|s| s.id).collect();
        let mut merged_from = target.merged_from.clone();
        merged_from.extend(actual_source_ids.iter().copied());

        self.memories
            .update_merge_fields(
                target_id,
                merged.title,
                merged.content.clone(),
                merged.tags,
                importance,
                merged_from,
                Some(embedding),
            )
            .await?;

        for source in &sources {
            if let Err(e) = self.memories.mark_replaced(source.id, target_id).await {
                warn!("Failed to mark {} replaced: {}", source.id, e);
            }
            let supersedes = Relationship {
                id: Uuid::new_v4(),
                from_memory_id: target_id,
                to_memory_id: source.id,
                relationship: REL_SUPERSEDES.to_string(),
                strength: 1.0,
                context: None,
                created_at: Utc::now(),
            };
            if let Err(e) = self.memories.store_relationship(&supersedes).await {
                warn!("Failed to link {} -> {}: {}", target_id, source.id, e);
            }
        }

        if importance >= self.config.promote_importance {
            self.memories.promote_to_long_term(target_id).await?;
        }

        let entry = ConsolidationLog {
            id: Uuid::new_v4(),
            target_id,
            source_ids: actual_source_ids,
            merge_strategy: strategy,
            similarity_score: None,
            content_before: target.content.clone(),
            content_after: merged.content,
            performed_by: actor.to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.consolidation.insert_log(&entry).await {
            warn!("Failed to log consolidation of {}: {}", target_id, e);
        }

        info!(
            "Consolidated {} memories into {} ({})",
            sources.len(),
            target_id,
            strategy
        );
        self.memories
            .get(target_id)
            .await?
            .ok_or_else(|| StewardError::NotFound(format!("target memory {}", target_id)))
    }

    async fn create_relationship(
        &self,
        from: MemoryId,
        to: MemoryId,
        relationship: &str,
        strength: f32,
    ) -> Result<Relationship> {
        let rel = Relationship {
            id: Uuid::new_v4(),
            from_memory_id: from,
            to_memory_id: to,
            relationship: relationship.to_string(),
            strength: if strength <= 0.0 {
                DEFAULT_RELATIONSHIP_STRENGTH
            } else {
                strength
            },
            context: None,
            created_at: Utc::now(),
        };
        self.memories.store_relationship(&rel).await?;
        Ok(rel)
    }

    async fn update_suggestion_status(&self, id: Uuid, status: SuggestionStatus) -> Result<bool> {
        self.consolidation.update_suggestion_status(id, status).await
    }

    async fn get_suggestions(
        &self,
        project_id: Option<String>,
        status: SuggestionStatus,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ConsolidationSuggestion>, i64)> {
        self.consolidation
            .list_suggestions(project_id, status, limit, offset)
            .await
    }

    async fn find_similar_to(
        &self,
        id: MemoryId,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarMemory>> {
        let memory = self
            .memories
            .get(id)
            .await?
            .ok_or_else(|| StewardError::NotFound(format!("memory {}", id)))?;
        let embedding = memory.embedding.ok_or_else(|| {
            StewardError::Validation(format!("memory has no embedding: {}", id))
        })?;
        let threshold = if threshold <= 0.0 {
            self.config.consolidation.suggest_threshold
        } else {
            threshold
        };

        // One extra slot so dropping the memory itself still fills `limit`
        let mut results = self
            .memories
            .find_similar(&embedding, memory.project_id, threshold, limit + 1)
            .await?;
        results.retain(|r| r.memory.id != id);
        results.truncate(limit);
        Ok(results)
    }

    async fn scan_for_duplicates(&self) -> Result<usize> {
        self.consolidation
            .scan_and_upsert(
                self.config.consolidation.suggest_threshold,
                self.config.consolidation.scan_batch_size,
            )
            .await
    }

    async fn cleanup_replaced(&self) -> Result<usize> {
        let retention = ChronoDuration::from_std(self.config.consolidation.replaced_retention)
            .map_err(|e| StewardError::Config(e.to_string()))?;
        let deleted = self.memories.cleanup_replaced(Utc::now() - retention).await?;
        if deleted > 0 {
            info!("Deleted {} replaced memories past retention", deleted);
        }
        Ok(deleted)
    }

    async fn consolidation_log(
        &self,
        target: Option<MemoryId>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ConsolidationLog>> {
        self.consolidation.list_log(target, limit, offset).await
    }
}
