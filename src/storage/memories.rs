//! Memory and relationship persistence
//!
//! Embeddings are stored as JSON arrays next to the row; similarity search
//! loads the candidate set for one project scope and ranks it in process.

use super::{from_millis, opt_from_millis, opt_uuid_col, to_millis, uuid_col, Database};
use crate::error::Result;
use crate::types::{
    Memory, MemoryId, MemoryScope, MemoryState, MemoryType, Relationship, SimilarMemory,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

pub(crate) const MEMORY_COLUMNS: &str = "id, title, content, summary, embedding, memory_type, scope, \
     project_id, agent_source, tags, importance, ttl_seconds, access_count, created_at, updated_at, \
     expires_at, version, merged_from, replaced_by";

/// Memory rows and the relationship graph
#[derive(Debug, Clone)]
pub struct MemoryRepository {
    db: Database,
}

impl MemoryRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn insert(&self, memory: &Memory) -> Result<()> {
        let m = memory.clone();
        self.db
            .interact(move |conn| {
                conn.execute(
                    "INSERT INTO memories (id, title, content, summary, embedding, memory_type, scope,
                        project_id, agent_source, tags, importance, ttl_seconds, access_count,
                        created_at, updated_at, expires_at, version, merged_from, replaced_by)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                    params![
                        m.id.to_string(),
                        m.title,
                        m.content,
                        m.summary,
                        embedding_json(m.embedding.as_deref())?,
                        m.memory_type.as_str(),
                        m.scope.as_str(),
                        m.project_id,
                        m.agent_source,
                        serde_json::to_string(&m.tags)?,
                        m.importance as f64,
                        m.ttl_seconds,
                        m.access_count,
                        to_millis(m.created_at),
                        to_millis(m.updated_at),
                        m.expires_at.map(to_millis),
                        m.version,
                        serde_json::to_string(&m.merged_from)?,
                        m.replaced_by().map(|id| id.to_string()),
                    ],
                )?;
                Ok(())
            })
            .await?;
        debug!("Inserted memory {}", memory.id);
        Ok(())
    }

    pub async fn get(&self, id: MemoryId) -> Result<Option<Memory>> {
        self.db
            .interact(move |conn| {
                let sql = format!("SELECT {} FROM memories WHERE id = ?1", MEMORY_COLUMNS);
                Ok(conn
                    .query_row(&sql, params![id.to_string()], row_to_memory)
                    .optional()?)
            })
            .await
    }

    /// Overwrite the editable fields of a memory and bump its version
    pub async fn update(&self, memory: &Memory) -> Result<()> {
        let m = memory.clone();
        self.db
            .interact(move |conn| {
                conn.execute(
                    "UPDATE memories
                     SET title = ?2, content = ?3, summary = ?4, embedding = ?5, memory_type = ?6,
                         tags = ?7, importance = ?8, ttl_seconds = ?9, expires_at = ?10,
                         updated_at = ?11, version = version + 1
                     WHERE id = ?1",
                    params![
                        m.id.to_string(),
                        m.title,
                        m.content,
                        m.summary,
                        embedding_json(m.embedding.as_deref())?,
                        m.memory_type.as_str(),
                        serde_json::to_string(&m.tags)?,
                        m.importance as f64,
                        m.ttl_seconds,
                        m.expires_at.map(to_millis),
                        to_millis(m.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Write the outcome of a merge into the target row
    #[allow(clippy::too_many_arguments)]
    pub async fn update_merge_fields(
        &self,
        id: MemoryId,
        title: String,
        content: String,
        tags: Vec<String>,
        importance: f32,
        merged_from: Vec<MemoryId>,
        embedding: Option<Vec<f32>>,
    ) -> Result<()> {
        self.db
            .interact(move |conn| {
                conn.execute(
                    "UPDATE memories
                     SET title = ?2, content = ?3, tags = ?4, importance = ?5, merged_from = ?6,
                         embedding = COALESCE(?7, embedding), updated_at = ?8, version = version + 1
                     WHERE id = ?1",
                    params![
                        id.to_string(),
                        title,
                        content,
                        serde_json::to_string(&tags)?,
                        importance as f64,
                        serde_json::to_string(&merged_from)?,
                        embedding_json(embedding.as_deref())?,
                        to_millis(Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn mark_replaced(&self, id: MemoryId, by: MemoryId) -> Result<()> {
        self.db
            .interact(move |conn| {
                conn.execute(
                    "UPDATE memories SET replaced_by = ?2, replaced_at = ?3 WHERE id = ?1",
                    params![id.to_string(), by.to_string(), to_millis(Utc::now())],
                )?;
                Ok(())
            })
            .await
    }

    /// Drop the TTL so the memory never expires
    pub async fn promote_to_long_term(&self, id: MemoryId) -> Result<()> {
        self.db
            .interact(move |conn| {
                conn.execute(
                    "UPDATE memories SET ttl_seconds = NULL, expires_at = NULL WHERE id = ?1",
                    params![id.to_string()],
                )?;
                Ok(())
            })
            .await
    }

    /// Active, unexpired memories with embeddings in one project scope
    ///
    /// `None` selects global (project-less) memories only.
    pub async fn list_active_in_scope(&self, project_id: Option<String>) -> Result<Vec<Memory>> {
        let now = to_millis(Utc::now());
        self.db
            .interact(move |conn| {
                let sql = format!(
                    "SELECT {} FROM memories
                     WHERE replaced_by IS NULL
                       AND embedding IS NOT NULL
                       AND (expires_at IS NULL OR expires_at > ?1)
                       AND ((?2 IS NULL AND project_id IS NULL) OR project_id = ?2)",
                    MEMORY_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![now, project_id], row_to_memory)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }

    /// Distinct project scopes that hold active memories (`None` = global)
    pub async fn list_scopes(&self) -> Result<Vec<Option<String>>> {
        self.db
            .interact(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT project_id FROM memories WHERE replaced_by IS NULL",
                )?;
                let rows = stmt.query_map([], |row| row.get::<_, Option<String>>(0))?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }

    /// Memories above `threshold` cosine similarity to `embedding`, best first
    pub async fn find_similar(
        &self,
        embedding: &[f32],
        project_id: Option<String>,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarMemory>> {
        let candidates = self.list_active_in_scope(project_id).await?;
        Ok(rank_similar(embedding, candidates, threshold, limit))
    }

    pub async fn store_relationship(&self, rel: &Relationship) -> Result<()> {
        let rel = rel.clone();
        self.db
            .interact(move |conn| {
                conn.execute(
                    "INSERT INTO memory_relationships
                        (id, from_memory_id, to_memory_id, relationship, strength, context, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT (from_memory_id, to_memory_id, relationship)
                     DO UPDATE SET strength = excluded.strength",
                    params![
                        rel.id.to_string(),
                        rel.from_memory_id.to_string(),
                        rel.to_memory_id.to_string(),
                        rel.relationship,
                        rel.strength as f64,
                        rel.context,
                        to_millis(rel.created_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Relationships touching a memory in either direction
    pub async fn relationships_for(&self, id: MemoryId) -> Result<Vec<Relationship>> {
        self.db
            .interact(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, from_memory_id, to_memory_id, relationship, strength, context, created_at
                     FROM memory_relationships
                     WHERE from_memory_id = ?1 OR to_memory_id = ?1
                     ORDER BY created_at ASC",
                )?;
                let rows = stmt.query_map(params![id.to_string()], |row| {
                    Ok(Relationship {
                        id: uuid_col(row, 0)?,
                        from_memory_id: MemoryId(uuid_col(row, 1)?),
                        to_memory_id: MemoryId(uuid_col(row, 2)?),
                        relationship: row.get(3)?,
                        strength: row.get::<_, f64>(4)? as f32,
                        context: row.get(5)?,
                        created_at: from_millis(row.get(6)?),
                    })
                })?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }

    /// Hard-delete memories replaced before `before`
    pub async fn cleanup_replaced(&self, before: DateTime<Utc>) -> Result<usize> {
        let cutoff = to_millis(before);
        self.db
            .interact(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM memories WHERE replaced_by IS NOT NULL AND replaced_at < ?1",
                    params![cutoff],
                )?)
            })
            .await
    }
}

/// Rank candidates by cosine similarity, keep those at or above `threshold`
pub fn rank_similar(
    embedding: &[f32],
    candidates: Vec<Memory>,
    threshold: f64,
    limit: usize,
) -> Vec<SimilarMemory> {
    let mut scored: Vec<SimilarMemory> = candidates
        .into_iter()
        .filter_map(|memory| {
            let similarity = cosine_similarity(embedding, memory.embedding.as_deref()?) as f64;
            (similarity >= threshold).then_some(SimilarMemory { memory, similarity })
        })
        .collect();
    scored.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(limit);
    scored
}

/// Cosine similarity; mismatched or zero vectors score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

fn embedding_json(embedding: Option<&[f32]>) -> Result<Option<String>> {
    Ok(embedding.map(serde_json::to_string).transpose()?)
}

pub(crate) fn row_to_memory(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let embedding: Option<String> = row.get(4)?;
    let tags: String = row.get(9)?;
    let merged_from: String = row.get(17)?;
    let memory_type: String = row.get(5)?;
    let scope: String = row.get(6)?;

    let state = match opt_uuid_col(row, 18)? {
        Some(by) => MemoryState::Replaced { by: MemoryId(by) },
        None => MemoryState::Active,
    };

    Ok(Memory {
        id: MemoryId(uuid_col(row, 0)?),
        title: row.get(1)?,
        content: row.get(2)?,
        summary: row.get(3)?,
        embedding: embedding.and_then(|s| serde_json::from_str(&s).ok()),
        memory_type: MemoryType::normalize(&memory_type),
        scope: MemoryScope::parse(&scope),
        project_id: row.get(7)?,
        agent_source: row.get(8)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        importance: row.get::<_, f64>(10)? as f32,
        ttl_seconds: row.get(11)?,
        access_count: row.get(12)?,
        created_at: from_millis(row.get(13)?),
        updated_at: from_millis(row.get(14)?),
        expires_at: opt_from_millis(row.get(15)?),
        version: row.get(16)?,
        merged_from: serde_json::from_str::<Vec<Uuid>>(&merged_from)
            .unwrap_or_default()
            .into_iter()
            .map(MemoryId)
            .collect(),
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let v = vec![0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal_and_mismatch() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
