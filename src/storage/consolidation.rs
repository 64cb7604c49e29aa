//! Consolidation repository: duplicate scan, suggestions and the merge log

use super::memories::{cosine_similarity, row_to_memory, MEMORY_COLUMNS};
use super::{
    from_millis, opt_from_millis, opt_uuid_col, parsed_col, strict_json_col, to_millis, uuid_col,
    Database,
};
use crate::error::Result;
use crate::types::{
    ConsolidationLog, ConsolidationSuggestion, DuplicatePair, Memory, MemoryId, SuggestionStatus,
};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Nearest neighbours kept per anchor memory during a scan
const SCAN_NEIGHBOURS: usize = 3;

/// Point-in-time view of a suggestion and the two memories it links
#[derive(Debug, Clone, PartialEq)]
pub struct SuggestionSnapshot {
    pub suggestion: ConsolidationSuggestion,
    pub memory_a_project: Option<String>,
    pub memory_b_project: Option<String>,
    pub memory_a_replaced_by: Option<MemoryId>,
    pub memory_b_replaced_by: Option<MemoryId>,
}

impl SuggestionSnapshot {
    /// Either side has already been merged away
    pub fn is_stale(&self) -> bool {
        self.memory_a_replaced_by.is_some() || self.memory_b_replaced_by.is_some()
    }

    /// Both sides are project-scoped and the projects differ
    pub fn has_project_mismatch(&self) -> bool {
        match (&self.memory_a_project, &self.memory_b_project) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsolidationRepository {
    db: Database,
}

impl ConsolidationRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Find likely duplicate pairs among recently updated memories
    ///
    /// Up to `batch_size` of the most recently updated active memories act as
    /// anchors. Each anchor is compared against every active memory in the same
    /// project scope; the best [`SCAN_NEIGHBOURS`] matches at or above
    /// `threshold` become pairs. Pairs are canonical and deduplicated, keeping
    /// the highest similarity seen.
    pub async fn scan_duplicates(
        &self,
        threshold: f64,
        batch_size: usize,
    ) -> Result<Vec<DuplicatePair>> {
        let now = to_millis(Utc::now());
        let candidates: Vec<Memory> = self
            .db
            .interact(move |conn| {
                let sql = format!(
                    "SELECT {} FROM memories
                     WHERE replaced_by IS NULL
                       AND embedding IS NOT NULL
                       AND (expires_at IS NULL OR expires_at > ?1)
                     ORDER BY updated_at DESC",
                    MEMORY_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![now], row_to_memory)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;

        let pairs = find_duplicate_pairs(&candidates, threshold, batch_size.max(1));
        debug!(
            "Duplicate scan compared {} memories, found {} pairs",
            candidates.len(),
            pairs.len()
        );
        Ok(pairs)
    }

    /// Insert a suggestion or raise the similarity of an existing one
    pub async fn upsert_suggestion(&self, pair: &DuplicatePair) -> Result<()> {
        let pair = DuplicatePair::new(
            pair.memory_a_id,
            pair.memory_b_id,
            pair.similarity,
            pair.project_id.clone(),
        );
        self.db
            .interact(move |conn| {
                conn.execute(
                    "INSERT INTO consolidation_suggestions
                        (id, memory_a_id, memory_b_id, similarity, status, project_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)
                     ON CONFLICT (memory_a_id, memory_b_id)
                     DO UPDATE SET similarity = MAX(similarity, excluded.similarity)",
                    params![
                        Uuid::new_v4().to_string(),
                        pair.memory_a_id.to_string(),
                        pair.memory_b_id.to_string(),
                        pair.similarity,
                        pair.project_id,
                        to_millis(Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Scan and persist every pair found; returns the number of pairs upserted
    pub async fn scan_and_upsert(&self, threshold: f64, batch_size: usize) -> Result<usize> {
        let pairs = self.scan_duplicates(threshold, batch_size).await?;
        for pair in &pairs {
            self.upsert_suggestion(pair).await?;
        }
        if !pairs.is_empty() {
            info!("Upserted {} consolidation suggestions", pairs.len());
        }
        Ok(pairs.len())
    }

    pub async fn get_suggestion(&self, id: Uuid) -> Result<Option<ConsolidationSuggestion>> {
        self.db
            .interact(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, memory_a_id, memory_b_id, similarity, status, project_id,
                                created_at, resolved_at
                         FROM consolidation_suggestions WHERE id = ?1",
                        params![id.to_string()],
                        row_to_suggestion,
                    )
                    .optional()?)
            })
            .await
    }

    /// Load a suggestion joined with the scope and replacement state of both memories
    pub async fn suggestion_snapshot(&self, id: Uuid) -> Result<Option<SuggestionSnapshot>> {
        self.db
            .interact(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT s.id, s.memory_a_id, s.memory_b_id, s.similarity, s.status, s.project_id,
                                s.created_at, s.resolved_at,
                                ma.project_id, mb.project_id, ma.replaced_by, mb.replaced_by
                         FROM consolidation_suggestions s
                         LEFT JOIN memories ma ON ma.id = s.memory_a_id
                         LEFT JOIN memories mb ON mb.id = s.memory_b_id
                         WHERE s.id = ?1",
                        params![id.to_string()],
                        |row| {
                            Ok(SuggestionSnapshot {
                                suggestion: row_to_suggestion(row)?,
                                memory_a_project: row.get(8)?,
                                memory_b_project: row.get(9)?,
                                memory_a_replaced_by: opt_uuid_col(row, 10)?.map(MemoryId),
                                memory_b_replaced_by: opt_uuid_col(row, 11)?.map(MemoryId),
                            })
                        },
                    )
                    .optional()?)
            })
            .await
    }

    /// Set a suggestion's status; resolved states stamp `resolved_at`
    pub async fn update_suggestion_status(&self, id: Uuid, status: SuggestionStatus) -> Result<bool> {
        let resolved_at = status.is_resolved().then(|| to_millis(Utc::now()));
        let changed = self
            .db
            .interact(move |conn| {
                Ok(conn.execute(
                    "UPDATE consolidation_suggestions SET status = ?2, resolved_at = ?3 WHERE id = ?1",
                    params![id.to_string(), status.as_str(), resolved_at],
                )?)
            })
            .await?;
        debug!("Suggestion {} -> {}", id, status.as_str());
        Ok(changed > 0)
    }

    /// Page through suggestions by status, highest similarity first
    pub async fn list_suggestions(
        &self,
        project_id: Option<String>,
        status: SuggestionStatus,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ConsolidationSuggestion>, i64)> {
        self.db
            .interact(move |conn| {
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM consolidation_suggestions
                     WHERE status = ?1 AND (?2 IS NULL OR project_id = ?2)",
                    params![status.as_str(), project_id],
                    |row| row.get(0),
                )?;
                let mut stmt = conn.prepare(
                    "SELECT id, memory_a_id, memory_b_id, similarity, status, project_id,
                            created_at, resolved_at
                     FROM consolidation_suggestions
                     WHERE status = ?1 AND (?2 IS NULL OR project_id = ?2)
                     ORDER BY similarity DESC, created_at ASC
                     LIMIT ?3 OFFSET ?4",
                )?;
                let rows = stmt.query_map(
                    params![status.as_str(), project_id, limit.max(0), offset.max(0)],
                    row_to_suggestion,
                )?;
                Ok((rows.collect::<rusqlite::Result<Vec<_>>>()?, total))
            })
            .await
    }

    pub async fn insert_log(&self, entry: &ConsolidationLog) -> Result<()> {
        let entry = entry.clone();
        self.db
            .interact(move |conn| {
                conn.execute(
                    "INSERT INTO consolidation_log
                        (id, target_id, source_ids, merge_strategy, similarity_score,
                         content_before, content_after, performed_by, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        entry.id.to_string(),
                        entry.target_id.to_string(),
                        serde_json::to_string(&entry.source_ids)?,
                        entry.merge_strategy.as_str(),
                        entry.similarity_score,
                        entry.content_before,
                        entry.content_after,
                        entry.performed_by,
                        to_millis(entry.created_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Merge log entries, newest first, optionally for one target
    pub async fn list_log(
        &self,
        target_id: Option<MemoryId>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ConsolidationLog>> {
        let target = target_id.map(|id| id.to_string());
        self.db
            .interact(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, target_id, source_ids, merge_strategy, similarity_score,
                            content_before, content_after, performed_by, created_at
                     FROM consolidation_log
                     WHERE (?1 IS NULL OR target_id = ?1)
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt.query_map(params![target, limit.max(0), offset.max(0)], |row| {
                    Ok(ConsolidationLog {
                        id: uuid_col(row, 0)?,
                        target_id: MemoryId(uuid_col(row, 1)?),
                        source_ids: strict_json_col(row, 2)?,
                        merge_strategy: parsed_col(row, 3)?,
                        similarity_score: row.get(4)?,
                        content_before: row.get(5)?,
                        content_after: row.get(6)?,
                        performed_by: row.get(7)?,
                        created_at: from_millis(row.get(8)?),
                    })
                })?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }
}

/// Pairwise comparison over an in-memory candidate set
///
/// `candidates` must be ordered most recently updated first; the first
/// `anchor_limit` entries act as anchors.
pub fn find_duplicate_pairs(
    candidates: &[Memory],
    threshold: f64,
    anchor_limit: usize,
) -> Vec<DuplicatePair> {
    let mut best: HashMap<(MemoryId, MemoryId), DuplicatePair> = HashMap::new();

    for anchor in candidates.iter().take(anchor_limit) {
        let Some(anchor_embedding) = anchor.embedding.as_deref() else {
            continue;
        };

        let mut neighbours: Vec<(&Memory, f64)> = candidates
            .iter()
            .filter(|other| other.id != anchor.id && other.project_id == anchor.project_id)
            .filter_map(|other| {
                let similarity =
                    cosine_similarity(anchor_embedding, other.embedding.as_deref()?) as f64;
                (similarity >= threshold).then_some((other, similarity))
            })
            .collect();
        neighbours.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        neighbours.truncate(SCAN_NEIGHBOURS);

        for (other, similarity) in neighbours {
            let pair = DuplicatePair::new(anchor.id, other.id, similarity, anchor.project_id.clone());
            best.entry((pair.memory_a_id, pair.memory_b_id))
                .and_modify(|existing| {
                    if similarity > existing.similarity {
                        existing.similarity = similarity;
                    }
                })
                .or_insert(pair);
        }
    }

    let mut pairs: Vec<DuplicatePair> = best.into_values().collect();
    pairs.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    pairs
}

fn row_to_suggestion(row: &Row<'_>) -> rusqlite::Result<ConsolidationSuggestion> {
    Ok(ConsolidationSuggestion {
        id: uuid_col(row, 0)?,
        memory_a_id: MemoryId(uuid_col(row, 1)?),
        memory_b_id: MemoryId(uuid_col(row, 2)?),
        similarity: row.get(3)?,
        status: parsed_col(row, 4)?,
        project_id: row.get(5)?,
        created_at: from_millis(row.get(6)?),
        resolved_at: opt_from_millis(row.get(7)?),
    })
}
