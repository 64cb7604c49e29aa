//! Policy history, tuning evidence and derivation records

use super::{from_millis, json_col, opt_uuid_col, to_millis, uuid_col, uuid_list_col, uuid_list_json, Database};
use crate::error::{Result, StewardError};
use crate::steward::types::{Derivation, DerivationStatus, PolicyChange};
use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

const POLICY_COLUMNS: &str = "id, policy_key, prior_value, new_value, reason, sample_size, evidence, \
     changed_by, rollback_of_id, created_at";

/// Observed outcomes over the last 24 hours
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyTuningEvidence {
    pub sample_size: i64,
    pub success_rate_24h: f64,
    pub accepted_suggest_24h: i64,
    pub dismissed_suggest_24h: i64,
    pub accepted_derive_24h: i64,
    pub skipped_derive_24h: i64,
}

impl PolicyTuningEvidence {
    pub fn suggest_total(&self) -> i64 {
        self.accepted_suggest_24h + self.dismissed_suggest_24h
    }

    pub fn derivation_total(&self) -> i64 {
        self.accepted_derive_24h + self.skipped_derive_24h
    }
}

#[derive(Debug, Clone)]
pub struct PolicyRepository {
    db: Database,
}

impl PolicyRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn tuning_evidence(&self) -> Result<PolicyTuningEvidence> {
        let day_ago = to_millis(Utc::now() - ChronoDuration::hours(24));
        self.db
            .interact(move |conn| {
                let (sample_size, success_rate_24h): (i64, f64) = conn.query_row(
                    "SELECT COUNT(*),
                            COALESCE(AVG(CASE WHEN status = 'succeeded' THEN 1.0 ELSE 0.0 END), 0)
                     FROM steward_runs WHERE created_at >= ?1",
                    params![day_ago],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                let (accepted_suggest_24h, dismissed_suggest_24h): (i64, i64) = conn.query_row(
                    "SELECT COALESCE(SUM(CASE WHEN status = 'accepted' THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN status = 'dismissed' THEN 1 ELSE 0 END), 0)
                     FROM consolidation_suggestions WHERE created_at >= ?1",
                    params![day_ago],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                let (accepted_derive_24h, skipped_derive_24h): (i64, i64) = conn.query_row(
                    "SELECT COALESCE(SUM(CASE WHEN status = 'accepted' THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN status = 'skipped' THEN 1 ELSE 0 END), 0)
                     FROM memory_derivations WHERE created_at >= ?1",
                    params![day_ago],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok(PolicyTuningEvidence {
                    sample_size,
                    success_rate_24h,
                    accepted_suggest_24h,
                    dismissed_suggest_24h,
                    accepted_derive_24h,
                    skipped_derive_24h,
                })
            })
            .await
    }

    pub async fn insert_policy_change(&self, change: PolicyChange) -> Result<PolicyChange> {
        let mut change = change;
        if change.id.is_nil() {
            change.id = Uuid::new_v4();
        }
        if change.changed_by.is_empty() {
            change.changed_by = "steward".to_string();
        }
        if change.evidence.is_null() {
            change.evidence = json!({});
        }
        change.created_at = Utc::now();

        let row = change.clone();
        self.db
            .interact(move |conn| {
                conn.execute(
                    "INSERT INTO steward_policy_history
                        (id, policy_key, prior_value, new_value, reason, sample_size, evidence,
                         changed_by, rollback_of_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        row.id.to_string(),
                        row.policy_key,
                        row.prior_value,
                        row.new_value,
                        row.reason,
                        row.sample_size,
                        row.evidence.to_string(),
                        row.changed_by,
                        row.rollback_of_id.map(|id| id.to_string()),
                        to_millis(row.created_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(change)
    }

    /// Newest first, optionally for a single key
    pub async fn list_policy_changes(
        &self,
        policy_key: Option<String>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<PolicyChange>> {
        let limit = if limit <= 0 { 50 } else { limit };
        let policy_key = policy_key.filter(|k| !k.is_empty());
        self.db
            .interact(move |conn| {
                let sql = format!(
                    "SELECT {} FROM steward_policy_history
                     WHERE (?1 IS NULL OR policy_key = ?1)
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?2 OFFSET ?3",
                    POLICY_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    params![policy_key, limit, offset.max(0)],
                    row_to_policy_change,
                )?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }

    pub async fn latest_policy_change(&self, policy_key: &str) -> Result<PolicyChange> {
        self.find_latest_policy_change(policy_key)
            .await?
            .ok_or_else(|| {
                StewardError::NotFound(format!("no policy history for key {:?}", policy_key))
            })
    }

    /// Latest history row for `policy_key`, if the key was ever changed
    pub async fn find_latest_policy_change(&self, policy_key: &str) -> Result<Option<PolicyChange>> {
        let key = policy_key.to_string();
        self.db
            .interact(move |conn| {
                let sql = format!(
                    "SELECT {} FROM steward_policy_history
                     WHERE policy_key = ?1
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT 1",
                    POLICY_COLUMNS
                );
                Ok(conn
                    .query_row(&sql, params![key], row_to_policy_change)
                    .optional()?)
            })
            .await
    }

    /// Insert the inverse of the latest change for `policy_key`
    pub async fn rollback_latest(&self, policy_key: &str) -> Result<PolicyChange> {
        let latest = self.latest_policy_change(policy_key).await?;
        let (Some(prior), Some(new)) = (latest.prior_value, latest.new_value) else {
            return Err(StewardError::Validation(
                "latest policy change has no rollback value".to_string(),
            ));
        };

        let rollback = PolicyChange {
            id: Uuid::new_v4(),
            policy_key: policy_key.to_string(),
            prior_value: Some(new),
            new_value: Some(prior),
            reason: Some("rollback latest policy change".to_string()),
            sample_size: Some(0),
            evidence: json!({ "rollback_of_id": latest.id.to_string() }),
            changed_by: "steward:rollback".to_string(),
            rollback_of_id: Some(latest.id),
            created_at: Utc::now(),
        };
        let inserted = self.insert_policy_change(rollback).await?;
        info!(
            "Rolled back policy {} from {} to {}",
            policy_key, new, prior
        );
        Ok(inserted)
    }

    pub async fn store_derivation(&self, derivation: &Derivation) -> Result<()> {
        let d = derivation.clone();
        self.db
            .interact(move |conn| {
                conn.execute(
                    "INSERT INTO memory_derivations
                        (id, source_memory_ids, derived_memory_id, derivation_type, confidence,
                         novelty, status, model, payload, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        d.id.to_string(),
                        uuid_list_json(&d.source_memory_ids),
                        d.derived_memory_id.map(|id| id.to_string()),
                        d.derivation_type,
                        d.confidence,
                        d.novelty,
                        d.status.as_str(),
                        d.model,
                        d.payload.to_string(),
                        to_millis(d.created_at),
                        to_millis(d.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Derivation records, newest first
    pub async fn list_derivations(&self, limit: i64, offset: i64) -> Result<Vec<Derivation>> {
        let limit = if limit <= 0 { 50 } else { limit };
        self.db
            .interact(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, source_memory_ids, derived_memory_id, derivation_type, confidence,
                            novelty, status, model, payload, created_at, updated_at
                     FROM memory_derivations
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt.query_map(params![limit, offset.max(0)], |row| {
                    let status: String = row.get(6)?;
                    Ok(Derivation {
                        id: uuid_col(row, 0)?,
                        source_memory_ids: uuid_list_col(row, 1)?,
                        derived_memory_id: opt_uuid_col(row, 2)?,
                        derivation_type: row.get(3)?,
                        confidence: row.get(4)?,
                        novelty: row.get(5)?,
                        status: if status == "accepted" {
                            DerivationStatus::Accepted
                        } else {
                            DerivationStatus::Skipped
                        },
                        model: row.get(7)?,
                        payload: json_col(row, 8, json!({}))?,
                        created_at: from_millis(row.get(9)?),
                        updated_at: from_millis(row.get(10)?),
                    })
                })?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }
}

fn row_to_policy_change(row: &Row<'_>) -> rusqlite::Result<PolicyChange> {
    Ok(PolicyChange {
        id: uuid_col(row, 0)?,
        policy_key: row.get(1)?,
        prior_value: row.get(2)?,
        new_value: row.get(3)?,
        reason: row.get(4)?,
        sample_size: row.get(5)?,
        evidence: json_col(row, 6, json!({}))?,
        changed_by: row.get(7)?,
        rollback_of_id: opt_uuid_col(row, 8)?,
        created_at: from_millis(row.get(9)?),
    })
}
