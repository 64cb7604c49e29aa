//! Common test utilities and helpers

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use steward_core::config::{MemoryConfig, StewardConfig};
use steward_core::storage::consolidation::ConsolidationRepository;
use steward_core::types::DuplicatePair;
use steward_core::{
    Database, Embedder, LocalMemoryService, Memory, MemoryId, MemoryScope, MemoryState,
    MemoryType, Result, SuggestionStatus,
};
use tempfile::TempDir;
use uuid::Uuid;

pub const EMBEDDING_DIMS: usize = 64;

/// Create a fresh file-backed database
///
/// `:memory:` would give every pooled connection its own empty database, so
/// tests use a temp file; keep the `TempDir` alive for the test's duration.
pub async fn create_test_db() -> (TempDir, Database) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::open(dir.path().join("steward_test.db"))
        .await
        .expect("Failed to open test database");
    (dir, db)
}

/// Deterministic bag-of-words embedder
///
/// Every lowercase word is hashed into one of [`EMBEDDING_DIMS`] buckets and
/// the vector is L2-normalised, so identical texts have similarity 1.0 and
/// texts sharing most words stay close.
#[derive(Debug, Default, Clone)]
pub struct HashEmbedder;

pub fn hash_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBEDDING_DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in word.to_lowercase().bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        vector[(hash % EMBEDDING_DIMS as u64) as usize] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(hash_embedding(text))
    }

    fn model_name(&self) -> &str {
        "hash-bow"
    }
}

pub fn create_memory_service(db: &Database) -> Arc<LocalMemoryService> {
    create_memory_service_with(db, MemoryConfig::default())
}

pub fn create_memory_service_with(db: &Database, config: MemoryConfig) -> Arc<LocalMemoryService> {
    Arc::new(LocalMemoryService::new(
        db.clone(),
        Arc::new(HashEmbedder),
        config,
    ))
}

/// Steward config for tests: mutations enabled, short timeouts
pub fn test_steward_config() -> StewardConfig {
    let mut config = StewardConfig::default();
    config.enabled = true;
    config.dry_run = false;
    config.request_timeout = std::time::Duration::from_secs(5);
    config
}

/// An active memory with an embedding of its own title and content
pub fn sample_memory(title: &str, content: &str, project: Option<&str>) -> Memory {
    let now = Utc::now();
    Memory {
        id: MemoryId::new(),
        title: title.to_string(),
        content: content.to_string(),
        summary: None,
        embedding: Some(hash_embedding(&format!("{} {}", title, content))),
        memory_type: MemoryType::General,
        scope: if project.is_some() {
            MemoryScope::Project
        } else {
            MemoryScope::Global
        },
        project_id: project.map(String::from),
        agent_source: Some("test".to_string()),
        tags: vec!["test".to_string()],
        importance: 0.5,
        ttl_seconds: None,
        access_count: 0,
        created_at: now,
        updated_at: now,
        expires_at: None,
        version: 1,
        merged_from: vec![],
        state: MemoryState::Active,
    }
}

/// Insert `memory` directly, bypassing write-time dedup
pub async fn insert_memory(service: &LocalMemoryService, memory: &Memory) {
    service
        .repository()
        .insert(memory)
        .await
        .expect("Failed to insert memory");
}

/// Persist a pending suggestion for the pair and return its id
pub async fn insert_suggestion(
    db: &Database,
    a: &Memory,
    b: &Memory,
    similarity: f64,
    project: Option<&str>,
) -> Uuid {
    let repo = ConsolidationRepository::new(db.clone());
    repo.upsert_suggestion(&DuplicatePair::new(
        a.id,
        b.id,
        similarity,
        project.map(String::from),
    ))
    .await
    .expect("Failed to upsert suggestion");

    let (pending, _) = repo
        .list_suggestions(None, SuggestionStatus::Pending, 100, 0)
        .await
        .expect("Failed to list suggestions");
    pending
        .into_iter()
        .find(|s| {
            (s.memory_a_id == a.id && s.memory_b_id == b.id)
                || (s.memory_a_id == b.id && s.memory_b_id == a.id)
        })
        .map(|s| s.id)
        .expect("Suggestion not found after upsert")
}
