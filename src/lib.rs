//! Mnemo Steward - background maintenance for a shared agent memory store
//!
//! Agents write memories concurrently, which leaves near-duplicates behind.
//! The steward runs next to the store and keeps it tidy:
//! - a durable job queue with leased claims, retry and dead-letter
//! - auto-merge of high-similarity duplicate suggestions, optionally
//!   guarded by a local decision model behind a circuit breaker
//! - derivation of decision and workflow memories from merged content
//! - self-learning adjustment of its own thresholds, with rollback
//!
//! Every execution attempt is audited as a run with an ordered event log,
//! and everything persisted to the audit tables is redacted first.
//!
//! # Architecture
//!
//! - **Types**: memories, suggestions and merge bookkeeping
//! - **Storage**: SQLite repositories for memories, consolidation, jobs and policy
//! - **Memory**: the [`MemoryService`] seam and its SQLite-backed implementation
//! - **Services**: embedding and decision-model HTTP clients
//! - **Steward**: executors, circuit breaker and the scheduling [`Manager`]
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use steward_core::{AppConfig, Database, LocalMemoryService, Manager, OllamaEmbedder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load(None)?;
//!     let db = Database::open(&config.database.path).await?;
//!     let embedder = Arc::new(OllamaEmbedder::new(&config.embeddings)?);
//!     let memory = Arc::new(LocalMemoryService::new(db.clone(), embedder, config.memory.clone()));
//!
//!     let manager = Manager::new(db, memory, config.steward.clone(), None);
//!     manager.run_once().await?;
//!     println!("{}", serde_json::to_string_pretty(&manager.status().await)?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod memory;
pub mod redaction;
pub mod services;
pub mod steward;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use config::{AppConfig, MemoryConfig, StewardConfig};
pub use error::{Result, StewardError};
pub use memory::{LocalMemoryService, MemoryService};
pub use services::{DecisionClient, Embedder, MergeDecider, OllamaEmbedder};
pub use steward::{Manager, StewardStatus};
pub use storage::Database;
pub use types::{
    ConsolidationSuggestion, Memory, MemoryId, MemoryScope, MemoryState, MemoryType,
    MergeStrategy, StoreAction, StoreRequest, StoreResult, SuggestionStatus,
};
