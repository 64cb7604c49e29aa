//! Clients for the model services the steward talks to

pub mod decision;
pub mod embeddings;

pub use decision::{DecisionClient, DecisionKind, MergeDecider, MergeDecision, MergeDecisionInput};
pub use embeddings::{Embedder, OllamaEmbedder};
