//! Error types for the steward subsystem
//!
//! Structured errors via thiserror; anyhow is accepted at the edges and folded
//! into [`StewardError::Other`].

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for steward operations
#[derive(Error, Debug)]
pub enum StewardError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite driver error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool could not hand out a connection
    #[error("Pool error: {0}")]
    Pool(String),

    /// Malformed input (payloads, decisions, configuration values)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Decision model call or response failed
    #[error("Decision model error: {0}")]
    Decision(String),

    /// Circuit breaker is open, the decision model was not called
    #[error("Circuit breaker open")]
    CircuitOpen,

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid identifier format
    #[error("Invalid id: {0}")]
    InvalidId(#[from] uuid::Error),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation exceeded its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The job is no longer running under this worker's lease
    #[error("Lease lost on job {0}")]
    LeaseLost(Uuid),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl StewardError {
    /// Whether a job failing with this error should be requeued with backoff.
    ///
    /// Malformed input will fail the same way on every attempt, so it goes
    /// straight to the dead-letter state.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StewardError::Validation(_) | StewardError::InvalidId(_)
        )
    }

    /// Short machine-readable class recorded on failed runs
    pub fn class(&self) -> &'static str {
        match self {
            StewardError::Validation(_) | StewardError::InvalidId(_) => "validation_error",
            StewardError::Decision(_) | StewardError::CircuitOpen => "model_error",
            StewardError::Timeout(_) => "timeout",
            StewardError::LeaseLost(_) => "lease_lost",
            StewardError::Database(_) | StewardError::Sqlite(_) | StewardError::Pool(_) => {
                "store_error"
            }
            _ => "executor_error",
        }
    }
}

/// Result type alias for steward operations
pub type Result<T> = std::result::Result<T, StewardError>;

impl From<anyhow::Error> for StewardError {
    fn from(err: anyhow::Error) -> Self {
        StewardError::Other(err.to_string())
    }
}

impl From<config::ConfigError> for StewardError {
    fn from(err: config::ConfigError) -> Self {
        StewardError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for StewardError {
    fn from(err: toml::de::Error) -> Self {
        StewardError::Config(err.to_string())
    }
}
