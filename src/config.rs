//! Configuration for the steward and the memory store it maintains
//!
//! Values come from built-in defaults, an optional TOML file and `STEWARD__*`
//! environment variables, in that order of precedence (last wins).

use crate::error::{Result, StewardError};
use crate::types::MergeStrategy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "STEWARD";

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub embeddings: EmbeddingConfig,
    pub memory: MemoryConfig,
    pub steward: StewardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("steward.db"),
            pool_size: 8,
        }
    }
}

/// Embedding endpoint (Ollama `/api/embed`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub url: String,
    pub model: String,
    #[serde(with = "serde_duration")]
    pub timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// TTL applied to short-term memories
    pub default_ttl_seconds: i64,
    /// Importance at or above which a memory is kept long-term
    pub promote_importance: f32,
    pub consolidation: ConsolidationConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 86_400,
            promote_importance: 0.8,
            consolidation: ConsolidationConfig::default(),
        }
    }
}

/// Write-time dedup and background duplicate scan settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub enabled: bool,
    pub auto_merge_threshold: f64,
    pub suggest_threshold: f64,
    pub merge_strategy: MergeStrategy,
    pub scan_batch_size: usize,
    #[serde(with = "serde_duration")]
    pub replaced_retention: Duration,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_merge_threshold: 0.92,
            suggest_threshold: 0.75,
            merge_strategy: MergeStrategy::SmartMerge,
            scan_batch_size: 100,
            replaced_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Steward manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StewardConfig {
    pub enabled: bool,
    /// Report decisions without mutating memories
    pub dry_run: bool,
    #[serde(with = "serde_duration")]
    pub tick_interval: Duration,
    pub claim_batch_size: usize,
    pub max_attempts: u32,
    /// Per-job deadline; also sizes the claim lease
    #[serde(with = "serde_duration")]
    pub request_timeout: Duration,
    pub ollama_url: String,
    pub model: String,
    pub fallback_model: String,
    pub auto_merge_threshold: f64,
    pub auto_merge_from_suggestions: bool,
    pub llm_conflict_guard_enabled: bool,
    pub breaker: BreakerConfig,
    pub derivation: DerivationConfig,
    pub self_learn: SelfLearnConfig,
    pub retention: RetentionConfig,
}

impl Default for StewardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: true,
            tick_interval: Duration::from_secs(30),
            claim_batch_size: 10,
            max_attempts: 3,
            request_timeout: Duration::from_secs(30),
            ollama_url: "http://localhost:11434".to_string(),
            model: "qwen2.5:3b".to_string(),
            fallback_model: "qwen2.5:1.5b".to_string(),
            auto_merge_threshold: 0.92,
            auto_merge_from_suggestions: true,
            llm_conflict_guard_enabled: false,
            breaker: BreakerConfig::default(),
            derivation: DerivationConfig::default(),
            self_learn: SelfLearnConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl StewardConfig {
    /// Lease granted to claimed jobs
    pub fn lease_duration(&self) -> Duration {
        std::cmp::max(self.request_timeout * 2, Duration::from_secs(30))
    }

    /// Time a leader lock stays valid without being refreshed
    pub fn leader_ttl(&self) -> Duration {
        std::cmp::max(self.tick_interval * 3, Duration::from_secs(60))
    }

    pub fn max_queued_total(&self) -> usize {
        std::cmp::max(100, self.claim_batch_size * 20)
    }

    pub fn max_queued_per_project(&self) -> usize {
        std::cmp::max(20, self.claim_batch_size * 5)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "serde_duration")]
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivationConfig {
    pub enabled: bool,
    pub max_candidates: i64,
    pub min_confidence: f64,
    pub min_novelty: f64,
}

impl Default for DerivationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_candidates: 3,
            min_confidence: 0.8,
            min_novelty: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfLearnConfig {
    pub enabled: bool,
    #[serde(with = "serde_duration")]
    pub eval_interval: Duration,
    pub min_sample_size: i64,
}

impl Default for SelfLearnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            eval_interval: Duration::from_secs(24 * 3600),
            min_sample_size: 100,
        }
    }
}

/// Audit log retention; a value of 0 keeps rows forever
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub run_log_days: i64,
    pub event_log_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            run_log_days: 14,
            event_log_days: 14,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, an optional TOML file, then environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?);

        if let Some(path) = path {
            debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let consolidation = &self.memory.consolidation;
        check_unit("memory.consolidation.auto_merge_threshold", consolidation.auto_merge_threshold)?;
        check_unit("memory.consolidation.suggest_threshold", consolidation.suggest_threshold)?;
        if consolidation.suggest_threshold > consolidation.auto_merge_threshold {
            return Err(StewardError::Config(
                "memory.consolidation.suggest_threshold must not exceed auto_merge_threshold"
                    .to_string(),
            ));
        }
        check_unit("memory.promote_importance", self.memory.promote_importance as f64)?;

        let steward = &self.steward;
        check_unit("steward.auto_merge_threshold", steward.auto_merge_threshold)?;
        check_unit("steward.derivation.min_confidence", steward.derivation.min_confidence)?;
        check_unit("steward.derivation.min_novelty", steward.derivation.min_novelty)?;
        if steward.claim_batch_size == 0 {
            return Err(StewardError::Config(
                "steward.claim_batch_size must be at least 1".to_string(),
            ));
        }
        if steward.max_attempts == 0 {
            return Err(StewardError::Config(
                "steward.max_attempts must be at least 1".to_string(),
            ));
        }
        if steward.tick_interval.is_zero() {
            return Err(StewardError::Config(
                "steward.tick_interval must be greater than zero".to_string(),
            ));
        }
        if steward.request_timeout.is_zero() {
            return Err(StewardError::Config(
                "steward.request_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(StewardError::Config(format!(
            "{} must be between 0.0 and 1.0, got {}",
            name, value
        )));
    }
    Ok(())
}

// Custom serde module for Duration (serialize/deserialize as seconds)
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.steward.enabled);
        assert!(config.steward.dry_run);
        assert_eq!(config.steward.model, "qwen2.5:3b");
        assert_eq!(config.memory.consolidation.merge_strategy, MergeStrategy::SmartMerge);
    }

    #[test]
    fn test_lease_duration_floor() {
        let mut steward = StewardConfig::default();
        steward.request_timeout = Duration::from_secs(5);
        assert_eq!(steward.lease_duration(), Duration::from_secs(30));
        steward.request_timeout = Duration::from_secs(45);
        assert_eq!(steward.lease_duration(), Duration::from_secs(90));
    }

    #[test]
    fn test_backpressure_limits() {
        let mut steward = StewardConfig::default();
        assert_eq!(steward.max_queued_total(), 200);
        assert_eq!(steward.max_queued_per_project(), 50);
        steward.claim_batch_size = 1;
        assert_eq!(steward.max_queued_total(), 100);
        assert_eq!(steward.max_queued_per_project(), 20);
    }

    #[test]
    fn test_from_toml_partial() {
        let toml_str = r#"
[steward]
enabled = true
dry_run = false
tick_interval = 5

[steward.derivation]
enabled = true
min_confidence = 0.75

[memory.consolidation]
merge_strategy = "append"
"#;
        let config = AppConfig::from_toml(toml_str).unwrap();
        assert!(config.steward.enabled);
        assert!(!config.steward.dry_run);
        assert_eq!(config.steward.tick_interval, Duration::from_secs(5));
        assert!(config.steward.derivation.enabled);
        assert_eq!(config.steward.derivation.min_confidence, 0.75);
        assert_eq!(config.steward.derivation.max_candidates, 3);
        assert_eq!(config.memory.consolidation.merge_strategy, MergeStrategy::Append);
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = AppConfig::default();
        config.steward.auto_merge_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.memory.consolidation.suggest_threshold = 0.95;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.steward.claim_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_with_file_and_env_override() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("steward.toml");
        std::fs::write(&path, "[steward]\nclaim_batch_size = 4\nmodel = \"small\"\n").unwrap();

        std::env::set_var("STEWARD__STEWARD__MODEL", "from-env");
        let config = AppConfig::load(Some(&path));
        std::env::remove_var("STEWARD__STEWARD__MODEL");

        let config = config.unwrap();
        assert_eq!(config.steward.claim_batch_size, 4);
        assert_eq!(config.steward.model, "from-env");
    }
}
