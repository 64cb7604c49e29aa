//! Embedding generation through an Ollama-compatible `/api/embed` endpoint

use crate::config::EmbeddingConfig;
use crate::error::{Result, StewardError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Produces a vector for a piece of text
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn model_name(&self) -> &str;
}

pub struct OllamaEmbedder {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StewardError::Embedding(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Embedding {} chars with {}", text.len(), self.model);

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&EmbedRequest {
                model: &self.model,
                input: text,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StewardError::Embedding(format!(
                "embedding request failed with status {}: {}",
                status, body
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| StewardError::Embedding(format!("Failed to parse response: {}", e)))?;

        parsed
            .embeddings
            .into_iter()
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| StewardError::Embedding("empty embedding in response".to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let config = EmbeddingConfig {
            url: "http://localhost:11434/".to_string(),
            model: "nomic-embed-text".to_string(),
            timeout: Duration::from_secs(5),
        };
        let embedder = OllamaEmbedder::new(&config).unwrap();
        assert_eq!(embedder.base_url, "http://localhost:11434");
        assert_eq!(embedder.model_name(), "nomic-embed-text");
    }

    #[test]
    fn test_response_missing_embeddings_defaults_empty() {
        let parsed: EmbedResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.embeddings.is_empty());
    }
}
