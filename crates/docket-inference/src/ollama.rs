//! Ollama embedding backend implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use docket_core::{
    embed_each_with_fallback, BatchEmbedding, EmbeddingBackend, Error, Result, Vector,
};

/// Default Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = docket_core::defaults::OLLAMA_URL;

/// Default embedding model.
pub const DEFAULT_EMBED_MODEL: &str = docket_core::defaults::EMBED_MODEL;

/// Default embedding dimension for nomic-embed-text.
pub const DEFAULT_DIMENSION: usize = docket_core::defaults::EMBED_DIMENSION;

/// Timeout for embedding requests (seconds).
pub const EMBED_TIMEOUT_SECS: u64 = docket_core::defaults::EMBED_TIMEOUT_SECS;

/// Embedding calls slower than this are logged at WARN.
const SLOW_EMBED_MS: u64 = 5_000;

/// Ollama embedding backend.
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    embed_model: String,
    dimension: usize,
    embed_timeout_secs: u64,
}

impl OllamaBackend {
    /// Create a new Ollama backend with default settings.
    pub fn new() -> Self {
        Self::with_config(
            DEFAULT_OLLAMA_URL.to_string(),
            DEFAULT_EMBED_MODEL.to_string(),
            DEFAULT_DIMENSION,
        )
    }

    /// Create a new Ollama backend with custom configuration.
    pub fn with_config(base_url: String, embed_model: String, dimension: usize) -> Self {
        Self::with_timeout(base_url, embed_model, dimension, EMBED_TIMEOUT_SECS)
    }

    /// Create a new Ollama backend with an explicit request timeout.
    pub fn with_timeout(
        base_url: String,
        embed_model: String,
        dimension: usize,
        embed_timeout_secs: u64,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(embed_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build tuned HTTP client, using defaults");
                Client::new()
            });

        info!(
            subsystem = "inference",
            component = "ollama",
            url = %base_url,
            model = %embed_model,
            dimension,
            "Initializing Ollama embedding backend"
        );

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            embed_model,
            dimension,
            embed_timeout_secs,
        }
    }

    /// Create from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `OLLAMA_BASE` | `http://127.0.0.1:11434` |
    /// | `OLLAMA_EMBED_MODEL` | `nomic-embed-text` |
    /// | `OLLAMA_EMBED_DIM` | `768` |
    /// | `EMBED_TIMEOUT_SECS` | `30` |
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("OLLAMA_BASE").unwrap_or_else(|_| DEFAULT_OLLAMA_URL.to_string());
        let embed_model =
            std::env::var("OLLAMA_EMBED_MODEL").unwrap_or_else(|_| DEFAULT_EMBED_MODEL.to_string());
        let dimension = std::env::var("OLLAMA_EMBED_DIM")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_DIMENSION);
        let timeout = std::env::var("EMBED_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(EMBED_TIMEOUT_SECS);

        Self::with_timeout(base_url, embed_model, dimension, timeout)
    }

    /// Base URL requests are sent to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Embed several texts in one `/api/embed` request.
    ///
    /// Fails as a whole on transport errors, non-2xx responses, a vector count
    /// that differs from the input count, or any vector of the wrong dimension.
    #[instrument(skip(self, texts), fields(subsystem = "inference", component = "ollama", op = "embed_texts", model = %self.embed_model, input_count = texts.len()))]
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let start = Instant::now();

        let request = EmbeddingRequest {
            model: self.embed_model.clone(),
            input: texts.to_vec(),
        };

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .timeout(Duration::from_secs(self.embed_timeout_secs))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!(
                "Ollama returned {}: {}",
                status, body
            )));
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("Failed to parse response: {}", e)))?;

        if result.embeddings.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                result.embeddings.len()
            )));
        }
        if let Some(bad) = result
            .embeddings
            .iter()
            .find(|v| v.len() != self.dimension)
        {
            return Err(Error::Embedding(format!(
                "expected {} dimensions, got {}",
                self.dimension,
                bad.len()
            )));
        }

        let elapsed = start.elapsed().as_millis() as u64;
        debug!(
            result_count = result.embeddings.len(),
            duration_ms = elapsed,
            "Embedding complete"
        );
        if elapsed > SLOW_EMBED_MS {
            warn!(
                duration_ms = elapsed,
                input_count = texts.len(),
                slow = true,
                "Slow embedding operation"
            );
        }
        Ok(result.embeddings)
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingBackend for OllamaBackend {
    async fn embed(&self, text: &str) -> Result<Vector> {
        self.embed_texts(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("empty embedding response".into()))
    }

    /// One request for the whole batch; if that fails, retry item by item so
    /// a single bad input degrades to a zero vector instead of sinking the
    /// batch.
    async fn embed_batch(&self, texts: &[String]) -> Result<BatchEmbedding> {
        match self.embed_texts(texts).await {
            Ok(vectors) => Ok(BatchEmbedding {
                vectors,
                fallback_indices: Vec::new(),
            }),
            Err(e) => {
                warn!(
                    subsystem = "inference",
                    component = "ollama",
                    input_count = texts.len(),
                    error = %e,
                    "Batch embedding failed, retrying per item"
                );
                Ok(embed_each_with_fallback(self, texts).await)
            }
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.embed_model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(DEFAULT_OLLAMA_URL, "http://127.0.0.1:11434");
        assert_eq!(DEFAULT_EMBED_MODEL, "nomic-embed-text");
        assert_eq!(DEFAULT_DIMENSION, 768);
    }

    #[test]
    fn test_new_uses_defaults() {
        let backend = OllamaBackend::new();
        assert_eq!(backend.base_url(), DEFAULT_OLLAMA_URL);
        assert_eq!(backend.model_name(), DEFAULT_EMBED_MODEL);
        assert_eq!(backend.dimension(), DEFAULT_DIMENSION);
    }

    #[test]
    fn test_with_config_trims_trailing_slash() {
        let backend =
            OllamaBackend::with_config("http://gpu-box:11434/".into(), "mxbai".into(), 1024);
        assert_eq!(backend.base_url(), "http://gpu-box:11434");
        assert_eq!(backend.model_name(), "mxbai");
        assert_eq!(backend.dimension(), 1024);
    }

    #[tokio::test]
    async fn test_embed_texts_empty_makes_no_request() {
        // Unroutable URL: any request would fail.
        let backend = OllamaBackend::with_config("http://127.0.0.1:1".into(), "m".into(), 3);
        assert!(backend.embed_texts(&[]).await.unwrap().is_empty());
    }
}
