//! Mock embedding backend for deterministic testing.
//!
//! Generates embeddings from the text content alone, so the same input
//! always yields the same vector. Inputs can be marked as failing to
//! exercise the zero-vector fallback path.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docket_inference::mock::MockEmbeddingBackend;
//! use docket_core::EmbeddingBackend;
//!
//! let backend = MockEmbeddingBackend::new()
//!     .with_dimension(32)
//!     .with_failing_input("poison");
//!
//! let batch = backend
//!     .embed_batch(&["fine".to_string(), "poison".to_string()])
//!     .await
//!     .unwrap();
//! assert_eq!(batch.fallback_indices, vec![1]);
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use docket_core::{EmbeddingBackend, Error, Result, Vector};

/// Mock embedding backend for testing.
#[derive(Clone)]
pub struct MockEmbeddingBackend {
    config: Arc<MockConfig>,
    embed_calls: Arc<AtomicUsize>,
}

#[derive(Debug, Clone)]
struct MockConfig {
    dimension: usize,
    model: String,
    failing_inputs: HashSet<String>,
    latency_ms: u64,
    failure_rate: f64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            model: "mock-embed".to_string(),
            failing_inputs: HashSet::new(),
            latency_ms: 0,
            failure_rate: 0.0,
        }
    }
}

impl MockEmbeddingBackend {
    /// Create a new mock backend with default configuration.
    pub fn new() -> Self {
        Self {
            config: Arc::new(MockConfig::default()),
            embed_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set the embedding dimension.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        Arc::make_mut(&mut self.config).dimension = dimension;
        self
    }

    /// Set the reported model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).model = model.into();
        self
    }

    /// Make `embed` fail for this exact input.
    pub fn with_failing_input(mut self, input: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config)
            .failing_inputs
            .insert(input.into());
        self
    }

    /// Set simulated latency for every call.
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        Arc::make_mut(&mut self.config).latency_ms = latency_ms;
        self
    }

    /// Set failure rate (0.0 - 1.0) for testing error handling.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        Arc::make_mut(&mut self.config).failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Number of `embed` calls made so far.
    pub fn embed_call_count(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    fn should_fail(&self, text: &str) -> bool {
        use rand::Rng;
        if self.config.failing_inputs.contains(text) {
            return true;
        }
        self.config.failure_rate > 0.0 && rand::thread_rng().gen::<f64>() < self.config.failure_rate
    }
}

impl Default for MockEmbeddingBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingBackend for MockEmbeddingBackend {
    async fn embed(&self, text: &str) -> Result<Vector> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);

        if self.config.latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.config.latency_ms)).await;
        }

        if self.should_fail(text) {
            return Err(Error::Embedding("simulated failure".into()));
        }

        Ok(MockEmbeddingGenerator::generate(text, self.config.dimension))
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// Mock embedding generator with deterministic output.
pub struct MockEmbeddingGenerator;

impl MockEmbeddingGenerator {
    /// Generate a deterministic unit vector from text.
    pub fn generate(text: &str, dimension: usize) -> Vector {
        let mut vec = vec![0.0; dimension];
        if dimension == 0 {
            return vec;
        }

        for (i, c) in text.chars().enumerate() {
            let idx = (c as usize + i) % dimension;
            vec[idx] += 0.1;
        }

        let magnitude: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            vec.iter_mut().for_each(|x| *x /= magnitude);
        }
        vec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_backend_embed() {
        let backend = MockEmbeddingBackend::new().with_dimension(128);

        let embedding = backend.embed("test").await.unwrap();
        assert_eq!(embedding.len(), 128);
        assert_eq!(backend.embed_call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_backend_deterministic() {
        let backend = MockEmbeddingBackend::new();

        let e1 = backend.embed("quantum computing").await.unwrap();
        let e2 = backend.embed("quantum computing").await.unwrap();
        assert_eq!(e1, e2, "Embeddings should be deterministic");
    }

    #[tokio::test]
    async fn test_mock_backend_failing_input() {
        let backend = MockEmbeddingBackend::new().with_failing_input("bad");

        assert!(backend.embed("bad").await.is_err());
        assert!(backend.embed("good").await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_backend_failure_rate() {
        let backend = MockEmbeddingBackend::new().with_failure_rate(1.0);
        assert!(matches!(
            backend.embed("test").await,
            Err(Error::Embedding(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_batch_uses_zero_vector_fallback() {
        let backend = MockEmbeddingBackend::new()
            .with_dimension(8)
            .with_failing_input("b");
        let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let batch = backend.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.vectors.len(), 3);
        assert_eq!(batch.fallback_indices, vec![1]);
        assert!(batch.vectors[1].iter().all(|x| *x == 0.0));
        assert!(batch.vectors[0].iter().any(|x| *x != 0.0));
    }

    #[test]
    fn test_embedding_generator_normalized() {
        let embedding = MockEmbeddingGenerator::generate("test", 128);
        let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 0.01, "Should be normalized");
    }

    #[test]
    fn test_embedding_generator_empty_text() {
        let embedding = MockEmbeddingGenerator::generate("", 16);
        assert_eq!(embedding, vec![0.0; 16]);
    }
}
