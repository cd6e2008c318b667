//! Core traits for docket abstractions.
//!
//! These traits define the interfaces concrete implementations must satisfy:
//! the job store, and the external collaborators the document pipeline calls.

use std::path::Path;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::*;

// =============================================================================
// JOB REPOSITORY
// =============================================================================

/// Durable store of jobs; the only state shared between workers.
///
/// Every mutation is a conditional update guarded by the current status, so
/// the state machine in [`JobStatus::can_transition_to`] holds even under
/// concurrent callers.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new PENDING job.
    async fn submit(&self, job_type: &str, payload: Document, priority: i32) -> Result<Uuid>;

    /// Insert a PENDING job unless a PENDING or PROCESSING job with the same
    /// type and `dedup_key` exists. Returns `None` when suppressed.
    async fn submit_unique(
        &self,
        job_type: &str,
        payload: Document,
        priority: i32,
        dedup_key: &str,
    ) -> Result<Option<Uuid>>;

    /// Point lookup.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// List jobs, optionally filtered by status, bounded by `limit`.
    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>>;

    /// Atomically claim the highest-priority, oldest PENDING job.
    async fn claim_next(&self) -> Result<Option<Job>>;

    /// Record progress of a PROCESSING job. No-op for any other status, and
    /// never lowers the stored value.
    async fn update_progress(&self, job_id: Uuid, percent: i32, message: Option<&str>)
        -> Result<()>;

    /// Mark a PROCESSING job as completed with its result.
    async fn complete(&self, job_id: Uuid, result: Document) -> Result<()>;

    /// Mark a PROCESSING job as failed.
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()>;

    /// Cancel a PENDING job.
    async fn cancel(&self, job_id: Uuid) -> Result<()>;

    /// Fail every PROCESSING job left behind by a previous process.
    async fn fail_orphaned(&self, reason: &str) -> Result<u64>;

    /// Count per status plus total.
    async fn stats(&self) -> Result<QueueStats>;
}

// =============================================================================
// DOCUMENT CONVERSION
// =============================================================================

/// Turns raw files into text.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Convert the file at `path`.
    async fn convert(&self, path: &Path) -> Result<ConvertedDocument>;

    /// Whether this converter accepts the file (by extension).
    fn supports(&self, path: &Path) -> bool;
}

// =============================================================================
// EMBEDDING
// =============================================================================

/// Result of a batch embedding call.
#[derive(Debug, Clone, Default)]
pub struct BatchEmbedding {
    /// One vector per input, in input order.
    pub vectors: Vec<Vector>,
    /// Inputs that failed and were replaced by a zero vector.
    pub fallback_indices: Vec<usize>,
}

/// Backend for generating text embeddings.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed a single text. Fails unless the vector has [`dimension`] entries.
    ///
    /// [`dimension`]: EmbeddingBackend::dimension
    async fn embed(&self, text: &str) -> Result<Vector>;

    /// Embed a batch of texts.
    ///
    /// Lossy by contract: an item that fails is replaced by a zero vector of
    /// [`dimension`](EmbeddingBackend::dimension) entries and reported in
    /// [`BatchEmbedding::fallback_indices`] instead of failing the batch.
    async fn embed_batch(&self, texts: &[String]) -> Result<BatchEmbedding> {
        Ok(embed_each_with_fallback(self, texts).await)
    }

    /// Expected dimension of embedding vectors.
    fn dimension(&self) -> usize;

    /// Model name being used.
    fn model_name(&self) -> &str;
}

/// Embed texts one by one, substituting a zero vector for each failure.
pub async fn embed_each_with_fallback<B>(backend: &B, texts: &[String]) -> BatchEmbedding
where
    B: EmbeddingBackend + ?Sized,
{
    let dimension = backend.dimension();
    let mut batch = BatchEmbedding {
        vectors: Vec::with_capacity(texts.len()),
        fallback_indices: Vec::new(),
    };

    for (idx, text) in texts.iter().enumerate() {
        let outcome = match backend.embed(text).await {
            Ok(vector) if vector.len() == dimension => Ok(vector),
            Ok(vector) => Err(Error::Embedding(format!(
                "expected {} dimensions, got {}",
                dimension,
                vector.len()
            ))),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(vector) => batch.vectors.push(vector),
            Err(e) => {
                warn!(
                    subsystem = "inference",
                    op = "embed_batch",
                    index = idx,
                    error = %e,
                    "Embedding failed, substituting zero vector"
                );
                batch.vectors.push(vec![0.0; dimension]);
                batch.fallback_indices.push(idx);
            }
        }
    }

    batch
}

// =============================================================================
// VECTOR INDEX
// =============================================================================

/// Vector index keyed by `(doc_id, chunk_id)`; upserts are idempotent.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Upsert chunk vectors for a document.
    async fn upsert(
        &self,
        doc_id: &str,
        chunks: &[TextChunk],
        vectors: &[Vector],
        metadata: &Document,
    ) -> Result<UpsertSummary>;

    /// Return the `k` nearest chunks, best first.
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>>;
}

// =============================================================================
// GRAPH STORE
// =============================================================================

/// Knowledge graph store; upserts are idempotent by natural key.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create or merge a node.
    async fn upsert_node(&self, node: &NodeKey, properties: Document) -> Result<()>;

    /// Create or merge a relationship between two existing nodes.
    async fn upsert_relationship(
        &self,
        from: &NodeKey,
        to: &NodeKey,
        rel_type: &str,
        properties: Document,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyBackend;

    #[async_trait]
    impl EmbeddingBackend for FlakyBackend {
        async fn embed(&self, text: &str) -> Result<Vector> {
            match text {
                "fail" => Err(Error::Embedding("boom".into())),
                "short" => Ok(vec![1.0]),
                _ => Ok(vec![1.0, 2.0, 3.0]),
            }
        }

        fn dimension(&self) -> usize {
            3
        }

        fn model_name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_embed_batch_substitutes_zero_vectors() {
        let texts = vec![
            "ok".to_string(),
            "fail".to_string(),
            "ok".to_string(),
            "short".to_string(),
        ];
        let batch = FlakyBackend.embed_batch(&texts).await.unwrap();

        assert_eq!(batch.vectors.len(), 4);
        assert_eq!(batch.fallback_indices, vec![1, 3]);
        assert_eq!(batch.vectors[0], vec![1.0, 2.0, 3.0]);
        assert_eq!(batch.vectors[1], vec![0.0, 0.0, 0.0]);
        assert_eq!(batch.vectors[3], vec![0.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_embed_batch_empty() {
        let batch = FlakyBackend.embed_batch(&[]).await.unwrap();
        assert!(batch.vectors.is_empty());
        assert!(batch.fallback_indices.is_empty());
    }
}
