//! In-process collaborator implementations.
//!
//! `MemoryVectorIndex` and `MemoryGraphStore` satisfy the [`VectorIndex`] and
//! [`GraphStore`] contracts without an external service. The worker binary
//! falls back to them when no external store is configured, and tests use
//! them to observe what a pipeline wrote.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::trace;

use crate::error::{Error, Result};
use crate::models::{Document, NodeKey, ScoredChunk, TextChunk, UpsertSummary, Vector};
use crate::traits::{GraphStore, VectorIndex};

#[derive(Debug, Clone)]
struct IndexedChunk {
    doc_id: String,
    chunk_id: usize,
    text: String,
    vector: Vector,
    metadata: Document,
}

/// Vector index held in memory, keyed by `"{doc_id}_chunk_{chunk_id}"`.
#[derive(Debug, Default)]
pub struct MemoryVectorIndex {
    dimension: Option<usize>,
    entries: RwLock<BTreeMap<String, IndexedChunk>>,
}

impl MemoryVectorIndex {
    /// Create an index accepting vectors of any non-zero length.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index that rejects vectors whose length is not `dimension`.
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: Some(dimension),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of chunks indexed for one document.
    pub fn chunk_count(&self, doc_id: &str) -> usize {
        self.entries
            .read()
            .map(|e| e.values().filter(|c| c.doc_id == doc_id).count())
            .unwrap_or(0)
    }

    /// Metadata stored with a chunk.
    pub fn metadata(&self, doc_id: &str, chunk_id: usize) -> Option<Document> {
        self.entries
            .read()
            .ok()?
            .get(&Self::entry_key(doc_id, chunk_id))
            .map(|c| c.metadata.clone())
    }

    fn entry_key(doc_id: &str, chunk_id: usize) -> String {
        format!("{doc_id}_chunk_{chunk_id}")
    }

    fn accepts(&self, vector: &[f32]) -> bool {
        match self.dimension {
            Some(dim) => vector.len() == dim,
            None => !vector.is_empty(),
        }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(
        &self,
        doc_id: &str,
        chunks: &[TextChunk],
        vectors: &[Vector],
        metadata: &Document,
    ) -> Result<UpsertSummary> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::Index("index lock poisoned".into()))?;

        let mut summary = UpsertSummary::default();
        for (idx, chunk) in chunks.iter().enumerate() {
            match vectors.get(idx) {
                Some(vector) if self.accepts(vector) => {
                    entries.insert(
                        Self::entry_key(doc_id, chunk.chunk_id),
                        IndexedChunk {
                            doc_id: doc_id.to_string(),
                            chunk_id: chunk.chunk_id,
                            text: chunk.text.clone(),
                            vector: vector.clone(),
                            metadata: metadata.clone(),
                        },
                    );
                    summary.succeeded += 1;
                }
                _ => {
                    trace!(doc_id, chunk_id = chunk.chunk_id, "Rejected chunk vector");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::Index("index lock poisoned".into()))?;

        let mut hits: Vec<ScoredChunk> = entries
            .values()
            .map(|c| ScoredChunk {
                doc_id: c.doc_id.clone(),
                chunk_id: c.chunk_id,
                text: c.text.clone(),
                score: cosine_similarity(vector, &c.vector),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }
}

type RelationshipKey = (NodeKey, NodeKey, String);

/// Property graph held in memory.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    nodes: RwLock<HashMap<NodeKey, Document>>,
    relationships: RwLock<HashMap<RelationshipKey, Document>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.read().map(|n| n.len()).unwrap_or(0)
    }

    /// Number of nodes with the given label.
    pub fn node_count_with_label(&self, label: &str) -> usize {
        self.nodes
            .read()
            .map(|n| n.keys().filter(|k| k.label == label).count())
            .unwrap_or(0)
    }

    /// Number of distinct relationships.
    pub fn relationship_count(&self) -> usize {
        self.relationships.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Properties of a node, if present.
    pub fn node(&self, key: &NodeKey) -> Option<Document> {
        self.nodes.read().ok()?.get(key).cloned()
    }

    /// Whether a relationship of `rel_type` exists between two nodes.
    pub fn has_relationship(&self, from: &NodeKey, to: &NodeKey, rel_type: &str) -> bool {
        self.relationships
            .read()
            .map(|r| r.contains_key(&(from.clone(), to.clone(), rel_type.to_string())))
            .unwrap_or(false)
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_node(&self, node: &NodeKey, properties: Document) -> Result<()> {
        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| Error::Graph("graph lock poisoned".into()))?;
        nodes.entry(node.clone()).or_default().extend(properties);
        Ok(())
    }

    async fn upsert_relationship(
        &self,
        from: &NodeKey,
        to: &NodeKey,
        rel_type: &str,
        properties: Document,
    ) -> Result<()> {
        {
            let nodes = self
                .nodes
                .read()
                .map_err(|_| Error::Graph("graph lock poisoned".into()))?;
            for endpoint in [from, to] {
                if !nodes.contains_key(endpoint) {
                    return Err(Error::Graph(format!("unknown node {endpoint}")));
                }
            }
        }

        let mut relationships = self
            .relationships
            .write()
            .map_err(|_| Error::Graph("graph lock poisoned".into()))?;
        relationships
            .entry((from.clone(), to.clone(), rel_type.to_string()))
            .or_default()
            .extend(properties);
        Ok(())
    }
}
