//! Document processing: convert, embed, index, graph-link, persist.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use docket_core::{
    defaults, ConvertedDocument, Document, DocumentConverter, EmbeddingBackend, Error, GraphStore,
    NodeKey, Result, TextChunk, UpsertSummary, Vector, VectorIndex,
};

use crate::chunking::{ChunkerConfig, SlidingWindowChunker};
use crate::entities::{extract_entities, Entity};
use crate::handler::{JobContext, JobHandler, JobResult};
use crate::into_document;
use crate::pipeline::{Pipeline, Stage, StageFailure};

/// Graph labels and relationship types written by the graph stage.
pub mod labels {
    pub const DOCUMENT: &str = "Document";
    pub const CHUNK: &str = "Chunk";
    pub const ENTITY: &str = "Entity";
    pub const HAS_CHUNK: &str = "HAS_CHUNK";
    pub const MENTIONS: &str = "MENTIONS";
}

/// Configuration for document processing.
#[derive(Debug, Clone)]
pub struct DocumentConfig {
    /// Directory receiving one JSON output file per processed document.
    pub output_dir: PathBuf,
    pub chunking: ChunkerConfig,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(defaults::OUTPUT_DIR),
            chunking: ChunkerConfig::default(),
        }
    }
}

impl DocumentConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DOCKET_OUTPUT_DIR` | `./output` |
    /// | `CHUNK_SIZE` | `512` |
    /// | `CHUNK_OVERLAP` | `50` |
    pub fn from_env() -> Self {
        let output_dir = std::env::var("DOCKET_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(defaults::OUTPUT_DIR));
        let chunk_size = std::env::var("CHUNK_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::CHUNK_SIZE);
        let overlap = std::env::var("CHUNK_OVERLAP")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::CHUNK_OVERLAP);

        Self {
            output_dir,
            chunking: ChunkerConfig::new(chunk_size, overlap),
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_chunking(mut self, chunking: ChunkerConfig) -> Self {
        self.chunking = chunking;
        self
    }
}

/// Input of a `process_document` job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRequest {
    pub file_path: PathBuf,
    pub file_name: String,
    pub document_id: String,
}

impl DocumentRequest {
    /// Request for a file, named after its basename, with a fresh document id.
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        let file_path = path.into();
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            file_path,
            file_name,
            document_id: Uuid::new_v4().to_string(),
        }
    }

    /// Parse `{file_path, file_name?, document_id?}`.
    pub fn from_payload(payload: &Document) -> Result<Self> {
        let file_path = payload
            .get("file_path")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidInput("payload field 'file_path' is required".into()))?;

        let mut request = Self::for_path(file_path);
        if let Some(name) = payload.get("file_name").and_then(|v| v.as_str()) {
            request.file_name = name.to_string();
        }
        if let Some(id) = payload.get("document_id").and_then(|v| v.as_str()) {
            request.document_id = id.to_string();
        }
        Ok(request)
    }
}

/// State threaded through the document stages.
#[derive(Debug)]
pub struct DocumentState {
    pub request: DocumentRequest,
    pub converted: Option<ConvertedDocument>,
    pub chunks: Vec<TextChunk>,
    pub vectors: Vec<Vector>,
    pub embedding_fallbacks: usize,
    pub indexed: UpsertSummary,
    pub entities: Vec<Entity>,
    pub output_file: Option<PathBuf>,
}

impl DocumentState {
    pub fn new(request: DocumentRequest) -> Self {
        Self {
            request,
            converted: None,
            chunks: Vec::new(),
            vectors: Vec::new(),
            embedding_fallbacks: 0,
            indexed: UpsertSummary::default(),
            entities: Vec::new(),
            output_file: None,
        }
    }

    fn converted(&self) -> Result<&ConvertedDocument> {
        self.converted
            .as_ref()
            .ok_or_else(|| Error::Internal("document has not been converted".into()))
    }

    /// Metadata shared by index entries, graph nodes and the output file.
    fn metadata(&self) -> Document {
        let mut meta = Document::new();
        meta.insert("document_id".into(), json!(self.request.document_id));
        meta.insert("file_name".into(), json!(self.request.file_name));
        meta.insert(
            "file_path".into(),
            json!(self.request.file_path.to_string_lossy()),
        );
        if let Some(doc) = &self.converted {
            meta.insert("num_pages".into(), json!(doc.page_count));
            meta.insert("format".into(), json!(doc.format));
        }
        meta
    }

    /// Final job result.
    fn into_result(self) -> Document {
        let (num_pages, format) = self
            .converted
            .as_ref()
            .map(|d| (d.page_count, d.format.clone()))
            .unwrap_or_default();
        let output_file = self
            .output_file
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());

        into_document(json!({
            "document_id": self.request.document_id,
            "file_name": self.request.file_name,
            "output_file": output_file,
            "num_chunks": self.chunks.len(),
            "metadata": { "num_pages": num_pages, "format": format },
            "embedding_fallbacks": self.embedding_fallbacks,
            "indexed": { "succeeded": self.indexed.succeeded, "failed": self.indexed.failed },
            "entities": self.entities.len(),
        }))
    }
}

// =============================================================================
// STAGES
// =============================================================================

struct ConvertStage {
    converter: Arc<dyn DocumentConverter>,
    chunker: SlidingWindowChunker,
}

#[async_trait]
impl Stage<DocumentState> for ConvertStage {
    fn name(&self) -> &'static str {
        "convert"
    }

    async fn run(&self, state: &mut DocumentState) -> Result<()> {
        let path = state.request.file_path.clone();
        if !self.converter.supports(&path) {
            return Err(Error::Conversion(format!(
                "unsupported file type: {}",
                path.display()
            )));
        }

        let converted = self.converter.convert(&path).await?;
        state.chunks = self.chunker.chunk(&converted.text);
        state.converted = Some(converted);
        Ok(())
    }
}

struct EmbedStage {
    embedder: Arc<dyn EmbeddingBackend>,
}

#[async_trait]
impl Stage<DocumentState> for EmbedStage {
    fn name(&self) -> &'static str {
        "embed"
    }

    async fn run(&self, state: &mut DocumentState) -> Result<()> {
        let texts: Vec<String> = state.chunks.iter().map(|c| c.text.clone()).collect();
        let batch = self.embedder.embed_batch(&texts).await?;

        if batch.vectors.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "expected {} vectors, got {}",
                texts.len(),
                batch.vectors.len()
            )));
        }
        if !batch.fallback_indices.is_empty() {
            warn!(
                document_id = %state.request.document_id,
                fallbacks = batch.fallback_indices.len(),
                chunk_count = texts.len(),
                "Some chunks were indexed with zero-vector embeddings"
            );
        }

        state.embedding_fallbacks = batch.fallback_indices.len();
        state.vectors = batch.vectors;
        Ok(())
    }
}

struct IndexStage {
    index: Arc<dyn VectorIndex>,
}

#[async_trait]
impl Stage<DocumentState> for IndexStage {
    fn name(&self) -> &'static str {
        "index"
    }

    async fn run(&self, state: &mut DocumentState) -> Result<()> {
        let summary = self
            .index
            .upsert(
                &state.request.document_id,
                &state.chunks,
                &state.vectors,
                &state.metadata(),
            )
            .await?;

        if summary.failed > 0 {
            warn!(
                document_id = %state.request.document_id,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "Vector index rejected some chunks"
            );
        }
        state.indexed = summary;
        Ok(())
    }
}

struct GraphStage {
    graph: Arc<dyn GraphStore>,
}

impl GraphStage {
    async fn link_entity(&self, chunk: &NodeKey, entity: &Entity) -> Result<()> {
        let node = NodeKey::new(labels::ENTITY, entity.name.clone());

        let mut props = Document::new();
        props.insert("name".into(), json!(entity.name));
        props.insert("type".into(), json!(entity.kind.as_str()));
        self.graph.upsert_node(&node, props).await?;

        let mut rel = Document::new();
        rel.insert("entity_type".into(), json!(entity.kind.as_str()));
        self.graph
            .upsert_relationship(chunk, &node, labels::MENTIONS, rel)
            .await
    }
}

#[async_trait]
impl Stage<DocumentState> for GraphStage {
    fn name(&self) -> &'static str {
        "graph"
    }

    async fn run(&self, state: &mut DocumentState) -> Result<()> {
        let doc_id = state.request.document_id.clone();
        let doc_node = NodeKey::new(labels::DOCUMENT, doc_id.clone());

        let mut doc_props = state.metadata();
        doc_props.insert("num_chunks".into(), json!(state.chunks.len()));
        self.graph.upsert_node(&doc_node, doc_props).await?;

        let mut entities: Vec<Entity> = Vec::new();

        for chunk in &state.chunks {
            let chunk_node = NodeKey::new(labels::CHUNK, format!("{}_chunk_{}", doc_id, chunk.chunk_id));

            let mut props = Document::new();
            props.insert("document_id".into(), json!(doc_id));
            props.insert("chunk_id".into(), json!(chunk.chunk_id));
            props.insert("text".into(), json!(chunk.text));
            props.insert("start_offset".into(), json!(chunk.start_offset));
            props.insert("end_offset".into(), json!(chunk.end_offset));
            self.graph.upsert_node(&chunk_node, props).await?;
            self.graph
                .upsert_relationship(&doc_node, &chunk_node, labels::HAS_CHUNK, Document::new())
                .await?;

            for entity in extract_entities(&chunk.text) {
                // Entity links are best-effort; the chunk itself is already stored.
                if let Err(e) = self.link_entity(&chunk_node, &entity).await {
                    warn!(
                        entity = %entity.name,
                        chunk = %chunk_node,
                        error = %e,
                        "Could not link entity"
                    );
                    continue;
                }
                if !entities.contains(&entity) {
                    entities.push(entity);
                }
            }
        }

        state.entities = entities;
        Ok(())
    }
}

struct PersistStage {
    output_dir: PathBuf,
}

impl PersistStage {
    fn output_path(&self, request: &DocumentRequest) -> PathBuf {
        let stem = Path::new(&request.file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| request.document_id.clone());
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        self.output_dir.join(format!("{stem}_{timestamp}.json"))
    }
}

#[async_trait]
impl Stage<DocumentState> for PersistStage {
    fn name(&self) -> &'static str {
        "persist"
    }

    async fn run(&self, state: &mut DocumentState) -> Result<()> {
        let converted = state.converted()?;
        let output = json!({
            "document_id": state.request.document_id,
            "file_name": state.request.file_name,
            "file_path": state.request.file_path.to_string_lossy(),
            "processed_at": Utc::now().to_rfc3339(),
            "metadata": { "num_pages": converted.page_count, "format": converted.format },
            "text": converted.text,
            "num_chunks": state.chunks.len(),
            "chunks": state.chunks,
            "entities": state.entities,
            "embedding_fallbacks": state.embedding_fallbacks,
        });

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.output_path(&state.request);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&output)?).await?;

        state.output_file = Some(path);
        Ok(())
    }
}

// =============================================================================
// PROCESSOR + HANDLER
// =============================================================================

/// Runs the five document stages against the configured collaborators.
pub struct DocumentProcessor {
    pipeline: Pipeline<DocumentState>,
}

impl DocumentProcessor {
    pub fn new(
        converter: Arc<dyn DocumentConverter>,
        embedder: Arc<dyn EmbeddingBackend>,
        index: Arc<dyn VectorIndex>,
        graph: Arc<dyn GraphStore>,
        config: DocumentConfig,
    ) -> Self {
        let pipeline = Pipeline::new()
            .stage(
                30,
                ConvertStage {
                    converter,
                    chunker: SlidingWindowChunker::new(config.chunking),
                },
            )
            .stage(50, EmbedStage { embedder })
            .stage(70, IndexStage { index })
            .stage(90, GraphStage { graph })
            .stage(
                100,
                PersistStage {
                    output_dir: config.output_dir,
                },
            );

        Self { pipeline }
    }

    /// Process one document. Progress goes to `ctx` when given.
    #[instrument(skip(self, request, ctx), fields(subsystem = "jobs", component = "document", document_id = %request.document_id))]
    pub async fn process(
        &self,
        request: DocumentRequest,
        ctx: Option<&JobContext>,
    ) -> std::result::Result<Document, StageFailure> {
        let mut state = DocumentState::new(request);
        self.pipeline.run(&mut state, ctx).await?;

        info!(
            file_name = %state.request.file_name,
            chunk_count = state.chunks.len(),
            entities = state.entities.len(),
            embedding_fallbacks = state.embedding_fallbacks,
            "Document processed"
        );
        Ok(state.into_result())
    }
}

/// Handler for `process_document` jobs.
pub struct ProcessDocumentHandler {
    processor: Arc<DocumentProcessor>,
}

impl ProcessDocumentHandler {
    pub fn new(processor: Arc<DocumentProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl JobHandler for ProcessDocumentHandler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        let request = match DocumentRequest::from_payload(ctx.payload()) {
            Ok(request) => request,
            Err(e) => return JobResult::Failed(e.to_string()),
        };

        self.processor.process(request, Some(&ctx)).await.into()
    }
}
