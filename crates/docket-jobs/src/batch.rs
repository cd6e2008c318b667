//! Batch document processing over a directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use docket_core::{defaults, Document, Error, Result};

use crate::document::{DocumentProcessor, DocumentRequest};
use crate::handler::{JobContext, JobHandler, JobResult};
use crate::into_document;

/// Handler for `process_batch` jobs, payload `{"input_dir": "..."}`.
///
/// Files are processed one after another with the document pipeline. A file
/// that fails is recorded in the result; the job itself only fails when the
/// directory cannot be read.
pub struct ProcessBatchHandler {
    processor: Arc<DocumentProcessor>,
    extensions: Vec<String>,
}

impl ProcessBatchHandler {
    pub fn new(processor: Arc<DocumentProcessor>) -> Self {
        Self {
            processor,
            extensions: defaults::BATCH_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
        }
    }

    /// Override the file extensions picked up from the directory.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.into().to_ascii_lowercase())
            .collect();
        self
    }

    /// Candidate files directly inside `dir`, sorted by path.
    pub async fn list_documents(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| self.extensions.contains(&e.to_ascii_lowercase()))
                .unwrap_or(false);
            if matches {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }

    async fn run(&self, ctx: &JobContext) -> Result<Document> {
        let input_dir = PathBuf::from(ctx.payload_str("input_dir")?);

        let files = self.list_documents(&input_dir).await.map_err(|e| {
            Error::Job(format!(
                "cannot read input directory {}: {}",
                input_dir.display(),
                e
            ))
        })?;

        if files.is_empty() {
            info!(input_dir = %input_dir.display(), "No documents found");
            return Ok(into_document(json!({
                "total": 0,
                "processed": 0,
                "failed": 0,
                "message": "No documents found",
                "results": [],
            })));
        }

        let total = files.len();
        let mut processed = 0usize;
        let mut failed = 0usize;
        let mut results = Vec::with_capacity(total);

        for (i, path) in files.iter().enumerate() {
            let request = DocumentRequest::for_path(path);
            let file_name = request.file_name.clone();

            let percent = (i * 100 / total) as i32;
            let message = format!("Processing {}/{}: {}", i + 1, total, file_name);
            ctx.report_progress(percent, Some(message.as_str())).await;

            // Per-file pipelines must not touch the batch job's own progress.
            match self.processor.process(request, None).await {
                Ok(result) => {
                    processed += 1;
                    results.push(json!({
                        "file": file_name,
                        "status": "success",
                        "document_id": result.get("document_id"),
                    }));
                }
                Err(failure) => {
                    failed += 1;
                    warn!(file = %file_name, error = %failure, "Batch item failed");
                    results.push(json!({
                        "file": file_name,
                        "status": "failed",
                        "error": failure.to_string(),
                    }));
                }
            }
        }

        info!(total, processed, failed, "Batch processing finished");

        Ok(into_document(json!({
            "total": total,
            "processed": processed,
            "failed": failed,
            "results": results,
        })))
    }
}

#[async_trait]
impl JobHandler for ProcessBatchHandler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        self.run(&ctx).await.into()
    }
}
