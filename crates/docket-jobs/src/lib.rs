//! # docket-jobs
//!
//! Worker pool and handlers for the docket job queue.
//!
//! This crate provides:
//! - A handler registry mapping job types to async handlers
//! - A pool of independent worker loops claiming jobs from the store
//! - Progress tracking and live events via a broadcast channel
//! - A staged document pipeline and the `process_document` /
//!   `process_batch` handlers built on it
//!
//! ## Example
//!
//! ```ignore
//! use docket_jobs::{handler_fn, JobResult, WorkerConfig, WorkerPool};
//! use docket_db::Database;
//!
//! let db = Database::connect("sqlite://docket.db").await?;
//! db.migrate().await?;
//!
//! let mut pool = WorkerPool::for_database(&db, WorkerConfig::default());
//! pool.register_handler("double", handler_fn(|ctx| async move {
//!     let n = ctx.payload()["n"].as_i64().unwrap_or(0);
//!     let mut out = docket_core::Document::new();
//!     out.insert("doubled".into(), (n * 2).into());
//!     JobResult::Success(out)
//! }));
//!
//! let handle = pool.start(4);
//! let mut events = handle.events();
//! // ...
//! handle.stop().await?;
//! ```

pub mod batch;
pub mod chunking;
pub mod converter;
pub mod document;
pub mod entities;
pub mod handler;
pub mod pipeline;
pub mod worker;

// Re-export core types
pub use docket_core::*;

pub use batch::ProcessBatchHandler;
pub use chunking::{ChunkerConfig, SlidingWindowChunker};
pub use converter::TextFileConverter;
pub use document::{
    DocumentConfig, DocumentProcessor, DocumentRequest, DocumentState, ProcessDocumentHandler,
};
pub use entities::{extract_entities, Entity, EntityKind};
pub use handler::{
    handler_fn, FnHandler, HandlerRegistry, JobContext, JobHandler, JobResult, NoOpHandler,
};
pub use pipeline::{Pipeline, Stage, StageFailure};
pub use worker::{WorkerConfig, WorkerEvent, WorkerHandle, WorkerPool};

/// Job type of single-document jobs.
pub const PROCESS_DOCUMENT: &str = "process_document";

/// Job type of directory batch jobs.
pub const PROCESS_BATCH: &str = "process_batch";

/// Unwrap a `json!` object literal into a [`Document`].
pub(crate) fn into_document(value: serde_json::Value) -> Document {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Document::new(),
    }
}
