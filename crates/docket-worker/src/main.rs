//! docket worker process.
//!
//! Opens the job store, registers the document handlers and runs the worker
//! pool until Ctrl-C.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docket_core::{
    defaults, parse_bool_env, JobRepository, MemoryGraphStore, MemoryVectorIndex,
};
use docket_db::{Database, PoolConfig};
use docket_inference::OllamaBackend;
use docket_jobs::{
    DocumentConfig, DocumentProcessor, ProcessBatchHandler, ProcessDocumentHandler,
    TextFileConverter, WorkerConfig, WorkerEvent, WorkerPool, PROCESS_BATCH, PROCESS_DOCUMENT,
};

const DEFAULT_LOG_FILTER: &str = "docket=info,docket_worker=info,docket_jobs=info,docket_db=info";

/// Install the global subscriber. The returned guard flushes the file writer.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, daily rotation)
    //   RUST_LOG    - standard env filter
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let path = Path::new(path);
        let file_dir = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("docket-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false),
                )
                .init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| defaults::DATABASE_URL.to_string());

    info!("Connecting to database...");
    let db = Database::connect_with_config(&database_url, PoolConfig::from_env()).await?;
    info!("Running database migrations...");
    db.migrate().await?;
    info!("Database ready");

    if parse_bool_env("JOB_FAIL_ORPHANED_ON_START", false) {
        let swept = db
            .jobs
            .fail_orphaned("worker restarted while job was processing")
            .await?;
        if swept > 0 {
            warn!(count = swept, "Failed jobs orphaned by a previous run");
        }
    }

    let stats = db.jobs.stats().await?;
    info!(
        pending = stats.pending,
        processing = stats.processing,
        total = stats.total,
        "Queue state at startup"
    );

    let embedder = OllamaBackend::from_env();
    let document_config = DocumentConfig::from_env();
    info!(
        embed_base = embedder.base_url(),
        output_dir = %document_config.output_dir.display(),
        vector_index = "memory",
        graph_store = "memory",
        "Document pipeline configured"
    );

    let processor = Arc::new(DocumentProcessor::new(
        Arc::new(TextFileConverter::new()),
        Arc::new(embedder),
        Arc::new(MemoryVectorIndex::new()),
        Arc::new(MemoryGraphStore::new()),
        document_config,
    ));

    let config = WorkerConfig::from_env();
    let worker_count = config.worker_count;

    let mut pool = WorkerPool::for_database(&db, config);
    pool.register_handler(PROCESS_DOCUMENT, ProcessDocumentHandler::new(processor.clone()));
    pool.register_handler(PROCESS_BATCH, ProcessBatchHandler::new(processor));

    let mut events = pool.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::JobProgress {
                    job_id,
                    percent,
                    message,
                }) => debug!(%job_id, percent, ?message, "Job progress"),
                Ok(event) => debug!(?event, "Worker event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Worker event listener lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let handle = pool.start(worker_count);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping workers");

    handle.stop().await?;
    db.close().await;
    info!("docket worker exited");
    Ok(())
}
