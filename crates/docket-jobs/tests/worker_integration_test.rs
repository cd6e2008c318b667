//! Integration tests for the worker pool and the document handlers.
//!
//! Each test opens its own SQLite file in a temporary directory, so pools
//! from parallel tests never compete for the same jobs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docket_core::{
    defaults, BatchEmbedding, Document, EmbeddingBackend, Error, JobRepository, JobStatus,
    MemoryGraphStore, MemoryVectorIndex, NodeKey, Result, Vector,
};
use docket_db::Database;
use docket_inference::MockEmbeddingBackend;
use docket_jobs::{
    handler_fn, DocumentConfig, DocumentProcessor, JobContext, JobHandler, JobResult,
    ProcessBatchHandler, ProcessDocumentHandler, TextFileConverter, WorkerConfig, WorkerEvent,
    WorkerPool, PROCESS_BATCH, PROCESS_DOCUMENT,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;
use uuid::Uuid;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

async fn setup_test_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
    let db = Database::connect(&url)
        .await
        .expect("Failed to open test database");
    db.migrate().await.expect("Failed to migrate test database");
    (dir, db)
}

fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_poll_interval(50)
        .with_shutdown_timeout(10)
}

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().expect("test documents are objects")
}

/// Wait for a job to reach a specific status.
async fn wait_for_job_status(
    db: &Database,
    job_id: Uuid,
    expected_status: JobStatus,
    timeout_secs: u64,
) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed().as_secs() < timeout_secs {
        if let Ok(Some(job)) = db.jobs.get(job_id).await {
            if job.status == expected_status {
                return true;
            }
        }
        sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Collect events until `done` matches one (inclusive) or 10s pass.
async fn collect_events_until<F>(
    rx: &mut broadcast::Receiver<WorkerEvent>,
    done: F,
) -> Vec<WorkerEvent>
where
    F: Fn(&WorkerEvent) -> bool,
{
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let finished = done(&event);
                    seen.push(event);
                    if finished {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await;
    seen
}

fn progress_for(events: &[WorkerEvent], id: Uuid) -> Vec<i32> {
    events
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::JobProgress {
                job_id, percent, ..
            } if *job_id == id => Some(*percent),
            _ => None,
        })
        .collect()
}

fn double_handler() -> impl JobHandler {
    handler_fn(|ctx: JobContext| async move {
        ctx.report_progress(0, Some("starting")).await;
        let n = ctx.payload().get("n").and_then(|v| v.as_i64()).unwrap_or(0);
        ctx.report_progress(50, Some("halfway")).await;
        JobResult::Success(doc(json!({ "doubled": n * 2 })))
    })
}

/// Handler that tracks which jobs it executed.
struct TrackingHandler {
    executions: Arc<Mutex<Vec<Uuid>>>,
    delay_ms: u64,
}

impl TrackingHandler {
    fn new(delay_ms: u64) -> (Self, Arc<Mutex<Vec<Uuid>>>) {
        let executions = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                executions: executions.clone(),
                delay_ms,
            },
            executions,
        )
    }
}

#[async_trait]
impl JobHandler for TrackingHandler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        if self.delay_ms > 0 {
            sleep(Duration::from_millis(self.delay_ms)).await;
        }
        self.executions.lock().await.push(ctx.job_id());
        JobResult::Success(Document::new())
    }
}

/// Handler that panics mid-job.
struct PanickingHandler;

#[async_trait]
impl JobHandler for PanickingHandler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        ctx.report_progress(20, None).await;
        panic!("kaboom");
    }
}

/// Embedding backend whose batch endpoint is down.
struct UnavailableEmbedder;

#[async_trait]
impl EmbeddingBackend for UnavailableEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vector> {
        Err(Error::Embedding("backend unavailable".into()))
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<BatchEmbedding> {
        Err(Error::Embedding("backend unavailable".into()))
    }

    fn dimension(&self) -> usize {
        8
    }

    fn model_name(&self) -> &str {
        "unavailable"
    }
}

struct Collaborators {
    processor: Arc<DocumentProcessor>,
    index: Arc<MemoryVectorIndex>,
    graph: Arc<MemoryGraphStore>,
}

fn document_processor(output_dir: &Path, embedder: Arc<dyn EmbeddingBackend>) -> Collaborators {
    let index = Arc::new(MemoryVectorIndex::new());
    let graph = Arc::new(MemoryGraphStore::new());
    let processor = Arc::new(DocumentProcessor::new(
        Arc::new(TextFileConverter::new()),
        embedder,
        index.clone(),
        graph.clone(),
        DocumentConfig::default().with_output_dir(output_dir),
    ));
    Collaborators {
        processor,
        index,
        graph,
    }
}

// ============================================================================
// WORKER POOL
// ============================================================================

#[tokio::test]
async fn test_handler_result_progress_and_completion() {
    let (_dir, db) = setup_test_db().await;

    let mut pool = WorkerPool::for_database(&db, fast_config());
    pool.register_handler("double", double_handler());
    let mut events = pool.events();
    let handle = pool.start(1);

    let id = db
        .jobs
        .submit("double", doc(json!({"n": 3})), 0)
        .await
        .unwrap();

    assert!(wait_for_job_status(&db, id, JobStatus::Completed, 10).await);

    let job = db.jobs.get(id).await.unwrap().unwrap();
    assert_eq!(job.result, Some(doc(json!({"doubled": 6}))));
    assert_eq!(job.progress, 100);
    assert!(job.error.is_none());
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());

    let seen = collect_events_until(&mut events, |e| {
        matches!(e, WorkerEvent::JobCompleted { job_id, .. } if *job_id == id)
    })
    .await;
    assert_eq!(progress_for(&seen, id), vec![0, 50]);
    assert!(seen.contains(&WorkerEvent::JobStarted {
        job_id: id,
        job_type: "double".into()
    }));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_type_fails_without_retry() {
    let (_dir, db) = setup_test_db().await;

    let mut pool = WorkerPool::for_database(&db, fast_config());
    pool.register_handler("double", double_handler());
    let handle = pool.start(2);

    let id = db
        .jobs
        .submit("unknown", doc(json!({})), 0)
        .await
        .unwrap();
    assert!(wait_for_job_status(&db, id, JobStatus::Failed, 10).await);

    // Give the loops a few more polls: the job must stay failed.
    sleep(Duration::from_millis(200)).await;

    let job = db.jobs.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error.as_deref(),
        Some("No handler registered for job type: unknown")
    );
    assert!(job.result.is_none());

    let stats = db.jobs.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.failed, 1);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_blank_failure_message_is_replaced() {
    let (_dir, db) = setup_test_db().await;

    let mut pool = WorkerPool::for_database(&db, fast_config());
    pool.register_handler(
        "silent",
        handler_fn(|_ctx: JobContext| async move { JobResult::Failed(String::new()) }),
    );
    let mut events = pool.events();
    let handle = pool.start(1);

    let id = db.jobs.submit("silent", doc(json!({})), 0).await.unwrap();
    assert!(wait_for_job_status(&db, id, JobStatus::Failed, 10).await);

    let job = db.jobs.get(id).await.unwrap().unwrap();
    assert!(job.result.is_none());
    assert_eq!(
        job.error.as_deref(),
        Some(defaults::UNSPECIFIED_FAILURE_REASON)
    );

    let seen = collect_events_until(&mut events, |e| {
        matches!(e, WorkerEvent::JobFailed { job_id, .. } if *job_id == id)
    })
    .await;
    assert!(seen.contains(&WorkerEvent::JobFailed {
        job_id: id,
        job_type: "silent".into(),
        error: defaults::UNSPECIFIED_FAILURE_REASON.into(),
    }));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_panicking_handler_fails_job_and_loop_continues() {
    let (_dir, db) = setup_test_db().await;

    let mut pool = WorkerPool::for_database(&db, fast_config());
    pool.register_handler("explode", PanickingHandler);
    pool.register_handler("double", double_handler());
    let handle = pool.start(1);

    let bad = db.jobs.submit("explode", doc(json!({})), 10).await.unwrap();
    let good = db
        .jobs
        .submit("double", doc(json!({"n": 21})), 0)
        .await
        .unwrap();

    assert!(wait_for_job_status(&db, bad, JobStatus::Failed, 10).await);
    assert!(wait_for_job_status(&db, good, JobStatus::Completed, 10).await);

    let failed = db.jobs.get(bad).await.unwrap().unwrap();
    assert_eq!(failed.error.as_deref(), Some("Handler panicked: kaboom"));
    // Progress stays readable on failed jobs.
    assert_eq!(failed.progress, 20);

    let done = db.jobs.get(good).await.unwrap().unwrap();
    assert_eq!(done.result.unwrap()["doubled"], 42);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_lifecycle_events() {
    let (_dir, db) = setup_test_db().await;

    let pool = WorkerPool::for_database(&db, fast_config());
    let mut events = pool.events();
    let handle = pool.start(3);
    assert_eq!(handle.worker_count(), 3);

    let mut stop_events = handle.events();
    handle.stop().await.unwrap();

    assert_eq!(events.recv().await.unwrap(), WorkerEvent::WorkerStarted);
    assert_eq!(stop_events.recv().await.unwrap(), WorkerEvent::WorkerStopped);
}

#[tokio::test]
async fn test_disabled_pool_does_not_process() {
    let (_dir, db) = setup_test_db().await;

    let mut pool = WorkerPool::for_database(&db, fast_config().with_enabled(false));
    pool.register_handler("double", double_handler());
    let handle = pool.start(2);
    assert_eq!(handle.worker_count(), 0);

    let id = db.jobs.submit("double", doc(json!({"n": 1})), 0).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        db.jobs.get(id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    handle.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_run_each_job_once() {
    let (_dir, db) = setup_test_db().await;

    let (handler, executions) = TrackingHandler::new(20);
    let mut pool = WorkerPool::for_database(&db, fast_config());
    pool.register_handler("track", handler);
    let handle = pool.start(4);

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(
            db.jobs
                .submit("track", doc(json!({ "i": i })), 0)
                .await
                .unwrap(),
        );
    }

    for id in &ids {
        assert!(wait_for_job_status(&db, *id, JobStatus::Completed, 20).await);
    }
    handle.stop().await.unwrap();

    let mut executed = executions.lock().await.clone();
    assert_eq!(executed.len(), ids.len(), "every job runs exactly once");
    executed.sort();
    executed.dedup();
    assert_eq!(executed.len(), ids.len());
}

#[tokio::test]
async fn test_stop_waits_for_running_job() {
    let (_dir, db) = setup_test_db().await;

    let (handler, executions) = TrackingHandler::new(300);
    let mut pool = WorkerPool::for_database(&db, fast_config());
    pool.register_handler("slow", handler);
    let handle = pool.start(1);

    let id = db.jobs.submit("slow", doc(json!({})), 0).await.unwrap();
    assert!(wait_for_job_status(&db, id, JobStatus::Processing, 10).await);

    handle.stop().await.unwrap();

    // The in-flight job finished before stop returned.
    assert_eq!(
        db.jobs.get(id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(executions.lock().await.as_slice(), &[id]);
}

#[tokio::test]
async fn test_stop_timeout_aborts_busy_loops() {
    let (_dir, db) = setup_test_db().await;

    let (handler, _executions) = TrackingHandler::new(5_000);
    let mut pool = WorkerPool::for_database(&db, fast_config().with_shutdown_timeout(0));
    pool.register_handler("stuck", handler);
    let handle = pool.start(1);

    let id = db.jobs.submit("stuck", doc(json!({})), 0).await.unwrap();
    assert!(wait_for_job_status(&db, id, JobStatus::Processing, 10).await);

    let err = handle.stop().await.unwrap_err();
    assert!(matches!(err, Error::Internal(_)));

    // Aborted mid-job: the row is left for an orphan sweep.
    assert_eq!(
        db.jobs.get(id).await.unwrap().unwrap().status,
        JobStatus::Processing
    );
    assert_eq!(db.jobs.fail_orphaned("worker aborted").await.unwrap(), 1);
}

#[tokio::test]
async fn test_cancelled_job_is_never_claimed() {
    let (_dir, db) = setup_test_db().await;

    let cancelled = db.jobs.submit("double", doc(json!({"n": 1})), 5).await.unwrap();
    db.jobs.cancel(cancelled).await.unwrap();

    let mut pool = WorkerPool::for_database(&db, fast_config());
    pool.register_handler("double", double_handler());
    let handle = pool.start(1);

    let other = db.jobs.submit("double", doc(json!({"n": 2})), 0).await.unwrap();
    assert!(wait_for_job_status(&db, other, JobStatus::Completed, 10).await);
    handle.stop().await.unwrap();

    let job = db.jobs.get(cancelled).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.started_at.is_none());
}

// ============================================================================
// DOCUMENT PIPELINE
// ============================================================================

#[tokio::test]
async fn test_process_document_end_to_end() {
    let (dir, db) = setup_test_db().await;

    let input = dir.path().join("minutes.txt");
    std::fs::write(
        &input,
        "Grace Hopper presented to Acme Widgets Inc on March 3, 2025. \
         Questions went to ops@example.com.",
    )
    .unwrap();

    let parts = document_processor(
        &dir.path().join("out"),
        Arc::new(MockEmbeddingBackend::new().with_dimension(16)),
    );

    let mut pool = WorkerPool::for_database(&db, fast_config());
    pool.register_handler(
        PROCESS_DOCUMENT,
        ProcessDocumentHandler::new(parts.processor.clone()),
    );
    let mut events = pool.events();
    let handle = pool.start(1);

    let id = db
        .jobs
        .submit(
            PROCESS_DOCUMENT,
            doc(json!({
                "file_path": input.to_string_lossy(),
                "document_id": "doc-1"
            })),
            0,
        )
        .await
        .unwrap();

    assert!(wait_for_job_status(&db, id, JobStatus::Completed, 10).await);

    let job = db.jobs.get(id).await.unwrap().unwrap();
    let result = job.result.expect("completed job has a result");
    assert_eq!(job.progress, 100);
    assert_eq!(result["document_id"], "doc-1");
    assert_eq!(result["file_name"], "minutes.txt");
    assert_eq!(result["num_chunks"], 1);
    assert_eq!(result["embedding_fallbacks"], 0);
    assert_eq!(result["indexed"]["succeeded"], 1);
    assert_eq!(result["metadata"]["format"], "txt");

    let output_file = result["output_file"].as_str().unwrap();
    assert!(Path::new(output_file).exists());

    assert_eq!(parts.index.chunk_count("doc-1"), 1);
    assert!(parts.graph.has_relationship(
        &NodeKey::new("Document", "doc-1"),
        &NodeKey::new("Chunk", "doc-1_chunk_0"),
        "HAS_CHUNK"
    ));
    assert!(parts.graph.has_relationship(
        &NodeKey::new("Chunk", "doc-1_chunk_0"),
        &NodeKey::new("Entity", "ops@example.com"),
        "MENTIONS"
    ));
    assert!(parts.graph.node_count_with_label("Entity") >= 3);

    let seen = collect_events_until(&mut events, |e| {
        matches!(e, WorkerEvent::JobCompleted { job_id, .. } if *job_id == id)
    })
    .await;
    assert_eq!(progress_for(&seen, id), vec![30, 50, 70, 90, 100]);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_process_document_stage_failure_is_prefixed() {
    let (dir, db) = setup_test_db().await;

    let input = dir.path().join("note.md");
    std::fs::write(&input, "# Heading\n\nSome text.").unwrap();

    let parts = document_processor(&dir.path().join("out"), Arc::new(UnavailableEmbedder));

    let mut pool = WorkerPool::for_database(&db, fast_config());
    pool.register_handler(PROCESS_DOCUMENT, ProcessDocumentHandler::new(parts.processor));
    let handle = pool.start(1);

    let id = db
        .jobs
        .submit(
            PROCESS_DOCUMENT,
            doc(json!({ "file_path": input.to_string_lossy() })),
            0,
        )
        .await
        .unwrap();
    assert!(wait_for_job_status(&db, id, JobStatus::Failed, 10).await);

    let job = db.jobs.get(id).await.unwrap().unwrap();
    let error = job.error.unwrap();
    assert!(error.starts_with("embed: "), "unexpected error: {error}");
    assert!(error.contains("backend unavailable"));
    // Convert finished before embed failed.
    assert_eq!(job.progress, 30);
    assert!(job.result.is_none());
    assert!(parts.index.is_empty());

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_process_document_missing_file_fails_in_convert() {
    let (dir, db) = setup_test_db().await;
    let parts = document_processor(
        &dir.path().join("out"),
        Arc::new(MockEmbeddingBackend::new().with_dimension(8)),
    );

    let mut pool = WorkerPool::for_database(&db, fast_config());
    pool.register_handler(PROCESS_DOCUMENT, ProcessDocumentHandler::new(parts.processor));
    let handle = pool.start(1);

    let missing = db
        .jobs
        .submit(
            PROCESS_DOCUMENT,
            doc(json!({ "file_path": dir.path().join("nope.txt").to_string_lossy() })),
            0,
        )
        .await
        .unwrap();
    let invalid = db
        .jobs
        .submit(PROCESS_DOCUMENT, doc(json!({ "path": "x" })), 0)
        .await
        .unwrap();

    assert!(wait_for_job_status(&db, missing, JobStatus::Failed, 10).await);
    assert!(wait_for_job_status(&db, invalid, JobStatus::Failed, 10).await);

    let error = db.jobs.get(missing).await.unwrap().unwrap().error.unwrap();
    assert!(error.starts_with("convert: "), "unexpected error: {error}");

    let error = db.jobs.get(invalid).await.unwrap().unwrap().error.unwrap();
    assert!(error.contains("file_path"), "unexpected error: {error}");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_process_batch_collects_per_file_outcomes() {
    let (dir, db) = setup_test_db().await;

    let input_dir = dir.path().join("inbox");
    std::fs::create_dir(&input_dir).unwrap();
    std::fs::write(input_dir.join("a.txt"), "Alan Turing wrote about machines.").unwrap();
    std::fs::write(input_dir.join("b.md"), "# Notes\n\nMeeting notes.").unwrap();
    std::fs::write(input_dir.join("c.pdf"), b"%PDF-1.4 not really").unwrap();
    std::fs::write(input_dir.join("ignored.csv"), "a,b\n1,2").unwrap();

    let parts = document_processor(
        &dir.path().join("out"),
        Arc::new(MockEmbeddingBackend::new().with_dimension(8)),
    );

    let mut pool = WorkerPool::for_database(&db, fast_config());
    pool.register_handler(PROCESS_BATCH, ProcessBatchHandler::new(parts.processor.clone()));
    let mut events = pool.events();
    let handle = pool.start(1);

    let id = db
        .jobs
        .submit(
            PROCESS_BATCH,
            doc(json!({ "input_dir": input_dir.to_string_lossy() })),
            0,
        )
        .await
        .unwrap();
    assert!(wait_for_job_status(&db, id, JobStatus::Completed, 10).await);

    let result = db.jobs.get(id).await.unwrap().unwrap().result.unwrap();
    assert_eq!(result["total"], 3);
    assert_eq!(result["processed"], 2);
    assert_eq!(result["failed"], 1);

    let results = result["results"].as_array().unwrap();
    assert_eq!(results[0]["file"], "a.txt");
    assert_eq!(results[0]["status"], "success");
    assert_eq!(results[2]["file"], "c.pdf");
    assert_eq!(results[2]["status"], "failed");
    assert!(results[2]["error"].as_str().unwrap().starts_with("convert: "));

    assert_eq!(parts.graph.node_count_with_label("Document"), 2);

    let seen = collect_events_until(&mut events, |e| {
        matches!(e, WorkerEvent::JobCompleted { job_id, .. } if *job_id == id)
    })
    .await;
    assert_eq!(progress_for(&seen, id), vec![0, 33, 66]);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_process_batch_empty_and_unreadable_directories() {
    let (dir, db) = setup_test_db().await;

    let empty_dir = dir.path().join("empty");
    std::fs::create_dir(&empty_dir).unwrap();

    let parts = document_processor(
        &dir.path().join("out"),
        Arc::new(MockEmbeddingBackend::new().with_dimension(8)),
    );

    let mut pool = WorkerPool::for_database(&db, fast_config());
    pool.register_handler(PROCESS_BATCH, ProcessBatchHandler::new(parts.processor));
    let handle = pool.start(2);

    let empty = db
        .jobs
        .submit(
            PROCESS_BATCH,
            doc(json!({ "input_dir": empty_dir.to_string_lossy() })),
            0,
        )
        .await
        .unwrap();
    let missing = db
        .jobs
        .submit(
            PROCESS_BATCH,
            doc(json!({ "input_dir": dir.path().join("absent").to_string_lossy() })),
            0,
        )
        .await
        .unwrap();

    assert!(wait_for_job_status(&db, empty, JobStatus::Completed, 10).await);
    assert!(wait_for_job_status(&db, missing, JobStatus::Failed, 10).await);

    let result = db.jobs.get(empty).await.unwrap().unwrap().result.unwrap();
    assert_eq!(result["total"], 0);
    assert_eq!(result["message"], "No documents found");

    let error = db.jobs.get(missing).await.unwrap().unwrap().error.unwrap();
    assert!(
        error.contains("cannot read input directory"),
        "unexpected error: {error}"
    );

    handle.stop().await.unwrap();
}
