//! Job handlers and the registry that maps job types to them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use docket_core::{Document, Error, Job, JobRepository, Result};

/// Progress callback type for job handlers.
pub type ProgressCallback = Box<dyn Fn(i32, Option<&str>) + Send + Sync>;

/// Context provided to job handlers.
pub struct JobContext {
    /// The job being processed.
    pub job: Job,
    /// Store that receives persisted progress updates.
    jobs: Option<Arc<dyn JobRepository>>,
    /// Progress callback for live fan-out (worker events).
    progress_callback: Option<ProgressCallback>,
}

impl JobContext {
    /// Create a new job context.
    pub fn new(job: Job) -> Self {
        Self {
            job,
            jobs: None,
            progress_callback: None,
        }
    }

    /// Persist progress through this repository.
    pub fn with_repository(mut self, jobs: Arc<dyn JobRepository>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Set the progress callback.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(i32, Option<&str>) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// The job ID.
    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    /// Get the job payload.
    pub fn payload(&self) -> &Document {
        &self.job.payload
    }

    /// Required string field of the payload.
    pub fn payload_str(&self, key: &str) -> Result<&str> {
        self.job
            .payload
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidInput(format!("payload field '{key}' must be a string")))
    }

    /// Report progress: persisted to the store, then fanned out to the callback.
    ///
    /// A store error is logged, never returned; progress is advisory and must
    /// not fail the job.
    pub async fn report_progress(&self, percent: i32, message: Option<&str>) {
        let percent = percent.clamp(0, 100);

        if let Some(jobs) = &self.jobs {
            if let Err(e) = jobs.update_progress(self.job.id, percent, message).await {
                warn!(job_id = %self.job.id, percent, error = %e, "Failed to persist job progress");
            }
        }

        debug!(job_id = %self.job.id, progress = percent, ?message, "Job progress");

        if let Some(ref callback) = self.progress_callback {
            callback(percent, message);
        }
    }
}

/// Result of job execution.
#[derive(Debug)]
pub enum JobResult {
    /// Job completed successfully with result data.
    Success(Document),
    /// Job failed with an error message.
    Failed(String),
}

impl JobResult {
    /// Whether the job succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success(_))
    }
}

impl<E: std::fmt::Display> From<std::result::Result<Document, E>> for JobResult {
    fn from(result: std::result::Result<Document, E>) -> Self {
        match result {
            Ok(doc) => JobResult::Success(doc),
            Err(e) => JobResult::Failed(e.to_string()),
        }
    }
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a handler.
///
/// ```rust,ignore
/// registry.register("double", handler_fn(|ctx| async move {
///     let n = ctx.payload()["n"].as_i64().unwrap_or(0);
///     let mut out = Document::new();
///     out.insert("doubled".into(), (n * 2).into());
///     JobResult::Success(out)
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    async fn execute(&self, ctx: JobContext) -> JobResult {
        (self.f)(ctx).await
    }
}

/// No-op handler for testing.
pub struct NoOpHandler;

#[async_trait]
impl JobHandler for NoOpHandler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        ctx.report_progress(50, Some("Processing...")).await;
        JobResult::Success(Document::new())
    }
}

/// Maps job-type strings to handlers.
///
/// Populated at startup and frozen when the worker pool starts.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler for the type.
    pub fn register<H: JobHandler + 'static>(&mut self, job_type: impl Into<String>, handler: H) {
        self.register_arc(job_type, Arc::new(handler));
    }

    /// Register a shared handler.
    pub fn register_arc(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        if self.handlers.insert(job_type.clone(), handler).is_some() {
            warn!(%job_type, "Replaced previously registered job handler");
        } else {
            debug!(%job_type, "Registered job handler");
        }
    }

    /// Look up the handler for a job type.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Whether a handler is registered for the type.
    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
