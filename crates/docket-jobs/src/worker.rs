//! Worker pool for processing queued jobs.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use docket_core::{defaults, failure_reason, parse_bool_env, Error, Job, JobRepository, Result};
use docket_db::Database;

use crate::handler::{HandlerRegistry, JobContext, JobHandler, JobResult};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Idle wait between empty polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Number of worker loops started by the binary.
    pub worker_count: usize,
    /// How long `stop()` waits for running jobs to finish.
    pub shutdown_timeout_secs: u64,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            worker_count: defaults::JOB_WORKER_COUNT,
            shutdown_timeout_secs: defaults::JOB_SHUTDOWN_TIMEOUT_SECS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_WORKER_COUNT` | `2` | Number of worker loops |
    /// | `JOB_POLL_INTERVAL_MS` | `1000` | Polling interval when queue is empty |
    /// | `JOB_SHUTDOWN_TIMEOUT_SECS` | `30` | Bound on graceful shutdown |
    pub fn from_env() -> Self {
        let enabled = parse_bool_env("JOB_WORKER_ENABLED", true);

        let worker_count = std::env::var("JOB_WORKER_COUNT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::JOB_WORKER_COUNT)
            .max(1);

        let poll_interval_ms = std::env::var("JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_POLL_INTERVAL_MS);

        let shutdown_timeout_secs = std::env::var("JOB_SHUTDOWN_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_SHUTDOWN_TIMEOUT_SECS);

        Self {
            poll_interval_ms,
            worker_count,
            shutdown_timeout_secs,
            enabled,
        }
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the number of worker loops.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Set the graceful shutdown bound.
    pub fn with_shutdown_timeout(mut self, secs: u64) -> Self {
        self.shutdown_timeout_secs = secs;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the worker pool.
///
/// Live fan-out only; the job store stays the source of truth.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A job was claimed and its handler started.
    JobStarted { job_id: Uuid, job_type: String },
    /// Job progress was updated.
    JobProgress {
        job_id: Uuid,
        percent: i32,
        message: Option<String>,
    },
    /// A job completed successfully.
    JobCompleted { job_id: Uuid, job_type: String },
    /// A job failed.
    JobFailed {
        job_id: Uuid,
        job_type: String,
        error: String,
    },
    /// Worker loops started.
    WorkerStarted,
    /// All worker loops exited.
    WorkerStopped,
}

/// A pool of independent worker loops pulling from one job store.
pub struct WorkerPool {
    jobs: Arc<dyn JobRepository>,
    config: WorkerConfig,
    registry: HandlerRegistry,
    event_tx: broadcast::Sender<WorkerEvent>,
    wakeup: Option<Arc<Notify>>,
}

impl WorkerPool {
    /// Create a pool over any job repository.
    pub fn new(jobs: Arc<dyn JobRepository>, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            jobs,
            config,
            registry: HandlerRegistry::new(),
            event_tx,
            wakeup: None,
        }
    }

    /// Create a pool over the database's job store, woken early on submit.
    pub fn for_database(db: &Database, config: WorkerConfig) -> Self {
        let wakeup = db.jobs.job_notify();
        Self::new(Arc::new(db.jobs.clone()), config).with_wakeup(wakeup)
    }

    /// Wake idle loops when this handle is notified.
    pub fn with_wakeup(mut self, notify: Arc<Notify>) -> Self {
        self.wakeup = Some(notify);
        self
    }

    /// Register a handler for a job type.
    pub fn register_handler<H: JobHandler + 'static>(
        &mut self,
        job_type: impl Into<String>,
        handler: H,
    ) {
        self.registry.register(job_type, handler);
    }

    /// Register a shared handler for a job type.
    pub fn register_handler_arc(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) {
        self.registry.register_arc(job_type, handler);
    }

    /// Handlers registered so far.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start `worker_count` loops and return a handle for stopping them.
    ///
    /// The registry is frozen from here on.
    pub fn start(self, worker_count: usize) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        let event_tx = self.event_tx.clone();
        let mut tasks = JoinSet::new();

        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return WorkerHandle {
                shutdown_tx,
                event_tx,
                tasks,
                shutdown_timeout,
            };
        }

        let worker_count = worker_count.max(1);
        info!(
            worker_count,
            poll_interval_ms = self.config.poll_interval_ms,
            job_types = ?self.registry.job_types(),
            "Job worker pool started"
        );

        let shared = Arc::new(Shared {
            jobs: self.jobs,
            registry: self.registry,
            event_tx: self.event_tx,
            poll_interval: Duration::from_millis(self.config.poll_interval_ms),
            wakeup: self.wakeup,
        });

        for worker_id in 0..worker_count {
            let shared = shared.clone();
            let shutdown_rx = shutdown_rx.clone();
            tasks.spawn(async move { shared.run(worker_id, shutdown_rx).await });
        }

        let _ = event_tx.send(WorkerEvent::WorkerStarted);

        WorkerHandle {
            shutdown_tx,
            event_tx,
            tasks,
            shutdown_timeout,
        }
    }
}

/// Handle for controlling a running pool.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    event_tx: broadcast::Sender<WorkerEvent>,
    tasks: JoinSet<()>,
    shutdown_timeout: Duration,
}

impl WorkerHandle {
    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Number of loops still running.
    pub fn worker_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every loop to exit after its current job and wait for them.
    ///
    /// Loops still busy after the shutdown timeout are aborted and an error
    /// is returned; their jobs stay PROCESSING in the store.
    pub async fn stop(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = ?e, "Worker task ended abnormally");
                }
            }
        })
        .await;

        if drained.is_err() {
            let remaining = self.tasks.len();
            self.tasks.abort_all();
            warn!(remaining, "Worker loops did not stop in time, aborted");
            return Err(Error::Internal(format!(
                "{} worker loop(s) still busy after {}s",
                remaining,
                self.shutdown_timeout.as_secs()
            )));
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker pool stopped");
        Ok(())
    }
}

/// State shared by every loop of a started pool.
struct Shared {
    jobs: Arc<dyn JobRepository>,
    registry: HandlerRegistry,
    event_tx: broadcast::Sender<WorkerEvent>,
    poll_interval: Duration,
    wakeup: Option<Arc<Notify>>,
}

impl Shared {
    /// One worker loop: claim, execute, repeat; idle-wait when the queue is empty.
    async fn run(&self, worker_id: usize, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(worker_id, "Worker loop started");

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            match self.jobs.claim_next().await {
                Ok(Some(job)) => {
                    self.execute_job(worker_id, job).await;
                    // No wait: immediately try to claim more jobs.
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to claim job");
                }
            }

            if self.idle_wait(&mut shutdown_rx).await {
                break;
            }
        }

        debug!(worker_id, "Worker loop stopped");
    }

    /// Wait one poll interval. Returns true when shutdown was requested.
    async fn idle_wait(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let wakeup = async {
            match &self.wakeup {
                Some(notify) => notify.notified().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            // Only `true` is ever sent; a dropped sender also means shutdown.
            _ = shutdown_rx.changed() => true,
            _ = sleep(self.poll_interval) => false,
            _ = wakeup => false,
        }
    }

    /// Execute a single claimed job and persist its outcome.
    async fn execute_job(&self, worker_id: usize, job: Job) {
        let start = Instant::now();
        let job_id = job.id;
        let job_type = job.job_type.clone();

        info!(worker_id, %job_id, %job_type, "Processing job");

        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            job_type: job_type.clone(),
        });

        let result = match self.registry.get(&job_type) {
            Some(handler) => {
                let event_tx = self.event_tx.clone();
                let ctx = JobContext::new(job)
                    .with_repository(self.jobs.clone())
                    .with_progress_callback(move |percent, message| {
                        let _ = event_tx.send(WorkerEvent::JobProgress {
                            job_id,
                            percent,
                            message: message.map(String::from),
                        });
                    });

                match AssertUnwindSafe(handler.execute(ctx)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(%job_id, %job_type, panic = %message, "Job handler panicked");
                        JobResult::Failed(format!("Handler panicked: {}", message))
                    }
                }
            }
            None => {
                warn!(%job_type, "No handler registered for job type");
                JobResult::Failed(format!("No handler registered for job type: {}", job_type))
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            JobResult::Success(result_data) => {
                if let Err(e) = self.jobs.complete(job_id, result_data).await {
                    error!(error = %e, %job_id, "Failed to mark job as completed");
                } else {
                    info!(%job_id, %job_type, duration_ms, "Job completed successfully");
                    let _ = self
                        .event_tx
                        .send(WorkerEvent::JobCompleted { job_id, job_type });
                }
            }
            JobResult::Failed(error) => {
                let error = failure_reason(&error).to_string();
                if let Err(e) = self.jobs.fail(job_id, &error).await {
                    error!(error = %e, %job_id, "Failed to mark job as failed");
                } else {
                    warn!(%job_id, %job_type, %error, duration_ms, "Job failed");
                    let _ = self.event_tx.send(WorkerEvent::JobFailed {
                        job_id,
                        job_type,
                        error,
                    });
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval_ms, 1_000);
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.shutdown_timeout_secs, 30);
        assert!(config.enabled);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_poll_interval(50)
            .with_worker_count(8)
            .with_shutdown_timeout(5)
            .with_enabled(false);

        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.shutdown_timeout_secs, 5);
        assert!(!config.enabled);
    }

    // Serializes tests that mutate process environment.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn test_worker_enabled_flag_is_case_insensitive() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        for value in ["FALSE", "no", "Off", "0"] {
            std::env::set_var("JOB_WORKER_ENABLED", value);
            assert!(!WorkerConfig::from_env().enabled, "{value:?}");
        }
        for value in ["TRUE", "yes", "on", "garbage"] {
            std::env::set_var("JOB_WORKER_ENABLED", value);
            assert!(WorkerConfig::from_env().enabled, "{value:?}");
        }
        std::env::remove_var("JOB_WORKER_ENABLED");
        assert!(WorkerConfig::from_env().enabled);
    }

    #[test]
    fn test_worker_count_at_least_one() {
        assert_eq!(WorkerConfig::default().with_worker_count(0).worker_count, 1);
    }

    #[test]
    fn test_worker_event_clone_eq() {
        let event = WorkerEvent::JobFailed {
            job_id: Uuid::nil(),
            job_type: "process_document".into(),
            error: "convert: boom".into(),
        };
        assert_eq!(event.clone(), event);
        assert_ne!(WorkerEvent::WorkerStarted, WorkerEvent::WorkerStopped);
    }

    #[test]
    fn test_panic_message_payloads() {
        let s: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(s.as_ref()), "static str");

        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");

        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic payload");
    }
}
