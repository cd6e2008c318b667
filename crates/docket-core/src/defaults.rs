//! Centralized default constants for docket.
//!
//! Every crate and the worker binary reference these constants instead of
//! defining their own magic numbers. Environment overrides are parsed by the
//! `from_env()` constructors of the types that consume them.

// =============================================================================
// DATABASE
// =============================================================================

/// Default SQLite database URL.
pub const DATABASE_URL: &str = "sqlite://docket.db";

/// Default maximum number of pooled SQLite connections.
pub const DB_MAX_CONNECTIONS: u32 = 8;

/// How long a connection waits on a locked database before giving up.
pub const DB_BUSY_TIMEOUT_MS: u64 = 5_000;

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default number of worker loops in the pool.
pub const JOB_WORKER_COUNT: usize = 2;

/// Idle wait between empty polls, in milliseconds.
pub const JOB_POLL_INTERVAL_MS: u64 = 1_000;

/// Upper bound on how long `stop()` waits for loops to drain.
pub const JOB_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default priority for submitted jobs.
pub const JOB_PRIORITY: i32 = 0;

/// Default page size for `list`.
pub const JOB_LIST_LIMIT: i64 = 100;

/// Default worker event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Error text stored on jobs cancelled before they were claimed.
pub const CANCELLED_REASON: &str = "cancelled";

/// Error text stored when a job fails with a blank message.
pub const UNSPECIFIED_FAILURE_REASON: &str = "Job handler failed without an error message";

// =============================================================================
// EMBEDDING
// =============================================================================

/// Default Ollama base URL.
pub const OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Default embedding model name (Ollama).
pub const EMBED_MODEL: &str = "nomic-embed-text";

/// Default embedding vector dimension for nomic-embed-text.
pub const EMBED_DIMENSION: usize = 768;

/// Timeout for embedding requests in seconds.
pub const EMBED_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// DOCUMENT PIPELINE
// =============================================================================

/// Maximum characters per chunk for text splitting.
pub const CHUNK_SIZE: usize = 512;

/// Overlap characters between adjacent chunks.
pub const CHUNK_OVERLAP: usize = 50;

/// Directory where processed document output is written.
pub const OUTPUT_DIR: &str = "./output";

/// File extensions picked up by batch document jobs.
pub const BATCH_EXTENSIONS: &[&str] = &["pdf", "docx", "pptx", "html", "md", "txt"];
