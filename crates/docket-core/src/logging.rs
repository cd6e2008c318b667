//! Structured logging field name constants for docket.
//!
//! All crates use these names for structured `tracing` fields so log
//! aggregation can query by the same keys across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), job completions |
//! | DEBUG | Decision points, claims, progress updates |
//! | TRACE | Per-item iteration (chunks, entities) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "jobs", "inference", "pipeline"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "worker", "ollama", "document"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "submit", "claim_next", "embed", "upsert"
pub const OPERATION: &str = "op";

/// Index of the worker loop inside the pool.
pub const WORKER_ID: &str = "worker_id";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Job type string.
pub const JOB_TYPE: &str = "job_type";

/// Document identifier inside a pipeline job.
pub const DOCUMENT_ID: &str = "document_id";

/// Pipeline stage name.
pub const STAGE: &str = "stage";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of chunks processed.
pub const CHUNK_COUNT: &str = "chunk_count";

/// Number of inputs sent to an embedding model.
pub const INPUT_COUNT: &str = "input_count";

/// Progress percentage reported by a handler.
pub const PROGRESS: &str = "progress";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Slow operation threshold exceeded.
pub const SLOW: &str = "slow";
