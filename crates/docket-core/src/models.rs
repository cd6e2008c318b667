//! Data models for jobs and the document pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Error;

/// Structured document carried as job payload and result.
///
/// A string-keyed map of JSON values, so new job types can carry new fields
/// without a schema migration.
pub type Document = serde_json::Map<String, JsonValue>;

/// Embedding vector.
pub type Vector = Vec<f32>;

// =============================================================================
// JOBS
// =============================================================================

/// Lifecycle state of a job.
///
/// ```text
/// PENDING ──► PROCESSING ──► COMPLETED
///    │                  └──► FAILED
///    └──► CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Every status, in state machine order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown job status: {other}"))),
        }
    }
}

/// A schedulable, trackable unit of asynchronous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: i32,
    pub payload: Document,
    pub result: Option<Document>,
    pub error: Option<String>,
    pub progress: i32,
    pub progress_message: Option<String>,
    /// Key used by deduplicated submission; `None` for plain submissions.
    pub dedup_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether the job reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Queue statistics: count per status plus total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

impl QueueStats {
    /// Count for a single status.
    pub fn count(&self, status: JobStatus) -> i64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }
}

// =============================================================================
// DOCUMENT PIPELINE
// =============================================================================

/// Output of the document-conversion collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertedDocument {
    pub text: String,
    pub page_count: u32,
    /// Source format, e.g. "txt", "md", "html".
    pub format: String,
}

/// A slice of converted document text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub chunk_id: usize,
    pub text: String,
    /// Starting byte offset in the converted text.
    pub start_offset: usize,
    /// Ending byte offset in the converted text.
    pub end_offset: usize,
}

/// Per-item outcome counts of a vector index upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// A ranked vector index hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub doc_id: String,
    pub chunk_id: usize,
    pub text: String,
    pub score: f32,
}

/// Natural key of a graph node: label plus identifying name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub label: String,
    pub key: String,
}

impl NodeKey {
    pub fn new(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.label, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trip() {
        for status in JobStatus::ALL {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_job_status_parse_rejects_unknown() {
        assert!("running".parse::<JobStatus>().is_err());
        assert!("PENDING".parse::<JobStatus>().is_err());
        assert!("".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_status_serde_lowercase() {
        let json = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        let back: JobStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(back, JobStatus::Cancelled);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_allowed_transitions() {
        use JobStatus::*;
        let allowed = [
            (Pending, Processing),
            (Pending, Cancelled),
            (Processing, Completed),
            (Processing, Failed),
        ];
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_processing_cannot_be_cancelled() {
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in JobStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_queue_stats_count() {
        let stats = QueueStats {
            pending: 1,
            processing: 2,
            completed: 3,
            failed: 4,
            cancelled: 5,
            total: 15,
        };
        let sum: i64 = JobStatus::ALL.iter().map(|s| stats.count(*s)).sum();
        assert_eq!(sum, stats.total);
        assert_eq!(stats.count(JobStatus::Failed), 4);
    }

    #[test]
    fn test_node_key_display() {
        let key = NodeKey::new("Entity", "Ada Lovelace");
        assert_eq!(key.to_string(), "Entity:Ada Lovelace");
    }
}
