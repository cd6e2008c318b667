//! # docket-core
//!
//! Core types, traits, and abstractions for the docket job queue.
//!
//! This crate provides the job model and state machine, the repository
//! contract every job store implements, and the call contracts of the
//! external collaborators (conversion, embedding, vector index, graph store)
//! that document-processing handlers consume.

pub mod config;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod memory;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use config::{parse_bool, parse_bool_env};
pub use error::{Error, Result};
pub use memory::{MemoryGraphStore, MemoryVectorIndex};
pub use models::*;
pub use traits::*;

/// Generate a new time-ordered job identifier.
#[inline]
pub fn new_v7() -> uuid::Uuid {
    uuid::Uuid::now_v7()
}

/// Error text to store for a failed job; a FAILED row never has a blank error.
pub fn failure_reason(error: &str) -> &str {
    if error.trim().is_empty() {
        defaults::UNSPECIFIED_FAILURE_REASON
    } else {
        error
    }
}
