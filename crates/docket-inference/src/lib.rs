//! # docket-inference
//!
//! Embedding backends consumed by docket's document pipeline.
//!
//! This crate provides:
//! - [`OllamaBackend`], an HTTP client for Ollama's `/api/embed` endpoint
//! - A deterministic mock backend (feature `mock`) for tests and offline runs
//!
//! # Feature Flags
//!
//! - `ollama` (default): Enable Ollama backend
//! - `mock`: Enable `MockEmbeddingBackend`
//!
//! # Example
//!
//! ```rust,no_run
//! use docket_inference::OllamaBackend;
//! use docket_core::EmbeddingBackend;
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = OllamaBackend::from_env();
//!     let texts = vec!["Hello".to_string()];
//!     let batch = backend.embed_batch(&texts).await.unwrap();
//!     println!("{} vectors, {} fallbacks", batch.vectors.len(), batch.fallback_indices.len());
//! }
//! ```

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export core types
pub use docket_core::*;

#[cfg(feature = "ollama")]
pub use ollama::OllamaBackend;

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockEmbeddingBackend, MockEmbeddingGenerator};
