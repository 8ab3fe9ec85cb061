//! # quarry-embed
//!
//! Text embeddings for quarry: a backend seam, two backends, and the
//! [`Embedder`] adapter that the ingestion and retrieval pipelines call.
//!
//! ## Features
//!
//! - **Local ONNX Models**: `all-MiniLM-L6-v2` and friends through fastembed,
//!   downloaded on first use and shared process-wide
//! - **Offline Hashing Backend**: deterministic bag-of-words vectors without
//!   any model files
//! - **Batching and Validation**: order-preserving batches, per-call timeouts,
//!   and rejection of malformed vectors (wrong length, NaN, all zeros)
//! - **Caching**: optional bounded cache of already computed embeddings
//!
//! ## Quick Start
//!
//! ```no_run
//! use quarry_embed::{EmbedConfig, Embedder};
//!
//! # async fn example() -> quarry_embed::Result<()> {
//! let embedder = Embedder::from_config(&EmbedConfig::default()).await?;
//!
//! let texts = vec!["Hello world".to_string(), "How are you?".to_string()];
//! let vectors = embedder.embed(&texts).await?;
//!
//! println!("Generated {} embeddings of dimension {}", vectors.len(), embedder.dimension());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: backend selection and tuning
//! - [`provider`]: the [`EmbeddingBackend`] trait and its implementations
//! - [`embedder`]: batching, timeouts, validation and caching
//! - [`cache`]: the bounded embedding cache
//! - [`error`]: error types and result handling
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`] using the crate's [`EmbedError`] type.
//! [`EmbedError::is_configuration`] separates fatal configuration problems
//! from failures of a single backend call.

pub mod cache;
pub mod config;
pub mod embedder;
pub mod error;
pub mod provider;

// Re-export main types for easy access
pub use cache::EmbeddingCache;
pub use config::{BackendKind, EmbedConfig, ModelSpec, SUPPORTED_MODELS, find_model};
pub use embedder::{Embedder, validate_embeddings};
pub use error::{EmbedError, Result};
pub use provider::{EmbeddingBackend, FastEmbedBackend, HashingBackend, create_backend};
