//! quarry-retriever: semantic document search over a vector index
//!
//! Documents are split into overlapping chunks, embedded, and written to two
//! places: the chunk text goes to a local document store and the vectors go
//! to a vector index service. A query is embedded the same way, the index
//! returns the nearest ids, and the store turns them back into text.
//!
//! ## Key Modules
//!
//! - **[`index`]**: [`index::VectorIndex`] trait with an HTTP client and an in-memory index
//! - **[`storage`]**: [`storage::DocumentStore`] trait with a SQLite implementation
//! - **[`retrieval`]**: ingestion and retrieval pipelines, document sources
//! - **[`config`]**: `quarry.toml` settings
//! - **[`error`]**: error classification shared by all components
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quarry_embed::{EmbedConfig, Embedder};
//! use quarry_retriever::index::{IndexSpec, MemoryIndex, Metric};
//! use quarry_retriever::retrieval::ingestion::{CancellationFlag, IngestionConfig, IngestionPipeline};
//! use quarry_retriever::retrieval::search::RetrievalPipeline;
//! use quarry_retriever::retrieval::sources::{SourceDocument, from_documents};
//! use quarry_retriever::storage::SqliteDocumentStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let embedder = Arc::new(Embedder::from_config(&EmbedConfig::default()).await?);
//! let index = Arc::new(MemoryIndex::new());
//! let store = Arc::new(SqliteDocumentStore::open_memory().await?);
//! let spec = IndexSpec::new("docs_index", embedder.dimension(), Metric::Cosine);
//!
//! let ingestion = IngestionPipeline::new(
//!     embedder.clone(), index.clone(), store.clone(), spec.clone(), IngestionConfig::default(),
//! )?;
//! ingestion.ensure_index().await?;
//! let docs = from_documents(vec![SourceDocument::new("dogs.txt", "Dogs are loyal pets.")]);
//! ingestion.ingest(docs, &CancellationFlag::new()).await?;
//!
//! let retrieval = RetrievalPipeline::new(embedder, index, store, spec)?;
//! for result in retrieval.search("canine", 5).await? {
//!     println!("{} {:.3} {}", result.rank, result.score, result.source_id);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Sources → Chunker → Embedder → DocumentStore + VectorIndex
//!                                      ↑              ↑
//!                  Query → Embedder ───┴──────────────┘ → ranked results
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod retrieval;
pub mod storage;
