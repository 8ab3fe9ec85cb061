//! Document store: the mapping from external id to chunk text.
//!
//! The vector index only knows ids and vectors. Everything a search result
//! shows to the user (text, source, offsets) lives here, keyed by the same
//! deterministic external id.
//!
//! ## Key Components
//!
//! - **DocumentStore**: async trait used by both pipelines
//! - **SqliteDocumentStore**: SQLite implementation (WAL mode, upsert on id)
//! - **DocumentEntry / DocumentLookup**: stored rows and batch lookup results
//!
//! The store also remembers which embedding model produced the vectors in
//! the index. [`pin_embedding_model`] records it on first ingestion and
//! refuses a different model afterwards; [`check_embedding_model`] does the
//! read-only check for queries.

use crate::error::{Classify, ErrorKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod sqlite_store;

pub use sqlite_store::SqliteDocumentStore;

/// Errors raised by document stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Document store database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },

    #[error("Document store IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error(
        "Embedding model mismatch: the index was built with '{stored}', but the configured embedder is '{requested}'"
    )]
    ModelMismatch { stored: String, requested: String },
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::ModelMismatch { .. } => ErrorKind::Configuration,
            StoreError::Database { .. } | StoreError::Io { .. } => ErrorKind::DocumentStore,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The text and origin of one indexed chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentEntry {
    pub external_id: String,
    pub text: String,
    pub source_id: String,
    pub sequence_index: usize,
    pub char_start: usize,
    pub char_end: usize,
}

/// Result of a batch lookup. Every requested id ends up in exactly one of
/// the two collections.
#[derive(Debug, Clone, Default)]
pub struct DocumentLookup {
    pub found: HashMap<String, DocumentEntry>,
    pub missing: Vec<String>,
}

/// Storage for [`DocumentEntry`] rows.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or overwrite one entry
    async fn put(&self, entry: DocumentEntry) -> Result<()> {
        self.put_many(vec![entry]).await
    }

    /// Insert or overwrite entries atomically
    async fn put_many(&self, entries: Vec<DocumentEntry>) -> Result<()>;

    /// Look up one entry; an unknown id is `None`, not an error
    async fn get(&self, external_id: &str) -> Result<Option<DocumentEntry>>;

    /// Look up many entries at once
    async fn get_many(&self, external_ids: &[String]) -> Result<DocumentLookup>;

    /// Delete entries by id, returning how many existed
    async fn delete_many(&self, external_ids: &[String]) -> Result<usize>;

    /// Delete the entries of `source_id` whose sequence index is at least
    /// `first_stale_sequence`, returning their ids
    async fn delete_source_from(
        &self,
        source_id: &str,
        first_stale_sequence: usize,
    ) -> Result<Vec<String>>;

    /// Ids stored for one source, in sequence order
    async fn source_ids(&self, source_id: &str) -> Result<Vec<String>>;

    /// Number of stored entries
    async fn count(&self) -> Result<usize>;

    /// The embedding model id recorded for this store, if any
    async fn embedding_model(&self) -> Result<Option<String>>;

    /// Record the embedding model id
    async fn set_embedding_model(&self, model_id: &str) -> Result<()>;
}

/// Record `model_id` on an unpinned store, or make sure it matches the one
/// already recorded.
pub async fn pin_embedding_model(store: &dyn DocumentStore, model_id: &str) -> Result<()> {
    match store.embedding_model().await? {
        None => {
            tracing::info!("Pinning document store to embedding model {}", model_id);
            store.set_embedding_model(model_id).await
        }
        Some(stored) if stored == model_id => Ok(()),
        Some(stored) => Err(StoreError::ModelMismatch {
            stored,
            requested: model_id.to_string(),
        }),
    }
}

/// Fail if the store was built with a different embedding model. A store
/// that was never pinned passes.
pub async fn check_embedding_model(store: &dyn DocumentStore, model_id: &str) -> Result<()> {
    match store.embedding_model().await? {
        Some(stored) if stored != model_id => Err(StoreError::ModelMismatch {
            stored,
            requested: model_id.to_string(),
        }),
        _ => Ok(()),
    }
}
