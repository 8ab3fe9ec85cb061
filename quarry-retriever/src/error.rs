//! Error classification shared by the pipelines.
//!
//! Every component has its own `thiserror` enum. What the pipelines need to
//! know about an error is only its [`ErrorKind`]: whether the run must stop,
//! or only the current batch or query has failed.

use quarry_context::ChunkError;
use quarry_embed::EmbedError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid settings, unknown model, or an index with the wrong shape.
    /// Fatal at startup.
    Configuration,
    /// The embedding backend failed, timed out, or returned unusable vectors.
    EmbeddingBackend,
    /// The vector index service failed or rejected a request.
    IndexService,
    /// The index and the document store disagree about an id.
    Consistency,
    /// The local document database failed.
    DocumentStore,
    /// A source document could not be read. Only that document fails.
    Source,
}

impl ErrorKind {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::Configuration)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::EmbeddingBackend => "embedding backend",
            ErrorKind::IndexService => "index service",
            ErrorKind::Consistency => "consistency",
            ErrorKind::DocumentStore => "document store",
            ErrorKind::Source => "source",
        };
        f.write_str(name)
    }
}

/// Errors that know their [`ErrorKind`].
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for EmbedError {
    fn kind(&self) -> ErrorKind {
        if self.is_configuration() {
            ErrorKind::Configuration
        } else {
            ErrorKind::EmbeddingBackend
        }
    }
}

impl Classify for ChunkError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}
