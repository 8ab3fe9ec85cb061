//! Error types for the embedding system

use std::time::Duration;

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error type for all embedding operations.
///
/// Variants fall in two groups, see [`EmbedError::is_configuration`]:
///
/// - **Configuration errors** (`InvalidConfig`, `UnknownModel`) are fatal: the
///   embedder cannot be used at all until the settings change.
/// - **Backend errors** (everything else) belong to a single call. The
///   backend was unreachable, too slow, or returned something that is not a
///   usable embedding. Retrying is left to the caller.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when the embedding configuration is invalid
    #[error("Invalid embedding configuration: {message}")]
    InvalidConfig { message: String },

    /// The requested model is not one the backend knows about
    #[error("Unknown embedding model '{name}' (supported: {supported})")]
    UnknownModel { name: String, supported: String },

    /// Error during model initialization
    #[error("Model initialization failed: {source}")]
    ModelInitialization {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The backend failed to produce embeddings
    #[error("Embedding generation failed: {source}")]
    EmbeddingGeneration {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A backend call did not complete in time
    #[error("Embedding backend timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The backend answered, but the vectors are unusable
    #[error("Malformed embedding output: {message}")]
    MalformedOutput { message: String },

    /// Async task join errors
    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    /// Create a model initialization error from any error type.
    pub fn model_init<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ModelInitialization {
            source: Box::new(source),
        }
    }

    /// Create an embedding generation error from any error type.
    pub fn embedding_gen<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::EmbeddingGeneration {
            source: Box::new(source),
        }
    }

    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a malformed output error with a custom message.
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedOutput {
            message: message.into(),
        }
    }

    /// Whether this error means the embedder is misconfigured rather than
    /// that one call failed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. } | Self::UnknownModel { .. }
        )
    }
}
