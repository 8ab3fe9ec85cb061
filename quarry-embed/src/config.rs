//! Configuration for embedding backends

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// A model the fastembed backend can load, with its native output dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: &'static str,
    pub dimension: usize,
}

/// Models supported by [`crate::FastEmbedBackend`]. The first entry is the default.
pub const SUPPORTED_MODELS: &[ModelSpec] = &[
    ModelSpec {
        name: "all-MiniLM-L6-v2",
        dimension: 384,
    },
    ModelSpec {
        name: "all-MiniLM-L12-v2",
        dimension: 384,
    },
    ModelSpec {
        name: "bge-small-en-v1.5",
        dimension: 384,
    },
    ModelSpec {
        name: "bge-base-en-v1.5",
        dimension: 768,
    },
];

/// Look up a supported model by name (case-insensitive).
pub fn find_model(name: &str) -> Option<&'static ModelSpec> {
    SUPPORTED_MODELS
        .iter()
        .find(|spec| spec.name.eq_ignore_ascii_case(name))
}

pub(crate) fn supported_model_names() -> String {
    SUPPORTED_MODELS
        .iter()
        .map(|spec| spec.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Which embedding backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local ONNX model through fastembed.
    #[default]
    FastEmbed,
    /// Feature hashing; no model files, fully offline.
    Hashing,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::FastEmbed => write!(f, "fastembed"),
            BackendKind::Hashing => write!(f, "hashing"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = EmbedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fastembed" => Ok(BackendKind::FastEmbed),
            "hashing" => Ok(BackendKind::Hashing),
            _ => Err(EmbedError::invalid_config(format!(
                "Unknown embedding backend '{s}' (expected fastembed or hashing)"
            ))),
        }
    }
}

/// Configuration for embedding generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// Which backend produces the vectors
    pub backend: BackendKind,
    /// Name of the fastembed model to use
    #[serde(alias = "model")]
    pub model_name: String,
    /// Expected vector dimension. The hashing backend produces exactly this
    /// many components; for fastembed it must match the model.
    pub dimension: usize,
    /// Maximum number of texts sent to the backend in one call
    pub batch_size: usize,
    /// Upper bound on a single backend call, in seconds
    pub timeout_secs: u64,
    /// Number of embeddings kept in the in-memory cache (0 disables it)
    pub cache_capacity: usize,
    /// Where fastembed stores downloaded model files
    pub cache_dir: Option<PathBuf>,
    /// Whether to L2-normalize embeddings
    pub normalize: bool,
    /// Show a progress bar while a model downloads
    pub show_download_progress: bool,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::FastEmbed,
            model_name: SUPPORTED_MODELS[0].name.to_string(),
            dimension: SUPPORTED_MODELS[0].dimension,
            batch_size: 32,
            timeout_secs: 60,
            cache_capacity: 1024,
            cache_dir: None,
            normalize: true,
            show_download_progress: true,
        }
    }
}

impl EmbedConfig {
    /// Configuration for a fastembed model, with its native dimension.
    pub fn new(model_name: impl Into<String>) -> Self {
        let model_name = model_name.into();
        let dimension = find_model(&model_name)
            .map(|spec| spec.dimension)
            .unwrap_or(SUPPORTED_MODELS[0].dimension);
        Self {
            model_name,
            dimension,
            ..Self::default()
        }
    }

    /// Configuration for the offline hashing backend.
    pub fn hashing(dimension: usize) -> Self {
        Self {
            backend: BackendKind::Hashing,
            dimension,
            ..Self::default()
        }
    }

    /// Set the batch size for embedding generation (builder style)
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    /// Set whether to normalize embeddings (builder style)
    pub fn with_normalize(self, normalize: bool) -> Self {
        Self { normalize, ..self }
    }

    /// Set the per-call timeout (builder style)
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout_secs: timeout.as_secs().max(1),
            ..self
        }
    }

    /// Set the embedding cache capacity, 0 to disable (builder style)
    pub fn with_cache_capacity(self, cache_capacity: usize) -> Self {
        Self {
            cache_capacity,
            ..self
        }
    }

    /// Set the model download directory (builder style)
    pub fn with_cache_dir<P: AsRef<Path>>(self, cache_dir: P) -> Self {
        Self {
            cache_dir: Some(cache_dir.as_ref().to_path_buf()),
            ..self
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Check the configuration without touching any model.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be greater than zero"));
        }
        if self.timeout_secs == 0 {
            return Err(EmbedError::invalid_config("timeout_secs must be greater than zero"));
        }
        if self.dimension == 0 {
            return Err(EmbedError::invalid_config("dimension must be greater than zero"));
        }

        if self.backend == BackendKind::FastEmbed {
            let spec = find_model(&self.model_name).ok_or_else(|| EmbedError::UnknownModel {
                name: self.model_name.clone(),
                supported: supported_model_names(),
            })?;
            if spec.dimension != self.dimension {
                return Err(EmbedError::invalid_config(format!(
                    "model {} produces {}-dimensional vectors, but dimension is set to {}",
                    spec.name, spec.dimension, self.dimension
                )));
            }
        }

        tracing::debug!("Embedding configuration valid for backend {}", self.backend);
        Ok(())
    }
}
