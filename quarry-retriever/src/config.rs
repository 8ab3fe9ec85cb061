//! Settings for the `quarry` binary, read from `quarry.toml`.
//!
//! Every field has a default, so the file is optional:
//!
//! ```toml
//! [index]
//! url = "http://localhost:8080"
//! name = "docs_index"
//! dimension = 384
//! metric = "cosine"
//! timeout_secs = 30
//!
//! [embedding]
//! backend = "fastembed"
//! model = "all-MiniLM-L6-v2"
//! dimension = 384
//!
//! [chunking]
//! max_chars = 800
//! overlap_chars = 100
//!
//! [ingestion]
//! data_dir = "data"
//! extensions = ["txt", "md"]
//!
//! [storage]
//! database = ".quarry.db"
//!
//! [search]
//! default_k = 5
//! ```

use crate::error::{Classify, ErrorKind};
use crate::index::{IndexError, IndexSpec, Metric};
use crate::retrieval::ingestion::IngestionConfig;
use crate::retrieval::sources::FileSource;
use quarry_context::{ChunkError, ChunkingConfig};
use quarry_embed::{EmbedConfig, EmbedError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "quarry.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error(transparent)]
    Embedding(#[from] EmbedError),

    #[error(transparent)]
    Chunking(#[from] ChunkError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

impl Classify for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub url: String,
    pub name: String,
    pub dimension: usize,
    pub metric: Metric,
    /// Per-request timeout for the index service
    pub timeout_secs: u64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            name: "docs_index".to_string(),
            dimension: 384,
            metric: Metric::Cosine,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionSettings {
    pub data_dir: PathBuf,
    pub extensions: Vec<String>,
    pub upsert_batch_size: usize,
    pub queue_depth: usize,
    pub parallelism: usize,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        let defaults = IngestionConfig::default();
        Self {
            data_dir: PathBuf::from("data"),
            extensions: vec!["txt".to_string(), "md".to_string()],
            upsert_batch_size: defaults.upsert_batch_size,
            queue_depth: defaults.queue_depth,
            parallelism: defaults.parallelism,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite database holding chunk text
    pub database: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database: PathBuf::from(".quarry.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub default_k: usize,
    /// Hits scoring below this are dropped
    pub min_similarity: Option<f32>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_k: 5,
            min_similarity: None,
        }
    }
}

/// Complete configuration of the `quarry` binary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarryConfig {
    pub index: IndexSettings,
    pub embedding: EmbedConfig,
    pub chunking: ChunkingConfig,
    pub ingestion: IngestionSettings,
    pub storage: StorageSettings,
    pub search: SearchSettings,
}

impl QuarryConfig {
    /// Load from `path`, or from `quarry.toml` if it exists, or use defaults.
    ///
    /// An explicit path that cannot be read is an error. The result is not
    /// validated yet so command line overrides can be applied first.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    tracing::debug!(
                        "No {} found, using default configuration",
                        DEFAULT_CONFIG_FILE
                    );
                    return Ok(Self::default());
                }
                default
            }
        };

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Check every setting, including that the embedder and the index
    /// agree on the vector dimension.
    pub fn validate(&self) -> Result<()> {
        if !(self.index.url.starts_with("http://") || self.index.url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                message: format!("index.url must be an http(s) URL, got '{}'", self.index.url),
            });
        }
        if self.index.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "index.timeout_secs must be greater than zero".to_string(),
            });
        }
        self.index_spec().validate()?;
        self.embedding.validate()?;
        if self.embedding.dimension != self.index.dimension {
            return Err(ConfigError::Invalid {
                message: format!(
                    "embedding.dimension ({}) does not match index.dimension ({})",
                    self.embedding.dimension, self.index.dimension
                ),
            });
        }
        if self.ingestion.extensions.is_empty() {
            return Err(ConfigError::Invalid {
                message: "ingestion.extensions must not be empty".to_string(),
            });
        }
        if self.search.default_k == 0 {
            return Err(ConfigError::Invalid {
                message: "search.default_k must be at least 1".to_string(),
            });
        }
        if let Some(threshold) = self.search.min_similarity {
            if !threshold.is_finite() {
                return Err(ConfigError::Invalid {
                    message: "search.min_similarity must be a finite number".to_string(),
                });
            }
        }
        self.ingestion_config()
            .validate()
            .map_err(|e| ConfigError::Invalid {
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub fn index_spec(&self) -> IndexSpec {
        IndexSpec::new(&self.index.name, self.index.dimension, self.index.metric)
    }

    pub fn index_timeout(&self) -> Duration {
        Duration::from_secs(self.index.timeout_secs)
    }

    pub fn ingestion_config(&self) -> IngestionConfig {
        IngestionConfig {
            chunking: self.chunking,
            upsert_batch_size: self.ingestion.upsert_batch_size,
            queue_depth: self.ingestion.queue_depth,
            parallelism: self.ingestion.parallelism,
        }
    }

    pub fn file_source(&self) -> FileSource {
        FileSource::new(&self.ingestion.data_dir, &self.ingestion.extensions)
    }
}
