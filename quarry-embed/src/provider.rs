//! Embedding backends

use crate::config::{BackendKind, EmbedConfig, find_model};
use crate::error::{EmbedError, Result};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use fnv::FnvHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// A source of embeddings: text in, fixed-length vectors out.
///
/// Implementations must be deterministic. The same text always maps to the
/// same vector, no matter which other texts share the batch.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed every text of one batch, in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Length of every vector this backend produces
    fn dimension(&self) -> usize;

    /// Identifier of the transformation, e.g. `fastembed:all-MiniLM-L6-v2`
    fn name(&self) -> &str;
}

/// Build the backend selected by `config`.
pub async fn create_backend(config: &EmbedConfig) -> Result<Arc<dyn EmbeddingBackend>> {
    config.validate()?;
    match config.backend {
        BackendKind::FastEmbed => Ok(Arc::new(FastEmbedBackend::create(config).await?)),
        BackendKind::Hashing => Ok(Arc::new(HashingBackend::new(
            config.dimension,
            config.normalize,
        )?)),
    }
}

fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

fn poisoned<T>(_: PoisonError<T>) -> EmbedError {
    EmbedError::External {
        source: anyhow::anyhow!("embedding model lock poisoned"),
    }
}

/// Type alias for cached model entries (model, dimension)
type ModelCacheEntry = (Arc<Mutex<TextEmbedding>>, usize);

/// Global cache for initialized embedding models to avoid reloading
static MODEL_CACHE: OnceLock<Mutex<HashMap<String, ModelCacheEntry>>> = OnceLock::new();

/// Get the global model cache
fn get_model_cache() -> &'static Mutex<HashMap<String, ModelCacheEntry>> {
    MODEL_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Map a supported model name to fastembed's model enum.
fn fastembed_model(name: &str) -> Option<EmbeddingModel> {
    let spec = find_model(name)?;
    match spec.name {
        "all-MiniLM-L6-v2" => Some(EmbeddingModel::AllMiniLML6V2),
        "all-MiniLM-L12-v2" => Some(EmbeddingModel::AllMiniLML12V2),
        "bge-small-en-v1.5" => Some(EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Some(EmbeddingModel::BGEBaseENV15),
        _ => None,
    }
}

/// FastEmbed-based backend running a local ONNX model.
///
/// Loaded models are kept in a process-wide cache, so creating a second
/// backend for the same model is cheap and shares the weights.
#[derive(Clone)]
pub struct FastEmbedBackend {
    name: String,
    model: Arc<Mutex<TextEmbedding>>,
    dimension: usize,
    normalize: bool,
}

impl std::fmt::Debug for FastEmbedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedBackend")
            .field("name", &self.name)
            .field("dimension", &self.dimension)
            .field("normalize", &self.normalize)
            .finish()
    }
}

impl FastEmbedBackend {
    /// Load (or reuse) the configured model. Downloads it on first use.
    pub async fn create(config: &EmbedConfig) -> Result<Self> {
        config.validate()?;
        let model_enum = fastembed_model(&config.model_name).ok_or_else(|| {
            EmbedError::invalid_config(format!(
                "model {} has no fastembed mapping",
                config.model_name
            ))
        })?;

        let cache_key = Self::create_cache_key(config);
        let cached = {
            let cache = get_model_cache().lock().map_err(poisoned)?;
            cache
                .get(&cache_key)
                .map(|(model, dim)| (Arc::clone(model), *dim))
        };

        let (model, dimension) = match cached {
            Some(entry) => {
                tracing::info!("Using cached model for: {}", config.model_name);
                entry
            }
            None => {
                let init_config = config.clone();
                let (model, dimension) =
                    tokio::task::spawn_blocking(move || -> Result<(TextEmbedding, usize)> {
                        tracing::info!("Loading embedding model: {}", init_config.model_name);

                        let mut init_options = InitOptions::new(model_enum)
                            .with_show_download_progress(init_config.show_download_progress);
                        if let Some(dir) = &init_config.cache_dir {
                            init_options = init_options.with_cache_dir(dir.clone());
                        }

                        let mut model = TextEmbedding::try_new(init_options).map_err(|e| {
                            EmbedError::ModelInitialization { source: e.into() }
                        })?;

                        // Probe the real output dimension
                        let probe = model
                            .embed(vec!["dimension probe".to_string()], None)
                            .map_err(|e| EmbedError::ModelInitialization { source: e.into() })?;
                        let dimension = probe.first().map(Vec::len).unwrap_or(0);

                        tracing::info!("Model loaded successfully. Dimension: {}", dimension);
                        Ok((model, dimension))
                    })
                    .await??;

                let model = Arc::new(Mutex::new(model));
                get_model_cache()
                    .lock()
                    .map_err(poisoned)?
                    .insert(cache_key, (Arc::clone(&model), dimension));
                (model, dimension)
            }
        };

        if dimension != config.dimension {
            return Err(EmbedError::invalid_config(format!(
                "model {} produced {}-dimensional vectors, expected {}",
                config.model_name, dimension, config.dimension
            )));
        }

        let name = Self::backend_name(config).ok_or_else(|| EmbedError::UnknownModel {
            name: config.model_name.clone(),
            supported: crate::config::supported_model_names(),
        })?;

        Ok(Self {
            name,
            model,
            dimension,
            normalize: config.normalize,
        })
    }

    /// Name used in the model id. Model names match case-insensitively, so
    /// the canonical spelling is used.
    fn backend_name(config: &EmbedConfig) -> Option<String> {
        let spec = find_model(&config.model_name)?;
        let mut name = format!("fastembed:{}", spec.name);
        if !config.normalize {
            name.push_str(":raw");
        }
        Some(name)
    }

    /// Models are shared by name and download location only.
    fn create_cache_key(config: &EmbedConfig) -> String {
        let mut hasher = FnvHasher::default();
        hasher.write(b"v1:");
        hasher.write(config.model_name.to_lowercase().as_bytes());
        if let Some(dir) = &config.cache_dir {
            hasher.write(dir.to_string_lossy().as_bytes());
        }
        format!("v1:{:x}", hasher.finish())
    }

    /// Clears the global model cache.
    pub fn clear_cache() -> Result<()> {
        get_model_cache().lock().map_err(poisoned)?.clear();
        tracing::info!("Model cache cleared");
        Ok(())
    }

    /// Returns the number of cached models.
    pub fn cache_size() -> usize {
        get_model_cache()
            .lock()
            .map(|cache| cache.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EmbeddingBackend for FastEmbedBackend {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batch = texts.to_vec();
        let model = Arc::clone(&self.model);
        let normalize = self.normalize;

        tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            tracing::debug!("Processing batch of {} texts", batch.len());

            let mut model_guard = model.lock().map_err(poisoned)?;
            let mut embeddings = model_guard
                .embed(batch, None)
                .map_err(|e| EmbedError::EmbeddingGeneration { source: e.into() })?;

            if normalize {
                embeddings.iter_mut().for_each(|v| l2_normalize(v));
            }
            Ok(embeddings)
        })
        .await?
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Deterministic bag-of-words embeddings by feature hashing.
///
/// Each lowercase alphanumeric token is hashed with FNV-1a into one of
/// `dimension` buckets. Text without any such token falls back to hashing
/// its individual characters, so only the empty string has no features.
/// There is no notion of meaning here: texts are similar only when they
/// share words.
#[derive(Debug, Clone)]
pub struct HashingBackend {
    name: String,
    dimension: usize,
    normalize: bool,
}

impl HashingBackend {
    pub fn new(dimension: usize, normalize: bool) -> Result<Self> {
        if dimension == 0 {
            return Err(EmbedError::invalid_config(
                "hashing backend needs a positive dimension",
            ));
        }
        let name = if normalize {
            "hashing:fnv1a-bow".to_string()
        } else {
            "hashing:fnv1a-bow:raw".to_string()
        };
        Ok(Self {
            name,
            dimension,
            normalize,
        })
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8]) {
        let mut hasher = FnvHasher::default();
        hasher.write(feature);
        let bucket = (hasher.finish() % self.dimension as u64) as usize;
        vector[bucket] += 1.0;
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimension];
        let lower = text.to_lowercase();

        let mut has_tokens = false;
        for token in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            self.add_feature(&mut vector, token.as_bytes());
            has_tokens = true;
        }

        if !has_tokens {
            let mut buf = [0u8; 4];
            for c in text.chars() {
                self.add_feature(&mut vector, c.encode_utf8(&mut buf).as_bytes());
            }
        }

        if self.normalize {
            l2_normalize(&mut vector);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingBackend for HashingBackend {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.name
    }
}
