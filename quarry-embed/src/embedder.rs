//! Batching, validation and caching in front of an [`EmbeddingBackend`].

use crate::cache::EmbeddingCache;
use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::provider::{EmbeddingBackend, create_backend};
use std::sync::Arc;
use std::time::Duration;

/// The embedding entry point used by the pipelines.
///
/// `embed` returns one vector per input text, in input order. Batch size,
/// cache hits and the order in which batches complete never change the
/// returned values.
pub struct Embedder {
    backend: Arc<dyn EmbeddingBackend>,
    batch_size: usize,
    timeout: Duration,
    cache: Option<EmbeddingCache>,
}

impl std::fmt::Debug for Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("backend", &self.backend.name())
            .field("dimension", &self.backend.dimension())
            .field("batch_size", &self.batch_size)
            .field("timeout", &self.timeout)
            .field("cache_capacity", &self.cache.as_ref().map(|c| c.capacity()))
            .finish()
    }
}

impl Embedder {
    /// Wrap an existing backend using the batching, timeout and cache
    /// settings of `config`.
    pub fn new(backend: Arc<dyn EmbeddingBackend>, config: &EmbedConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be greater than zero"));
        }
        if config.timeout_secs == 0 {
            return Err(EmbedError::invalid_config("timeout_secs must be greater than zero"));
        }
        if backend.dimension() == 0 {
            return Err(EmbedError::invalid_config(format!(
                "backend {} reports a zero dimension",
                backend.name()
            )));
        }

        Ok(Self {
            backend,
            batch_size: config.batch_size,
            timeout: config.timeout(),
            cache: EmbeddingCache::new(config.cache_capacity),
        })
    }

    /// Build the configured backend and wrap it.
    pub async fn from_config(config: &EmbedConfig) -> Result<Self> {
        let backend = create_backend(config).await?;
        Self::new(backend, config)
    }

    pub fn dimension(&self) -> usize {
        self.backend.dimension()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Identifies the text-to-vector transformation. Vectors are only
    /// comparable when they were produced under the same id.
    pub fn model_id(&self) -> String {
        format!("{}:{}", self.backend.name(), self.backend.dimension())
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Embed `texts` in batches of the configured size.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_with_batch_size(texts, self.batch_size).await
    }

    /// Embed a single text, e.g. a search query.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::malformed("no embedding returned for a single text"))
    }

    /// Embed `texts`, sending at most `batch_size` of them per backend call.
    ///
    /// Texts found in the cache are not sent at all. The first failing
    /// backend call aborts the whole call; nothing is retried.
    pub async fn embed_with_batch_size(
        &self,
        texts: &[String],
        batch_size: usize,
    ) -> Result<Vec<Vec<f32>>> {
        if batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be greater than zero"));
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut slots: Vec<Option<Vec<f32>>> = match &self.cache {
            Some(cache) => texts.iter().map(|text| cache.get(text)).collect(),
            None => vec![None; texts.len()],
        };
        let pending: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.is_none().then_some(i))
            .collect();

        if pending.len() < texts.len() {
            tracing::debug!(
                "Embedding cache answered {} of {} texts",
                texts.len() - pending.len(),
                texts.len()
            );
        }

        for batch_indices in pending.chunks(batch_size) {
            let batch: Vec<String> = batch_indices.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.call_backend(&batch).await?;

            for (&i, vector) in batch_indices.iter().zip(vectors) {
                if let Some(cache) = &self.cache {
                    cache.insert(&texts[i], &vector);
                }
                slots[i] = Some(vector);
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| EmbedError::malformed("missing embedding for input")))
            .collect()
    }

    async fn call_backend(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        tracing::debug!(
            "Sending batch of {} texts to {}",
            batch.len(),
            self.backend.name()
        );
        let vectors = tokio::time::timeout(self.timeout, self.backend.embed_batch(batch))
            .await
            .map_err(|_| EmbedError::Timeout {
                timeout: self.timeout,
            })??;

        validate_embeddings(&vectors, batch.len(), self.backend.dimension())?;
        Ok(vectors)
    }
}

/// Check that a backend answer is usable: one vector per input, every
/// vector of length `dimension`, finite and not all zero.
pub fn validate_embeddings(
    vectors: &[Vec<f32>],
    expected_count: usize,
    dimension: usize,
) -> Result<()> {
    if vectors.len() != expected_count {
        return Err(EmbedError::malformed(format!(
            "expected {expected_count} embeddings, got {}",
            vectors.len()
        )));
    }
    for (i, vector) in vectors.iter().enumerate() {
        if vector.len() != dimension {
            return Err(EmbedError::malformed(format!(
                "embedding {i} has dimension {}, expected {dimension}",
                vector.len()
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(EmbedError::malformed(format!(
                "embedding {i} contains non-finite values"
            )));
        }
        if vector.iter().all(|v| *v == 0.0) {
            return Err(EmbedError::malformed(format!("embedding {i} is all zeros")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::HashingBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every batch it receives and answers with a fixed pattern.
    struct RecordingBackend {
        calls: AtomicUsize,
        batch_sizes: std::sync::Mutex<Vec<usize>>,
        output: fn(&str) -> Vec<f32>,
        delay: Option<Duration>,
    }

    impl RecordingBackend {
        fn new(output: fn(&str) -> Vec<f32>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                batch_sizes: std::sync::Mutex::new(Vec::new()),
                output,
                delay: None,
            }
        }
    }

    #[async_trait]
    impl EmbeddingBackend for RecordingBackend {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batch_sizes.lock().unwrap().push(texts.len());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(texts.iter().map(|t| (self.output)(t)).collect())
        }

        fn dimension(&self) -> usize {
            2
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn length_vector(text: &str) -> Vec<f32> {
        vec![text.len() as f32, 1.0]
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| "x".repeat(i + 1)).collect()
    }

    fn config() -> EmbedConfig {
        EmbedConfig::hashing(2).with_cache_capacity(0)
    }

    #[tokio::test]
    async fn test_order_is_preserved_across_batches() -> Result<()> {
        let backend = Arc::new(RecordingBackend::new(length_vector));
        let embedder = Embedder::new(backend.clone(), &config().with_batch_size(3))?;

        let vectors = embedder.embed(&texts(7)).await?;

        assert_eq!(vectors.len(), 7);
        for (i, v) in vectors.iter().enumerate() {
            assert_eq!(v[0], (i + 1) as f32);
        }
        assert_eq!(*backend.batch_sizes.lock().unwrap(), vec![3, 3, 1]);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_input_skips_backend() -> Result<()> {
        let backend = Arc::new(RecordingBackend::new(length_vector));
        let embedder = Embedder::new(backend.clone(), &config())?;

        assert!(embedder.embed(&[]).await?.is_empty());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_config_error() {
        let backend = Arc::new(RecordingBackend::new(length_vector));
        let embedder = Embedder::new(backend, &config()).unwrap();

        let err = embedder
            .embed_with_batch_size(&texts(2), 0)
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        let backend = Arc::new(HashingBackend::new(2, true).unwrap());
        assert!(Embedder::new(backend, &config().with_batch_size(0)).is_err());
    }

    #[tokio::test]
    async fn test_batch_size_does_not_change_results() -> Result<()> {
        let backend = Arc::new(HashingBackend::new(32, true)?);
        let embedder = Embedder::new(backend, &EmbedConfig::hashing(32).with_cache_capacity(0))?;
        let inputs: Vec<String> = ["alpha beta", "gamma", "delta epsilon zeta", "eta", "theta iota"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let reference = embedder.embed_with_batch_size(&inputs, 1).await?;
        for batch_size in [2, 3, 5, 100] {
            assert_eq!(embedder.embed_with_batch_size(&inputs, batch_size).await?, reference);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_cache_skips_repeated_texts() -> Result<()> {
        let backend = Arc::new(RecordingBackend::new(length_vector));
        let embedder = Embedder::new(backend.clone(), &config().with_cache_capacity(16))?;

        let first = embedder.embed(&texts(3)).await?;
        let mixed = vec!["x".to_string(), "new text".to_string(), "xxx".to_string()];
        let second = embedder.embed(&mixed).await?;

        assert_eq!(second[0], first[0]);
        assert_eq!(second[2], first[2]);
        assert_eq!(second[1], length_vector("new text"));
        // Only the uncached text reached the backend the second time.
        assert_eq!(*backend.batch_sizes.lock().unwrap(), vec![3, 1]);
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_output_is_rejected() {
        fn zeros(_: &str) -> Vec<f32> {
            vec![0.0, 0.0]
        }
        fn nan(_: &str) -> Vec<f32> {
            vec![f32::NAN, 1.0]
        }
        fn short(_: &str) -> Vec<f32> {
            vec![1.0]
        }

        for output in [zeros as fn(&str) -> Vec<f32>, nan, short] {
            let embedder =
                Embedder::new(Arc::new(RecordingBackend::new(output)), &config()).unwrap();
            let err = embedder.embed(&texts(1)).await.unwrap_err();
            assert!(matches!(err, EmbedError::MalformedOutput { .. }), "{err}");
        }
    }

    #[test]
    fn test_validate_embeddings_count() {
        let err = validate_embeddings(&[vec![1.0]], 2, 1).unwrap_err();
        assert!(err.to_string().contains("expected 2 embeddings"));
        assert!(validate_embeddings(&[vec![1.0], vec![0.5]], 2, 1).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_timeout() {
        let mut backend = RecordingBackend::new(length_vector);
        backend.delay = Some(Duration::from_secs(120));
        let embedder = Embedder::new(
            Arc::new(backend),
            &config().with_timeout(Duration::from_secs(1)),
        )
        .unwrap();

        let err = embedder.embed(&texts(1)).await.unwrap_err();
        assert!(matches!(err, EmbedError::Timeout { .. }));
        assert!(!err.is_configuration());
    }

    #[tokio::test]
    async fn test_embed_one_and_model_id() -> Result<()> {
        let embedder = Embedder::from_config(&EmbedConfig::hashing(8)).await?;
        let v = embedder.embed_one("hello world").await?;

        assert_eq!(v.len(), 8);
        assert_eq!(embedder.model_id(), "hashing:fnv1a-bow:8");
        Ok(())
    }
}
