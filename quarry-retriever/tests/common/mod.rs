//! Test doubles shared by the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use quarry_embed::{EmbedConfig, EmbedError, Embedder, EmbeddingBackend, HashingBackend};
use quarry_retriever::index::{
    CreateOutcome, FailedRecord, IndexError, IndexRecord, IndexSpec, MemoryIndex, ScoredId,
    UpsertOutcome, VectorIndex,
};
use quarry_retriever::storage::{DocumentEntry, DocumentLookup, DocumentStore, StoreError};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const HASHING_DIMENSION: usize = 256;

pub fn hashing_embedder() -> anyhow::Result<Arc<Embedder>> {
    let backend = Arc::new(HashingBackend::new(HASHING_DIMENSION, true)?);
    Ok(Arc::new(Embedder::new(
        backend,
        &EmbedConfig::hashing(HASHING_DIMENSION),
    )?))
}

/// Embeds text onto a few hand-picked concept axes, so that synonyms land
/// close together without a real model.
pub struct ConceptBackend;

const CONCEPTS: &[&[&str]] = &[
    &["dog", "dogs", "canine", "puppy", "puppies", "hound", "fetch", "bark"],
    &["cat", "cats", "feline", "kitten", "kittens", "purr"],
    &["stock", "stocks", "market", "investors", "shares", "finance"],
];

#[async_trait]
impl EmbeddingBackend for ConceptBackend {
    async fn embed_batch(&self, texts: &[String]) -> quarry_embed::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; CONCEPTS.len() + 1];
                vector[CONCEPTS.len()] = 0.1;
                for word in text
                    .split(|c: char| !c.is_alphanumeric())
                    .map(str::to_lowercase)
                {
                    for (axis, words) in CONCEPTS.iter().enumerate() {
                        if words.contains(&word.as_str()) {
                            vector[axis] += 1.0;
                        }
                    }
                }
                let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
                vector.iter().map(|v| v / norm).collect()
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        CONCEPTS.len() + 1
    }

    fn name(&self) -> &str {
        "concept-test"
    }
}

pub fn concept_embedder() -> anyhow::Result<Arc<Embedder>> {
    let config = EmbedConfig::hashing(CONCEPTS.len() + 1);
    Ok(Arc::new(Embedder::new(Arc::new(ConceptBackend), &config)?))
}

/// Fails every batch containing a text with `poison` in it.
pub struct PoisonedBackend {
    inner: HashingBackend,
}

impl PoisonedBackend {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            inner: HashingBackend::new(HASHING_DIMENSION, true)?,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for PoisonedBackend {
    async fn embed_batch(&self, texts: &[String]) -> quarry_embed::Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.contains("poison")) {
            return Err(EmbedError::embedding_gen(std::io::Error::other(
                "backend refused the batch",
            )));
        }
        self.inner.embed_batch(texts).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// A [`MemoryIndex`] that refuses chosen ids, or every batch.
#[derive(Clone, Default)]
pub struct FlakyIndex {
    pub inner: MemoryIndex,
    pub reject: HashSet<String>,
    pub fail_every_batch: bool,
    pub upsert_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl VectorIndex for FlakyIndex {
    async fn create_index(&self, spec: &IndexSpec) -> Result<CreateOutcome, IndexError> {
        self.inner.create_index(spec).await
    }

    async fn upsert(
        &self,
        spec: &IndexSpec,
        records: Vec<IndexRecord>,
    ) -> Result<UpsertOutcome, IndexError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_every_batch {
            return Err(IndexError::Backend {
                status: 503,
                body: "service unavailable".to_string(),
            });
        }

        let (refused, accepted): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| self.reject.contains(&r.external_id));
        let mut outcome = self.inner.upsert(spec, accepted).await?;
        outcome
            .failed
            .extend(refused.into_iter().map(|r| FailedRecord {
                external_id: r.external_id,
                reason: "refused by test index".to_string(),
            }));
        Ok(outcome)
    }

    async fn search(
        &self,
        spec: &IndexSpec,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredId>, IndexError> {
        self.inner.search(spec, vector, k).await
    }
}

/// Delegates to another store but cannot delete anything.
pub struct UndeletableStore<S> {
    pub inner: S,
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for UndeletableStore<S> {
    async fn put_many(&self, entries: Vec<DocumentEntry>) -> Result<(), StoreError> {
        self.inner.put_many(entries).await
    }

    async fn get(&self, external_id: &str) -> Result<Option<DocumentEntry>, StoreError> {
        self.inner.get(external_id).await
    }

    async fn get_many(&self, external_ids: &[String]) -> Result<DocumentLookup, StoreError> {
        self.inner.get_many(external_ids).await
    }

    async fn delete_many(&self, _external_ids: &[String]) -> Result<usize, StoreError> {
        Err(StoreError::Io {
            source: std::io::Error::other("disk is read-only"),
        })
    }

    async fn delete_source_from(
        &self,
        source_id: &str,
        first_stale_sequence: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.inner
            .delete_source_from(source_id, first_stale_sequence)
            .await
    }

    async fn source_ids(&self, source_id: &str) -> Result<Vec<String>, StoreError> {
        self.inner.source_ids(source_id).await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.inner.count().await
    }

    async fn embedding_model(&self) -> Result<Option<String>, StoreError> {
        self.inner.embedding_model().await
    }

    async fn set_embedding_model(&self, model_id: &str) -> Result<(), StoreError> {
        self.inner.set_embedding_model(model_id).await
    }
}
