//! Retrieval pipeline: query text in, ranked chunks out.
//!
//! The query is embedded as a single-item batch, the index returns the
//! nearest ids, and the document store turns ids back into text. Ids the
//! index returns but the store does not know are logged as a consistency
//! problem and left out; the count is reported in [`SearchResponse`].

use crate::error::{Classify, ErrorKind};
use crate::index::{IndexError, IndexSpec, VectorIndex};
use crate::storage::{DocumentStore, StoreError, check_embedding_model};
use quarry_embed::{EmbedError, Embedder};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Query is empty")]
    EmptyQuery,

    #[error("k must be at least 1, got {k}")]
    InvalidK { k: usize },

    #[error("Invalid search configuration: {message}")]
    Configuration { message: String },

    #[error("Failed to embed query: {0}")]
    Embedding(#[from] EmbedError),

    #[error("Index search failed: {0}")]
    Index(#[from] IndexError),

    #[error("Document lookup failed: {0}")]
    Store(#[from] StoreError),
}

impl Classify for SearchError {
    fn kind(&self) -> ErrorKind {
        match self {
            SearchError::EmptyQuery
            | SearchError::InvalidK { .. }
            | SearchError::Configuration { .. } => ErrorKind::Configuration,
            SearchError::Embedding(e) => e.kind(),
            SearchError::Index(e) => e.kind(),
            SearchError::Store(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;

/// One ranked chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    /// 1-based position in the result list
    pub rank: usize,
    pub external_id: String,
    /// Higher is more similar
    pub score: f32,
    pub source_id: String,
    pub text: String,
    pub char_start: usize,
    pub char_end: usize,
}

/// Results plus what had to be left out.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    /// Ids returned by the index with no document store entry
    pub omitted_inconsistent: usize,
}

/// Answers queries against an ingested index.
pub struct RetrievalPipeline {
    embedder: Arc<Embedder>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn DocumentStore>,
    spec: IndexSpec,
    min_similarity: Option<f32>,
}

impl RetrievalPipeline {
    pub fn new(
        embedder: Arc<Embedder>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn DocumentStore>,
        spec: IndexSpec,
    ) -> Result<Self> {
        spec.validate()?;
        if embedder.dimension() != spec.dimension {
            return Err(SearchError::Configuration {
                message: format!(
                    "embedder {} produces {}-dimensional vectors but index '{}' has dimension {}",
                    embedder.model_id(),
                    embedder.dimension(),
                    spec.name,
                    spec.dimension
                ),
            });
        }
        Ok(Self {
            embedder,
            index,
            store,
            spec,
            min_similarity: None,
        })
    }

    /// Drop hits scoring below `threshold`
    pub fn with_min_similarity(mut self, threshold: f32) -> Self {
        self.min_similarity = Some(threshold);
        self
    }

    /// The `k` best chunks for `query`, best first.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        Ok(self.search_with_report(query, k).await?.results)
    }

    pub async fn search_with_report(&self, query: &str, k: usize) -> Result<SearchResponse> {
        if query.trim().is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        if k == 0 {
            return Err(SearchError::InvalidK { k });
        }
        check_embedding_model(self.store.as_ref(), &self.embedder.model_id()).await?;

        let vector = self.embedder.embed_one(query).await?;
        let mut hits = self.index.search(&self.spec, &vector, k).await?;
        if let Some(threshold) = self.min_similarity {
            hits.retain(|hit| hit.score >= threshold);
        }
        if hits.is_empty() {
            debug!("No hits for query in '{}'", self.spec.name);
            return Ok(SearchResponse::default());
        }

        let ids: Vec<String> = hits.iter().map(|hit| hit.external_id.clone()).collect();
        let mut lookup = self.store.get_many(&ids).await?;
        for missing in &lookup.missing {
            warn!(
                "Index '{}' returned id {} which has no document store entry; skipping it",
                self.spec.name, missing
            );
        }
        let omitted_inconsistent = lookup.missing.len();

        let mut results: Vec<SearchResult> = hits
            .into_iter()
            .filter_map(|hit| {
                let entry = lookup.found.remove(&hit.external_id)?;
                Some(SearchResult {
                    rank: 0,
                    external_id: hit.external_id,
                    score: hit.score,
                    source_id: entry.source_id,
                    text: entry.text,
                    char_start: entry.char_start,
                    char_end: entry.char_end,
                })
            })
            .collect();

        results.sort_by(compare_results);
        results.truncate(k);
        for (position, result) in results.iter_mut().enumerate() {
            result.rank = position + 1;
        }

        debug!(
            "Query returned {} results ({} omitted)",
            results.len(),
            omitted_inconsistent
        );
        Ok(SearchResponse {
            results,
            omitted_inconsistent,
        })
    }
}

/// Order of two results: score descending, then id ascending
pub fn compare_results(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.external_id.cmp(&b.external_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexRecord, Metadata, MemoryIndex, Metric};
    use crate::storage::{DocumentEntry, SqliteDocumentStore};
    use quarry_embed::{EmbedConfig, HashingBackend};

    struct Fixture {
        pipeline: RetrievalPipeline,
        embedder: Arc<Embedder>,
        index: MemoryIndex,
        store: Arc<SqliteDocumentStore>,
        spec: IndexSpec,
    }

    async fn fixture() -> anyhow::Result<Fixture> {
        let embedder = Arc::new(Embedder::new(
            Arc::new(HashingBackend::new(256, true)?),
            &EmbedConfig::hashing(256),
        )?);
        let index = MemoryIndex::new();
        let store = Arc::new(SqliteDocumentStore::open_memory().await?);
        let spec = IndexSpec::new("docs", 256, Metric::Cosine);
        index.create_index(&spec).await?;
        let pipeline = RetrievalPipeline::new(
            embedder.clone(),
            Arc::new(index.clone()),
            store.clone(),
            spec.clone(),
        )?;
        Ok(Fixture {
            pipeline,
            embedder,
            index,
            store,
            spec,
        })
    }

    impl Fixture {
        async fn add(&self, id: &str, text: &str, store_it: bool) -> anyhow::Result<()> {
            let vector = self.embedder.embed_one(text).await?;
            self.index
                .upsert(
                    &self.spec,
                    vec![IndexRecord {
                        external_id: id.to_string(),
                        vector,
                        metadata: Metadata::new(),
                    }],
                )
                .await?;
            if store_it {
                self.store
                    .put(DocumentEntry {
                        external_id: id.to_string(),
                        text: text.to_string(),
                        source_id: format!("{id}.txt"),
                        sequence_index: 0,
                        char_start: 0,
                        char_end: text.chars().count(),
                    })
                    .await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_arguments() -> anyhow::Result<()> {
        let f = fixture().await?;
        assert!(matches!(
            f.pipeline.search("   ", 3).await,
            Err(SearchError::EmptyQuery)
        ));
        assert!(matches!(
            f.pipeline.search("rust", 0).await,
            Err(SearchError::InvalidK { k: 0 })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_ranks_and_resolves_text() -> anyhow::Result<()> {
        let f = fixture().await?;
        f.add("a", "tokio runtime async tasks", true).await?;
        f.add("b", "sqlite database storage", true).await?;
        f.add("c", "async await futures tokio", true).await?;

        let results = f.pipeline.search("tokio async", 2).await?;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].rank, 1);
        assert_eq!(results[1].rank, 2);
        assert!(results[0].score >= results[1].score);
        assert!(results.iter().all(|r| r.external_id != "b"));
        assert!(results.iter().all(|r| r.source_id.ends_with(".txt")));
        Ok(())
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_missing_store_entries_are_omitted() -> anyhow::Result<()> {
        let f = fixture().await?;
        f.add("kept", "vector search engine", true).await?;
        f.add("orphan", "vector search index", false).await?;

        let response = f.pipeline.search_with_report("vector search", 5).await?;
        assert_eq!(response.omitted_inconsistent, 1);
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].external_id, "kept");
        assert!(logs_contain("has no document store entry"));
        Ok(())
    }

    #[tokio::test]
    async fn test_min_similarity_filters() -> anyhow::Result<()> {
        let f = fixture().await?;
        f.add("a", "completely unrelated words here", true).await?;

        let strict = RetrievalPipeline::new(
            f.embedder.clone(),
            Arc::new(f.index.clone()),
            f.store.clone(),
            f.spec.clone(),
        )?
        .with_min_similarity(1.01);
        let response = strict.search_with_report("query", 5).await?;
        assert!(response.results.is_empty());
        assert_eq!(response.omitted_inconsistent, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_model_mismatch_fails_query() -> anyhow::Result<()> {
        let f = fixture().await?;
        f.store.set_embedding_model("fastembed:other:256").await?;
        let err = f.pipeline.search("anything", 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        Ok(())
    }

    #[test]
    fn test_compare_results_orders_ties_by_id() {
        let result = |id: &str, score: f32| SearchResult {
            rank: 0,
            external_id: id.to_string(),
            score,
            source_id: String::new(),
            text: String::new(),
            char_start: 0,
            char_end: 1,
        };
        let mut results = vec![result("b", 0.5), result("a", 0.5), result("c", 0.9)];
        results.sort_by(compare_results);
        let ids: Vec<_> = results.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, ["c", "a", "b"]);
    }
}
