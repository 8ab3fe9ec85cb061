//! In-process vector index with exhaustive search.

use super::{
    CreateOutcome, IndexError, IndexRecord, IndexSpec, Metadata, Result, ScoredId, UpsertOutcome,
    VectorIndex, check_search_args, partition_by_dimension, sort_scored,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug)]
struct Collection {
    dimension: usize,
    metric: super::Metric,
    records: BTreeMap<String, (Vec<f32>, Metadata)>,
}

impl Collection {
    /// The caller's spec must describe this collection, not just name it.
    fn check_shape(&self, spec: &IndexSpec) -> Result<()> {
        if self.dimension != spec.dimension || self.metric != spec.metric {
            return Err(IndexError::configuration(format!(
                "index '{}' exists with dimension {} and metric {}, wanted dimension {} and metric {}",
                spec.name, self.dimension, self.metric, spec.dimension, spec.metric
            )));
        }
        Ok(())
    }
}

/// A [`VectorIndex`] held in memory.
///
/// Clones share the same indexes. Search compares the query against every
/// stored vector, which is exact and fine for tests and small corpora.
#[derive(Debug, Clone, Default)]
pub struct MemoryIndex {
    collections: Arc<RwLock<HashMap<String, Collection>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of vectors in an index, `None` if it does not exist
    pub async fn len(&self, name: &str) -> Option<usize> {
        self.collections
            .read()
            .await
            .get(name)
            .map(|c| c.records.len())
    }

    /// Stored vector for an id
    pub async fn vector(&self, name: &str, external_id: &str) -> Option<Vec<f32>> {
        self.collections
            .read()
            .await
            .get(name)?
            .records
            .get(external_id)
            .map(|(vector, _)| vector.clone())
    }

    /// Stored metadata for an id
    pub async fn metadata(&self, name: &str, external_id: &str) -> Option<Metadata> {
        self.collections
            .read()
            .await
            .get(name)?
            .records
            .get(external_id)
            .map(|(_, metadata)| metadata.clone())
    }

    /// All ids in an index, sorted
    pub async fn ids(&self, name: &str) -> Vec<String> {
        self.collections
            .read()
            .await
            .get(name)
            .map(|c| c.records.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn create_index(&self, spec: &IndexSpec) -> Result<CreateOutcome> {
        spec.validate()?;
        let mut collections = self.collections.write().await;

        if let Some(existing) = collections.get(&spec.name) {
            existing.check_shape(spec)?;
            return Ok(CreateOutcome::AlreadyExists);
        }

        collections.insert(
            spec.name.clone(),
            Collection {
                dimension: spec.dimension,
                metric: spec.metric,
                records: BTreeMap::new(),
            },
        );
        tracing::debug!("Created in-memory index '{}'", spec.name);
        Ok(CreateOutcome::Created)
    }

    async fn upsert(&self, spec: &IndexSpec, records: Vec<IndexRecord>) -> Result<UpsertOutcome> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(&spec.name)
            .ok_or_else(|| IndexError::NotFound {
                name: spec.name.clone(),
            })?;
        collection.check_shape(spec)?;

        let (accepted, failed) = partition_by_dimension(spec, records);
        let mut upserted = Vec::with_capacity(accepted.len());
        for record in accepted {
            upserted.push(record.external_id.clone());
            collection
                .records
                .insert(record.external_id, (record.vector, record.metadata));
        }

        Ok(UpsertOutcome { upserted, failed })
    }

    async fn search(&self, spec: &IndexSpec, vector: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        check_search_args(spec, vector, k)?;
        let collections = self.collections.read().await;
        let collection = collections
            .get(&spec.name)
            .ok_or_else(|| IndexError::NotFound {
                name: spec.name.clone(),
            })?;
        collection.check_shape(spec)?;

        let mut hits: Vec<ScoredId> = collection
            .records
            .iter()
            .map(|(id, (stored, _))| ScoredId {
                external_id: id.clone(),
                score: collection.metric.similarity(vector, stored),
            })
            .collect();
        sort_scored(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }
}
