//! Client side of the vector index service.
//!
//! The index is reached only through three operations: create an index,
//! upsert vectors, and search for the nearest neighbours of a vector. Two
//! implementations share the [`VectorIndex`] trait:
//!
//! - [`HttpIndexClient`] talks JSON to a remote vector server,
//! - [`MemoryIndex`] keeps everything in process and searches exhaustively.
//!
//! Every call names the index through an [`IndexSpec`], so dimension checks
//! happen locally before anything is sent and clients hold no remote state.

use crate::error::{Classify, ErrorKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub mod http_client;
pub mod memory;

pub use http_client::HttpIndexClient;
pub use memory::MemoryIndex;

/// Errors raised by index clients.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The index exists with a different shape, or the client is misconfigured
    #[error("Index configuration error: {message}")]
    Configuration { message: String },

    #[error("Index '{name}' not found")]
    NotFound { name: String },

    #[error("Vector dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Network failure or timeout
    #[error("Index service unreachable: {source}")]
    Transport {
        #[from]
        source: reqwest::Error,
    },

    /// The service answered with a non-success status
    #[error("Index service returned {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("Malformed response from index service: {message}")]
    MalformedResponse { message: String },
}

impl IndexError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }
}

impl Classify for IndexError {
    fn kind(&self) -> ErrorKind {
        match self {
            IndexError::Configuration { .. } | IndexError::InvalidArgument { .. } => {
                ErrorKind::Configuration
            }
            IndexError::NotFound { .. }
            | IndexError::DimensionMismatch { .. }
            | IndexError::Transport { .. }
            | IndexError::Backend { .. }
            | IndexError::MalformedResponse { .. } => ErrorKind::IndexService,
        }
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// How vectors are compared. Scores are always "higher is more similar".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    /// Scored as `1 / (1 + distance)`
    Euclidean,
    /// Inner product
    Dot,
}

impl Metric {
    /// Name used by the index service (`space_type`)
    pub fn wire_name(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Euclidean => "l2",
            Metric::Dot => "ip",
        }
    }

    /// Parse a service `space_type`, also accepting the config spelling.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "cosine" => Some(Metric::Cosine),
            "l2" | "euclidean" => Some(Metric::Euclidean),
            "ip" | "dot" => Some(Metric::Dot),
            _ => None,
        }
    }

    /// Similarity of two vectors of equal length.
    pub fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        match self {
            Metric::Dot => dot,
            Metric::Cosine => {
                let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm_a == 0.0 || norm_b == 0.0 {
                    0.0
                } else {
                    dot / (norm_a * norm_b)
                }
            }
            Metric::Euclidean => {
                let distance = a
                    .iter()
                    .zip(b)
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt();
                self.similarity_from_distance(distance)
            }
        }
    }

    /// Convert a distance reported by the service into a similarity.
    ///
    /// Cosine and inner-product distances are `1 - similarity`; Euclidean
    /// distances map onto `(0, 1]`.
    pub fn similarity_from_distance(&self, distance: f32) -> f32 {
        match self {
            Metric::Cosine | Metric::Dot => 1.0 - distance,
            Metric::Euclidean => 1.0 / (1.0 + distance.max(0.0)),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Metric::Cosine => "cosine",
            Metric::Euclidean => "euclidean",
            Metric::Dot => "dot",
        };
        f.write_str(name)
    }
}

impl FromStr for Metric {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        Metric::from_wire_name(s).ok_or_else(|| {
            IndexError::configuration(format!(
                "Unknown metric '{s}' (expected cosine, euclidean or dot)"
            ))
        })
    }
}

/// Name and shape of one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub dimension: usize,
    pub metric: Metric,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, dimension: usize, metric: Metric) -> Self {
        Self {
            name: name.into(),
            dimension,
            metric,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(IndexError::configuration("index name must not be empty"));
        }
        if self.dimension == 0 {
            return Err(IndexError::configuration(
                "index dimension must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

/// Opaque string metadata passed through to the index service.
pub type Metadata = BTreeMap<String, String>;

/// One vector to upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub external_id: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
}

/// An id returned by a search, with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredId {
    pub external_id: String,
    pub score: f32,
}

/// Result of `create_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// An index with the same name, dimension and metric was already there
    AlreadyExists,
}

/// A record the index did not accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRecord {
    pub external_id: String,
    pub reason: String,
}

/// Per-record result of an upsert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertOutcome {
    pub upserted: Vec<String>,
    pub failed: Vec<FailedRecord>,
}

impl UpsertOutcome {
    pub fn failed_ids(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.external_id.clone()).collect()
    }
}

/// Split records into those matching the index dimension and local rejections.
pub(crate) fn partition_by_dimension(
    spec: &IndexSpec,
    records: Vec<IndexRecord>,
) -> (Vec<IndexRecord>, Vec<FailedRecord>) {
    let mut accepted = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();
    for record in records {
        match spec.check_dimension(&record.vector) {
            Ok(()) => accepted.push(record),
            Err(e) => rejected.push(FailedRecord {
                external_id: record.external_id,
                reason: e.to_string(),
            }),
        }
    }
    (accepted, rejected)
}

/// Order search hits by score, best first; equal scores by id.
pub fn sort_scored(hits: &mut [ScoredId]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.external_id.cmp(&b.external_id))
    });
}

/// The three operations of a vector index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the index, or confirm an identical one exists. An existing
    /// index with another dimension or metric is a configuration error.
    async fn create_index(&self, spec: &IndexSpec) -> Result<CreateOutcome>;

    /// Insert or overwrite vectors by id.
    ///
    /// `Err` means the whole batch failed. Records rejected individually,
    /// including those whose length does not match `spec.dimension`, are
    /// listed in [`UpsertOutcome::failed`].
    async fn upsert(&self, spec: &IndexSpec, records: Vec<IndexRecord>) -> Result<UpsertOutcome>;

    /// Up to `k` ids nearest to `vector`, best first.
    async fn search(&self, spec: &IndexSpec, vector: &[f32], k: usize) -> Result<Vec<ScoredId>>;
}

pub(crate) fn check_search_args(spec: &IndexSpec, vector: &[f32], k: usize) -> Result<()> {
    if k == 0 {
        return Err(IndexError::InvalidArgument {
            message: "k must be at least 1".to_string(),
        });
    }
    spec.check_dimension(vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_wire_names() {
        for metric in [Metric::Cosine, Metric::Euclidean, Metric::Dot] {
            assert_eq!(Metric::from_wire_name(metric.wire_name()), Some(metric));
            assert_eq!(metric.to_string().parse::<Metric>().unwrap(), metric);
        }
        assert_eq!(Metric::Euclidean.wire_name(), "l2");
        assert!("manhattan".parse::<Metric>().is_err());
    }

    #[test]
    fn test_metric_similarity() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        let c = [2.0, 0.0];

        assert!((Metric::Cosine.similarity(&a, &c) - 1.0).abs() < 1e-6);
        assert!(Metric::Cosine.similarity(&a, &b).abs() < 1e-6);
        assert_eq!(Metric::Dot.similarity(&a, &c), 2.0);
        assert_eq!(Metric::Euclidean.similarity(&a, &a), 1.0);
        assert!(Metric::Euclidean.similarity(&a, &c) > Metric::Euclidean.similarity(&b, &c));
        assert_eq!(Metric::Cosine.similarity(&a, &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_similarity_from_distance() {
        assert!((Metric::Cosine.similarity_from_distance(0.25) - 0.75).abs() < 1e-6);
        assert_eq!(Metric::Euclidean.similarity_from_distance(0.0), 1.0);
        assert_eq!(Metric::Euclidean.similarity_from_distance(1.0), 0.5);
    }

    #[test]
    fn test_sort_scored_breaks_ties_by_id() {
        let mut hits = vec![
            ScoredId {
                external_id: "b".into(),
                score: 0.5,
            },
            ScoredId {
                external_id: "c".into(),
                score: 0.9,
            },
            ScoredId {
                external_id: "a".into(),
                score: 0.5,
            },
        ];
        sort_scored(&mut hits);
        let ids: Vec<_> = hits.iter().map(|h| h.external_id.as_str()).collect();
        assert_eq!(ids, ["c", "a", "b"]);
    }

    #[test]
    fn test_partition_by_dimension() {
        let spec = IndexSpec::new("docs", 2, Metric::Cosine);
        let records = vec![
            IndexRecord {
                external_id: "ok".into(),
                vector: vec![1.0, 0.0],
                metadata: Metadata::new(),
            },
            IndexRecord {
                external_id: "short".into(),
                vector: vec![1.0],
                metadata: Metadata::new(),
            },
        ];

        let (accepted, rejected) = partition_by_dimension(&spec, records);
        assert_eq!(accepted.len(), 1);
        assert_eq!(rejected[0].external_id, "short");
        assert!(rejected[0].reason.contains("expects 2, got 1"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            IndexError::configuration("dim").kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            IndexError::NotFound { name: "x".into() }.kind(),
            ErrorKind::IndexService
        );
        assert_eq!(
            IndexError::Backend {
                status: 500,
                body: String::new()
            }
            .kind(),
            ErrorKind::IndexService
        );
    }

    #[test]
    fn test_index_spec_validation() {
        assert!(IndexSpec::new("docs", 384, Metric::Cosine).validate().is_ok());
        assert!(IndexSpec::new(" ", 384, Metric::Cosine).validate().is_err());
        assert!(IndexSpec::new("docs", 0, Metric::Cosine).validate().is_err());
    }
}
