//! JSON/HTTP client for a remote vector server.
//!
//! Endpoints:
//!
//! | operation | request |
//! |---|---|
//! | health | `GET /api/v1/health` |
//! | create | `POST /api/v1/index/create` `{index_name, dim, space_type}` |
//! | info | `GET /api/v1/index/{name}/info` |
//! | upsert | `POST /api/v1/index/{name}/vector/insert` `[{id, vector, meta}]` |
//! | search | `POST /api/v1/index/{name}/search` `{vector, k, include_vectors}` |
//!
//! A `409 Conflict` from create means the index already exists; its shape is
//! then fetched from the info endpoint and compared with the requested spec.
//! A `404` on any index route means the index does not exist.

use super::{
    CreateOutcome, FailedRecord, IndexError, IndexRecord, IndexSpec, Metric, Result, ScoredId,
    UpsertOutcome, VectorIndex, check_search_args, partition_by_dimension, sort_scored,
};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Serialize)]
struct CreateIndexRequest<'a> {
    index_name: &'a str,
    dim: usize,
    space_type: &'a str,
}

/// Shape of an existing index as reported by the info endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexInfo {
    #[serde(alias = "dimension")]
    pub dim: usize,
    #[serde(alias = "metric")]
    pub space_type: String,
    #[serde(default, alias = "count", alias = "total_elements")]
    pub size: Option<u64>,
}

#[derive(Debug, Serialize)]
struct WireVector<'a> {
    id: &'a str,
    vector: &'a [f32],
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct InsertResponse {
    #[serde(default)]
    failed_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    k: usize,
    include_vectors: bool,
}

/// [`super::VectorIndex`] backed by a vector server over HTTP.
#[derive(Debug, Clone)]
pub struct HttpIndexClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpIndexClient {
    /// Create a client; every request is bounded by `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(IndexError::configuration(format!(
                "index url must start with http:// or https://, got '{base_url}'"
            )));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn index_url(&self, name: &str, route: &str) -> String {
        format!("{}/api/v1/index/{}/{}", self.base_url, name, route)
    }

    /// Check that the service is up.
    pub async fn health(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/api/v1/health", self.base_url))
            .send()
            .await?;
        check_status(resp, None).await?;
        tracing::debug!("Index service at {} is healthy", self.base_url);
        Ok(())
    }

    /// Fetch the shape of an existing index.
    pub async fn info(&self, name: &str) -> Result<IndexInfo> {
        let resp = self.client.get(self.index_url(name, "info")).send().await?;
        let resp = check_status(resp, Some(name)).await?;
        resp.json::<IndexInfo>()
            .await
            .map_err(|e| IndexError::malformed(format!("index info: {e}")))
    }

    async fn verify_existing(&self, spec: &IndexSpec) -> Result<CreateOutcome> {
        let info = self.info(&spec.name).await?;
        let metric = Metric::from_wire_name(&info.space_type).ok_or_else(|| {
            IndexError::malformed(format!("unknown space_type '{}'", info.space_type))
        })?;

        if info.dim != spec.dimension || metric != spec.metric {
            return Err(IndexError::configuration(format!(
                "index '{}' already exists with dimension {} and metric {}, wanted dimension {} and metric {}",
                spec.name, info.dim, metric, spec.dimension, spec.metric
            )));
        }
        tracing::info!("Index '{}' already exists with matching shape", spec.name);
        Ok(CreateOutcome::AlreadyExists)
    }
}

/// Pass through a successful response, otherwise turn it into an error.
async fn check_status(resp: Response, index_name: Option<&str>) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        if let Some(name) = index_name {
            return Err(IndexError::NotFound {
                name: name.to_string(),
            });
        }
    }
    let body = resp.text().await.unwrap_or_default();
    Err(IndexError::Backend {
        status: status.as_u16(),
        body: truncate(body),
    })
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    body
}

fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse one search hit: `{id, similarity}`, `{id, score}`, `{id, distance}`
/// (or `label` for `id`), or a `[score, id]` pair.
fn parse_hit(item: &Value, metric: Metric) -> Result<ScoredId> {
    match item {
        Value::Object(map) => {
            let external_id = map
                .get("id")
                .or_else(|| map.get("label"))
                .and_then(id_from_value)
                .ok_or_else(|| IndexError::malformed(format!("search hit without id: {item}")))?;

            let score = if let Some(similarity) = map
                .get("similarity")
                .or_else(|| map.get("score"))
                .and_then(Value::as_f64)
            {
                similarity as f32
            } else if let Some(distance) = map.get("distance").and_then(Value::as_f64) {
                metric.similarity_from_distance(distance as f32)
            } else {
                return Err(IndexError::malformed(format!(
                    "search hit without score: {item}"
                )));
            };

            Ok(ScoredId { external_id, score })
        }
        Value::Array(pair) if pair.len() >= 2 => {
            let score = pair[0]
                .as_f64()
                .ok_or_else(|| IndexError::malformed(format!("bad score in hit: {item}")))?;
            let external_id = id_from_value(&pair[1])
                .ok_or_else(|| IndexError::malformed(format!("bad id in hit: {item}")))?;
            Ok(ScoredId {
                external_id,
                score: score as f32,
            })
        }
        _ => Err(IndexError::malformed(format!("unexpected search hit: {item}"))),
    }
}

/// Parse a search response: a list of hits or `{"results": [...]}`.
pub(crate) fn parse_search_response(body: &Value, metric: Metric) -> Result<Vec<ScoredId>> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("results") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(IndexError::malformed(
                    "expected a list of hits or an object with a results list",
                ));
            }
        },
        _ => {
            return Err(IndexError::malformed(format!(
                "unexpected search response: {body}"
            )));
        }
    };

    items.iter().map(|item| parse_hit(item, metric)).collect()
}

#[async_trait]
impl VectorIndex for HttpIndexClient {
    async fn create_index(&self, spec: &IndexSpec) -> Result<CreateOutcome> {
        spec.validate()?;
        let request = CreateIndexRequest {
            index_name: &spec.name,
            dim: spec.dimension,
            space_type: spec.metric.wire_name(),
        };

        let resp = self
            .client
            .post(format!("{}/api/v1/index/create", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            tracing::info!(
                "Created index '{}' (dimension {}, {})",
                spec.name,
                spec.dimension,
                spec.metric
            );
            return Ok(CreateOutcome::Created);
        }
        if status == StatusCode::CONFLICT {
            return self.verify_existing(spec).await;
        }

        let body = resp.text().await.unwrap_or_default();
        if body.to_lowercase().contains("already exists") {
            return self.verify_existing(spec).await;
        }
        Err(IndexError::Backend {
            status: status.as_u16(),
            body: truncate(body),
        })
    }

    async fn upsert(&self, spec: &IndexSpec, records: Vec<IndexRecord>) -> Result<UpsertOutcome> {
        let (accepted, mut failed) = partition_by_dimension(spec, records);
        if !failed.is_empty() {
            tracing::warn!(
                "Rejected {} vectors with the wrong dimension for index '{}'",
                failed.len(),
                spec.name
            );
        }
        if accepted.is_empty() {
            return Ok(UpsertOutcome {
                upserted: Vec::new(),
                failed,
            });
        }

        let mut wire = Vec::with_capacity(accepted.len());
        for record in &accepted {
            let meta = if record.metadata.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&record.metadata).map_err(|e| {
                    IndexError::InvalidArgument {
                        message: format!("metadata for {}: {e}", record.external_id),
                    }
                })?)
            };
            wire.push(WireVector {
                id: &record.external_id,
                vector: &record.vector,
                meta,
            });
        }

        let resp = self
            .client
            .post(self.index_url(&spec.name, "vector/insert"))
            .json(&wire)
            .send()
            .await?;
        let resp = check_status(resp, Some(&spec.name)).await?;

        // A success body may be empty, plain text, or list rejected ids.
        let body = resp.text().await.unwrap_or_default();
        let rejected = serde_json::from_str::<InsertResponse>(&body)
            .map(|r| r.failed_ids)
            .unwrap_or_default();

        let mut upserted = Vec::with_capacity(accepted.len());
        for record in accepted {
            if rejected.contains(&record.external_id) {
                failed.push(FailedRecord {
                    external_id: record.external_id,
                    reason: "rejected by index service".to_string(),
                });
            } else {
                upserted.push(record.external_id);
            }
        }

        tracing::debug!(
            "Upserted {} vectors into '{}' ({} failed)",
            upserted.len(),
            spec.name,
            failed.len()
        );
        Ok(UpsertOutcome { upserted, failed })
    }

    async fn search(&self, spec: &IndexSpec, vector: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        check_search_args(spec, vector, k)?;
        let request = SearchRequest {
            vector,
            k,
            include_vectors: false,
        };

        let resp = self
            .client
            .post(self.index_url(&spec.name, "search"))
            .json(&request)
            .send()
            .await?;
        let resp = check_status(resp, Some(&spec.name)).await?;

        let body: Value = resp
            .json()
            .await
            .map_err(|e| IndexError::malformed(format!("search response: {e}")))?;

        let mut hits = parse_search_response(&body, spec.metric)?;
        sort_scored(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }
}
