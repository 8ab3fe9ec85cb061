//! Ingestion pipeline: documents in, chunks in the store, vectors in the index.
//!
//! ## Pipeline Flow
//!
//! ```text
//! SourceDocument → Chunker → Embedder ──flume──▶ DocumentStore.put_many → VectorIndex.upsert
//!                   (producer, batch N+1)           (consumer, batch N)
//! ```
//!
//! Each document runs a small producer/consumer pair over a bounded channel,
//! so embedding the next batch overlaps with writing the previous one while
//! chunk order inside the document is kept. Several documents can be in
//! flight at once (`parallelism`).
//!
//! Store entries are written before the vectors of the same batch. For ids
//! the index did not accept, the store is put back the way it was: entries
//! from an earlier run are restored and new ones deleted. If that rollback
//! fails the ids are reported as a consistency failure, and retrieval will
//! skip them.
//!
//! Failures never stop the run. They are collected in the
//! [`IngestionReport`] with their [`ErrorKind`]. Only problems that make
//! every document fail (wrong index shape, wrong embedding model) are
//! returned as an [`IngestionError`].

use crate::error::{Classify, ErrorKind};
use crate::index::{CreateOutcome, IndexError, IndexRecord, IndexSpec, Metadata, VectorIndex};
use crate::retrieval::sources::{SourceDocument, SourceError, SourceItem};
use crate::storage::{DocumentEntry, DocumentStore, StoreError, pin_embedding_model};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, future};
use quarry_context::{Chunk, ChunkError, Chunker, ChunkingConfig};
use quarry_embed::Embedder;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Errors that stop an ingestion run before any document is processed.
#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    #[error("Invalid ingestion configuration: {message}")]
    Configuration { message: String },

    #[error(transparent)]
    Chunking(#[from] ChunkError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for IngestionError {
    fn kind(&self) -> ErrorKind {
        match self {
            IngestionError::Configuration { .. } => ErrorKind::Configuration,
            IngestionError::Chunking(e) => e.kind(),
            IngestionError::Index(e) => e.kind(),
            IngestionError::Store(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestionError>;

/// Derive the id of a chunk from its document and position.
///
/// `hex(blake3(source_id ‖ 0x00 ‖ sequence_index as u64 LE))`, first 16
/// bytes. The same chunk always gets the same id, so re-ingestion
/// overwrites instead of duplicating.
pub fn external_id(source_id: &str, sequence_index: usize) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(&(sequence_index as u64).to_le_bytes());
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

/// Tuning for an ingestion run.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub chunking: ChunkingConfig,
    /// Chunks per embed/store/upsert round trip
    pub upsert_batch_size: usize,
    /// Embedded batches waiting to be written, per document
    pub queue_depth: usize,
    /// Documents processed concurrently
    pub parallelism: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            upsert_batch_size: 100,
            queue_depth: 2,
            parallelism: 1,
        }
    }
}

impl IngestionConfig {
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        for (name, value) in [
            ("upsert_batch_size", self.upsert_batch_size),
            ("queue_depth", self.queue_depth),
            ("parallelism", self.parallelism),
        ] {
            if value == 0 {
                return Err(IngestionError::Configuration {
                    message: format!("{name} must be greater than zero"),
                });
            }
        }
        Ok(())
    }
}

/// Cooperative cancellation shared between the caller and a running
/// pipeline. Checked between documents.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Something that went wrong for one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionFailure {
    pub source_id: String,
    pub kind: ErrorKind,
    pub message: String,
    /// Chunk ids affected, empty when the whole document failed early
    pub external_ids: Vec<String>,
}

impl IngestionFailure {
    fn new(
        source_id: &str,
        kind: ErrorKind,
        message: impl Into<String>,
        external_ids: Vec<String>,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            kind,
            message: message.into(),
            external_ids,
        }
    }
}

/// Outcome of ingesting one document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentReport {
    pub source_id: String,
    pub chunks: usize,
    pub vectors_upserted: usize,
    pub stale_entries_evicted: usize,
    pub failures: Vec<IngestionFailure>,
}

/// Summary of an ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub documents_processed: usize,
    pub chunks_processed: usize,
    pub vectors_upserted: usize,
    pub stale_entries_evicted: usize,
    pub failures: Vec<IngestionFailure>,
    /// Documents were left unprocessed because cancellation was requested
    pub cancelled: bool,
}

impl IngestionReport {
    fn start() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            documents_processed: 0,
            chunks_processed: 0,
            vectors_upserted: 0,
            stale_entries_evicted: 0,
            failures: Vec::new(),
            cancelled: false,
        }
    }

    fn absorb(&mut self, document: DocumentReport) {
        self.documents_processed += 1;
        self.chunks_processed += document.chunks;
        self.vectors_upserted += document.vectors_upserted;
        self.stale_entries_evicted += document.stale_entries_evicted;
        self.failures.extend(document.failures);
    }

    /// No failures and not cancelled
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    /// Distinct documents with at least one failure
    pub fn failed_documents(&self) -> BTreeSet<&str> {
        self.failures.iter().map(|f| f.source_id.as_str()).collect()
    }

    pub fn summary(&self) -> String {
        let elapsed = self.finished_at - self.started_at;
        let mut summary = format!(
            "Processed {} documents: {} chunks, {} vectors upserted, {} stale entries evicted, {} failures in {:.1}s",
            self.documents_processed,
            self.chunks_processed,
            self.vectors_upserted,
            self.stale_entries_evicted,
            self.failures.len(),
            elapsed.num_milliseconds() as f64 / 1000.0
        );
        if self.cancelled {
            summary.push_str(" (cancelled)");
        }
        summary
    }
}

/// Report for a document the source failed to produce.
fn unreadable_document(e: SourceError) -> DocumentReport {
    let source_id = e.source_id().unwrap_or_default().to_string();
    error!("Skipping {}: {}", source_id, e);
    DocumentReport {
        failures: vec![IngestionFailure::new(
            &source_id,
            e.kind(),
            e.to_string(),
            Vec::new(),
        )],
        source_id,
        ..DocumentReport::default()
    }
}

/// One embedded batch on its way to the store and index.
struct EmbeddedBatch {
    chunks: Vec<Chunk>,
    ids: Vec<String>,
    vectors: Vec<Vec<f32>>,
}

/// Turns documents into stored chunks and indexed vectors.
pub struct IngestionPipeline {
    embedder: Arc<Embedder>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn DocumentStore>,
    spec: IndexSpec,
    chunker: Chunker,
    config: IngestionConfig,
}

impl IngestionPipeline {
    pub fn new(
        embedder: Arc<Embedder>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn DocumentStore>,
        spec: IndexSpec,
        config: IngestionConfig,
    ) -> Result<Self> {
        config.validate()?;
        spec.validate()?;
        if embedder.dimension() != spec.dimension {
            return Err(IngestionError::Configuration {
                message: format!(
                    "embedder {} produces {}-dimensional vectors but index '{}' has dimension {}",
                    embedder.model_id(),
                    embedder.dimension(),
                    spec.name,
                    spec.dimension
                ),
            });
        }
        let chunker = Chunker::new(config.chunking)?;

        Ok(Self {
            embedder,
            index,
            store,
            spec,
            chunker,
            config,
        })
    }

    pub fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    /// Create the index if needed; an existing index must have the same shape.
    pub async fn ensure_index(&self) -> Result<CreateOutcome> {
        Ok(self.index.create_index(&self.spec).await?)
    }

    /// Ingest every document of `documents` until it ends or `cancel` is set.
    ///
    /// Documents the source could not read are reported as failures.
    pub async fn ingest<S>(
        &self,
        documents: S,
        cancel: &CancellationFlag,
    ) -> Result<IngestionReport>
    where
        S: Stream<Item = SourceItem>,
    {
        let model_id = self.embedder.model_id();
        pin_embedding_model(self.store.as_ref(), &model_id).await?;

        info!(
            "Starting ingestion into '{}' with {} (parallelism {}, batch size {})",
            self.spec.name, model_id, self.config.parallelism, self.config.upsert_batch_size
        );

        let mut report = IngestionReport::start();
        let stopped = AtomicBool::new(false);

        let outcomes = documents
            .take_while(|_| {
                let keep_going = !cancel.is_cancelled();
                if !keep_going {
                    stopped.store(true, Ordering::SeqCst);
                }
                future::ready(keep_going)
            })
            .map(|item| async move {
                match item {
                    Ok(document) => self.ingest_document(document).await,
                    Err(e) => unreadable_document(e),
                }
            })
            .buffer_unordered(self.config.parallelism);
        futures::pin_mut!(outcomes);

        while let Some(document) = outcomes.next().await {
            report.absorb(document);
        }

        report.cancelled = stopped.load(Ordering::SeqCst);
        report.finished_at = Utc::now();
        if report.cancelled {
            warn!("Ingestion cancelled: {}", report.summary());
        } else {
            info!("Ingestion finished: {}", report.summary());
        }
        Ok(report)
    }

    /// Chunk, embed, store, and index one document.
    ///
    /// Entries left over from a longer earlier version of the document are
    /// evicted from the store once all chunks are produced.
    pub async fn ingest_document(&self, document: SourceDocument) -> DocumentReport {
        let source_id = document.source_id.as_str();
        let (tx, rx) = flume::bounded::<EmbeddedBatch>(self.config.queue_depth);

        let producer = async {
            let tx = tx;
            let mut chunks = self.chunker.chunk(source_id, &document.full_text);
            let mut total = 0;
            let mut failures = Vec::new();

            loop {
                let batch: Vec<Chunk> = chunks
                    .by_ref()
                    .take(self.config.upsert_batch_size)
                    .collect();
                if batch.is_empty() {
                    break;
                }
                total += batch.len();

                let ids: Vec<String> = batch
                    .iter()
                    .map(|c| external_id(&c.source_id, c.sequence_index))
                    .collect();
                let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();

                match self.embedder.embed(&texts).await {
                    Ok(vectors) => {
                        let embedded = EmbeddedBatch {
                            chunks: batch,
                            ids,
                            vectors,
                        };
                        if tx.send_async(embedded).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "Embedding failed for {} chunks of {}: {}",
                            ids.len(),
                            source_id,
                            e
                        );
                        failures.push(IngestionFailure::new(
                            source_id,
                            e.kind(),
                            e.to_string(),
                            ids,
                        ));
                    }
                }
            }
            (total, failures)
        };

        let consumer = async {
            let mut upserted = 0;
            let mut failures = Vec::new();
            while let Ok(batch) = rx.recv_async().await {
                upserted += self.write_batch(source_id, batch, &mut failures).await;
            }
            (upserted, failures)
        };

        let ((chunks, producer_failures), (vectors_upserted, consumer_failures)) =
            tokio::join!(producer, consumer);

        let mut report = DocumentReport {
            source_id: source_id.to_string(),
            chunks,
            vectors_upserted,
            stale_entries_evicted: 0,
            failures: producer_failures,
        };
        report.failures.extend(consumer_failures);

        match self.store.delete_source_from(source_id, chunks).await {
            Ok(evicted) => {
                if !evicted.is_empty() {
                    debug!(
                        "Evicted {} stale entries of {} from the document store",
                        evicted.len(),
                        source_id
                    );
                }
                report.stale_entries_evicted = evicted.len();
            }
            Err(e) => {
                warn!("Failed to evict stale entries of {}: {}", source_id, e);
                report
                    .failures
                    .push(IngestionFailure::new(source_id, e.kind(), e.to_string(), Vec::new()));
            }
        }

        if report.failures.is_empty() {
            debug!(
                "Ingested {} ({} chunks, {} vectors)",
                source_id, report.chunks, report.vectors_upserted
            );
        } else {
            error!(
                "Ingested {} with {} failures ({} of {} chunks indexed)",
                source_id,
                report.failures.len(),
                report.vectors_upserted,
                report.chunks
            );
        }
        report
    }

    /// Store entries, upsert vectors, and roll back ids the index refused.
    /// Returns the number of vectors upserted.
    async fn write_batch(
        &self,
        source_id: &str,
        batch: EmbeddedBatch,
        failures: &mut Vec<IngestionFailure>,
    ) -> usize {
        let EmbeddedBatch {
            chunks,
            ids,
            vectors,
        } = batch;

        let entries: Vec<DocumentEntry> = chunks
            .iter()
            .zip(&ids)
            .map(|(chunk, id)| DocumentEntry {
                external_id: id.clone(),
                text: chunk.text.clone(),
                source_id: chunk.source_id.clone(),
                sequence_index: chunk.sequence_index,
                char_start: chunk.char_start,
                char_end: chunk.char_end,
            })
            .collect();

        // Entries an earlier run wrote for these ids still describe the
        // vectors in the index until the upsert succeeds.
        let previous = match self.store.get_many(&ids).await {
            Ok(lookup) => lookup.found,
            Err(e) => {
                warn!("Failed to read existing entries of {}: {}", source_id, e);
                failures.push(IngestionFailure::new(source_id, e.kind(), e.to_string(), ids));
                return 0;
            }
        };

        if let Err(e) = self.store.put_many(entries).await {
            warn!("Failed to store {} chunks of {}: {}", ids.len(), source_id, e);
            failures.push(IngestionFailure::new(source_id, e.kind(), e.to_string(), ids));
            return 0;
        }

        let records: Vec<IndexRecord> = chunks
            .iter()
            .zip(ids.iter().cloned().zip(vectors))
            .map(|(chunk, (external_id, vector))| {
                let mut metadata = Metadata::new();
                metadata.insert("source_id".to_string(), chunk.source_id.clone());
                metadata.insert(
                    "sequence_index".to_string(),
                    chunk.sequence_index.to_string(),
                );
                IndexRecord {
                    external_id,
                    vector,
                    metadata,
                }
            })
            .collect();

        let (upserted, failed_ids, kind, message) =
            match self.index.upsert(&self.spec, records).await {
                Ok(outcome) => {
                    let message = match outcome.failed.first() {
                        Some(first) => format!(
                            "{} vectors were not upserted: {}",
                            outcome.failed.len(),
                            first.reason
                        ),
                        None => String::new(),
                    };
                    let failed_ids = outcome.failed_ids();
                    (outcome.upserted.len(), failed_ids, ErrorKind::IndexService, message)
                }
                Err(e) => (0, ids, e.kind(), e.to_string()),
            };

        debug!(
            "Upserted {} vectors for {} ({} failed)",
            upserted,
            source_id,
            failed_ids.len()
        );
        if failed_ids.is_empty() {
            return upserted;
        }

        warn!("Upsert failed for {} chunks of {}: {}", failed_ids.len(), source_id, message);
        if let Err(e) = self.roll_back(&failed_ids, previous).await {
            error!(
                "Rollback of {} document store entries of {} failed: {}",
                failed_ids.len(),
                source_id,
                e
            );
            failures.push(IngestionFailure::new(
                source_id,
                ErrorKind::Consistency,
                format!("document store no longer matches the index for these chunks: {e}"),
                failed_ids.clone(),
            ));
        }
        failures.push(IngestionFailure::new(source_id, kind, message, failed_ids));
        upserted
    }

    /// Undo the store writes for ids the index did not take.
    ///
    /// Ids that had an entry before keep their old vector in the index, so
    /// the old entry is put back. Ids that are new to the store are removed.
    async fn roll_back(
        &self,
        failed_ids: &[String],
        mut previous: HashMap<String, DocumentEntry>,
    ) -> std::result::Result<(), StoreError> {
        let mut restore = Vec::new();
        let mut remove = Vec::new();
        for id in failed_ids {
            match previous.remove(id) {
                Some(entry) => restore.push(entry),
                None => remove.push(id.clone()),
            }
        }

        if !restore.is_empty() {
            debug!("Restoring {} earlier document store entries", restore.len());
            self.store.put_many(restore).await?;
        }
        if !remove.is_empty() {
            self.store.delete_many(&remove).await?;
        }
        Ok(())
    }
}
