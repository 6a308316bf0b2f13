//! Ingestion pipeline orchestration.
//!
//! Coordinates one ingestion: loader → file selection → chunking →
//! embedding → index write → catalog entry.
//!
//! ```text
//! ingest(url)
//!   ├─ checkout (clone or fetch + hard reset, per-URL lock held)
//!   ├─ namespace = H(normalized url, commit)
//!   ├─ select + chunk files (blocking pool)
//!   ├─ release the working copy
//!   ├─ embed batches concurrently, upsert each batch as it completes
//!   ├─ drop rows of the namespace this run did not write
//!   └─ record the namespace in the catalog
//! ```
//!
//! Per-file, per-chunk and per-batch problems become warnings on the
//! [`IngestReport`]. The ingestion as a whole fails only when the loader
//! cannot produce a commit, or when no chunk at all reached the index
//! because the embedder or the index was unavailable.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use repo_guide_core::chunk::{chunk_file, ChunkParams};
use repo_guide_core::embedding::Embedder;
use repo_guide_core::error::{EmbeddingError, IndexError};
use repo_guide_core::models::{Chunk, ChunkingWarning};
use repo_guide_core::namespace::{normalize_repository_url, Namespace};
use repo_guide_core::store::{IndexRecord, VectorIndex};

use crate::embedding::embed_batch;
use crate::files::{FileSelector, SkipCounts};
use crate::loader::{GitLoader, LoaderError};
use crate::progress::{IngestEvent, IngestProgress};
use crate::sqlite_index::{NamespaceEntry, SqliteIndex};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Loader(#[from] LoaderError),
    /// Chunks were produced but none of them could be embedded.
    #[error("no chunk could be embedded: {0}")]
    EmbedderUnavailable(EmbeddingError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("file selection failed: {0}")]
    Selection(String),
}

/// Result of a successful (possibly partial) ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub namespace: String,
    pub repository_url: String,
    pub commit: String,
    pub branch: String,
    pub model: String,
    /// Vectors stored under the namespace after this ingestion.
    pub chunk_count: usize,
    pub files_indexed: usize,
    pub files_skipped: usize,
    pub skipped: SkipCounts,
    /// Sorted by file path.
    pub warnings: Vec<ChunkingWarning>,
    /// Chunks whose embedding failed and were left out of the index.
    pub embedding_failures: usize,
    /// Embedded chunks whose batch the index refused.
    pub index_failures: usize,
}

/// Outcome of embedding and writing one batch.
#[derive(Default)]
struct BatchWrite {
    /// `(file_path, sequence_index)` of every stored record.
    written: Vec<(String, u32)>,
    embedding_failures: Vec<(ChunkingWarning, EmbeddingError)>,
    index_failure: Option<(Vec<ChunkingWarning>, IndexError)>,
}

pub struct Ingestor<'a> {
    loader: &'a GitLoader,
    selector: Arc<FileSelector>,
    params: ChunkParams,
    embedder: &'a dyn Embedder,
    index: &'a dyn VectorIndex,
    catalog: &'a SqliteIndex,
    batch_size: usize,
    concurrency: usize,
    progress: &'a dyn IngestProgress,
}

impl<'a> Ingestor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        loader: &'a GitLoader,
        selector: Arc<FileSelector>,
        params: ChunkParams,
        embedder: &'a dyn Embedder,
        index: &'a dyn VectorIndex,
        catalog: &'a SqliteIndex,
        batch_size: usize,
        concurrency: usize,
        progress: &'a dyn IngestProgress,
    ) -> Self {
        Self {
            loader,
            selector,
            params,
            embedder,
            index,
            catalog,
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
            progress,
        }
    }

    /// Ingest `url` at the tip of `branch` (or the remote default branch).
    pub async fn ingest(&self, url: &str, branch: Option<&str>) -> Result<IngestReport, IngestError> {
        let url = url.trim();
        self.progress.report(IngestEvent::Loading {
            url: url.to_string(),
        });
        let checkout = self.loader.checkout(url, branch).await?;
        let commit = checkout.commit().to_string();
        let branch = checkout.branch().to_string();
        let namespace = Namespace::derive(url, &commit);
        info!(%url, %commit, %namespace, "ingesting");

        self.progress.report(IngestEvent::Selecting {
            commit: commit.clone(),
        });
        let selector = Arc::clone(&self.selector);
        let params = self.params.clone();
        let root = checkout.path().to_path_buf();
        let (selection, chunks) = tokio::task::spawn_blocking(move || {
            let selection = selector.select(&root);
            let chunks: Vec<Chunk> = selection
                .files
                .iter()
                .flat_map(|file| chunk_file(&file.path, &file.text, &params))
                .collect();
            (selection, chunks)
        })
        .await
        .map_err(|e| IngestError::Selection(e.to_string()))?;

        // Everything needed is in memory; let the next ingestion of this URL in.
        drop(checkout);

        let files_indexed = selection.files.len();
        let mut warnings = selection.warnings;
        for warning in &warnings {
            debug!(path = %warning.file_path, reason = %warning.reason, "file skipped");
        }
        info!(
            files = files_indexed,
            skipped = selection.skipped.total(),
            chunks = chunks.len(),
            "chunked working copy"
        );

        let total = chunks.len() as u64;
        let mut processed = 0u64;
        let mut written: HashSet<(String, u32)> = HashSet::new();
        let mut failures = Vec::new();
        let mut rejected_batches = Vec::new();

        let mut batches = stream::iter(chunks.chunks(self.batch_size))
            .map(|batch| self.write_batch(&namespace, batch))
            .buffer_unordered(self.concurrency);

        while let Some(batch) = batches.next().await {
            processed += batch.written.len() as u64 + batch.embedding_failures.len() as u64;
            written.extend(batch.written);
            failures.extend(batch.embedding_failures);
            if let Some((lost, error)) = batch.index_failure {
                processed += lost.len() as u64;
                rejected_batches.push((lost, error));
            }
            self.progress.report(IngestEvent::Embedding {
                n: processed,
                total,
            });
        }
        drop(batches);

        if written.is_empty() {
            if let Some((_, error)) = rejected_batches.into_iter().next() {
                return Err(IngestError::Index(error));
            }
            if let Some((_, error)) = failures.into_iter().next() {
                return Err(IngestError::EmbedderUnavailable(error));
            }
            failures = Vec::new();
            rejected_batches = Vec::new();
        } else {
            if !failures.is_empty() {
                warn!(failed = failures.len(), written = written.len(), "some chunks could not be embedded");
            }
            for (lost, error) in &rejected_batches {
                warn!(chunks = lost.len(), %error, "index rejected a batch");
            }
        }

        let embedding_failures = failures.len();
        warnings.extend(failures.into_iter().map(|(warning, _)| warning));
        let mut index_failures = 0;
        for (lost, _) in rejected_batches {
            index_failures += lost.len();
            warnings.extend(lost);
        }
        warnings.sort_by(|a, b| a.file_path.cmp(&b.file_path));

        let pruned = self.catalog.retain_only(&namespace, &written).await?;
        if pruned > 0 {
            debug!(%namespace, pruned, "removed rows not rewritten by this ingestion");
        }

        let chunk_count = self.index.count(&namespace).await?;
        let model = self.embedder.model_name().to_string();
        let now = Utc::now().timestamp();
        self.catalog
            .record_namespace(&NamespaceEntry {
                namespace: namespace.clone(),
                repository_url: url.to_string(),
                normalized_url: normalize_repository_url(url),
                commit: commit.clone(),
                model: model.clone(),
                dims: self.embedder.dims(),
                chunk_count,
                created_at: now,
                updated_at: now,
            })
            .await?;
        info!(%namespace, chunk_count, warnings = warnings.len(), "ingestion complete");

        Ok(IngestReport {
            namespace: namespace.to_string(),
            repository_url: url.to_string(),
            commit,
            branch,
            model,
            chunk_count,
            files_indexed,
            files_skipped: selection.skipped.total(),
            skipped: selection.skipped,
            warnings,
            embedding_failures,
            index_failures,
        })
    }

    async fn write_batch(&self, namespace: &Namespace, batch: &[Chunk]) -> BatchWrite {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let outcome = embed_batch(self.embedder, &texts).await;

        let mut records = Vec::with_capacity(batch.len());
        let mut embedded = Vec::with_capacity(batch.len());
        for (chunk, vector) in batch.iter().zip(outcome.vectors) {
            if let Some(vector) = vector {
                records.push(IndexRecord::from_chunk(namespace, chunk, vector));
                embedded.push(chunk);
            }
        }
        let embedding_failures = outcome
            .errors
            .into_iter()
            .filter_map(|(i, error)| {
                batch.get(i).map(|chunk| {
                    let warning = ChunkingWarning {
                        file_path: chunk.file_path.clone(),
                        reason: format!(
                            "chunk {} (lines {}-{}) not embedded: {}",
                            chunk.sequence_index, chunk.start_line, chunk.end_line, error
                        ),
                    };
                    (warning, error)
                })
            })
            .collect();

        let mut write = BatchWrite {
            embedding_failures,
            ..BatchWrite::default()
        };
        if records.is_empty() {
            return write;
        }
        match self.index.upsert(namespace, &records).await {
            Ok(()) => {
                write.written = embedded
                    .iter()
                    .map(|c| (c.file_path.clone(), c.sequence_index))
                    .collect();
            }
            Err(error) => {
                let lost = embedded
                    .iter()
                    .map(|chunk| ChunkingWarning {
                        file_path: chunk.file_path.clone(),
                        reason: format!(
                            "chunk {} (lines {}-{}) not stored: {}",
                            chunk.sequence_index, chunk.start_line, chunk.end_line, error
                        ),
                    })
                    .collect();
                write.index_failure = Some((lost, error));
            }
        }
        write
    }
}
