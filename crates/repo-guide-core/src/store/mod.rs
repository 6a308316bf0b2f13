//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the narrow contract the ingestion pipeline
//! and the retrieval flow depend on: keyed upserts and nearest-neighbour
//! queries, both scoped to a single [`Namespace`]. Any backend (SQLite,
//! in-memory, a hosted vector database) can sit behind it.
//!
//! Implementations must uphold two rules:
//!
//! - **Isolation.** A query against namespace A never returns a record
//!   written under namespace B, whatever is being written concurrently.
//! - **Idempotency.** Upserts are keyed by `(namespace, file_path,
//!   sequence_index)`; writing the same key twice overwrites.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;

use crate::embedding::Metric;
use crate::error::IndexError;
use crate::models::{Chunk, ChunkMetadata};
use crate::namespace::Namespace;

/// One vector plus the metadata needed to cite it.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

impl IndexRecord {
    pub fn from_chunk(namespace: &Namespace, chunk: &Chunk, vector: Vec<f32>) -> Self {
        Self {
            id: record_id(namespace, &chunk.file_path, chunk.sequence_index),
            vector,
            metadata: chunk.metadata(),
        }
    }
}

/// A query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexHit {
    pub id: String,
    pub score: f32,
    pub metadata: ChunkMetadata,
}

/// Stable record identifier: `{namespace}:{file_path}:{sequence_index}`.
pub fn record_id(namespace: &Namespace, file_path: &str, sequence_index: u32) -> String {
    format!("{}:{}:{}", namespace, file_path, sequence_index)
}

/// Sort hits by descending score, breaking ties by ascending
/// `sequence_index` and then `file_path`, so identical inputs always rank
/// identically.
pub fn rank_hits(hits: &mut [IndexHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.metadata.sequence_index.cmp(&b.metadata.sequence_index))
            .then_with(|| a.metadata.file_path.cmp(&b.metadata.file_path))
    });
}

/// Reject records whose vectors do not match the index dimensionality.
pub fn check_dims(records: &[IndexRecord], dims: usize) -> Result<(), IndexError> {
    match records.iter().find(|r| r.vector.len() != dims) {
        Some(bad) => Err(IndexError::DimensionMismatch {
            expected: dims,
            actual: bad.vector.len(),
        }),
        None => Ok(()),
    }
}

/// Namespace-scoped vector storage.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Insert or overwrite records in one namespace |
/// | [`query`](VectorIndex::query) | k nearest records in one namespace |
/// | [`count`](VectorIndex::count) | Number of records in one namespace |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Dimensionality every stored vector must have.
    fn dims(&self) -> usize;

    fn metric(&self) -> Metric;

    async fn upsert(&self, namespace: &Namespace, records: &[IndexRecord]) -> Result<(), IndexError>;

    /// Up to `k` records of `namespace`, ranked by [`rank_hits`].
    async fn query(
        &self,
        namespace: &Namespace,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<IndexHit>, IndexError>;

    async fn count(&self, namespace: &Namespace) -> Result<usize, IndexError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(path: &str, seq: u32, score: f32) -> IndexHit {
        IndexHit {
            id: format!("{}:{}", path, seq),
            score,
            metadata: ChunkMetadata {
                file_path: path.to_string(),
                start_line: 1,
                end_line: 1,
                sequence_index: seq,
                text: String::new(),
            },
        }
    }

    #[test]
    fn test_rank_hits_ties_by_sequence_then_path() {
        let mut hits = vec![
            hit("b.rs", 0, 0.5),
            hit("a.rs", 2, 0.5),
            hit("a.rs", 0, 0.5),
            hit("c.rs", 9, 0.9),
        ];
        rank_hits(&mut hits);
        let order: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(order, vec!["c.rs:9", "a.rs:0", "b.rs:0", "a.rs:2"]);
    }

    #[test]
    fn test_record_id_format() {
        let ns = Namespace::from_key("ns1");
        assert_eq!(record_id(&ns, "src/lib.rs", 3), "ns1:src/lib.rs:3");
    }
}
