//! In-memory [`VectorIndex`] for tests and embedding hosts.
//!
//! Each namespace owns its own map, so a query can only ever see records
//! of the namespace it names. Vector search is brute-force over that map.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::Metric;
use crate::error::IndexError;
use crate::namespace::Namespace;

use super::{check_dims, rank_hits, IndexHit, IndexRecord, VectorIndex};

type RecordKey = (String, u32);

/// In-memory vector index.
pub struct InMemoryIndex {
    dims: usize,
    metric: Metric,
    namespaces: RwLock<HashMap<Namespace, BTreeMap<RecordKey, IndexRecord>>>,
}

impl InMemoryIndex {
    pub fn new(dims: usize, metric: Metric) -> Self {
        Self {
            dims,
            metric,
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    /// Namespaces that hold at least one record, sorted.
    pub fn namespaces(&self) -> Vec<Namespace> {
        let guard = match self.namespaces.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut keys: Vec<Namespace> = guard.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    async fn upsert(&self, namespace: &Namespace, records: &[IndexRecord]) -> Result<(), IndexError> {
        check_dims(records, self.dims)?;
        let mut guard = self
            .namespaces
            .write()
            .map_err(|_| IndexError::Write("index lock poisoned".to_string()))?;
        let partition = guard.entry(namespace.clone()).or_default();
        for record in records {
            let key = (
                record.metadata.file_path.clone(),
                record.metadata.sequence_index,
            );
            partition.insert(key, record.clone());
        }
        Ok(())
    }

    async fn query(
        &self,
        namespace: &Namespace,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<IndexHit>, IndexError> {
        if vector.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let guard = self
            .namespaces
            .read()
            .map_err(|_| IndexError::Query("index lock poisoned".to_string()))?;
        let Some(partition) = guard.get(namespace) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<IndexHit> = partition
            .values()
            .map(|r| IndexHit {
                id: r.id.clone(),
                score: self.metric.score(vector, &r.vector),
                metadata: r.metadata.clone(),
            })
            .collect();
        rank_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn count(&self, namespace: &Namespace) -> Result<usize, IndexError> {
        let guard = self
            .namespaces
            .read()
            .map_err(|_| IndexError::Query("index lock poisoned".to_string()))?;
        Ok(guard.get(namespace).map(|p| p.len()).unwrap_or(0))
    }
}
