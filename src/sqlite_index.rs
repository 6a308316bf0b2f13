//! SQLite-backed [`VectorIndex`] and the namespace catalog.
//!
//! Vectors are stored as little-endian `f32` BLOBs in `chunk_vectors`,
//! keyed by `(namespace, file_path, sequence_index)`. Similarity search is
//! brute force over the rows of a single namespace: every query carries
//! `WHERE namespace = ?`, so records of other namespaces are never read.
//!
//! Every call runs under a timeout and reports a typed [`IndexError`].

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use repo_guide_core::embedding::{blob_to_vec, vec_to_blob, Metric};
use repo_guide_core::error::IndexError;
use repo_guide_core::models::ChunkMetadata;
use repo_guide_core::namespace::{normalize_repository_url, Namespace};
use repo_guide_core::store::{check_dims, rank_hits, IndexHit, IndexRecord, VectorIndex};

use crate::config::Config;
use crate::db;
use crate::migrate;

/// SQLite implementation of [`VectorIndex`].
pub struct SqliteIndex {
    pool: SqlitePool,
    dims: usize,
    metric: Metric,
    query_timeout: Duration,
    write_timeout: Duration,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool, dims: usize, config: &Config) -> Self {
        Self {
            pool,
            dims,
            metric: config.index.metric,
            query_timeout: Duration::from_secs(config.index.query_timeout_secs),
            write_timeout: Duration::from_secs(config.index.write_timeout_secs),
        }
    }

    /// Connect, make sure the schema exists and wrap the pool.
    pub async fn open(config: &Config, dims: usize) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        Ok(Self::new(pool, dims, config))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or refresh the catalog entry for an ingestion.
    pub async fn record_namespace(&self, entry: &NamespaceEntry) -> Result<(), IndexError> {
        let pool = &self.pool;
        bounded("catalog write", self.write_timeout, async move {
            sqlx::query(
                r#"
                INSERT INTO namespaces (namespace, repository_url, normalized_url, commit_hash,
                                        model, dims, chunk_count, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(namespace) DO UPDATE SET
                    repository_url = excluded.repository_url,
                    model = excluded.model,
                    dims = excluded.dims,
                    chunk_count = excluded.chunk_count,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(entry.namespace.as_str())
            .bind(&entry.repository_url)
            .bind(&entry.normalized_url)
            .bind(&entry.commit)
            .bind(&entry.model)
            .bind(entry.dims as i64)
            .bind(entry.chunk_count as i64)
            .bind(entry.created_at)
            .bind(entry.updated_at)
            .execute(pool)
            .await
            .map_err(|e| IndexError::Write(e.to_string()))?;
            Ok::<_, IndexError>(())
        })
        .await
    }

    /// Delete every row of `namespace` whose `(file_path, sequence_index)`
    /// is not in `keep`. Returns the number of rows removed.
    pub async fn retain_only(
        &self,
        namespace: &Namespace,
        keep: &HashSet<(String, u32)>,
    ) -> Result<usize, IndexError> {
        let pool = &self.pool;
        bounded("prune", self.write_timeout, async move {
            let write_err = |e: sqlx::Error| IndexError::Write(e.to_string());
            let mut tx = pool.begin().await.map_err(write_err)?;
            let rows = sqlx::query(
                "SELECT file_path, sequence_index FROM chunk_vectors WHERE namespace = ?",
            )
            .bind(namespace.as_str())
            .fetch_all(&mut *tx)
            .await
            .map_err(write_err)?;

            let mut removed = 0usize;
            for row in &rows {
                let file_path: String = row.try_get("file_path").map_err(write_err)?;
                let seq = row.try_get::<i64, _>("sequence_index").map_err(write_err)? as u32;
                if keep.contains(&(file_path.clone(), seq)) {
                    continue;
                }
                sqlx::query(
                    "DELETE FROM chunk_vectors
                     WHERE namespace = ? AND file_path = ? AND sequence_index = ?",
                )
                .bind(namespace.as_str())
                .bind(&file_path)
                .bind(seq as i64)
                .execute(&mut *tx)
                .await
                .map_err(write_err)?;
                removed += 1;
            }
            tx.commit().await.map_err(write_err)?;
            Ok::<_, IndexError>(removed)
        })
        .await
    }

    /// All catalog entries, most recently updated first.
    pub async fn list_namespaces(&self) -> Result<Vec<NamespaceEntry>, IndexError> {
        let pool = &self.pool;
        bounded("catalog read", self.query_timeout, async move {
            let rows = sqlx::query(
                "SELECT namespace, repository_url, normalized_url, commit_hash, model, dims,
                        chunk_count, created_at, updated_at
                 FROM namespaces ORDER BY updated_at DESC, namespace ASC",
            )
            .fetch_all(pool)
            .await
            .map_err(|e| IndexError::Query(e.to_string()))?;
            rows.iter().map(entry_from_row).collect::<Result<Vec<_>, IndexError>>()
        })
        .await
    }

    /// The newest ingestion of `repository_url`, matched on its normalized
    /// form.
    pub async fn latest_for_url(
        &self,
        repository_url: &str,
    ) -> Result<Option<NamespaceEntry>, IndexError> {
        let normalized = normalize_repository_url(repository_url);
        let pool = &self.pool;
        bounded("catalog read", self.query_timeout, async move {
            let row = sqlx::query(
                "SELECT namespace, repository_url, normalized_url, commit_hash, model, dims,
                        chunk_count, created_at, updated_at
                 FROM namespaces WHERE normalized_url = ?
                 ORDER BY updated_at DESC LIMIT 1",
            )
            .bind(&normalized)
            .fetch_optional(pool)
            .await
            .map_err(|e| IndexError::Query(e.to_string()))?;
            row.as_ref().map(entry_from_row).transpose()
        })
        .await
    }

    pub async fn get_namespace(&self, key: &str) -> Result<Option<NamespaceEntry>, IndexError> {
        let pool = &self.pool;
        bounded("catalog read", self.query_timeout, async move {
            let row = sqlx::query(
                "SELECT namespace, repository_url, normalized_url, commit_hash, model, dims,
                        chunk_count, created_at, updated_at
                 FROM namespaces WHERE namespace = ?",
            )
            .bind(key)
            .fetch_optional(pool)
            .await
            .map_err(|e| IndexError::Query(e.to_string()))?;
            row.as_ref().map(entry_from_row).transpose()
        })
        .await
    }
}

/// One ingested `(repository, commit)` as recorded in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamespaceEntry {
    pub namespace: Namespace,
    pub repository_url: String,
    pub normalized_url: String,
    pub commit: String,
    pub model: String,
    pub dims: usize,
    pub chunk_count: usize,
    /// Unix seconds.
    pub created_at: i64,
    pub updated_at: i64,
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<NamespaceEntry, IndexError> {
    let get_err = |e: sqlx::Error| IndexError::Query(e.to_string());
    Ok(NamespaceEntry {
        namespace: Namespace::from_key(row.try_get::<String, _>("namespace").map_err(get_err)?),
        repository_url: row.try_get("repository_url").map_err(get_err)?,
        normalized_url: row.try_get("normalized_url").map_err(get_err)?,
        commit: row.try_get("commit_hash").map_err(get_err)?,
        model: row.try_get("model").map_err(get_err)?,
        dims: row.try_get::<i64, _>("dims").map_err(get_err)? as usize,
        chunk_count: row.try_get::<i64, _>("chunk_count").map_err(get_err)? as usize,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}

/// Run `fut` with a deadline, mapping expiry to [`IndexError::Timeout`].
async fn bounded<T, F>(operation: &'static str, after: Duration, fut: F) -> Result<T, IndexError>
where
    F: Future<Output = Result<T, IndexError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(IndexError::Timeout { operation, after }),
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    async fn upsert(&self, namespace: &Namespace, records: &[IndexRecord]) -> Result<(), IndexError> {
        check_dims(records, self.dims)?;
        if records.is_empty() {
            return Ok(());
        }
        let pool = &self.pool;
        bounded("write", self.write_timeout, async move {
            let write_err = |e: sqlx::Error| IndexError::Write(e.to_string());
            let mut tx = pool.begin().await.map_err(write_err)?;
            for record in records {
                let meta = &record.metadata;
                sqlx::query(
                    r#"
                    INSERT INTO chunk_vectors (namespace, file_path, sequence_index, id,
                                               start_line, end_line, text, dims, embedding)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(namespace, file_path, sequence_index) DO UPDATE SET
                        id = excluded.id,
                        start_line = excluded.start_line,
                        end_line = excluded.end_line,
                        text = excluded.text,
                        dims = excluded.dims,
                        embedding = excluded.embedding
                    "#,
                )
                .bind(namespace.as_str())
                .bind(&meta.file_path)
                .bind(meta.sequence_index as i64)
                .bind(&record.id)
                .bind(meta.start_line as i64)
                .bind(meta.end_line as i64)
                .bind(&meta.text)
                .bind(record.vector.len() as i64)
                .bind(vec_to_blob(&record.vector))
                .execute(&mut *tx)
                .await
                .map_err(write_err)?;
            }
            tx.commit().await.map_err(write_err)?;
            debug!(namespace = %namespace, records = records.len(), "index write committed");
            Ok::<_, IndexError>(())
        })
        .await
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
        let pool = &self.pool;
        let metric = self.metric;
        let dims = self.dims as i64;
        bounded("query", self.query_timeout, async move {
            let query_err = |e: sqlx::Error| IndexError::Query(e.to_string());
            let rows = sqlx::query(
                "SELECT id, file_path, sequence_index, start_line, end_line, text, embedding
                 FROM chunk_vectors WHERE namespace = ? AND dims = ?",
            )
            .bind(namespace.as_str())
            .bind(dims)
            .fetch_all(pool)
            .await
            .map_err(query_err)?;

            let mut hits = Vec::with_capacity(rows.len());
            for row in &rows {
                let blob: Vec<u8> = row.try_get("embedding").map_err(query_err)?;
                let stored = blob_to_vec(&blob);
                hits.push(IndexHit {
                    id: row.try_get("id").map_err(query_err)?,
                    score: metric.score(vector, &stored),
                    metadata: ChunkMetadata {
                        file_path: row.try_get("file_path").map_err(query_err)?,
                        start_line: row.try_get::<i64, _>("start_line").map_err(query_err)? as u32,
                        end_line: row.try_get::<i64, _>("end_line").map_err(query_err)? as u32,
                        sequence_index: row.try_get::<i64, _>("sequence_index").map_err(query_err)?
                            as u32,
                        text: row.try_get("text").map_err(query_err)?,
                    },
                });
            }
            rank_hits(&mut hits);
            hits.truncate(k);
            Ok::<_, IndexError>(hits)
        })
        .await
    }

    async fn count(&self, namespace: &Namespace) -> Result<usize, IndexError> {
        let pool = &self.pool;
        bounded("count", self.query_timeout, async move {
            let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE namespace = ?")
                .bind(namespace.as_str())
                .fetch_one(pool)
                .await
                .map_err(|e| IndexError::Query(e.to_string()))?;
            Ok::<_, IndexError>(n as usize)
        })
        .await
    }
}

/// Render a unix timestamp as an ISO-8601 UTC string.
pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use repo_guide_core::store::record_id;
    use tempfile::TempDir;

    async fn open(tmp: &TempDir, dims: usize) -> SqliteIndex {
        let mut config = Config::default();
        config.db.path = tmp.path().join("data").join("index.sqlite");
        SqliteIndex::open(&config, dims).await.unwrap()
    }

    fn record(ns: &Namespace, path: &str, seq: u32, vector: Vec<f32>, text: &str) -> IndexRecord {
        IndexRecord {
            id: record_id(ns, path, seq),
            vector,
            metadata: ChunkMetadata {
                file_path: path.to_string(),
                start_line: seq * 10 + 1,
                end_line: seq * 10 + 10,
                sequence_index: seq,
                text: text.to_string(),
            },
        }
    }

    fn entry(ns: &str, url: &str, updated_at: i64) -> NamespaceEntry {
        NamespaceEntry {
            namespace: Namespace::from_key(ns),
            repository_url: url.to_string(),
            normalized_url: normalize_repository_url(url),
            commit: "0".repeat(40),
            model: "test".to_string(),
            dims: 3,
            chunk_count: 1,
            created_at: updated_at,
            updated_at,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_query_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp, 3).await;
        let ns = Namespace::from_key("ns");
        index
            .upsert(
                &ns,
                &[
                    record(&ns, "src/a.rs", 0, vec![1.0, 0.0, 0.0], "alpha"),
                    record(&ns, "src/b.rs", 0, vec![0.0, 1.0, 0.0], "beta"),
                ],
            )
            .await
            .unwrap();

        let hits = index.query(&ns, &[0.9, 0.1, 0.0], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.file_path, "src/a.rs");
        assert_eq!(hits[0].metadata.text, "alpha");
        assert_eq!(
            (hits[0].metadata.start_line, hits[0].metadata.end_line),
            (1, 10)
        );
    }

    #[tokio::test]
    async fn test_retain_only_drops_unlisted_rows() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp, 2).await;
        let ns = Namespace::from_key("ns");
        let other = Namespace::from_key("other");
        index
            .upsert(
                &ns,
                &[
                    record(&ns, "a.rs", 0, vec![1.0, 0.0], "a0"),
                    record(&ns, "a.rs", 1, vec![1.0, 0.0], "a1"),
                    record(&ns, "b.rs", 0, vec![0.0, 1.0], "b0"),
                ],
            )
            .await
            .unwrap();
        index
            .upsert(&other, &[record(&other, "a.rs", 1, vec![1.0, 0.0], "x")])
            .await
            .unwrap();

        let keep: HashSet<(String, u32)> = [("a.rs".to_string(), 0), ("b.rs".to_string(), 0)]
            .into_iter()
            .collect();
        assert_eq!(index.retain_only(&ns, &keep).await.unwrap(), 1);
        assert_eq!(index.count(&ns).await.unwrap(), 2);
        assert_eq!(index.count(&other).await.unwrap(), 1);
        assert_eq!(index.retain_only(&ns, &keep).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_namespaces_never_mix() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp, 2).await;
        let a = Namespace::from_key("a");
        let b = Namespace::from_key("b");
        index
            .upsert(&a, &[record(&a, "a.rs", 0, vec![1.0, 0.0], "a")])
            .await
            .unwrap();
        index
            .upsert(&b, &[record(&b, "b.rs", 0, vec![1.0, 0.0], "b")])
            .await
            .unwrap();

        let hits = index.query(&a, &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.file_path, "a.rs");
        assert_eq!(index.count(&b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reupsert_overwrites() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp, 2).await;
        let ns = Namespace::from_key("ns");
        let first = vec![
            record(&ns, "a.rs", 0, vec![1.0, 0.0], "old"),
            record(&ns, "a.rs", 1, vec![0.0, 1.0], "other"),
        ];
        index.upsert(&ns, &first).await.unwrap();
        index.upsert(&ns, &first).await.unwrap();
        index
            .upsert(&ns, &[record(&ns, "a.rs", 0, vec![1.0, 0.0], "new")])
            .await
            .unwrap();

        assert_eq!(index.count(&ns).await.unwrap(), 2);
        let hits = index.query(&ns, &[1.0, 0.0], 1).await.unwrap();
        assert_eq!(hits[0].metadata.text, "new");
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp, 3).await;
        let ns = Namespace::from_key("ns");
        let err = index
            .upsert(&ns, &[record(&ns, "a.rs", 0, vec![1.0], "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));
        assert_eq!(index.count(&ns).await.unwrap(), 0);

        let err = index.query(&ns, &[1.0, 0.0], 5).await.unwrap_err();
        assert_eq!(
            err,
            IndexError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        );
    }

    #[tokio::test]
    async fn test_persists_across_connections() {
        let tmp = TempDir::new().unwrap();
        let ns = Namespace::from_key("ns");
        {
            let index = open(&tmp, 2).await;
            index
                .upsert(&ns, &[record(&ns, "a.rs", 0, vec![1.0, 0.0], "kept")])
                .await
                .unwrap();
            index.pool().close().await;
        }
        let index = open(&tmp, 2).await;
        assert_eq!(index.count(&ns).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_catalog_lists_newest_first_and_resolves_urls() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp, 3).await;
        index
            .record_namespace(&entry("old", "https://github.com/acme/widget.git", 100))
            .await
            .unwrap();
        index
            .record_namespace(&entry("new", "https://github.com/acme/widget", 200))
            .await
            .unwrap();
        index
            .record_namespace(&entry("other", "https://github.com/acme/gadget", 150))
            .await
            .unwrap();

        let keys: Vec<String> = index
            .list_namespaces()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.namespace.to_string())
            .collect();
        assert_eq!(keys, vec!["new", "other", "old"]);

        let latest = index
            .latest_for_url("git@github.com:acme/widget.git")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.namespace.as_str(), "new");
        assert!(index.get_namespace("missing").await.unwrap().is_none());
    }

    #[test]
    fn test_format_ts_iso() {
        assert_eq!(format_ts_iso(0), "1970-01-01T00:00:00Z");
    }
}
