use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema on a fresh connection and close it again.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // One row per chunk; the key makes re-ingestion an overwrite.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            namespace TEXT NOT NULL,
            file_path TEXT NOT NULL,
            sequence_index INTEGER NOT NULL,
            id TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            text TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (namespace, file_path, sequence_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Catalog of ingested namespaces
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS namespaces (
            namespace TEXT PRIMARY KEY,
            repository_url TEXT NOT NULL,
            normalized_url TEXT NOT NULL,
            commit_hash TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            chunk_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_namespaces_url ON namespaces(normalized_url, updated_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
