use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Create repositories table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create uploads table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS uploads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            repository_id INTEGER NOT NULL,
            commit_sha TEXT NOT NULL,
            root TEXT NOT NULL DEFAULT '',
            indexer TEXT NOT NULL,
            indexer_version TEXT NOT NULL DEFAULT '',
            content_type TEXT NOT NULL,
            upload_size INTEGER NOT NULL,
            uncompressed_size INTEGER,
            uploaded_at INTEGER NOT NULL,
            state TEXT NOT NULL DEFAULT 'queued',
            failure_message TEXT,
            process_after INTEGER,
            num_failures INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER,
            finished_at INTEGER,
            worker_id TEXT,
            FOREIGN KEY (repository_id) REFERENCES repositories(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one completed upload per (repository, commit, root, indexer)
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_uploads_completed_identity
        ON uploads(repository_id, commit_sha, root, indexer)
        WHERE state = 'completed'
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_uploads_state ON uploads(state, process_after)")
        .execute(pool)
        .await?;

    // Create commit dates table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS commit_dates (
            repository_id INTEGER NOT NULL,
            commit_sha TEXT NOT NULL,
            committed_at INTEGER NOT NULL,
            PRIMARY KEY (repository_id, commit_sha)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create package tables
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS packages (
            upload_id INTEGER NOT NULL,
            scheme TEXT NOT NULL,
            manager TEXT NOT NULL,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            PRIMARY KEY (upload_id, scheme, manager, name, version)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS package_references (
            upload_id INTEGER NOT NULL,
            scheme TEXT NOT NULL,
            manager TEXT NOT NULL,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            PRIMARY KEY (upload_id, scheme, manager, name, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create downstream signal tables
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dependency_sync_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            upload_id INTEGER NOT NULL,
            state TEXT NOT NULL DEFAULT 'queued',
            queued_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dirty_repositories (
            repository_id INTEGER PRIMARY KEY,
            dirty_token INTEGER NOT NULL DEFAULT 0,
            update_token INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create document store tables
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS upload_metadata (
            upload_id INTEGER PRIMARY KEY,
            text_document_encoding TEXT NOT NULL,
            tool_name TEXT NOT NULL,
            tool_version TEXT NOT NULL,
            tool_arguments TEXT NOT NULL DEFAULT '[]',
            protocol_version INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_payloads (
            hash TEXT PRIMARY KEY,
            payload BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS upload_documents (
            upload_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            payload_hash TEXT NOT NULL,
            PRIMARY KEY (upload_id, path),
            FOREIGN KEY (payload_hash) REFERENCES document_payloads(hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
