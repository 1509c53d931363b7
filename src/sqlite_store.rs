//! SQLite-backed upload and document stores.
//!
//! Both stores share one database but hand out independent transactions,
//! so a committed document transaction survives a failed upload
//! transaction. Unique-constraint failures are tagged with
//! [`UniqueViolation`] and lock contention with [`StoreBusy`] for the
//! handler to recognize.
//!
//! A document transaction stages its documents on disk while the index is
//! being correlated and writes them to the database in one go when flushed,
//! so concurrent workers are not locked out for the length of a pass.
//!
//! Document payloads are stored gzip-compressed and keyed by the SHA-256 of
//! their canonical encoding, so identical documents across uploads share
//! one row.

use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tempfile::NamedTempFile;
use tokio::sync::{Mutex, OwnedMutexGuard};

use scip_ingest_core::error::{StoreBusy, UniqueViolation};
use scip_ingest_core::models::{
    Package, PackageReference, ProcessedDocument, ProcessedMetadata, Repository, Upload,
    UploadState,
};
use scip_ingest_core::scip;
use scip_ingest_core::store::{DocumentStore, DocumentTransaction, UploadStore, UploadTransaction};

const UPLOAD_COLUMNS: &str = "id, repository_id, commit_sha, root, indexer, indexer_version, \
    content_type, upload_size, uncompressed_size, uploaded_at, state, failure_message, \
    process_after, num_failures";

fn timestamp(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn row_to_upload(row: &SqliteRow) -> Result<Upload> {
    let state: String = row.try_get("state")?;
    let process_after: Option<i64> = row.try_get("process_after")?;
    Ok(Upload {
        id: row.try_get("id")?,
        repository_id: row.try_get("repository_id")?,
        commit: row.try_get("commit_sha")?,
        root: row.try_get("root")?,
        indexer: row.try_get("indexer")?,
        indexer_version: row.try_get("indexer_version")?,
        content_type: row.try_get("content_type")?,
        upload_size: row.try_get("upload_size")?,
        uncompressed_size: row.try_get("uncompressed_size")?,
        uploaded_at: timestamp(row.try_get("uploaded_at")?),
        state: UploadState::parse(&state)
            .with_context(|| format!("Unknown upload state: {}", state))?,
        failure_message: row.try_get("failure_message")?,
        process_after: process_after.map(timestamp),
        num_failures: row.try_get("num_failures")?,
    })
}

/// Wraps a sqlx error, tagging unique-constraint failures.
fn tag_unique(err: sqlx::Error, what: impl FnOnce() -> String) -> anyhow::Error {
    if matches!(&err, sqlx::Error::Database(db) if db.is_unique_violation()) {
        return anyhow::Error::new(err).context(UniqueViolation(what()));
    }
    tag_busy(err)
}

/// Wraps a sqlx error, tagging `SQLITE_BUSY`/`SQLITE_LOCKED` (extended codes
/// included) and pool exhaustion with [`StoreBusy`].
fn tag_busy(err: sqlx::Error) -> anyhow::Error {
    let busy = match &err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map_or(false, |code| matches!(code & 0xff, 5 | 6)),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    };
    let tag = busy.then(|| StoreBusy(err.to_string()));
    let err = anyhow::Error::new(err);
    match tag {
        Some(tag) => err.context(tag),
        None => err,
    }
}

/// Fields of an upload supplied by the uploader.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub repository_id: i64,
    pub commit: String,
    pub root: String,
    pub indexer: String,
    pub indexer_version: String,
    pub content_type: String,
    pub upload_size: i64,
    pub uncompressed_size: Option<i64>,
}

/// Inserts a queued upload, returning its id.
pub async fn insert_upload(conn: &mut SqliteConnection, upload: &NewUpload) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO uploads (repository_id, commit_sha, root, indexer, indexer_version,
                             content_type, upload_size, uncompressed_size, uploaded_at, state)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'queued')
        RETURNING id
        "#,
    )
    .bind(upload.repository_id)
    .bind(&upload.commit)
    .bind(&upload.root)
    .bind(&upload.indexer)
    .bind(&upload.indexer_version)
    .bind(&upload.content_type)
    .bind(upload.upload_size)
    .bind(upload.uncompressed_size)
    .bind(Utc::now().timestamp())
    .fetch_one(&mut *conn)
    .await
    .context("Failed to insert upload")?;
    Ok(id)
}

/// An upload together with its repository name, for listings.
#[derive(Debug, Clone)]
pub struct UploadListing {
    pub upload: Upload,
    pub repository: String,
}

// ═══════════════════════════════════════════════════════════════════════
// Upload store
// ═══════════════════════════════════════════════════════════════════════

/// SQLite implementation of [`UploadStore`], plus the scheduler queries
/// the worker needs.
#[derive(Clone)]
pub struct SqliteUploadStore {
    pool: SqlitePool,
}

impl SqliteUploadStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the id of the named repository, creating it if needed.
    pub async fn ensure_repository(&self, name: &str) -> Result<i64> {
        sqlx::query("INSERT INTO repositories (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;
        let id: i64 = sqlx::query_scalar("SELECT id FROM repositories WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn upload(&self, id: i64) -> Result<Option<Upload>> {
        let row = sqlx::query(&format!("SELECT {} FROM uploads WHERE id = ?", UPLOAD_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_upload).transpose()
    }

    pub async fn list_uploads(&self) -> Result<Vec<UploadListing>> {
        let columns: Vec<String> = UPLOAD_COLUMNS
            .split(", ")
            .map(|c| format!("u.{}", c.trim()))
            .collect();
        let rows = sqlx::query(&format!(
            "SELECT {}, r.name AS repository_name FROM uploads u \
             JOIN repositories r ON r.id = u.repository_id ORDER BY u.id",
            columns.join(", ")
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(UploadListing {
                    upload: row_to_upload(row)?,
                    repository: row.try_get("repository_name")?,
                })
            })
            .collect()
    }

    /// Queued uploads ready to run, oldest first.
    pub async fn queued_candidates(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Upload>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM uploads WHERE state = 'queued' \
             AND (process_after IS NULL OR process_after <= ?) \
             ORDER BY uploaded_at, id LIMIT ?",
            UPLOAD_COLUMNS
        ))
        .bind(now.timestamp())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_upload).collect()
    }

    /// Moves a queued upload to processing. Returns `false` if another
    /// worker got there first.
    pub async fn claim(&self, id: i64, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE uploads SET state = 'processing', started_at = ?, worker_id = ? \
             WHERE id = ? AND state = 'queued'",
        )
        .bind(Utc::now().timestamp())
        .bind(worker_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Completes an upload. A completed upload with the same identity that
    /// finished in the meantime is soft-deleted in the same transaction, so
    /// the last upload to complete wins.
    pub async fn mark_completed(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE uploads SET state = 'deleted'
            WHERE state = 'completed' AND id != ?1
              AND (repository_id, commit_sha, root, indexer) =
                  (SELECT repository_id, commit_sha, root, indexer FROM uploads WHERE id = ?1)
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE uploads SET state = 'completed', finished_at = ?, failure_message = NULL \
             WHERE id = ?",
        )
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn mark_errored(&self, id: i64, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE uploads SET state = 'errored', finished_at = ?, failure_message = ?, \
             num_failures = num_failures + 1 WHERE id = ?",
        )
        .bind(Utc::now().timestamp())
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns a processing upload to the queue without counting a failure.
    pub async fn reset_to_queued(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE uploads SET state = 'queued', started_at = NULL, worker_id = NULL \
             WHERE id = ? AND state = 'processing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Requeues uploads left in processing by a worker that went away.
    pub async fn reset_stalled(&self, worker_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE uploads SET state = 'queued', started_at = NULL, worker_id = NULL \
             WHERE state = 'processing' AND (worker_id IS NULL OR worker_id != ?)",
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn packages(&self, upload_id: i64) -> Result<Vec<Package>> {
        let rows = sqlx::query(
            "SELECT scheme, manager, name, version FROM packages WHERE upload_id = ? \
             ORDER BY scheme, manager, name, version",
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_package).collect()
    }

    pub async fn references(&self, upload_id: i64) -> Result<Vec<PackageReference>> {
        let rows = sqlx::query(
            "SELECT scheme, manager, name, version FROM package_references WHERE upload_id = ? \
             ORDER BY scheme, manager, name, version",
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok(PackageReference { package: row_to_package(row)? }))
            .collect()
    }

    pub async fn dependency_sync_jobs(&self, upload_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dependency_sync_jobs WHERE upload_id = ?")
                .bind(upload_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Dirty token of a repository, or `None` if it was never marked.
    pub async fn dirty_token(&self, repository_id: i64) -> Result<Option<i64>> {
        let token: Option<i64> =
            sqlx::query_scalar("SELECT dirty_token FROM dirty_repositories WHERE repository_id = ?")
                .bind(repository_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(token)
    }

    pub async fn commit_date(
        &self,
        repository_id: i64,
        commit: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let ts: Option<i64> = sqlx::query_scalar(
            "SELECT committed_at FROM commit_dates WHERE repository_id = ? AND commit_sha = ?",
        )
        .bind(repository_id)
        .bind(commit)
        .fetch_optional(&self.pool)
        .await?;
        Ok(ts.map(timestamp))
    }
}

fn row_to_package(row: &SqliteRow) -> Result<Package> {
    Ok(Package {
        scheme: row.try_get("scheme")?,
        manager: row.try_get("manager")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
    })
}

#[async_trait]
impl UploadStore for SqliteUploadStore {
    async fn repository(&self, repository_id: i64) -> Result<Option<Repository>> {
        let row = sqlx::query("SELECT id, name FROM repositories WHERE id = ?")
            .bind(repository_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(Repository {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            })
        })
        .transpose()
    }

    async fn update_commit_date(
        &self,
        repository_id: i64,
        commit: &str,
        date: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO commit_dates (repository_id, commit_sha, committed_at)
            VALUES (?, ?, ?)
            ON CONFLICT(repository_id, commit_sha) DO UPDATE SET
                committed_at = excluded.committed_at
            "#,
        )
        .bind(repository_id)
        .bind(commit)
        .bind(date.timestamp())
        .execute(&self.pool)
        .await
        .map_err(tag_busy)?;
        Ok(())
    }

    async fn requeue(&self, upload_id: i64, not_before: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE uploads SET state = 'queued', process_after = ?, started_at = NULL, \
             worker_id = NULL WHERE id = ?",
        )
        .bind(not_before.timestamp())
        .bind(upload_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transact(&self) -> Result<Box<dyn UploadTransaction>> {
        let tx = self.pool.begin().await.map_err(tag_busy)?;
        Ok(Box::new(SqliteUploadTransaction { tx }))
    }
}

struct SqliteUploadTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl SqliteUploadTransaction {
    async fn replace_packages(
        &mut self,
        table: &str,
        upload_id: i64,
        packages: impl Iterator<Item = &Package> + Send,
    ) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE upload_id = ?", table))
            .bind(upload_id)
            .execute(&mut *self.tx)
            .await
            .map_err(tag_busy)?;

        let insert = format!(
            "INSERT INTO {} (upload_id, scheme, manager, name, version) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT DO NOTHING",
            table
        );
        for package in packages {
            sqlx::query(&insert)
                .bind(upload_id)
                .bind(&package.scheme)
                .bind(&package.manager)
                .bind(&package.name)
                .bind(&package.version)
                .execute(&mut *self.tx)
                .await
                .map_err(tag_busy)?;
        }
        Ok(())
    }
}

#[async_trait]
impl UploadTransaction for SqliteUploadTransaction {
    async fn delete_overlapping_uploads(&mut self, upload: &Upload) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE uploads SET state = 'deleted'
            WHERE repository_id = ? AND commit_sha = ? AND root = ? AND indexer = ?
              AND state = 'completed' AND id != ?
            "#,
        )
        .bind(upload.repository_id)
        .bind(&upload.commit)
        .bind(&upload.root)
        .bind(&upload.indexer)
        .bind(upload.id)
        .execute(&mut *self.tx)
        .await
        .map_err(tag_busy)?;
        Ok(result.rows_affected())
    }

    async fn update_packages(&mut self, upload_id: i64, packages: &[Package]) -> Result<()> {
        self.replace_packages("packages", upload_id, packages.iter())
            .await
    }

    async fn update_package_references(
        &mut self,
        upload_id: i64,
        references: &[PackageReference],
    ) -> Result<()> {
        self.replace_packages(
            "package_references",
            upload_id,
            references.iter().map(|r| &r.package),
        )
        .await
    }

    async fn insert_dependency_sync_job(&mut self, upload_id: i64) -> Result<()> {
        sqlx::query("INSERT INTO dependency_sync_jobs (upload_id, queued_at) VALUES (?, ?)")
            .bind(upload_id)
            .bind(Utc::now().timestamp())
            .execute(&mut *self.tx)
            .await
            .map_err(tag_busy)?;
        Ok(())
    }

    async fn set_repository_dirty(&mut self, repository_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dirty_repositories (repository_id, dirty_token, update_token, updated_at)
            VALUES (?, 1, 0, ?)
            ON CONFLICT(repository_id) DO UPDATE SET
                dirty_token = dirty_token + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(repository_id)
        .bind(Utc::now().timestamp())
        .execute(&mut *self.tx)
        .await
        .map_err(tag_busy)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(tag_busy)?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Document store
// ═══════════════════════════════════════════════════════════════════════

/// SQLite implementation of [`DocumentStore`].
///
/// Clones share one write lock, so transactions of one store write to the
/// database one at a time.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
    staging_dir: Option<PathBuf>,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
            staging_dir: None,
        }
    }

    /// Stages documents under `dir` instead of the system temp directory.
    pub fn with_staging_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.staging_dir = dir;
        self
    }

    pub async fn metadata(&self, upload_id: i64) -> Result<Option<ProcessedMetadata>> {
        let row = sqlx::query(
            "SELECT text_document_encoding, tool_name, tool_version, tool_arguments, \
             protocol_version FROM upload_metadata WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let arguments: String = row.try_get("tool_arguments")?;
            Ok(ProcessedMetadata {
                text_document_encoding: row.try_get("text_document_encoding")?,
                tool_name: row.try_get("tool_name")?,
                tool_version: row.try_get("tool_version")?,
                tool_arguments: serde_json::from_str(&arguments)
                    .context("Failed to parse tool arguments")?,
                protocol_version: row.try_get("protocol_version")?,
            })
        })
        .transpose()
    }

    /// Documents of an upload, ordered by path.
    pub async fn documents(&self, upload_id: i64) -> Result<Vec<ProcessedDocument>> {
        let rows = sqlx::query(
            "SELECT d.path, p.payload FROM upload_documents d \
             JOIN document_payloads p ON p.hash = d.payload_hash \
             WHERE d.upload_id = ? ORDER BY d.path",
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let path: String = row.try_get("path")?;
                let payload: Vec<u8> = row.try_get("payload")?;
                Ok(ProcessedDocument {
                    payload: decode_payload(&payload)
                        .with_context(|| format!("Failed to decode document {}", path))?,
                    path,
                })
            })
            .collect()
    }

    /// Number of distinct stored payloads.
    pub async fn payload_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_payloads")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Hash and compressed bytes of a canonical document.
fn encode_payload(document: &scip::Document) -> Result<(String, Vec<u8>)> {
    let bytes = document.encode_to_vec();

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let hash = format!("{:x}", hasher.finalize());

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&bytes)?;
    Ok((hash, encoder.finish()?))
}

fn decode_payload(compressed: &[u8]) -> Result<scip::Document> {
    let mut bytes = Vec::new();
    MultiGzDecoder::new(compressed).read_to_end(&mut bytes)?;
    Ok(scip::Document::decode(bytes.as_slice())?)
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn transact(&self) -> Result<Box<dyn DocumentTransaction>> {
        Ok(Box::new(SqliteDocumentTransaction {
            store: self.clone(),
            metadata: None,
            staged: None,
            staged_count: 0,
            tx: None,
            written: 0,
        }))
    }
}

/// Document transaction that stages encoded documents in a temporary file
/// and only touches the database from [`flush`](DocumentTransaction::flush)
/// on. SQLite has one writer at a time, so the write lock is held for the
/// bulk insert and commit, never while the index is still being read.
struct SqliteDocumentTransaction {
    store: SqliteDocumentStore,
    metadata: Option<(i64, ProcessedMetadata)>,
    staged: Option<BufWriter<NamedTempFile>>,
    staged_count: u64,
    tx: Option<(Transaction<'static, Sqlite>, OwnedMutexGuard<()>)>,
    written: u64,
}

impl SqliteDocumentTransaction {
    async fn metadata_exists(&self, upload_id: i64) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM upload_metadata WHERE upload_id = ?")
            .bind(upload_id)
            .fetch_optional(&self.store.pool)
            .await
            .map_err(tag_busy)?;
        Ok(row.is_some())
    }

    fn staging(&mut self) -> Result<&mut BufWriter<NamedTempFile>> {
        let staged = match self.staged.take() {
            Some(staged) => staged,
            None => {
                let file = match &self.store.staging_dir {
                    Some(dir) => NamedTempFile::new_in(dir),
                    None => NamedTempFile::new(),
                }
                .context("Failed to create document staging file")?;
                BufWriter::new(file)
            }
        };
        Ok(self.staged.insert(staged))
    }

    /// Takes the single-writer lock and opens the database transaction.
    async fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Ok(());
        }
        let guard = self.store.write_lock.clone().lock_owned().await;
        let tx = self.store.pool.begin().await.map_err(tag_busy)?;
        self.tx = Some((tx, guard));
        Ok(())
    }

    async fn write_staged(&mut self) -> Result<()> {
        self.begin().await?;
        let Some((tx, _)) = self.tx.as_mut() else {
            return Ok(());
        };

        if let Some((upload_id, metadata)) = self.metadata.take() {
            insert_metadata_row(tx, upload_id, &metadata).await?;
        }

        let Some(staged) = self.staged.take() else {
            return Ok(());
        };
        let mut file = staged
            .into_inner()
            .map_err(|err| err.into_error())
            .context("Failed to write document staging file")?;
        file.seek(SeekFrom::Start(0))
            .context("Failed to rewind document staging file")?;
        let mut reader = BufReader::new(file);

        for _ in 0..std::mem::take(&mut self.staged_count) {
            let record = StagedDocument::read_from(&mut reader)
                .context("Failed to read document staging file")?;
            sqlx::query(
                "INSERT INTO document_payloads (hash, payload) VALUES (?, ?) \
                 ON CONFLICT(hash) DO NOTHING",
            )
            .bind(&record.hash)
            .bind(&record.payload)
            .execute(&mut **tx)
            .await
            .map_err(tag_busy)?;
            sqlx::query(
                "INSERT INTO upload_documents (upload_id, path, payload_hash) VALUES (?, ?, ?)",
            )
            .bind(record.upload_id)
            .bind(&record.path)
            .bind(&record.hash)
            .execute(&mut **tx)
            .await
            .map_err(|err| {
                tag_unique(err, || {
                    format!("document {} of upload {}", record.path, record.upload_id)
                })
            })?;
            self.written += 1;
        }
        Ok(())
    }
}

async fn insert_metadata_row(
    tx: &mut Transaction<'static, Sqlite>,
    upload_id: i64,
    metadata: &ProcessedMetadata,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO upload_metadata (upload_id, text_document_encoding, tool_name,
                                     tool_version, tool_arguments, protocol_version)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(upload_id)
    .bind(&metadata.text_document_encoding)
    .bind(&metadata.tool_name)
    .bind(&metadata.tool_version)
    .bind(serde_json::to_string(&metadata.tool_arguments)?)
    .bind(metadata.protocol_version)
    .execute(&mut **tx)
    .await
    .map_err(|err| tag_unique(err, || format!("metadata of upload {}", upload_id)))?;
    Ok(())
}

/// One encoded document in the staging file.
///
/// Layout: upload id (i64 LE), then path, hash and compressed payload, each
/// as a u32 LE length followed by the bytes.
struct StagedDocument {
    upload_id: i64,
    path: String,
    hash: String,
    payload: Vec<u8>,
}

impl StagedDocument {
    fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&self.upload_id.to_le_bytes())?;
        for field in [self.path.as_bytes(), self.hash.as_bytes(), self.payload.as_slice()] {
            let len = u32::try_from(field.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "staged field too large"))?;
            out.write_all(&len.to_le_bytes())?;
            out.write_all(field)?;
        }
        Ok(())
    }

    fn read_from<R: Read>(input: &mut R) -> io::Result<Self> {
        let mut id = [0u8; 8];
        input.read_exact(&mut id)?;
        let path = read_field(input)?;
        let hash = read_field(input)?;
        let payload = read_field(input)?;
        let text = |bytes: Vec<u8>| {
            String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        };
        Ok(Self {
            upload_id: i64::from_le_bytes(id),
            path: text(path)?,
            hash: text(hash)?,
            payload,
        })
    }
}

fn read_field<R: Read>(input: &mut R) -> io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    input.read_exact(&mut len)?;
    let mut field = vec![0u8; u32::from_le_bytes(len) as usize];
    input.read_exact(&mut field)?;
    Ok(field)
}

#[async_trait]
impl DocumentTransaction for SqliteDocumentTransaction {
    async fn insert_metadata(
        &mut self,
        upload_id: i64,
        metadata: &ProcessedMetadata,
    ) -> Result<()> {
        if let Some((tx, _)) = self.tx.as_mut() {
            return insert_metadata_row(tx, upload_id, metadata).await;
        }
        if self.metadata_exists(upload_id).await? {
            return Err(anyhow::anyhow!("metadata row already exists")
                .context(UniqueViolation(format!("metadata of upload {}", upload_id))));
        }
        self.metadata = Some((upload_id, metadata.clone()));
        Ok(())
    }

    async fn insert_document(
        &mut self,
        upload_id: i64,
        document: ProcessedDocument,
    ) -> Result<()> {
        let (hash, payload) = encode_payload(&document.payload)?;
        let record = StagedDocument {
            upload_id,
            path: document.path,
            hash,
            payload,
        };
        record
            .write_to(self.staging()?)
            .context("Failed to stage document")?;
        self.staged_count += 1;
        Ok(())
    }

    async fn flush(&mut self) -> Result<u64> {
        self.write_staged().await?;
        Ok(self.written)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.write_staged().await?;
        if let Some((tx, _guard)) = self.tx.take() {
            tx.commit().await.map_err(tag_busy)?;
        }
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        if let Some((tx, _guard)) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use scip_ingest_core::error::{is_store_busy, is_unique_violation};
    use scip_ingest_core::scip::Occurrence;
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::apply(&pool).await.unwrap();
        pool
    }

    async fn file_pool(dir: &std::path::Path, busy_timeout: Duration) -> SqlitePool {
        let options = SqliteConnectOptions::new()
            .filename(dir.join("store.sqlite"))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .unwrap();
        migrate::apply(&pool).await.unwrap();
        pool
    }

    fn document(path: &str, symbol: &str) -> ProcessedDocument {
        ProcessedDocument {
            path: path.to_string(),
            payload: scip::Document {
                occurrences: vec![Occurrence {
                    range: vec![1, 2, 3],
                    symbol: symbol.to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_identical_payloads_are_stored_once() {
        let pool = pool().await;
        let store = SqliteDocumentStore::new(pool);

        let mut tx = store.transact().await.unwrap();
        tx.insert_document(1, document("a.go", "x")).await.unwrap();
        tx.insert_document(2, document("b.go", "x")).await.unwrap();
        tx.insert_document(2, document("c.go", "y")).await.unwrap();
        assert_eq!(tx.flush().await.unwrap(), 3);
        tx.commit().await.unwrap();

        assert_eq!(store.payload_count().await.unwrap(), 2);
        let docs = store.documents(2).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0], document("b.go", "x"));
    }

    #[tokio::test]
    async fn test_duplicate_rows_are_tagged_unique() {
        let pool = pool().await;
        let store = SqliteDocumentStore::new(pool);

        let mut tx = store.transact().await.unwrap();
        tx.insert_metadata(1, &ProcessedMetadata::default()).await.unwrap();
        tx.insert_document(1, document("a.go", "x")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.transact().await.unwrap();
        let err = tx
            .insert_metadata(1, &ProcessedMetadata::default())
            .await
            .unwrap_err();
        assert!(is_unique_violation(&err));
        tx.rollback().await.unwrap();

        let mut tx = store.transact().await.unwrap();
        tx.insert_document(1, document("a.go", "z")).await.unwrap();
        let err = tx.flush().await.unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[tokio::test]
    async fn test_staged_document_transaction_leaves_writers_unblocked() {
        let tmp = TempDir::new().unwrap();
        let staging = tmp.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let pool = file_pool(tmp.path(), Duration::from_secs(30)).await;
        let documents =
            SqliteDocumentStore::new(pool.clone()).with_staging_dir(Some(staging.clone()));
        let uploads = SqliteUploadStore::new(pool);
        let repo = uploads.ensure_repository("github.com/acme/api").await.unwrap();

        let mut tx = documents.transact().await.unwrap();
        tx.insert_metadata(1, &ProcessedMetadata::default()).await.unwrap();
        tx.insert_document(1, document("a.go", "x")).await.unwrap();
        tx.insert_document(1, document("b.go", "y")).await.unwrap();
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 1);

        let write = uploads.update_commit_date(repo, "abc", Utc::now());
        tokio::time::timeout(Duration::from_secs(3), write)
            .await
            .expect("writer blocked by open document transaction")
            .unwrap();

        assert_eq!(tx.flush().await.unwrap(), 2);
        tx.commit().await.unwrap();
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
        assert!(documents.metadata(1).await.unwrap().is_some());
        assert_eq!(
            documents.documents(1).await.unwrap(),
            vec![document("a.go", "x"), document("b.go", "y")]
        );
    }

    #[tokio::test]
    async fn test_rolled_back_document_transaction_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let pool = file_pool(tmp.path(), Duration::from_secs(30)).await;
        let documents = SqliteDocumentStore::new(pool);

        let mut tx = documents.transact().await.unwrap();
        tx.insert_metadata(3, &ProcessedMetadata::default()).await.unwrap();
        tx.insert_document(3, document("a.go", "x")).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(documents.metadata(3).await.unwrap().is_none());
        assert_eq!(documents.payload_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lock_contention_is_tagged_busy() {
        let tmp = TempDir::new().unwrap();
        let pool = file_pool(tmp.path(), Duration::from_millis(50)).await;
        let uploads = SqliteUploadStore::new(pool.clone());
        let repo = uploads.ensure_repository("github.com/acme/api").await.unwrap();

        let mut holder = pool.begin().await.unwrap();
        sqlx::query("UPDATE repositories SET name = name WHERE id = ?")
            .bind(repo)
            .execute(&mut *holder)
            .await
            .unwrap();

        let err = uploads
            .update_commit_date(repo, "abc", Utc::now())
            .await
            .unwrap_err();
        assert!(is_store_busy(&err));
        assert!(!is_unique_violation(&err));

        holder.rollback().await.unwrap();
        uploads
            .update_commit_date(repo, "abc", Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_overlapping_completed_uploads_are_soft_deleted() {
        let pool = pool().await;
        let store = SqliteUploadStore::new(pool.clone());
        let repo = store.ensure_repository("github.com/acme/api").await.unwrap();

        let new = NewUpload {
            repository_id: repo,
            commit: "abc".into(),
            root: "".into(),
            indexer: "scip-go".into(),
            indexer_version: "0.1.0".into(),
            content_type: scip_ingest_core::models::CONTENT_TYPE_SCIP.into(),
            upload_size: 10,
            uncompressed_size: None,
        };
        let mut conn = pool.acquire().await.unwrap();
        let first = insert_upload(&mut conn, &new).await.unwrap();
        let second = insert_upload(&mut conn, &new).await.unwrap();
        drop(conn);
        store.mark_completed(first).await.unwrap();

        let upload = store.upload(second).await.unwrap().unwrap();
        let mut tx = store.transact().await.unwrap();
        assert_eq!(tx.delete_overlapping_uploads(&upload).await.unwrap(), 1);
        tx.commit().await.unwrap();
        let first_upload = store.upload(first).await.unwrap().unwrap();
        assert_eq!(first_upload.state, UploadState::Deleted);

        // Completing races with another completion: the later one wins.
        sqlx::query("UPDATE uploads SET state = 'completed' WHERE id = ?")
            .bind(first)
            .execute(&pool)
            .await
            .unwrap();
        store.mark_completed(second).await.unwrap();
        let first_upload = store.upload(first).await.unwrap().unwrap();
        assert_eq!(first_upload.state, UploadState::Deleted);
        let second_upload = store.upload(second).await.unwrap().unwrap();
        assert_eq!(second_upload.state, UploadState::Completed);
    }

    #[tokio::test]
    async fn test_rolled_back_upload_transaction_writes_nothing() {
        let pool = pool().await;
        let store = SqliteUploadStore::new(pool);
        let package = Package {
            scheme: "scip-go".into(),
            manager: "gomod".into(),
            name: "github.com/acme/api".into(),
            version: "v1.0.0".into(),
        };

        let mut tx = store.transact().await.unwrap();
        tx.update_packages(5, &[package.clone()]).await.unwrap();
        tx.set_repository_dirty(1).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(store.packages(5).await.unwrap().is_empty());
        assert_eq!(store.dirty_token(1).await.unwrap(), None);

        for _ in 0..2 {
            let mut tx = store.transact().await.unwrap();
            tx.update_packages(5, &[package.clone()]).await.unwrap();
            tx.set_repository_dirty(1).await.unwrap();
            tx.commit().await.unwrap();
        }
        assert_eq!(store.packages(5).await.unwrap(), vec![package]);
        assert_eq!(store.dirty_token(1).await.unwrap(), Some(2));
    }
}
