//! Processing of one dequeued upload into durable index state.
//!
//! [`UploadHandler::handle`] runs these steps in order:
//!
//! 1. Resolve the owning repository.
//! 2. Resolve the commit. A repository still cloning or a commit not yet
//!    visible requeues the upload after a delay.
//! 3. Find out whether the commit is on the default branch.
//! 4. Reject anything that is not a SCIP upload.
//! 5. Store the commit date.
//! 6. Buffer the upload and correlate it.
//! 7. Write metadata and documents in a document store transaction. A
//!    unique violation means an earlier attempt already wrote them; the
//!    transaction is rolled back and processing continues.
//! 8. Replace overlapping uploads and write packages, references, the
//!    dependency sync job and the dirty flag in one upload store
//!    transaction.
//! 9. Delete the raw upload. Failure here is only logged.
//!
//! Moving the upload to its terminal state is left to the caller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::correlate::{Correlation, CorrelationOutput, DocumentSink};
use crate::error::{is_store_busy, is_unique_violation, InvalidUpload, ProcessError};
use crate::models::{
    ProcessedDocument, ProcessedMetadata, ProcessedPackageData, Repository, Upload,
};
use crate::reader::{prepare_reader, BufferKind, BufferingConfig, PreparedUpload};
use crate::store::{
    BlobStore, CommitTree, DocumentStore, DocumentTransaction, SourceControl, UploadStore,
};

/// Delay before a requeued upload is picked up again.
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub buffering: BufferingConfig,
    pub requeue_delay: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            buffering: BufferingConfig::default(),
            requeue_delay: DEFAULT_REQUEUE_DELAY,
        }
    }
}

/// What a successful processing attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSummary {
    pub documents_written: u64,
    pub packages: usize,
    pub references: usize,
    pub buffer: BufferKind,
    pub ignored_paths: usize,
    pub failed_merges: usize,
    pub is_default_branch: bool,
    /// Documents were already stored by an earlier attempt.
    pub already_present: bool,
    pub overlapping_deleted: u64,
}

/// Non-error end states of [`UploadHandler::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Source control is not ready; the upload is queued again.
    Requeued {
        not_before: DateTime<Utc>,
        reason: String,
    },
    /// Every write is durable.
    Committed(ProcessSummary),
}

pub struct UploadHandler {
    uploads: Arc<dyn UploadStore>,
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    source: Arc<dyn SourceControl>,
    config: HandlerConfig,
}

impl UploadHandler {
    pub fn new(
        uploads: Arc<dyn UploadStore>,
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        source: Arc<dyn SourceControl>,
        config: HandlerConfig,
    ) -> Self {
        Self {
            uploads,
            documents,
            blobs,
            source,
            config,
        }
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Processes `upload`, which the caller has already claimed.
    pub async fn handle(
        &self,
        upload: &Upload,
        cancel: &CancellationToken,
    ) -> Result<HandleOutcome, ProcessError> {
        ensure_running(cancel)?;
        let repository = self
            .uploads
            .repository(upload.repository_id)
            .await
            .context("Failed to look up repository")
            .map_err(ProcessError::infrastructure)?
            .ok_or_else(|| {
                ProcessError::input(InvalidUpload(format!(
                    "unknown repository {}",
                    upload.repository_id
                )))
            })?;

        ensure_running(cancel)?;
        if let Err(err) = self
            .source
            .resolve_revision(&repository, &upload.commit)
            .await
        {
            if !err.is_transient() {
                return Err(ProcessError::infrastructure(
                    anyhow::Error::new(err).context("Failed to resolve commit"),
                ));
            }
            return self.requeue(upload, &repository, err.to_string()).await;
        }

        ensure_running(cancel)?;
        let is_default_branch = self
            .is_on_default_branch(&repository, &upload.commit)
            .await
            .map_err(ProcessError::infrastructure)?;

        if !upload.is_scip() {
            return Err(ProcessError::input(InvalidUpload(format!(
                "unsupported content type {:?}",
                upload.content_type
            ))));
        }

        ensure_running(cancel)?;
        let commit_date = self
            .source
            .commit_date(&repository, &upload.commit)
            .await
            .context("Failed to get commit date")
            .map_err(ProcessError::infrastructure)?
            .ok_or_else(|| {
                ProcessError::input(InvalidUpload(format!(
                    "commit {} no longer exists in {}",
                    upload.commit, repository.name
                )))
            })?;
        if let Err(err) = self
            .uploads
            .update_commit_date(repository.id, &upload.commit, commit_date)
            .await
        {
            let err = err.context("Failed to update commit date");
            return self.requeue_if_busy(upload, &repository, err).await;
        }

        ensure_running(cancel)?;
        let source = self
            .blobs
            .get(&upload.blob_name())
            .await
            .with_context(|| format!("Failed to fetch upload blob {}", upload.blob_name()))
            .map_err(ProcessError::infrastructure)?;
        let mut prepared = prepare_reader(
            source,
            upload.upload_size,
            upload.uncompressed_size,
            &self.config.buffering,
        )
        .map_err(ProcessError::infrastructure)?;
        let buffer = prepared.kind();
        tracing::debug!(upload_id = upload.id, buffer = buffer.as_str(), "buffered upload");

        let written = self
            .write_documents(upload, &repository, &mut prepared, cancel)
            .await;
        release(prepared, upload.id);
        let (documents, correlation) = match written {
            Ok(written) => written,
            Err(err) => return self.requeue_if_busy(upload, &repository, err).await,
        };

        ensure_running(cancel)?;
        let overlapping_deleted = match self.write_packages(upload, &correlation.packages).await {
            Ok(deleted) => deleted,
            Err(err) => return self.requeue_if_busy(upload, &repository, err).await,
        };

        if let Err(err) = self.blobs.delete(&upload.blob_name()).await {
            tracing::warn!(
                upload_id = upload.id,
                error = %format!("{:#}", err),
                "failed to delete upload blob"
            );
        }

        let summary = ProcessSummary {
            documents_written: documents.written,
            packages: correlation.packages.packages.len(),
            references: correlation.packages.references.len(),
            buffer,
            ignored_paths: correlation.stats.ignored_paths,
            failed_merges: correlation.stats.failed_merges,
            is_default_branch,
            already_present: documents.already_present,
            overlapping_deleted,
        };
        tracing::info!(
            upload_id = upload.id,
            repository = %repository.name,
            commit = %upload.commit,
            documents = summary.documents_written,
            packages = summary.packages,
            references = summary.references,
            already_present = summary.already_present,
            "processed upload"
        );
        Ok(HandleOutcome::Committed(summary))
    }

    /// Puts `upload` back in the queue for another attempt after the
    /// configured delay.
    async fn requeue(
        &self,
        upload: &Upload,
        repository: &Repository,
        reason: String,
    ) -> Result<HandleOutcome, ProcessError> {
        let not_before = Utc::now()
            + chrono::Duration::from_std(self.config.requeue_delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.uploads
            .requeue(upload.id, not_before)
            .await
            .context("Failed to requeue upload")
            .map_err(ProcessError::infrastructure)?;
        tracing::info!(
            upload_id = upload.id,
            repository = %repository.name,
            commit = %upload.commit,
            %not_before,
            reason = %reason,
            "requeued upload"
        );
        Ok(HandleOutcome::Requeued { not_before, reason })
    }

    /// Lock contention in a store is retried later. Every other error is
    /// classified as usual.
    async fn requeue_if_busy(
        &self,
        upload: &Upload,
        repository: &Repository,
        err: anyhow::Error,
    ) -> Result<HandleOutcome, ProcessError> {
        if is_store_busy(&err) {
            tracing::warn!(
                upload_id = upload.id,
                error = %format!("{:#}", err),
                "store busy, retrying upload later"
            );
            return self.requeue(upload, repository, format!("{:#}", err)).await;
        }
        Err(ProcessError::classify(err))
    }

    async fn is_on_default_branch(&self, repository: &Repository, commit: &str) -> Result<bool> {
        let refs = self
            .source
            .ref_descriptions(repository, commit)
            .await
            .context("Failed to get ref descriptions")?;
        if refs.iter().any(|r| r.is_default_branch) {
            return Ok(true);
        }

        let branches = self
            .source
            .branches_containing(repository, commit)
            .await
            .context("Failed to get branches containing commit")?;
        Ok(branches.iter().any(|b| b.is_default_branch))
    }

    /// Correlates the upload and writes its processed form, inside one
    /// document store transaction.
    async fn write_documents(
        &self,
        upload: &Upload,
        repository: &Repository,
        prepared: &mut PreparedUpload,
        cancel: &CancellationToken,
    ) -> Result<(DocumentsWritten, CorrelationOutput)> {
        let tree = CommitTree {
            source: self.source.as_ref(),
            repository,
            commit: &upload.commit,
        };
        let correlation = Correlation::prepare(&mut prepared.reader, &upload.root, &tree, cancel)
            .await
            .context("Failed to correlate upload")?;

        let tx = self
            .documents
            .transact()
            .await
            .context("Failed to open document transaction")?;
        let mut writer = DocumentWriter::new(upload.id, tx);
        if let Err(err) = writer.write_metadata(correlation.metadata()).await {
            writer.abandon().await;
            return Err(err);
        }

        let output = match correlation
            .materialize(&mut prepared.reader, &mut writer, cancel)
            .await
        {
            Ok(output) => output,
            Err(err) => {
                writer.abandon().await;
                return Err(err.context("Failed to correlate upload"));
            }
        };

        let written = writer.finish().await?;
        Ok((written, output))
    }

    /// Runs step 8, returning the number of overlapping uploads deleted.
    async fn write_packages(&self, upload: &Upload, packages: &ProcessedPackageData) -> Result<u64> {
        let mut tx = self
            .uploads
            .transact()
            .await
            .context("Failed to open upload transaction")?;

        let result: Result<u64> = async {
            let deleted = tx
                .delete_overlapping_uploads(upload)
                .await
                .context("Failed to delete overlapping uploads")?;
            tx.update_packages(upload.id, &packages.packages)
                .await
                .context("Failed to update packages")?;
            tx.update_package_references(upload.id, &packages.references)
                .await
                .context("Failed to update package references")?;
            tx.insert_dependency_sync_job(upload.id)
                .await
                .context("Failed to enqueue dependency sync job")?;
            tx.set_repository_dirty(upload.repository_id)
                .await
                .context("Failed to mark repository dirty")?;
            Ok(deleted)
        }
        .await;

        match result {
            Ok(deleted) => {
                tx.commit()
                    .await
                    .context("Failed to commit upload transaction")?;
                if deleted > 0 {
                    tracing::info!(upload_id = upload.id, deleted, "replaced overlapping uploads");
                }
                Ok(deleted)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(
                        upload_id = upload.id,
                        error = %format!("{:#}", rollback),
                        "failed to roll back upload transaction"
                    );
                }
                Err(err)
            }
        }
    }
}

fn ensure_running(cancel: &CancellationToken) -> Result<(), ProcessError> {
    if cancel.is_cancelled() {
        return Err(ProcessError::cancelled());
    }
    Ok(())
}

fn release(prepared: PreparedUpload, upload_id: i64) {
    if let Err(err) = prepared.release() {
        tracing::warn!(upload_id, error = %err, "failed to remove spill file");
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DocumentsWritten {
    written: u64,
    already_present: bool,
}

/// [`DocumentSink`] writing into a document transaction.
///
/// The first unique violation rolls the transaction back and turns the
/// writer into a discarding sink, so correlation can still finish.
struct DocumentWriter {
    upload_id: i64,
    tx: Option<Box<dyn DocumentTransaction>>,
    written: u64,
    already_present: bool,
}

impl DocumentWriter {
    fn new(upload_id: i64, tx: Box<dyn DocumentTransaction>) -> Self {
        Self {
            upload_id,
            tx: Some(tx),
            written: 0,
            already_present: false,
        }
    }

    async fn write_metadata(&mut self, metadata: &ProcessedMetadata) -> Result<()> {
        let result = match self.tx.as_mut() {
            Some(tx) => tx.insert_metadata(self.upload_id, metadata).await,
            None => return Ok(()),
        };
        self.absorb(result.context("Failed to insert metadata")).await
    }

    /// Turns a unique violation into discard mode; other errors pass
    /// through.
    async fn absorb(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                tracing::warn!(
                    upload_id = self.upload_id,
                    error = %format!("{:#}", err),
                    "upload data already present, skipping document writes"
                );
                self.already_present = true;
                if let Some(tx) = self.tx.take() {
                    tx.rollback()
                        .await
                        .context("Failed to roll back document transaction")?;
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn abandon(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(err) = tx.rollback().await {
                tracing::warn!(
                    upload_id = self.upload_id,
                    error = %format!("{:#}", err),
                    "failed to roll back document transaction"
                );
            }
        }
    }

    async fn finish(mut self) -> Result<DocumentsWritten> {
        let flushed = match self.tx.as_mut() {
            Some(tx) => tx.flush().await.context("Failed to flush documents"),
            None => Ok(self.written),
        };
        match flushed {
            Ok(count) => self.written = count,
            Err(err) => {
                if !is_unique_violation(&err) {
                    self.abandon().await;
                }
                self.absorb(Err(err)).await?;
            }
        }

        if let Some(tx) = self.tx.take() {
            tx.commit()
                .await
                .context("Failed to commit document transaction")?;
        } else {
            self.written = 0;
        }
        Ok(DocumentsWritten {
            written: self.written,
            already_present: self.already_present,
        })
    }
}

#[async_trait]
impl DocumentSink for DocumentWriter {
    async fn accept(&mut self, document: ProcessedDocument) -> Result<()> {
        let result = match self.tx.as_mut() {
            Some(tx) => tx.insert_document(self.upload_id, document).await,
            None => return Ok(()),
        };
        self.absorb(result.context("Failed to insert document")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fixtures::{
        sample_upload, IndexBuilder, SAMPLE_DEPENDENCIES, SAMPLE_PACKAGE, SAMPLE_PATHS,
        SAMPLE_TOOL_NAME, SAMPLE_TOOL_VERSION,
    };
    use crate::models::{UploadState, CONTENT_TYPE_LSIF, CONTENT_TYPE_SCIP};
    use crate::store::memory::{
        InMemoryBlobStore, InMemoryDocumentStore, InMemorySourceControl, InMemoryUploadStore,
    };
    use tempfile::TempDir;

    const REPO: &str = "github.com/acme/template";
    const COMMIT: &str = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef";

    struct Harness {
        uploads: InMemoryUploadStore,
        documents: InMemoryDocumentStore,
        blobs: Arc<InMemoryBlobStore>,
        source: Arc<InMemorySourceControl>,
        handler: UploadHandler,
    }

    fn harness_with(config: HandlerConfig) -> Harness {
        let uploads = InMemoryUploadStore::new();
        let documents = InMemoryDocumentStore::new();
        let blobs = Arc::new(InMemoryBlobStore::new());
        let source = Arc::new(InMemorySourceControl::new());
        uploads.add_repository(1, REPO);
        source.add_commit(REPO, COMMIT, Some(Utc::now()), &SAMPLE_PATHS);

        let handler = UploadHandler::new(
            Arc::new(uploads.clone()),
            Arc::new(documents.clone()),
            blobs.clone(),
            source.clone(),
            config,
        );
        Harness {
            uploads,
            documents,
            blobs,
            source,
            handler,
        }
    }

    fn harness() -> Harness {
        harness_with(HandlerConfig::default())
    }

    fn upload(id: i64, blob: &[u8]) -> Upload {
        Upload {
            id,
            repository_id: 1,
            commit: COMMIT.to_string(),
            root: String::new(),
            indexer: SAMPLE_TOOL_NAME.to_string(),
            indexer_version: SAMPLE_TOOL_VERSION.to_string(),
            content_type: CONTENT_TYPE_SCIP.to_string(),
            upload_size: blob.len() as i64,
            uncompressed_size: None,
            uploaded_at: Utc::now(),
            state: UploadState::Processing,
            failure_message: None,
            process_after: None,
            num_failures: 0,
        }
    }

    impl Harness {
        fn enqueue(&self, id: i64, blob: Vec<u8>) -> Upload {
            let upload = upload(id, &blob);
            self.blobs.put(&upload.blob_name(), blob);
            self.uploads.insert_upload(upload.clone());
            upload
        }

        async fn handle(&self, upload: &Upload) -> Result<HandleOutcome, ProcessError> {
            self.handler.handle(upload, &CancellationToken::new()).await
        }
    }

    fn committed(outcome: HandleOutcome) -> ProcessSummary {
        match outcome {
            HandleOutcome::Committed(summary) => summary,
            other => panic!("expected commit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sample_upload_end_to_end() {
        let h = harness();
        let upload = h.enqueue(42, sample_upload());

        let summary = committed(h.handle(&upload).await.unwrap());
        assert_eq!(summary.documents_written, 11);
        assert_eq!(summary.packages, 1);
        assert_eq!(summary.references, 8);
        assert_eq!(summary.buffer, BufferKind::InMemory);
        assert!(!summary.already_present);

        let documents = h.documents.documents(42);
        assert_eq!(documents.len(), 11);
        assert!(documents.iter().all(|d| d.payload.relative_path.is_empty()));

        let metadata = h.documents.metadata(42).unwrap();
        assert_eq!(metadata.tool_name, SAMPLE_TOOL_NAME);
        assert_eq!(metadata.tool_version, SAMPLE_TOOL_VERSION);
        assert_eq!(metadata.text_document_encoding, "UTF8");
        assert_eq!(metadata.protocol_version, 0);

        let packages = h.uploads.packages(42);
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, SAMPLE_PACKAGE.0);
        let mut references: Vec<String> = h
            .uploads
            .references(42)
            .into_iter()
            .map(|r| r.package.name)
            .collect();
        references.sort();
        let mut expected: Vec<String> =
            SAMPLE_DEPENDENCIES.iter().map(|(n, _)| n.to_string()).collect();
        expected.sort();
        assert_eq!(references, expected);

        assert_eq!(h.uploads.dependency_sync_jobs(), vec![42]);
        assert_eq!(h.uploads.dirty_repositories().get(&1), Some(&1));
        assert!(h.uploads.stored_commit_date(1, COMMIT).is_some());
        assert!(!h.blobs.contains(&upload.blob_name()));
        assert_eq!(h.source.list_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_spilled_upload_matches_in_memory() {
        let spill = TempDir::new().unwrap();
        let h = harness_with(HandlerConfig {
            buffering: BufferingConfig {
                max_in_memory_bytes: 1,
                spill_dir: Some(spill.path().to_path_buf()),
            },
            ..Default::default()
        });
        let upload = h.enqueue(1, sample_upload());
        let summary = committed(h.handle(&upload).await.unwrap());
        assert_eq!(summary.buffer, BufferKind::Spilled);
        assert_eq!(summary.documents_written, 11);
        assert_eq!(std::fs::read_dir(spill.path()).unwrap().count(), 0);

        let reference = harness();
        let upload = reference.enqueue(1, sample_upload());
        committed(reference.handle(&upload).await.unwrap());
        assert_eq!(h.documents.documents(1), reference.documents.documents(1));
    }

    #[tokio::test]
    async fn test_missing_commit_requeues() {
        let h = harness();
        let mut upload = h.enqueue(5, sample_upload());
        upload.commit = "cafebabe".to_string();

        let before = Utc::now();
        match h.handle(&upload).await.unwrap() {
            HandleOutcome::Requeued { not_before, .. } => {
                assert!(not_before >= before + chrono::Duration::seconds(59));
            }
            other => panic!("expected requeue, got {:?}", other),
        }
        assert!(h.uploads.requeued_until(5).is_some());
        assert!(h.documents.documents(5).is_empty());
        assert!(h.blobs.contains(&upload.blob_name()));
    }

    #[tokio::test]
    async fn test_cloning_repository_requeues() {
        let h = harness();
        h.source.set_cloning(REPO, true);
        let upload = h.enqueue(5, sample_upload());
        assert!(matches!(
            h.handle(&upload).await.unwrap(),
            HandleOutcome::Requeued { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_repository_is_input_error() {
        let h = harness();
        let mut upload = h.enqueue(5, sample_upload());
        upload.repository_id = 99;
        let err = h.handle(&upload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[tokio::test]
    async fn test_lsif_upload_is_rejected() {
        let h = harness();
        let mut upload = h.enqueue(5, sample_upload());
        upload.content_type = CONTENT_TYPE_LSIF.to_string();
        let err = h.handle(&upload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
        assert!(err.to_string().contains("unsupported content type"));
        assert!(h.documents.documents(5).is_empty());
    }

    #[tokio::test]
    async fn test_vanished_commit_is_input_error() {
        let h = harness();
        h.source.add_commit(REPO, "gone", None, &[]);
        let mut upload = h.enqueue(5, sample_upload());
        upload.commit = "gone".to_string();
        let err = h.handle(&upload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
        assert!(err.to_string().contains("no longer exists"));
    }

    #[tokio::test]
    async fn test_missing_metadata_is_input_error() {
        let h = harness();
        let blob = IndexBuilder::without_metadata()
            .document(crate::fixtures::document("src/index.ts", vec![]))
            .encode_gzipped();
        let upload = h.enqueue(5, blob);
        let err = h.handle(&upload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[tokio::test]
    async fn test_corrupt_upload_is_input_error() {
        let h = harness();
        // A document field whose declared length runs past the end.
        let upload = h.enqueue(5, crate::fixtures::gzip(&[0x12, 0xff, 0x01]));
        let err = h.handle(&upload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[tokio::test]
    async fn test_reprocessing_absorbs_duplicate_documents() {
        let h = harness();
        let upload = h.enqueue(7, sample_upload());
        committed(h.handle(&upload).await.unwrap());

        h.blobs.put(&upload.blob_name(), sample_upload());
        let summary = committed(h.handle(&upload).await.unwrap());
        assert!(summary.already_present);
        assert_eq!(summary.documents_written, 0);
        assert_eq!(summary.packages, 1);
        assert_eq!(summary.references, 8);
        assert_eq!(h.documents.documents(7).len(), 11);
        assert_eq!(h.uploads.packages(7).len(), 1);
        assert_eq!(h.uploads.dirty_repositories().get(&1), Some(&2));
    }

    #[tokio::test]
    async fn test_new_upload_replaces_completed_overlap() {
        let h = harness();
        let first = h.enqueue(1, sample_upload());
        committed(h.handle(&first).await.unwrap());
        h.uploads.set_upload_state(1, UploadState::Completed);

        let second = h.enqueue(2, sample_upload());
        let summary = committed(h.handle(&second).await.unwrap());
        assert_eq!(summary.overlapping_deleted, 1);
        assert_eq!(h.uploads.upload(1).unwrap().state, UploadState::Deleted);
    }

    #[tokio::test]
    async fn test_busy_commit_date_write_requeues() {
        let h = harness();
        h.uploads.busy_on("update_commit_date");
        let upload = h.enqueue(4, sample_upload());

        match h.handle(&upload).await.unwrap() {
            HandleOutcome::Requeued { reason, .. } => assert!(reason.contains("store busy")),
            other => panic!("expected requeue, got {:?}", other),
        }
        assert!(h.uploads.requeued_until(4).is_some());
        assert!(h.documents.documents(4).is_empty());

        let summary = committed(h.handle(&upload).await.unwrap());
        assert_eq!(summary.documents_written, 11);
    }

    #[tokio::test]
    async fn test_busy_upload_transaction_requeues() {
        let h = harness();
        h.uploads.busy_on("update_packages");
        let upload = h.enqueue(6, sample_upload());

        assert!(matches!(
            h.handle(&upload).await.unwrap(),
            HandleOutcome::Requeued { .. }
        ));
        assert!(h.uploads.packages(6).is_empty());
        assert!(h.blobs.contains(&upload.blob_name()));

        let summary = committed(h.handle(&upload).await.unwrap());
        assert!(summary.already_present);
        assert_eq!(summary.packages, 1);
        assert_eq!(h.documents.documents(6).len(), 11);
        assert!(!h.blobs.contains(&upload.blob_name()));
    }

    #[tokio::test]
    async fn test_upload_transaction_failure_keeps_documents() {
        let h = harness();
        h.uploads.fail_on("update_packages");
        let upload = h.enqueue(3, sample_upload());
        let err = h.handle(&upload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(err.to_string().contains("Failed to update packages"));

        assert_eq!(h.documents.documents(3).len(), 11);
        assert!(h.uploads.packages(3).is_empty());
        assert!(h.uploads.dependency_sync_jobs().is_empty());
        assert!(h.blobs.contains(&upload.blob_name()));
    }

    #[tokio::test]
    async fn test_document_store_failure_is_infrastructure_error() {
        let h = harness();
        h.documents.fail_on("insert_document");
        let upload = h.enqueue(3, sample_upload());
        let err = h.handle(&upload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(h.documents.metadata(3).is_none());
        assert!(h.uploads.packages(3).is_empty());
    }

    #[tokio::test]
    async fn test_blob_delete_failure_is_only_logged() {
        let h = harness();
        h.blobs.fail_on("delete");
        let upload = h.enqueue(4, sample_upload());
        committed(h.handle(&upload).await.unwrap());
        assert!(h.blobs.contains(&upload.blob_name()));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness();
        let upload = h.enqueue(4, sample_upload());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = h.handler.handle(&upload, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(h.documents.documents(4).is_empty());
    }

    #[tokio::test]
    async fn test_paths_missing_from_tree_are_ignored() {
        let h = harness();
        let files: Vec<&str> = SAMPLE_PATHS
            .iter()
            .copied()
            .filter(|p| !p.starts_with("test/"))
            .collect();
        h.source.add_commit(REPO, COMMIT, Some(Utc::now()), &files);

        let upload = h.enqueue(6, sample_upload());
        let summary = committed(h.handle(&upload).await.unwrap());
        assert_eq!(summary.ignored_paths, 2);
        assert_eq!(summary.documents_written, 9);
        assert!(h
            .documents
            .documents(6)
            .iter()
            .all(|d| !d.path.starts_with("test/")));
    }

    #[tokio::test]
    async fn test_default_branch_detection() {
        let h = harness();
        h.source.add_branch(REPO, "main", "tip", &[COMMIT], true);
        let upload = h.enqueue(8, sample_upload());
        assert!(committed(h.handle(&upload).await.unwrap()).is_default_branch);

        let h = harness();
        h.source.add_branch(REPO, "feature", COMMIT, &[], false);
        let upload = h.enqueue(8, sample_upload());
        assert!(!committed(h.handle(&upload).await.unwrap()).is_default_branch);
    }
}
