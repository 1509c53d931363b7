//! Collaborator interfaces used by the upload handler.
//!
//! The handler talks to four collaborators:
//!
//! | Trait | Role |
//! |-------|------|
//! | [`SourceControl`] | Commit resolution, commit dates, file tree listings and refs |
//! | [`UploadStore`] | Relational metadata: repositories, uploads, packages |
//! | [`DocumentStore`] | Processed documents and index metadata |
//! | [`BlobStore`] | Raw uploaded artifacts |
//!
//! The two stores hand out transactions. They are independent: committing
//! one says nothing about the other.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! [`memory`] provides in-process implementations of all four.

pub mod memory;

use std::collections::HashMap;
use std::io::Read;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RevisionError;
use crate::models::{
    Package, PackageReference, ProcessedDocument, ProcessedMetadata, Repository, Upload,
};
use crate::pathexistence::ChildrenLookup;

/// Kind of a git ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Branch,
    Tag,
}

/// A named ref pointing at, or containing, a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefDescription {
    pub name: String,
    pub kind: RefKind,
    pub is_default_branch: bool,
}

/// Read access to repository history.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Checks that `commit` is known to the repository.
    async fn resolve_revision(&self, repository: &Repository, commit: &str)
        -> Result<(), RevisionError>;

    /// Committer date of `commit`, or `None` if the commit does not exist.
    async fn commit_date(
        &self,
        repository: &Repository,
        commit: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Direct children of each directory at `commit`.
    ///
    /// Keys are the requested directories (`""` is the repository root) and
    /// children are repository-relative paths.
    async fn list_directory_children(
        &self,
        repository: &Repository,
        commit: &str,
        dirnames: &[String],
    ) -> Result<HashMap<String, Vec<String>>>;

    /// Refs whose tip is `commit`.
    async fn ref_descriptions(
        &self,
        repository: &Repository,
        commit: &str,
    ) -> Result<Vec<RefDescription>>;

    /// Branches whose history contains `commit`.
    async fn branches_containing(
        &self,
        repository: &Repository,
        commit: &str,
    ) -> Result<Vec<RefDescription>>;
}

/// The file tree of one commit, as seen through [`SourceControl`].
pub struct CommitTree<'a, S: ?Sized> {
    pub source: &'a S,
    pub repository: &'a Repository,
    pub commit: &'a str,
}

#[async_trait]
impl<S> ChildrenLookup for CommitTree<'_, S>
where
    S: SourceControl + ?Sized,
{
    async fn children(&self, dirnames: &[String]) -> Result<HashMap<String, Vec<String>>> {
        self.source
            .list_directory_children(self.repository, self.commit, dirnames)
            .await
    }
}

/// Relational metadata about repositories, uploads and packages.
#[async_trait]
pub trait UploadStore: Send + Sync {
    async fn repository(&self, repository_id: i64) -> Result<Option<Repository>>;

    /// Records the committer date of a commit of a repository.
    async fn update_commit_date(
        &self,
        repository_id: i64,
        commit: &str,
        date: DateTime<Utc>,
    ) -> Result<()>;

    /// Puts a processing upload back in the queue, not to be picked up
    /// before `not_before`.
    async fn requeue(&self, upload_id: i64, not_before: DateTime<Utc>) -> Result<()>;

    async fn transact(&self) -> Result<Box<dyn UploadTransaction>>;
}

/// Writes that complete the processing of one upload.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait UploadTransaction: Send {
    /// Soft-deletes completed uploads sharing the identity of `upload`
    /// (repository, commit, root, indexer), returning how many were deleted.
    async fn delete_overlapping_uploads(&mut self, upload: &Upload) -> Result<u64>;

    async fn update_packages(&mut self, upload_id: i64, packages: &[Package]) -> Result<()>;

    async fn update_package_references(
        &mut self,
        upload_id: i64,
        references: &[PackageReference],
    ) -> Result<()>;

    /// Signals that dependencies of the upload should be synced.
    async fn insert_dependency_sync_job(&mut self, upload_id: i64) -> Result<()>;

    /// Marks the repository's visibility data as stale. Repeated marks
    /// before recomputation coalesce.
    async fn set_repository_dirty(&mut self, repository_id: i64) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Storage of processed documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn transact(&self) -> Result<Box<dyn DocumentTransaction>>;
}

/// Writes of the processed form of one upload.
///
/// A write that conflicts with data already stored for the same upload
/// fails with an error carrying [`UniqueViolation`](crate::error::UniqueViolation).
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait DocumentTransaction: Send {
    async fn insert_metadata(&mut self, upload_id: i64, metadata: &ProcessedMetadata)
        -> Result<()>;

    /// Queues a document for writing. Writes may be deferred until
    /// [`flush`](DocumentTransaction::flush).
    async fn insert_document(&mut self, upload_id: i64, document: ProcessedDocument)
        -> Result<()>;

    /// Writes queued documents, returning the number written since the
    /// transaction started.
    async fn flush(&mut self) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Storage of raw uploaded artifacts, addressed by name.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Box<dyn Read + Send>>;

    async fn delete(&self, name: &str) -> Result<()>;
}
