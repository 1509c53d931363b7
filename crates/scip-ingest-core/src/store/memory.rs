//! In-memory collaborators for tests and local experiments.
//!
//! State lives behind `std::sync` locks. Transactions buffer their writes
//! and apply them under a single lock on commit, so an uncommitted
//! transaction leaves no trace. Each store can be told to fail a named
//! operation, to exercise error paths.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    BlobStore, DocumentStore, DocumentTransaction, RefDescription, RefKind, SourceControl,
    UploadStore, UploadTransaction,
};
use crate::error::{RevisionError, StoreBusy, UniqueViolation};
use crate::models::{
    Package, PackageReference, ProcessedDocument, ProcessedMetadata, Repository, Upload,
    UploadState,
};

// ═══════════════════════════════════════════════════════════════════════
// Source control
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct CommitEntry {
    date: Option<DateTime<Utc>>,
    files: Vec<String>,
}

#[derive(Debug, Clone)]
struct BranchEntry {
    name: String,
    tip: String,
    contains: HashSet<String>,
    is_default: bool,
}

#[derive(Debug, Clone, Default)]
struct RepositoryEntry {
    cloning: bool,
    commits: HashMap<String, CommitEntry>,
    branches: Vec<BranchEntry>,
}

/// Source control over hand-described repositories, keyed by name.
#[derive(Debug, Default)]
pub struct InMemorySourceControl {
    repositories: RwLock<HashMap<String, RepositoryEntry>>,
    list_calls: Mutex<Vec<Vec<String>>>,
}

impl InMemorySourceControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a commit whose tree holds `files`. A commit without a date
    /// resolves but reports no commit date.
    pub fn add_commit(
        &self,
        repository: &str,
        commit: &str,
        date: Option<DateTime<Utc>>,
        files: &[&str],
    ) {
        let mut repos = self.repositories.write().unwrap();
        repos.entry(repository.to_string()).or_default().commits.insert(
            commit.to_string(),
            CommitEntry {
                date,
                files: files.iter().map(|f| f.to_string()).collect(),
            },
        );
    }

    pub fn set_cloning(&self, repository: &str, cloning: bool) {
        let mut repos = self.repositories.write().unwrap();
        repos.entry(repository.to_string()).or_default().cloning = cloning;
    }

    /// Adds a branch pointing at `tip` whose history holds `contains`
    /// (the tip included).
    pub fn add_branch(
        &self,
        repository: &str,
        name: &str,
        tip: &str,
        contains: &[&str],
        is_default: bool,
    ) {
        let mut contains: HashSet<String> = contains.iter().map(|c| c.to_string()).collect();
        contains.insert(tip.to_string());
        let mut repos = self.repositories.write().unwrap();
        repos.entry(repository.to_string()).or_default().branches.push(BranchEntry {
            name: name.to_string(),
            tip: tip.to_string(),
            contains,
            is_default,
        });
    }

    /// Directory batches passed to `list_directory_children`, in call order.
    pub fn list_calls(&self) -> Vec<Vec<String>> {
        self.list_calls.lock().unwrap().clone()
    }

    fn branches<F>(&self, repository: &Repository, keep: F) -> Vec<RefDescription>
    where
        F: Fn(&BranchEntry) -> bool,
    {
        let repos = self.repositories.read().unwrap();
        repos
            .get(&repository.name)
            .map(|repo| {
                repo.branches
                    .iter()
                    .filter(|branch| keep(branch))
                    .map(|branch| RefDescription {
                        name: branch.name.clone(),
                        kind: RefKind::Branch,
                        is_default_branch: branch.is_default,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl SourceControl for InMemorySourceControl {
    async fn resolve_revision(
        &self,
        repository: &Repository,
        commit: &str,
    ) -> Result<(), RevisionError> {
        let repos = self.repositories.read().unwrap();
        let repo = match repos.get(&repository.name) {
            Some(repo) => repo,
            None => {
                return Err(RevisionError::Other(anyhow::anyhow!(
                    "unknown repository {}",
                    repository.name
                )))
            }
        };
        if repo.cloning {
            return Err(RevisionError::Cloning {
                repository: repository.name.clone(),
            });
        }
        if !repo.commits.contains_key(commit) {
            return Err(RevisionError::NotFound {
                repository: repository.name.clone(),
                commit: commit.to_string(),
            });
        }
        Ok(())
    }

    async fn commit_date(
        &self,
        repository: &Repository,
        commit: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let repos = self.repositories.read().unwrap();
        Ok(repos
            .get(&repository.name)
            .and_then(|repo| repo.commits.get(commit))
            .and_then(|entry| entry.date))
    }

    async fn list_directory_children(
        &self,
        repository: &Repository,
        commit: &str,
        dirnames: &[String],
    ) -> Result<HashMap<String, Vec<String>>> {
        self.list_calls.lock().unwrap().push(dirnames.to_vec());

        let repos = self.repositories.read().unwrap();
        let entry = match repos
            .get(&repository.name)
            .and_then(|repo| repo.commits.get(commit))
        {
            Some(entry) => entry,
            None => bail!("commit {} not found in {}", commit, repository.name),
        };

        let wanted: HashSet<&str> = dirnames.iter().map(|d| d.as_str()).collect();
        let mut children: HashMap<String, BTreeSet<String>> = HashMap::new();
        for file in &entry.files {
            let segments: Vec<&str> = file.split('/').collect();
            for depth in 0..segments.len() {
                let dir = segments[..depth].join("/");
                if wanted.contains(dir.as_str()) {
                    children
                        .entry(dir)
                        .or_default()
                        .insert(segments[..=depth].join("/"));
                }
            }
        }

        Ok(children
            .into_iter()
            .map(|(dir, set)| (dir, set.into_iter().collect()))
            .collect())
    }

    async fn ref_descriptions(
        &self,
        repository: &Repository,
        commit: &str,
    ) -> Result<Vec<RefDescription>> {
        Ok(self.branches(repository, |branch| branch.tip == commit))
    }

    async fn branches_containing(
        &self,
        repository: &Repository,
        commit: &str,
    ) -> Result<Vec<RefDescription>> {
        Ok(self.branches(repository, |branch| branch.contains.contains(commit)))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Upload store
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct UploadTables {
    repositories: HashMap<i64, Repository>,
    uploads: HashMap<i64, Upload>,
    commit_dates: HashMap<(i64, String), DateTime<Utc>>,
    packages: HashMap<i64, Vec<Package>>,
    references: HashMap<i64, Vec<PackageReference>>,
    dependency_sync_jobs: Vec<i64>,
    dirty_repositories: HashMap<i64, u64>,
    requeued: HashMap<i64, DateTime<Utc>>,
}

/// Relational store over in-memory maps.
#[derive(Debug, Default, Clone)]
pub struct InMemoryUploadStore {
    state: Arc<Mutex<UploadTables>>,
    fail_on: Arc<Mutex<Option<String>>>,
    busy_on: Arc<Mutex<Option<String>>>,
}

impl InMemoryUploadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_repository(&self, id: i64, name: &str) {
        self.state.lock().unwrap().repositories.insert(
            id,
            Repository {
                id,
                name: name.to_string(),
            },
        );
    }

    pub fn insert_upload(&self, upload: Upload) {
        self.state.lock().unwrap().uploads.insert(upload.id, upload);
    }

    pub fn set_upload_state(&self, upload_id: i64, state: UploadState) {
        if let Some(upload) = self.state.lock().unwrap().uploads.get_mut(&upload_id) {
            upload.state = state;
        }
    }

    pub fn upload(&self, upload_id: i64) -> Option<Upload> {
        self.state.lock().unwrap().uploads.get(&upload_id).cloned()
    }

    pub fn packages(&self, upload_id: i64) -> Vec<Package> {
        let state = self.state.lock().unwrap();
        state.packages.get(&upload_id).cloned().unwrap_or_default()
    }

    pub fn references(&self, upload_id: i64) -> Vec<PackageReference> {
        let state = self.state.lock().unwrap();
        state.references.get(&upload_id).cloned().unwrap_or_default()
    }

    pub fn dependency_sync_jobs(&self) -> Vec<i64> {
        self.state.lock().unwrap().dependency_sync_jobs.clone()
    }

    /// Number of times each repository was marked dirty.
    pub fn dirty_repositories(&self) -> HashMap<i64, u64> {
        self.state.lock().unwrap().dirty_repositories.clone()
    }

    pub fn stored_commit_date(&self, repository_id: i64, commit: &str) -> Option<DateTime<Utc>> {
        let state = self.state.lock().unwrap();
        state
            .commit_dates
            .get(&(repository_id, commit.to_string()))
            .copied()
    }

    pub fn requeued_until(&self, upload_id: i64) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().requeued.get(&upload_id).copied()
    }

    /// Makes the named transaction operation fail from now on
    /// (for example `"update_packages"` or `"commit"`).
    pub fn fail_on(&self, operation: &str) {
        *self.fail_on.lock().unwrap() = Some(operation.to_string());
    }

    /// Makes the next call of the named operation fail as if another
    /// writer held the store's lock.
    pub fn busy_on(&self, operation: &str) {
        *self.busy_on.lock().unwrap() = Some(operation.to_string());
    }

    fn check(&self, operation: &str) -> Result<()> {
        let mut busy = self.busy_on.lock().unwrap();
        if busy.as_deref() == Some(operation) {
            *busy = None;
            return Err(anyhow::anyhow!("database is locked")
                .context(StoreBusy(operation.to_string())));
        }
        drop(busy);
        check_failure(&self.fail_on, operation)
    }
}

fn check_failure(fail_on: &Mutex<Option<String>>, operation: &str) -> Result<()> {
    if fail_on.lock().unwrap().as_deref() == Some(operation) {
        bail!("injected failure in {}", operation);
    }
    Ok(())
}

#[async_trait]
impl UploadStore for InMemoryUploadStore {
    async fn repository(&self, repository_id: i64) -> Result<Option<Repository>> {
        self.check("repository")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .repositories
            .get(&repository_id)
            .cloned())
    }

    async fn update_commit_date(
        &self,
        repository_id: i64,
        commit: &str,
        date: DateTime<Utc>,
    ) -> Result<()> {
        self.check("update_commit_date")?;
        self.state
            .lock()
            .unwrap()
            .commit_dates
            .insert((repository_id, commit.to_string()), date);
        Ok(())
    }

    async fn requeue(&self, upload_id: i64, not_before: DateTime<Utc>) -> Result<()> {
        self.check("requeue")?;
        let mut state = self.state.lock().unwrap();
        if let Some(upload) = state.uploads.get_mut(&upload_id) {
            upload.state = UploadState::Queued;
            upload.process_after = Some(not_before);
        }
        state.requeued.insert(upload_id, not_before);
        Ok(())
    }

    async fn transact(&self) -> Result<Box<dyn UploadTransaction>> {
        self.check("transact")?;
        Ok(Box::new(InMemoryUploadTransaction {
            store: self.clone(),
            ops: Vec::new(),
        }))
    }
}

#[derive(Debug)]
enum UploadOp {
    DeleteOverlapping(Upload),
    Packages(i64, Vec<Package>),
    References(i64, Vec<PackageReference>),
    DependencySync(i64),
    Dirty(i64),
}

struct InMemoryUploadTransaction {
    store: InMemoryUploadStore,
    ops: Vec<UploadOp>,
}

fn overlaps(candidate: &Upload, upload: &Upload) -> bool {
    candidate.id != upload.id
        && candidate.state == UploadState::Completed
        && candidate.repository_id == upload.repository_id
        && candidate.commit == upload.commit
        && candidate.root == upload.root
        && candidate.indexer == upload.indexer
}

#[async_trait]
impl UploadTransaction for InMemoryUploadTransaction {
    async fn delete_overlapping_uploads(&mut self, upload: &Upload) -> Result<u64> {
        self.store.check("delete_overlapping_uploads")?;
        let count = {
            let state = self.store.state.lock().unwrap();
            state
                .uploads
                .values()
                .filter(|candidate| overlaps(candidate, upload))
                .count() as u64
        };
        self.ops.push(UploadOp::DeleteOverlapping(upload.clone()));
        Ok(count)
    }

    async fn update_packages(&mut self, upload_id: i64, packages: &[Package]) -> Result<()> {
        self.store.check("update_packages")?;
        self.ops.push(UploadOp::Packages(upload_id, packages.to_vec()));
        Ok(())
    }

    async fn update_package_references(
        &mut self,
        upload_id: i64,
        references: &[PackageReference],
    ) -> Result<()> {
        self.store.check("update_package_references")?;
        self.ops
            .push(UploadOp::References(upload_id, references.to_vec()));
        Ok(())
    }

    async fn insert_dependency_sync_job(&mut self, upload_id: i64) -> Result<()> {
        self.store.check("insert_dependency_sync_job")?;
        self.ops.push(UploadOp::DependencySync(upload_id));
        Ok(())
    }

    async fn set_repository_dirty(&mut self, repository_id: i64) -> Result<()> {
        self.store.check("set_repository_dirty")?;
        self.ops.push(UploadOp::Dirty(repository_id));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.store.check("commit")?;
        let mut state = self.store.state.lock().unwrap();
        for op in self.ops {
            match op {
                UploadOp::DeleteOverlapping(upload) => {
                    for candidate in state.uploads.values_mut() {
                        if overlaps(candidate, &upload) {
                            candidate.state = UploadState::Deleted;
                        }
                    }
                }
                UploadOp::Packages(id, packages) => {
                    state.packages.insert(id, packages);
                }
                UploadOp::References(id, references) => {
                    state.references.insert(id, references);
                }
                UploadOp::DependencySync(id) => state.dependency_sync_jobs.push(id),
                UploadOp::Dirty(id) => *state.dirty_repositories.entry(id).or_insert(0) += 1,
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Document store
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct DocumentTables {
    metadata: HashMap<i64, ProcessedMetadata>,
    documents: HashMap<i64, HashMap<String, ProcessedDocument>>,
}

/// Document store over in-memory maps.
///
/// Metadata is unique per upload and documents per (upload, path), like
/// the constraints of a relational document store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDocumentStore {
    state: Arc<Mutex<DocumentTables>>,
    fail_on: Arc<Mutex<Option<String>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(&self, upload_id: i64) -> Option<ProcessedMetadata> {
        self.state.lock().unwrap().metadata.get(&upload_id).cloned()
    }

    /// Documents of an upload, ordered by path.
    pub fn documents(&self, upload_id: i64) -> Vec<ProcessedDocument> {
        let state = self.state.lock().unwrap();
        let mut documents: Vec<ProcessedDocument> = state
            .documents
            .get(&upload_id)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default();
        documents.sort_by(|a, b| a.path.cmp(&b.path));
        documents
    }

    pub fn fail_on(&self, operation: &str) {
        *self.fail_on.lock().unwrap() = Some(operation.to_string());
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn transact(&self) -> Result<Box<dyn DocumentTransaction>> {
        check_failure(&self.fail_on, "transact")?;
        Ok(Box::new(InMemoryDocumentTransaction {
            store: self.clone(),
            metadata: None,
            queued: Vec::new(),
            written: Vec::new(),
        }))
    }
}

struct InMemoryDocumentTransaction {
    store: InMemoryDocumentStore,
    metadata: Option<(i64, ProcessedMetadata)>,
    queued: Vec<(i64, ProcessedDocument)>,
    written: Vec<(i64, ProcessedDocument)>,
}

impl InMemoryDocumentTransaction {
    fn check(&self, operation: &str) -> Result<()> {
        check_failure(&self.store.fail_on, operation)
    }
}

#[async_trait]
impl DocumentTransaction for InMemoryDocumentTransaction {
    async fn insert_metadata(
        &mut self,
        upload_id: i64,
        metadata: &ProcessedMetadata,
    ) -> Result<()> {
        self.check("insert_metadata")?;
        let exists = self.store.state.lock().unwrap().metadata.contains_key(&upload_id);
        if exists || self.metadata.is_some() {
            return Err(UniqueViolation(format!("metadata for upload {}", upload_id)).into());
        }
        self.metadata = Some((upload_id, metadata.clone()));
        Ok(())
    }

    async fn insert_document(
        &mut self,
        upload_id: i64,
        document: ProcessedDocument,
    ) -> Result<()> {
        self.check("insert_document")?;
        self.queued.push((upload_id, document));
        Ok(())
    }

    async fn flush(&mut self) -> Result<u64> {
        self.check("flush")?;
        {
            let state = self.store.state.lock().unwrap();
            for (upload_id, document) in &self.queued {
                let stored = state
                    .documents
                    .get(upload_id)
                    .map(|docs| docs.contains_key(&document.path))
                    .unwrap_or(false);
                let pending = self
                    .written
                    .iter()
                    .any(|(id, doc)| id == upload_id && doc.path == document.path);
                if stored || pending {
                    return Err(UniqueViolation(format!(
                        "document {} of upload {}",
                        document.path, upload_id
                    ))
                    .into());
                }
            }
        }
        self.written.append(&mut self.queued);
        Ok(self.written.len() as u64)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.check("commit")?;
        self.flush().await?;
        let InMemoryDocumentTransaction {
            store,
            metadata,
            written,
            ..
        } = *self;
        let mut state = store.state.lock().unwrap();
        if let Some((upload_id, metadata)) = metadata {
            state.metadata.insert(upload_id, metadata);
        }
        for (upload_id, document) in written {
            state
                .documents
                .entry(upload_id)
                .or_default()
                .insert(document.path.clone(), document);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Blob store
// ═══════════════════════════════════════════════════════════════════════

/// Blob store over an in-memory map.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    fail_on: Mutex<Option<String>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, name: &str, bytes: Vec<u8>) {
        self.blobs.write().unwrap().insert(name.to_string(), bytes);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.blobs.read().unwrap().contains_key(name)
    }

    pub fn fail_on(&self, operation: &str) {
        *self.fail_on.lock().unwrap() = Some(operation.to_string());
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        check_failure(&self.fail_on, "get")?;
        match self.blobs.read().unwrap().get(name) {
            Some(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            None => bail!("blob {} not found", name),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        check_failure(&self.fail_on, "delete")?;
        self.blobs.write().unwrap().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> Repository {
        Repository {
            id: 1,
            name: "github.com/acme/web".to_string(),
        }
    }

    #[tokio::test]
    async fn test_source_control_resolution() {
        let source = InMemorySourceControl::new();
        source.add_commit("github.com/acme/web", "abc", Some(Utc::now()), &[]);

        assert!(source.resolve_revision(&repo(), "abc").await.is_ok());
        let err = source.resolve_revision(&repo(), "def").await.unwrap_err();
        assert!(matches!(err, RevisionError::NotFound { .. }));

        source.set_cloning("github.com/acme/web", true);
        let err = source.resolve_revision(&repo(), "abc").await.unwrap_err();
        assert!(matches!(err, RevisionError::Cloning { .. }));
    }

    #[tokio::test]
    async fn test_directory_children_include_subdirectories() {
        let source = InMemorySourceControl::new();
        source.add_commit(
            "github.com/acme/web",
            "abc",
            None,
            &["README.md", "src/main.rs", "src/bin/tool.rs"],
        );
        let children = source
            .list_directory_children(&repo(), "abc", &["".to_string(), "src".to_string()])
            .await
            .unwrap();
        assert_eq!(children[""], vec!["README.md", "src"]);
        assert_eq!(children["src"], vec!["src/bin", "src/main.rs"]);
    }

    #[tokio::test]
    async fn test_branch_queries() {
        let source = InMemorySourceControl::new();
        source.add_branch("github.com/acme/web", "main", "c3", &["c1", "c2"], true);
        source.add_branch("github.com/acme/web", "feature", "c2", &["c1"], false);

        let refs = source.ref_descriptions(&repo(), "c2").await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "feature");

        let containing = source.branches_containing(&repo(), "c1").await.unwrap();
        assert_eq!(containing.len(), 2);
    }

    #[tokio::test]
    async fn test_uncommitted_document_transaction_leaves_no_trace() {
        let store = InMemoryDocumentStore::new();
        let mut tx = store.transact().await.unwrap();
        tx.insert_metadata(7, &ProcessedMetadata::default()).await.unwrap();
        tx.insert_document(
            7,
            ProcessedDocument {
                path: "a.rs".into(),
                payload: Default::default(),
            },
        )
        .await
        .unwrap();
        assert_eq!(tx.flush().await.unwrap(), 1);
        tx.rollback().await.unwrap();

        assert!(store.metadata(7).is_none());
        assert!(store.documents(7).is_empty());
    }

    #[tokio::test]
    async fn test_second_metadata_insert_is_unique_violation() {
        let store = InMemoryDocumentStore::new();
        let mut tx = store.transact().await.unwrap();
        tx.insert_metadata(7, &ProcessedMetadata::default()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.transact().await.unwrap();
        let err = tx
            .insert_metadata(7, &ProcessedMetadata::default())
            .await
            .unwrap_err();
        assert!(crate::error::is_unique_violation(&err));
    }
}
