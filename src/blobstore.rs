//! Filesystem blob store.
//!
//! Raw uploads live as flat files under `blobstore.root`. Writes go
//! through a temporary file in the same directory and are renamed into
//! place, so readers never see a partial blob.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tempfile::NamedTempFile;

use scip_ingest_core::store::BlobStore;

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
            anyhow::bail!("Invalid blob name: '{}'", name);
        }
        Ok(self.root.join(name))
    }

    /// Stores `data` under `name`, replacing any existing blob.
    pub fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path(name)?;
        std::fs::create_dir_all(&self.root).with_context(|| {
            format!("Failed to create blob directory: {}", self.root.display())
        })?;

        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to write blob: {}", path.display()))?;
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).map(|p| p.is_file()).unwrap_or(false)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.path(name)?;
        let file =
            File::open(&path).with_context(|| format!("Failed to open blob: {}", path.display()))?;
        Ok(Box::new(file))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to delete blob: {}", path.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path().join("blobs"));

        store.put("upload-1.scip.gz", b"payload").unwrap();
        assert!(store.exists("upload-1.scip.gz"));

        let mut content = Vec::new();
        store
            .get("upload-1.scip.gz")
            .await
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"payload");

        store.delete("upload-1.scip.gz").await.unwrap();
        assert!(!store.exists("upload-1.scip.gz"));
        // Deleting twice is fine.
        store.delete("upload-1.scip.gz").await.unwrap();
        assert!(store.get("upload-1.scip.gz").await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_names_outside_root() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.put("../escape", b"x").is_err());
        assert!(store.get("a/b").await.is_err());
    }
}
