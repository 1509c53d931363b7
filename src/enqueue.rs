//! Enqueueing of local index files as uploads.
//!
//! Stores the artifact gzip-compressed in the blob store and inserts a
//! queued upload row. The upload row and blob are written before the
//! transaction commits, so a worker never sees an upload without its blob.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use scip_ingest_core::models::{self, CONTENT_TYPE_LSIF, CONTENT_TYPE_SCIP};
use scip_ingest_core::scip::{EntryKind, IndexEntry, IndexReader};

use crate::blobstore::FsBlobStore;
use crate::config::Config;
use crate::db;
use crate::sqlite_store::{self, NewUpload, SqliteUploadStore};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub file: PathBuf,
    pub repository: String,
    pub commit: String,
    pub root: String,
    pub indexer: Option<String>,
    pub indexer_version: Option<String>,
    pub lsif: bool,
}

/// Artifact bytes as stored, with both sizes.
struct Artifact {
    compressed: Vec<u8>,
    uncompressed_size: i64,
}

fn read_artifact(path: &Path) -> Result<Artifact> {
    let raw =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    if raw.starts_with(&GZIP_MAGIC) {
        let uncompressed_size = io::copy(&mut MultiGzDecoder::new(raw.as_slice()), &mut io::sink())
            .with_context(|| format!("Failed to decompress {}", path.display()))?;
        return Ok(Artifact {
            compressed: raw,
            uncompressed_size: uncompressed_size as i64,
        });
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    Ok(Artifact {
        compressed: encoder.finish()?,
        uncompressed_size: raw.len() as i64,
    })
}

/// Tool name and version from the index metadata, if present.
fn read_tool_info(compressed: &[u8]) -> Result<Option<(String, String)>> {
    let mut reader = IndexReader::new(MultiGzDecoder::new(compressed));
    match reader.next_matching(|kind| kind == EntryKind::Metadata)? {
        Some(IndexEntry::Metadata(metadata)) => Ok(metadata
            .tool_info
            .map(|tool| (tool.name, tool.version))),
        _ => Ok(None),
    }
}

fn validate_commit(commit: &str) -> Result<()> {
    if commit.len() != 40 || !commit.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("Commit must be a 40-character hex SHA, got '{}'", commit);
    }
    Ok(())
}

/// Enqueues one upload, returning its id.
pub async fn enqueue(config: &Config, request: &EnqueueRequest) -> Result<i64> {
    validate_commit(&request.commit)?;
    let artifact = read_artifact(&request.file)?;

    let content_type = if request.lsif {
        CONTENT_TYPE_LSIF
    } else {
        CONTENT_TYPE_SCIP
    };
    let tool = if request.lsif {
        None
    } else {
        read_tool_info(&artifact.compressed)
            .with_context(|| format!("Failed to read index {}", request.file.display()))?
    };
    let indexer = match (&request.indexer, &tool) {
        (Some(indexer), _) => indexer.clone(),
        (None, Some((name, _))) if !name.is_empty() => name.clone(),
        _ => bail!("No indexer name in index metadata; pass --indexer"),
    };
    let indexer_version = request
        .indexer_version
        .clone()
        .or_else(|| tool.map(|(_, version)| version))
        .unwrap_or_default();

    let pool = db::connect(config).await?;
    let store = SqliteUploadStore::new(pool.clone());
    let blobs = FsBlobStore::new(&config.blobstore.root);
    let repository_id = store.ensure_repository(&request.repository).await?;

    let mut tx = pool.begin().await?;
    let upload_id = sqlite_store::insert_upload(
        &mut tx,
        &NewUpload {
            repository_id,
            commit: request.commit.clone(),
            root: request.root.clone(),
            indexer: indexer.clone(),
            indexer_version: indexer_version.clone(),
            content_type: content_type.to_string(),
            upload_size: artifact.compressed.len() as i64,
            uncompressed_size: Some(artifact.uncompressed_size),
        },
    )
    .await?;
    blobs.put(&models::blob_name(upload_id, content_type), &artifact.compressed)?;
    tx.commit().await?;
    pool.close().await;

    tracing::info!(upload_id, repository = %request.repository, commit = %request.commit, "enqueued upload");

    println!("enqueue {}", request.file.display());
    println!("  upload id: {}", upload_id);
    println!("  repository: {}", request.repository);
    println!("  commit: {}", request.commit);
    println!("  indexer: {} {}", indexer, indexer_version);
    println!("  compressed bytes: {}", artifact.compressed.len());
    println!("  uncompressed bytes: {}", artifact.uncompressed_size);
    println!("ok");

    Ok(upload_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use scip_ingest_core::fixtures::{gzip, sample_index, IndexBuilder};
    use tempfile::TempDir;

    #[test]
    fn test_plain_files_are_compressed() {
        let dir = TempDir::new().unwrap();
        let bytes = sample_index().encode_to_vec();
        let path = dir.path().join("index.scip");
        std::fs::write(&path, &bytes).unwrap();

        let artifact = read_artifact(&path).unwrap();
        assert!(artifact.compressed.starts_with(&GZIP_MAGIC));
        assert_eq!(artifact.uncompressed_size, bytes.len() as i64);

        let gz = dir.path().join("index.scip.gz");
        std::fs::write(&gz, gzip(&bytes)).unwrap();
        let artifact = read_artifact(&gz).unwrap();
        assert_eq!(artifact.uncompressed_size, bytes.len() as i64);
    }

    #[test]
    fn test_tool_info_comes_from_metadata() {
        let with = IndexBuilder::new("scip-go", "0.1.9").encode_gzipped();
        assert_eq!(
            read_tool_info(&with).unwrap(),
            Some(("scip-go".to_string(), "0.1.9".to_string()))
        );

        let without = IndexBuilder::without_metadata().encode_gzipped();
        assert_eq!(read_tool_info(&without).unwrap(), None);
    }

    #[test]
    fn test_validate_commit() {
        assert!(validate_commit(&"a".repeat(40)).is_ok());
        assert!(validate_commit("HEAD").is_err());
        assert!(validate_commit(&"z".repeat(40)).is_err());
    }
}
