//! Two-pass streaming correlation of a SCIP index.
//!
//! # Passes
//!
//! 1. **Aggregate** ([`Correlation::prepare`]): read metadata, count
//!    document fragments per path and index external symbols by name. The
//!    distinct paths are then checked against the repository tree and
//!    missing ones become the ignore set.
//! 2. **Materialize** ([`Correlation::materialize`]): read the index again,
//!    merge split documents, inject the external symbols they reach, put
//!    them in canonical form and hand them to a [`DocumentSink`] one at a
//!    time while classifying packages.
//!
//! The reader is rewound before and after the second pass, so the same
//! [`DecompressingReader`] can be correlated again from scratch.

pub mod canonical;
pub mod first_pass;
pub mod packages;
pub mod second_pass;

use std::collections::HashSet;
use std::io::Read;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Cancelled, InvalidUpload};
use crate::models::{ProcessedDocument, ProcessedMetadata, ProcessedPackageData};
use crate::pathexistence::{ChildrenLookup, PathExistenceChecker};
use crate::reader::DecompressingReader;
use crate::scip::{EntryKind, IndexEntry, IndexReader, IndexVisitor};

pub use first_pass::{FirstPassSummary, FirstPassVisitor};
pub use second_pass::{SecondPassStats, SecondPassVisitor};

/// Receives materialized documents, one at a time.
#[async_trait]
pub trait DocumentSink: Send {
    async fn accept(&mut self, document: ProcessedDocument) -> Result<()>;
}

/// Keeps every document in memory. Mostly useful in tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub documents: Vec<ProcessedDocument>,
}

#[async_trait]
impl DocumentSink for CollectingSink {
    async fn accept(&mut self, document: ProcessedDocument) -> Result<()> {
        self.documents.push(document);
        Ok(())
    }
}

/// Drops every document.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl DocumentSink for DiscardSink {
    async fn accept(&mut self, _document: ProcessedDocument) -> Result<()> {
        Ok(())
    }
}

/// Counters of a completed correlation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationStats {
    pub paths: usize,
    pub ignored_paths: usize,
    pub external_symbols: usize,
    pub documents: usize,
    pub ignored_fragments: usize,
    pub failed_merges: usize,
    pub injected_symbols: usize,
}

/// Output of the second pass.
#[derive(Debug, Clone, Default)]
pub struct CorrelationOutput {
    pub packages: ProcessedPackageData,
    pub stats: CorrelationStats,
}

/// State carried from the first pass into the second.
#[derive(Debug, Clone)]
pub struct Correlation {
    metadata: ProcessedMetadata,
    summary: FirstPassSummary,
    ignored: HashSet<String>,
}

impl Correlation {
    /// Runs the aggregate pass over `reader` and computes the ignore set.
    ///
    /// Index paths are resolved against `root` through `lookup`. The reader
    /// is rewound afterwards.
    pub async fn prepare<L>(
        reader: &mut DecompressingReader,
        root: &str,
        lookup: &L,
        cancel: &CancellationToken,
    ) -> Result<Self>
    where
        L: ChildrenLookup + ?Sized,
    {
        reader.rewind().context("Failed to rewind upload")?;
        let mut visitor = FirstPassVisitor::new();
        {
            let mut entries = IndexReader::new(&mut *reader);
            while let Some(entry) = next_entry(&mut entries, &visitor, cancel)? {
                let is_document =
                    matches!(entry.kind(), EntryKind::Document | EntryKind::DocumentPath);
                entry.accept(&mut visitor)?;
                if is_document {
                    tokio::task::yield_now().await;
                }
            }
        }
        reader.rewind().context("Failed to rewind upload")?;

        let summary = visitor.finish();
        let metadata = match &summary.metadata {
            Some(metadata) => ProcessedMetadata::from(metadata),
            None => return Err(InvalidUpload("index has no metadata".to_string()).into()),
        };

        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        let checker = PathExistenceChecker::load(root, &summary.paths, lookup)
            .await
            .context("Failed to list repository paths")?;
        let ignored: HashSet<String> = summary
            .paths
            .iter()
            .filter(|path| !checker.exists(path))
            .cloned()
            .collect();

        tracing::debug!(
            paths = summary.paths.len(),
            ignored = ignored.len(),
            external_symbols = summary.external_symbols.len(),
            "aggregated index"
        );

        Ok(Self {
            metadata,
            summary,
            ignored,
        })
    }

    pub fn metadata(&self) -> &ProcessedMetadata {
        &self.metadata
    }

    pub fn summary(&self) -> &FirstPassSummary {
        &self.summary
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignored.contains(path)
    }

    /// Ignored paths in sorted order.
    pub fn ignored_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.ignored.iter().cloned().collect();
        paths.sort();
        paths
    }

    /// Runs the materialize pass, feeding every kept document to `sink`.
    ///
    /// Checks `cancel` before every entry and yields to the runtime after
    /// every document. The reader is rewound before and after the pass.
    pub async fn materialize<S>(
        &self,
        reader: &mut DecompressingReader,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<CorrelationOutput>
    where
        S: DocumentSink + ?Sized,
    {
        reader.rewind().context("Failed to rewind upload")?;
        let mut visitor = SecondPassVisitor::new(&self.summary, &self.ignored);
        {
            let mut entries = IndexReader::new(&mut *reader);
            while let Some(entry) = next_entry(&mut entries, &visitor, cancel)? {
                entry.accept(&mut visitor)?;
                while let Some(document) = visitor.pop_ready() {
                    let path = document.path.clone();
                    sink.accept(document)
                        .await
                        .with_context(|| format!("Failed to store document {}", path))?;
                }
                tokio::task::yield_now().await;
            }
        }
        reader.rewind().context("Failed to rewind upload")?;

        let (packages, pass) = visitor.finish();
        let stats = CorrelationStats {
            paths: self.summary.paths.len(),
            ignored_paths: self.ignored.len(),
            external_symbols: self.summary.external_symbols.len(),
            documents: pass.documents,
            ignored_fragments: pass.ignored_fragments,
            failed_merges: pass.failed_merges,
            injected_symbols: pass.injected_symbols,
        };
        tracing::debug!(
            documents = stats.documents,
            packages = packages.packages.len(),
            references = packages.references.len(),
            failed_merges = stats.failed_merges,
            "materialized index"
        );

        Ok(CorrelationOutput { packages, stats })
    }
}

/// Reads the next entry `visitor` wants, failing if `cancel` has fired.
fn next_entry<R, V>(
    entries: &mut IndexReader<R>,
    visitor: &V,
    cancel: &CancellationToken,
) -> Result<Option<IndexEntry>>
where
    R: Read,
    V: IndexVisitor,
{
    if cancel.is_cancelled() {
        return Err(Cancelled.into());
    }
    entries.next_matching(|kind| visitor.wants(kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{sample_upload, IndexBuilder, SAMPLE_PATHS};
    use crate::models::Repository;
    use crate::store::memory::InMemorySourceControl;
    use crate::store::CommitTree;

    const COMMIT: &str = "deadbeef";

    fn repository() -> Repository {
        Repository {
            id: 1,
            name: "github.com/acme/template".to_string(),
        }
    }

    fn source(files: &[&str]) -> InMemorySourceControl {
        let source = InMemorySourceControl::new();
        source.add_commit("github.com/acme/template", COMMIT, None, files);
        source
    }

    async fn prepare(
        reader: &mut DecompressingReader,
        source: &InMemorySourceControl,
    ) -> Result<Correlation> {
        let repository = repository();
        let tree = CommitTree {
            source,
            repository: &repository,
            commit: COMMIT,
        };
        Correlation::prepare(reader, "", &tree, &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_sample_index_correlates() {
        let source = source(&SAMPLE_PATHS);
        let mut reader = DecompressingReader::in_memory(sample_upload());
        let correlation = prepare(&mut reader, &source).await.unwrap();
        assert_eq!(correlation.metadata().tool_name, "scip-typescript");
        assert!(correlation.ignored_paths().is_empty());

        let mut sink = CollectingSink::default();
        let output = correlation
            .materialize(&mut reader, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.documents.len(), 11);
        assert_eq!(output.stats.documents, 11);
        assert_eq!(output.stats.failed_merges, 0);
        assert_eq!(output.packages.packages.len(), 1);
        assert_eq!(output.packages.references.len(), 8);

        // Three fragments of ast.ts collapse into one document.
        let ast = sink
            .documents
            .iter()
            .find(|d| d.path == "src/parser/ast.ts")
            .unwrap();
        assert_eq!(ast.payload.occurrences.len(), 5);

        // Observable pulls in the types it implements, transitively.
        let lexer = sink
            .documents
            .iter()
            .find(|d| d.path == "src/parser/lexer.ts")
            .unwrap();
        assert_eq!(lexer.payload.symbols.len(), 3);
    }

    #[tokio::test]
    async fn test_materialize_is_repeatable() {
        let source = source(&SAMPLE_PATHS);
        let mut reader = DecompressingReader::in_memory(sample_upload());
        let correlation = prepare(&mut reader, &source).await.unwrap();

        let mut first = CollectingSink::default();
        let mut second = CollectingSink::default();
        let cancel = CancellationToken::new();
        correlation
            .materialize(&mut reader, &mut first, &cancel)
            .await
            .unwrap();
        correlation
            .materialize(&mut reader, &mut second, &cancel)
            .await
            .unwrap();
        assert_eq!(first.documents, second.documents);
    }

    #[tokio::test]
    async fn test_missing_paths_are_ignored() {
        let source = source(&SAMPLE_PATHS[..9]);
        let mut reader = DecompressingReader::in_memory(sample_upload());
        let correlation = prepare(&mut reader, &source).await.unwrap();
        assert_eq!(
            correlation.ignored_paths(),
            vec!["test/index.test.ts", "test/util.test.ts"]
        );

        let output = correlation
            .materialize(&mut reader, &mut DiscardSink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.stats.documents, 9);
        assert_eq!(output.stats.ignored_fragments, 2);
    }

    #[tokio::test]
    async fn test_missing_metadata_is_invalid() {
        let source = source(&SAMPLE_PATHS);
        let mut reader =
            DecompressingReader::in_memory(IndexBuilder::without_metadata().encode_gzipped());
        let err = prepare(&mut reader, &source).await.unwrap_err();
        assert!(err.downcast_ref::<InvalidUpload>().is_some());
    }

    #[tokio::test]
    async fn test_cancelled_materialize_stops() {
        let source = source(&SAMPLE_PATHS);
        let mut reader = DecompressingReader::in_memory(sample_upload());
        let correlation = prepare(&mut reader, &source).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut sink = CollectingSink::default();
        let err = correlation
            .materialize(&mut reader, &mut sink, &cancel)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<Cancelled>().is_some());
        assert!(sink.documents.is_empty());
    }
}
