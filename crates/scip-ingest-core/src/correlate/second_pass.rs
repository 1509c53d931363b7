//! Second pass: merge, canonicalize, and classify every kept document.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::Result;

use super::canonical::{canonicalize_document, flatten_documents, inject_external_symbols};
use super::first_pass::FirstPassSummary;
use super::packages::PackageRoles;
use crate::models::{ProcessedDocument, ProcessedPackageData};
use crate::scip::{Document, EntryKind, IndexVisitor};

/// Counters reported at the end of the second pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecondPassStats {
    pub documents: usize,
    pub ignored_fragments: usize,
    pub failed_merges: usize,
    pub injected_symbols: usize,
}

/// [`IndexVisitor`] turning document fragments into [`ProcessedDocument`]s.
///
/// Fragments of a path seen once in the first pass are processed on
/// arrival. Fragments of split paths are held until the last one arrives,
/// then merged. Finished documents queue up until taken with
/// [`SecondPassVisitor::pop_ready`], so a caller can hand them off one at a
/// time.
pub struct SecondPassVisitor<'a> {
    summary: &'a FirstPassSummary,
    ignored: &'a HashSet<String>,
    pending: HashMap<String, Vec<Document>>,
    ready: VecDeque<ProcessedDocument>,
    packages: PackageRoles,
    stats: SecondPassStats,
}

impl<'a> SecondPassVisitor<'a> {
    pub fn new(summary: &'a FirstPassSummary, ignored: &'a HashSet<String>) -> Self {
        Self {
            summary,
            ignored,
            pending: HashMap::new(),
            ready: VecDeque::new(),
            packages: PackageRoles::new(),
            stats: SecondPassStats::default(),
        }
    }

    pub fn pop_ready(&mut self) -> Option<ProcessedDocument> {
        self.ready.pop_front()
    }

    pub fn stats(&self) -> SecondPassStats {
        self.stats
    }

    /// Ends the pass. Paths still waiting for fragments are reported and
    /// dropped.
    pub fn finish(self) -> (ProcessedPackageData, SecondPassStats) {
        let mut stats = self.stats;
        for (path, fragments) in &self.pending {
            tracing::warn!(
                path = %path,
                received = fragments.len(),
                expected = self.summary.fragment_count(path),
                "document fragments missing in second pass"
            );
            stats.failed_merges += 1;
        }
        (self.packages.into_package_data(), stats)
    }

    fn emit(&mut self, path: String, mut document: Document) {
        self.stats.injected_symbols +=
            inject_external_symbols(&mut document, &self.summary.external_symbols);
        canonicalize_document(&mut document);
        self.packages.observe_document(&document);
        self.stats.documents += 1;
        self.ready.push_back(ProcessedDocument {
            path,
            payload: document,
        });
    }
}

impl IndexVisitor for SecondPassVisitor<'_> {
    fn wants(&self, kind: EntryKind) -> bool {
        kind == EntryKind::Document
    }

    fn visit_document(&mut self, document: Document) -> Result<()> {
        let path = document.relative_path.clone();
        if self.ignored.contains(&path) {
            self.stats.ignored_fragments += 1;
            return Ok(());
        }

        let expected = self.summary.fragment_count(&path);
        if expected <= 1 {
            self.emit(path, document);
            return Ok(());
        }

        let fragments = self.pending.entry(path.clone()).or_default();
        fragments.push(document);
        if fragments.len() < expected {
            return Ok(());
        }

        let fragments = self.pending.remove(&path).unwrap_or_default();
        let mut merged = flatten_documents(fragments);
        if merged.len() != 1 {
            tracing::warn!(
                path = %path,
                documents = merged.len(),
                "merging document fragments did not yield exactly one document; skipping"
            );
            self.stats.failed_merges += 1;
            return Ok(());
        }
        if let Some(document) = merged.pop() {
            self.emit(path, document);
        }
        Ok(())
    }
}
