//! First pass: index-wide aggregates needed before any document is emitted.

use std::collections::HashMap;

use anyhow::Result;

use crate::scip::{EntryKind, IndexVisitor, Metadata, SymbolInformation};

/// Everything the second pass needs to know about the whole index.
#[derive(Debug, Clone, Default)]
pub struct FirstPassSummary {
    pub metadata: Option<Metadata>,
    /// External symbol definitions by name. A later definition of the same
    /// name replaces an earlier one.
    pub external_symbols: HashMap<String, SymbolInformation>,
    /// Distinct document paths, in order of first appearance.
    pub paths: Vec<String>,
    /// Number of document fragments seen per path.
    pub fragment_counts: HashMap<String, usize>,
}

impl FirstPassSummary {
    pub fn fragment_count(&self, path: &str) -> usize {
        self.fragment_counts.get(path).copied().unwrap_or(0)
    }
}

/// [`IndexVisitor`] producing a [`FirstPassSummary`].
///
/// Documents are decoded down to their path only; occurrences, symbols
/// and text are skipped by the decoder.
#[derive(Debug, Default)]
pub struct FirstPassVisitor {
    summary: FirstPassSummary,
}

impl FirstPassVisitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> FirstPassSummary {
        self.summary
    }
}

impl IndexVisitor for FirstPassVisitor {
    fn visit_metadata(&mut self, metadata: Metadata) -> Result<()> {
        self.summary.metadata = Some(metadata);
        Ok(())
    }

    fn wants(&self, kind: EntryKind) -> bool {
        kind != EntryKind::Document
    }

    fn visit_document_path(&mut self, path: String) -> Result<()> {
        let count = self.summary.fragment_counts.entry(path.clone()).or_insert(0);
        if *count == 0 {
            self.summary.paths.push(path);
        }
        *count += 1;
        Ok(())
    }

    fn visit_external_symbol(&mut self, symbol: SymbolInformation) -> Result<()> {
        if let Some(previous) = self.summary.external_symbols.insert(symbol.symbol.clone(), symbol) {
            tracing::debug!(symbol = %previous.symbol, "external symbol defined more than once");
        }
        Ok(())
    }
}
