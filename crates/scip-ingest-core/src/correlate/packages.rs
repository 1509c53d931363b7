//! Classification of packages as defined or referenced by an upload.

use std::collections::HashMap;

use crate::models::{Package, PackageReference, ProcessedPackageData};
use crate::scip::Document;
use crate::symbol::{is_local_symbol, package_for_symbol};

/// Accumulates, across every document of an upload, whether each package
/// touched by the upload is defined by it.
///
/// A package becomes defined as soon as one occurrence with the definition
/// role points into it, and stays defined. Packages only ever seen in other
/// roles are references.
#[derive(Debug, Default)]
pub struct PackageRoles {
    defined: HashMap<Package, bool>,
}

impl PackageRoles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the packages of every symbol, relationship target and
    /// non-local occurrence in `document`.
    pub fn observe_document(&mut self, document: &Document) {
        for symbol in &document.symbols {
            self.observe(&symbol.symbol, false);
            for relationship in &symbol.relationships {
                self.observe(&relationship.symbol, false);
            }
        }

        for occurrence in &document.occurrences {
            if occurrence.symbol.is_empty() || is_local_symbol(&occurrence.symbol) {
                continue;
            }
            self.observe(&occurrence.symbol, occurrence.is_definition());
        }
    }

    fn observe(&mut self, symbol: &str, is_definition: bool) {
        if let Some(package) = package_for_symbol(symbol) {
            let defined = self.defined.entry(package).or_insert(false);
            *defined |= is_definition;
        }
    }

    pub fn len(&self) -> usize {
        self.defined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defined.is_empty()
    }

    /// Splits the accumulated map into normalized package data.
    pub fn into_package_data(self) -> ProcessedPackageData {
        let mut data = ProcessedPackageData::default();
        for (package, defined) in self.defined {
            if defined {
                data.packages.push(package);
            } else {
                data.references.push(PackageReference { package });
            }
        }
        data.normalize();
        data
    }
}
