//! Document merging and canonicalization.
//!
//! Two uploads carrying the same semantic content for a file must produce
//! byte-identical payloads, since stored documents are de-duplicated by the
//! hash of their encoding.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::scip::{Diagnostic, Document, Occurrence, Relationship, SymbolInformation};
use crate::symbol::is_local_symbol;

/// Merges documents sharing a relative path into one document per path.
///
/// Occurrences and symbols are concatenated in input order. Language, text
/// and position encoding come from the first fragment that sets them.
/// Output is ordered by first appearance of each path.
pub fn flatten_documents(documents: Vec<Document>) -> Vec<Document> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, Document> = HashMap::new();

    for document in documents {
        match merged.get_mut(&document.relative_path) {
            Some(target) => {
                target.occurrences.extend(document.occurrences);
                target.symbols.extend(document.symbols);
                if target.language.is_empty() {
                    target.language = document.language;
                }
                if target.text.is_empty() {
                    target.text = document.text;
                }
                if target.position_encoding == 0 {
                    target.position_encoding = document.position_encoding;
                }
            }
            None => {
                order.push(document.relative_path.clone());
                merged.insert(document.relative_path.clone(), document);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|path| merged.remove(&path))
        .collect()
}

/// Adds a definition for every external symbol the document reaches but
/// does not define.
///
/// Starting from the symbols referenced by occurrences and relationships,
/// the frontier of referenced-but-undefined names is expanded until empty:
/// each name found in `external_symbols` is added to the document and its
/// own relationship targets join the next frontier. Names with no external
/// definition are dropped from the frontier.
///
/// Returns the number of injected symbols.
pub fn inject_external_symbols(
    document: &mut Document,
    external_symbols: &HashMap<String, SymbolInformation>,
) -> usize {
    let mut defined: HashSet<String> = document
        .symbols
        .iter()
        .map(|symbol| symbol.symbol.clone())
        .collect();

    let mut frontier: HashSet<String> = HashSet::new();
    for occurrence in &document.occurrences {
        frontier.insert(occurrence.symbol.clone());
    }
    for symbol in &document.symbols {
        for relationship in &symbol.relationships {
            frontier.insert(relationship.symbol.clone());
        }
    }

    let mut injected = 0;
    while !frontier.is_empty() {
        let mut next = HashSet::new();
        // Sorted so that injection order does not depend on hash order.
        let mut names: Vec<String> = frontier.into_iter().collect();
        names.sort();

        for name in names {
            if name.is_empty() || is_local_symbol(&name) || defined.contains(&name) {
                continue;
            }
            let Some(external) = external_symbols.get(&name) else {
                continue;
            };
            for relationship in &external.relationships {
                if !defined.contains(&relationship.symbol) {
                    next.insert(relationship.symbol.clone());
                }
            }
            defined.insert(name);
            document.symbols.push(external.clone());
            injected += 1;
        }
        frontier = next;
    }
    injected
}

/// Rewrites a document into its canonical form.
///
/// - the relative path is cleared (it is stored next to the payload)
/// - single-line four-element ranges collapse to three elements
/// - occurrences are sorted by every field, exact duplicates dropped
/// - symbol information is sorted by symbol and merged per symbol
/// - relationships are sorted by target and merged per target
pub fn canonicalize_document(document: &mut Document) {
    document.relative_path.clear();

    for occurrence in &mut document.occurrences {
        canonicalize_range(&mut occurrence.range);
        canonicalize_range(&mut occurrence.enclosing_range);
    }
    document.occurrences.sort_by(compare_occurrences);
    document.occurrences.dedup();

    let symbols = std::mem::take(&mut document.symbols);
    document.symbols = merge_symbols(symbols);
}

fn canonicalize_range(range: &mut Vec<i32>) {
    if range.len() == 4 && range[0] == range[2] {
        let end_character = range[3];
        range.truncate(2);
        range.push(end_character);
    }
}

fn compare_occurrences(a: &Occurrence, b: &Occurrence) -> Ordering {
    range_key(&a.range)
        .cmp(&range_key(&b.range))
        .then_with(|| a.symbol.cmp(&b.symbol))
        .then_with(|| a.symbol_roles.cmp(&b.symbol_roles))
        .then_with(|| a.syntax_kind.cmp(&b.syntax_kind))
        .then_with(|| a.range.cmp(&b.range))
        .then_with(|| a.enclosing_range.cmp(&b.enclosing_range))
        .then_with(|| a.override_documentation.cmp(&b.override_documentation))
        .then_with(|| {
            a.diagnostics
                .iter()
                .map(diagnostic_key)
                .cmp(b.diagnostics.iter().map(diagnostic_key))
        })
}

fn diagnostic_key(d: &Diagnostic) -> (i32, &str, &str, &str, &[i32]) {
    (
        d.severity,
        d.code.as_str(),
        d.message.as_str(),
        d.source.as_str(),
        d.tags.as_slice(),
    )
}

/// Four-element sort key `(start line, start char, end line, end char)`.
fn range_key(range: &[i32]) -> (i32, i32, i32, i32) {
    match *range {
        [line, start, end] => (line, start, line, end),
        [start_line, start, end_line, end] => (start_line, start, end_line, end),
        _ => (i32::MAX, i32::MAX, i32::MAX, i32::MAX),
    }
}

fn merge_symbols(symbols: Vec<SymbolInformation>) -> Vec<SymbolInformation> {
    let mut by_name: BTreeMap<String, SymbolInformation> = BTreeMap::new();

    for symbol in symbols {
        match by_name.get_mut(&symbol.symbol) {
            Some(existing) => {
                for line in symbol.documentation {
                    if !existing.documentation.contains(&line) {
                        existing.documentation.push(line);
                    }
                }
                existing.relationships.extend(symbol.relationships);
                if existing.kind == 0 {
                    existing.kind = symbol.kind;
                }
                if existing.display_name.is_empty() {
                    existing.display_name = symbol.display_name;
                }
                if existing.signature_documentation.is_none() {
                    existing.signature_documentation = symbol.signature_documentation;
                }
                if existing.enclosing_symbol.is_empty() {
                    existing.enclosing_symbol = symbol.enclosing_symbol;
                }
            }
            None => {
                by_name.insert(symbol.symbol.clone(), symbol);
            }
        }
    }

    by_name
        .into_values()
        .map(|mut symbol| {
            symbol.relationships = merge_relationships(std::mem::take(&mut symbol.relationships));
            symbol
        })
        .collect()
}

fn merge_relationships(relationships: Vec<Relationship>) -> Vec<Relationship> {
    let mut by_target: BTreeMap<String, Relationship> = BTreeMap::new();
    for relationship in relationships {
        by_target
            .entry(relationship.symbol.clone())
            .and_modify(|existing| {
                existing.is_reference |= relationship.is_reference;
                existing.is_implementation |= relationship.is_implementation;
                existing.is_type_definition |= relationship.is_type_definition;
                existing.is_definition |= relationship.is_definition;
            })
            .or_insert(relationship);
    }
    by_target.into_values().collect()
}
