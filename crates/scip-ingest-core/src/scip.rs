//! SCIP wire types and a streaming reader over the top-level `Index`.
//!
//! An index can be far larger than the memory we are willing to spend on it,
//! so [`IndexReader`] never decodes the `Index` message as a whole. It walks
//! the top-level fields one at a time and decodes a single metadata,
//! document, or external symbol message per step.
//!
//! ```text
//! Index
//! ├── 1: Metadata            (once)
//! ├── 2: Document            (repeated, may repeat a path)
//! └── 3: SymbolInformation   (repeated, external symbols)
//! ```

use std::io::{self, BufReader, Read};

use anyhow::{Context, Result};
use prost::Message;

use crate::error::InvalidUpload;

/// Bit set in [`Occurrence::symbol_roles`] for definitions.
pub const SYMBOL_ROLE_DEFINITION: i32 = 0x1;
pub const SYMBOL_ROLE_IMPORT: i32 = 0x2;
pub const SYMBOL_ROLE_WRITE_ACCESS: i32 = 0x4;
pub const SYMBOL_ROLE_READ_ACCESS: i32 = 0x8;

const FIELD_METADATA: u64 = 1;
const FIELD_DOCUMENTS: u64 = 2;
const FIELD_EXTERNAL_SYMBOLS: u64 = 3;

const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u64 = 1;
const WIRE_LENGTH_DELIMITED: u64 = 2;
const WIRE_FIXED32: u64 = 5;

/// Upper bound on the buffer reserved up front for one entry. Larger
/// entries grow the buffer as their bytes actually arrive.
const MAX_ENTRY_RESERVE: usize = 64 * 1024;

// ═══════════════════════════════════════════════════════════════════════
// Messages
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone, PartialEq, Message)]
pub struct Index {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<Metadata>,
    #[prost(message, repeated, tag = "2")]
    pub documents: Vec<Document>,
    #[prost(message, repeated, tag = "3")]
    pub external_symbols: Vec<SymbolInformation>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Metadata {
    #[prost(enumeration = "ProtocolVersion", tag = "1")]
    pub version: i32,
    #[prost(message, optional, tag = "2")]
    pub tool_info: Option<ToolInfo>,
    #[prost(string, tag = "3")]
    pub project_root: String,
    #[prost(enumeration = "TextEncoding", tag = "4")]
    pub text_document_encoding: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ToolInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub version: String,
    #[prost(string, repeated, tag = "3")]
    pub arguments: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Document {
    #[prost(string, tag = "1")]
    pub relative_path: String,
    #[prost(message, repeated, tag = "2")]
    pub occurrences: Vec<Occurrence>,
    #[prost(message, repeated, tag = "3")]
    pub symbols: Vec<SymbolInformation>,
    #[prost(string, tag = "4")]
    pub language: String,
    #[prost(string, tag = "5")]
    pub text: String,
    #[prost(enumeration = "PositionEncoding", tag = "6")]
    pub position_encoding: i32,
}

/// A [`Document`] decoded down to its path. Every other field is skipped
/// by the decoder.
#[derive(Clone, PartialEq, Message)]
pub struct DocumentPath {
    #[prost(string, tag = "1")]
    pub relative_path: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Occurrence {
    /// `[startLine, startCharacter, endCharacter]` for single-line ranges,
    /// `[startLine, startCharacter, endLine, endCharacter]` otherwise.
    #[prost(int32, repeated, tag = "1")]
    pub range: Vec<i32>,
    #[prost(string, tag = "2")]
    pub symbol: String,
    #[prost(int32, tag = "3")]
    pub symbol_roles: i32,
    #[prost(string, repeated, tag = "4")]
    pub override_documentation: Vec<String>,
    #[prost(int32, tag = "5")]
    pub syntax_kind: i32,
    #[prost(message, repeated, tag = "6")]
    pub diagnostics: Vec<Diagnostic>,
    #[prost(int32, repeated, tag = "7")]
    pub enclosing_range: Vec<i32>,
}

impl Occurrence {
    pub fn is_definition(&self) -> bool {
        self.symbol_roles & SYMBOL_ROLE_DEFINITION != 0
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct SymbolInformation {
    #[prost(string, tag = "1")]
    pub symbol: String,
    #[prost(string, repeated, tag = "3")]
    pub documentation: Vec<String>,
    #[prost(message, repeated, tag = "4")]
    pub relationships: Vec<Relationship>,
    #[prost(int32, tag = "5")]
    pub kind: i32,
    #[prost(string, tag = "6")]
    pub display_name: String,
    #[prost(message, optional, tag = "7")]
    pub signature_documentation: Option<Document>,
    #[prost(string, tag = "8")]
    pub enclosing_symbol: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Relationship {
    #[prost(string, tag = "1")]
    pub symbol: String,
    #[prost(bool, tag = "2")]
    pub is_reference: bool,
    #[prost(bool, tag = "3")]
    pub is_implementation: bool,
    #[prost(bool, tag = "4")]
    pub is_type_definition: bool,
    #[prost(bool, tag = "5")]
    pub is_definition: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct Diagnostic {
    #[prost(int32, tag = "1")]
    pub severity: i32,
    #[prost(string, tag = "2")]
    pub code: String,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(string, tag = "4")]
    pub source: String,
    #[prost(int32, repeated, tag = "5")]
    pub tags: Vec<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ProtocolVersion {
    UnspecifiedProtocolVersion = 0,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum TextEncoding {
    UnspecifiedTextEncoding = 0,
    Utf8 = 1,
    Utf16 = 2,
}

impl TextEncoding {
    /// Name stored alongside processed metadata.
    pub fn label(value: i32) -> &'static str {
        match TextEncoding::try_from(value) {
            Ok(TextEncoding::Utf8) => "UTF8",
            Ok(TextEncoding::Utf16) => "UTF16",
            _ => "UnspecifiedTextEncoding",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PositionEncoding {
    UnspecifiedPositionEncoding = 0,
    Utf8CodeUnitOffsetFromLineStart = 1,
    Utf16CodeUnitOffsetFromLineStart = 2,
    Utf32CodeUnitOffsetFromLineStart = 3,
}

// ═══════════════════════════════════════════════════════════════════════
// Streaming reader
// ═══════════════════════════════════════════════════════════════════════

/// Kind of a top-level index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Metadata,
    Document,
    /// A document entry of which only the path is decoded. Asked for only
    /// when [`EntryKind::Document`] is not wanted.
    DocumentPath,
    ExternalSymbol,
}

/// One decoded top-level entry of an index.
#[derive(Debug, Clone)]
pub enum IndexEntry {
    Metadata(Metadata),
    Document(Document),
    DocumentPath(String),
    ExternalSymbol(SymbolInformation),
}

/// Per-entity callbacks for a single streaming pass over an index.
///
/// Each pass over an index is a struct implementing this trait and
/// accumulating into its own output, so passes can be exercised in
/// isolation.
pub trait IndexVisitor {
    /// Entries for which this returns `false` are skipped without decoding.
    fn wants(&self, _kind: EntryKind) -> bool {
        true
    }

    fn visit_metadata(&mut self, _metadata: Metadata) -> Result<()> {
        Ok(())
    }

    fn visit_document(&mut self, _document: Document) -> Result<()> {
        Ok(())
    }

    fn visit_document_path(&mut self, _path: String) -> Result<()> {
        Ok(())
    }

    fn visit_external_symbol(&mut self, _symbol: SymbolInformation) -> Result<()> {
        Ok(())
    }
}

impl IndexEntry {
    pub fn kind(&self) -> EntryKind {
        match self {
            IndexEntry::Metadata(_) => EntryKind::Metadata,
            IndexEntry::Document(_) => EntryKind::Document,
            IndexEntry::DocumentPath(_) => EntryKind::DocumentPath,
            IndexEntry::ExternalSymbol(_) => EntryKind::ExternalSymbol,
        }
    }

    /// Dispatches this entry to the matching visitor method.
    pub fn accept<V: IndexVisitor + ?Sized>(self, visitor: &mut V) -> Result<()> {
        match self {
            IndexEntry::Metadata(metadata) => visitor.visit_metadata(metadata),
            IndexEntry::Document(document) => visitor.visit_document(document),
            IndexEntry::DocumentPath(path) => visitor.visit_document_path(path),
            IndexEntry::ExternalSymbol(symbol) => visitor.visit_external_symbol(symbol),
        }
    }
}

/// Pull parser over the top-level fields of a serialized `Index`.
pub struct IndexReader<R> {
    inner: BufReader<R>,
    offset: u64,
    scratch: Vec<u8>,
}

impl<R: Read> IndexReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            offset: 0,
            scratch: Vec::new(),
        }
    }

    /// Number of bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the underlying reader. Read-ahead buffered data is discarded.
    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }

    /// Returns the next entry, decoding every kind.
    pub fn next_entry(&mut self) -> Result<Option<IndexEntry>> {
        self.next_matching(|_| true)
    }

    /// Returns the next entry whose kind satisfies `want`. Other entries and
    /// unknown fields are skipped without being decoded.
    pub fn next_matching<F>(&mut self, want: F) -> Result<Option<IndexEntry>>
    where
        F: Fn(EntryKind) -> bool,
    {
        loop {
            let key = match self.read_varint(true)? {
                Some(key) => key,
                None => return Ok(None),
            };
            let field = key >> 3;
            let wire_type = key & 0x7;

            let kind = match field {
                FIELD_METADATA => Some(EntryKind::Metadata),
                FIELD_DOCUMENTS => Some(EntryKind::Document),
                FIELD_EXTERNAL_SYMBOLS => Some(EntryKind::ExternalSymbol),
                _ => None,
            };

            let kind = match kind {
                Some(kind) if wire_type == WIRE_LENGTH_DELIMITED => kind,
                Some(_) => {
                    return Err(InvalidUpload(format!(
                        "index field {} has wire type {}, expected length-delimited (offset {})",
                        field, wire_type, self.offset
                    ))
                    .into())
                }
                None => {
                    self.skip_field(wire_type)?;
                    continue;
                }
            };

            let kind = match kind {
                EntryKind::Document if !want(kind) && want(EntryKind::DocumentPath) => {
                    EntryKind::DocumentPath
                }
                kind => kind,
            };

            let len = self.read_length()?;
            if !want(kind) {
                self.skip_bytes(len)?;
                continue;
            }

            let offset = self.offset;
            self.read_payload(len)?;
            let payload = self.scratch.as_slice();
            let entry = match kind {
                EntryKind::Metadata => {
                    IndexEntry::Metadata(Metadata::decode(payload).context(invalid(
                        "failed to decode index metadata",
                        offset,
                    ))?)
                }
                EntryKind::Document => {
                    IndexEntry::Document(Document::decode(payload).context(invalid(
                        "failed to decode index document",
                        offset,
                    ))?)
                }
                EntryKind::DocumentPath => IndexEntry::DocumentPath(
                    DocumentPath::decode(payload)
                        .context(invalid("failed to decode index document", offset))?
                        .relative_path,
                ),
                EntryKind::ExternalSymbol => IndexEntry::ExternalSymbol(
                    SymbolInformation::decode(payload)
                        .context(invalid("failed to decode external symbol", offset))?,
                ),
            };
            return Ok(Some(entry));
        }
    }

    fn read_length(&mut self) -> Result<u64> {
        match self.read_varint(false)? {
            Some(len) => Ok(len),
            None => Err(invalid("unexpected end of index", self.offset).into()),
        }
    }

    /// Reads a base-128 varint. Returns `None` on a clean EOF before the first
    /// byte when `eof_ok` is set.
    fn read_varint(&mut self, eof_ok: bool) -> Result<Option<u64>> {
        let mut value: u64 = 0;
        for shift in (0..64).step_by(7) {
            let byte = match self.read_byte()? {
                Some(byte) => byte,
                None if shift == 0 && eof_ok => return Ok(None),
                None => {
                    return Err(invalid("unexpected end of index inside varint", self.offset).into())
                }
            };
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(Some(value));
            }
        }
        Err(invalid("malformed varint", self.offset).into())
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.offset += 1;
                    return Ok(Some(byte[0]));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_error(e, "Failed to read index")),
            }
        }
    }

    fn read_payload(&mut self, len: u64) -> Result<()> {
        self.scratch.clear();
        let reserve =
            usize::try_from(len).map_or(MAX_ENTRY_RESERVE, |len| len.min(MAX_ENTRY_RESERVE));
        self.scratch.reserve(reserve);
        let read = (&mut self.inner)
            .take(len)
            .read_to_end(&mut self.scratch)
            .map_err(|e| read_error(e, "Failed to read index entry"))?;
        self.offset += read as u64;
        if read as u64 != len {
            return Err(InvalidUpload(format!(
                "unexpected end of index: entry declares {} bytes, {} available",
                len, read
            ))
            .into());
        }
        Ok(())
    }

    fn skip_bytes(&mut self, len: u64) -> Result<()> {
        let skipped = io::copy(&mut (&mut self.inner).take(len), &mut io::sink())
            .map_err(|e| read_error(e, "Failed to skip index entry"))?;
        self.offset += skipped;
        if skipped != len {
            return Err(InvalidUpload(format!(
                "unexpected end of index while skipping {} bytes",
                len
            ))
            .into());
        }
        Ok(())
    }

    fn skip_field(&mut self, wire_type: u64) -> Result<()> {
        match wire_type {
            WIRE_VARINT => {
                self.read_length()?;
                Ok(())
            }
            WIRE_FIXED64 => self.skip_bytes(8),
            WIRE_LENGTH_DELIMITED => {
                let len = self.read_length()?;
                self.skip_bytes(len)
            }
            WIRE_FIXED32 => self.skip_bytes(4),
            other => Err(InvalidUpload(format!(
                "unsupported wire type {} at offset {}",
                other, self.offset
            ))
            .into()),
        }
    }
}

fn invalid(what: &str, offset: u64) -> InvalidUpload {
    InvalidUpload(format!("{} at offset {}", what, offset))
}

/// Errors from the decompressor that mean the upload itself is damaged are
/// tagged [`InvalidUpload`]. Anything else comes from the storage under the
/// reader and stays untagged.
fn read_error(error: io::Error, what: &'static str) -> anyhow::Error {
    match error.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            let tag = InvalidUpload(format!("corrupt compressed index: {}", error));
            anyhow::Error::new(error).context(what).context(tag)
        }
        _ => anyhow::Error::new(error).context(what),
    }
}

/// Drives `reader` to the end, dispatching every wanted entry to `visitor`.
pub fn visit_index<R, V>(reader: R, visitor: &mut V) -> Result<()>
where
    R: Read,
    V: IndexVisitor + ?Sized,
{
    let mut entries = IndexReader::new(reader);
    while let Some(entry) = entries.next_matching(|kind| visitor.wants(kind))? {
        entry.accept(visitor)?;
    }
    Ok(())
}
