//! Core data models used throughout the upload pipeline.
//!
//! These types represent the upload records, extracted packages, and
//! processed documents that flow from the correlator into the stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scip;

/// Content type of SCIP uploads, the only format this pipeline processes.
pub const CONTENT_TYPE_SCIP: &str = "application/x-protobuf+scip";

/// Content type of legacy LSIF uploads. No longer processed.
pub const CONTENT_TYPE_LSIF: &str = "application/x-ndjson+lsif";

/// Name of the raw artifact of an upload in blob storage:
/// `upload-<id>.<format>.gz`.
pub fn blob_name(upload_id: i64, content_type: &str) -> String {
    let format = if content_type == CONTENT_TYPE_LSIF {
        "lsif"
    } else {
        "scip"
    };
    format!("upload-{}.{}.gz", upload_id, format)
}

/// Scheduler-owned processing state of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Queued,
    Processing,
    Completed,
    Errored,
    Deleted,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Queued => "queued",
            UploadState::Processing => "processing",
            UploadState::Completed => "completed",
            UploadState::Errored => "errored",
            UploadState::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(UploadState::Queued),
            "processing" => Some(UploadState::Processing),
            "completed" => Some(UploadState::Completed),
            "errored" => Some(UploadState::Errored),
            "deleted" => Some(UploadState::Deleted),
            _ => None,
        }
    }
}

/// One uploaded index artifact.
///
/// Identity fields are immutable once dequeued; `state`, `failure_message`,
/// `process_after` and `num_failures` belong to the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct Upload {
    pub id: i64,
    pub repository_id: i64,
    pub commit: String,
    pub root: String,
    pub indexer: String,
    pub indexer_version: String,
    pub content_type: String,
    /// Declared compressed (on-wire) size in bytes.
    pub upload_size: i64,
    /// Declared uncompressed size in bytes, when the uploader knew it.
    pub uncompressed_size: Option<i64>,
    pub uploaded_at: DateTime<Utc>,
    pub state: UploadState,
    pub failure_message: Option<String>,
    pub process_after: Option<DateTime<Utc>>,
    pub num_failures: i64,
}

impl Upload {
    pub fn blob_name(&self) -> String {
        blob_name(self.id, &self.content_type)
    }

    pub fn is_scip(&self) -> bool {
        self.content_type == CONTENT_TYPE_SCIP
    }
}

/// A repository known to the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repository {
    pub id: i64,
    pub name: String,
}

/// A dependency identity extracted from symbol names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Package {
    pub scheme: String,
    pub manager: String,
    pub name: String,
    pub version: String,
}

/// A package used, but not defined, by an upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageReference {
    pub package: Package,
}

/// Packages defined and referenced by one upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessedPackageData {
    pub packages: Vec<Package>,
    pub references: Vec<PackageReference>,
}

impl ProcessedPackageData {
    /// Sorts and de-duplicates both lists, and drops every reference to a
    /// package that is also defined, so the two sets are disjoint.
    pub fn normalize(&mut self) {
        self.packages.sort();
        self.packages.dedup();

        let packages = &self.packages;
        self.references
            .retain(|reference| packages.binary_search(&reference.package).is_err());
        self.references.sort();
        self.references.dedup();
    }
}

/// Index-wide metadata persisted next to the documents of an upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessedMetadata {
    pub text_document_encoding: String,
    pub tool_name: String,
    pub tool_version: String,
    pub tool_arguments: Vec<String>,
    pub protocol_version: i32,
}

impl From<&scip::Metadata> for ProcessedMetadata {
    fn from(metadata: &scip::Metadata) -> Self {
        let tool = metadata.tool_info.clone().unwrap_or_default();
        Self {
            text_document_encoding: scip::TextEncoding::label(metadata.text_document_encoding)
                .to_string(),
            tool_name: tool.name,
            tool_version: tool.version,
            tool_arguments: tool.arguments,
            protocol_version: metadata.version,
        }
    }
}

/// A canonical document ready for persistence.
///
/// The path lives here rather than in the payload so the payload bytes do
/// not change when a file moves.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedDocument {
    pub path: String,
    pub payload: scip::Document,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str) -> Package {
        Package {
            scheme: "scip-go".to_string(),
            manager: "gomod".to_string(),
            name: name.to_string(),
            version: "v1".to_string(),
        }
    }

    #[test]
    fn test_normalize_sorts_dedupes_and_separates() {
        let mut data = ProcessedPackageData {
            packages: vec![pkg("b"), pkg("a"), pkg("b")],
            references: vec![
                PackageReference { package: pkg("c") },
                PackageReference { package: pkg("a") },
                PackageReference { package: pkg("c") },
            ],
        };
        data.normalize();
        assert_eq!(data.packages, vec![pkg("a"), pkg("b")]);
        assert_eq!(data.references, vec![PackageReference { package: pkg("c") }]);
    }

    #[test]
    fn test_blob_name() {
        let upload = Upload {
            id: 42,
            repository_id: 1,
            commit: "deadbeef".to_string(),
            root: String::new(),
            indexer: "scip-go".to_string(),
            indexer_version: String::new(),
            content_type: CONTENT_TYPE_SCIP.to_string(),
            upload_size: 10,
            uncompressed_size: None,
            uploaded_at: Utc::now(),
            state: UploadState::Queued,
            failure_message: None,
            process_after: None,
            num_failures: 0,
        };
        assert_eq!(upload.blob_name(), "upload-42.scip.gz");
        assert!(upload.is_scip());
    }

    #[test]
    fn test_upload_state_round_trips_through_str() {
        for state in [
            UploadState::Queued,
            UploadState::Processing,
            UploadState::Completed,
            UploadState::Errored,
            UploadState::Deleted,
        ] {
            assert_eq!(UploadState::parse(state.as_str()), Some(state));
        }
    }
}
