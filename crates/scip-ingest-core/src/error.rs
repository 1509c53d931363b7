//! Error types callers branch on.
//!
//! Most fallible code returns `anyhow::Result` with context attached at each
//! collaborator call. The types here are the exceptions: they are either
//! returned directly (`ProcessError`, `RevisionError`) or attached to an
//! `anyhow::Error` so the handler can recover them with `downcast_ref`
//! (`UniqueViolation`, `InvalidUpload`, `Cancelled`, `StoreBusy`).

use std::fmt;

use thiserror::Error;

/// Failure class of a processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The upload itself is unusable. Retrying will not help.
    Input,
    /// A collaborator failed or is unreachable.
    Infrastructure,
    /// The attempt was cancelled before finishing.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Input => "input",
            ErrorKind::Infrastructure => "infrastructure",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of [`UploadHandler::handle`](crate::handler::UploadHandler::handle).
#[derive(Debug, Error)]
#[error("{error:#}")]
pub struct ProcessError {
    kind: ErrorKind,
    error: anyhow::Error,
}

impl ProcessError {
    pub fn input(error: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: ErrorKind::Input,
            error: error.into(),
        }
    }

    pub fn infrastructure(error: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: ErrorKind::Infrastructure,
            error: error.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            error: Cancelled.into(),
        }
    }

    /// Classifies an error coming out of the pipeline by the markers
    /// attached to it. Unmarked errors are infrastructure failures.
    pub fn classify(error: anyhow::Error) -> Self {
        let kind = if error.downcast_ref::<Cancelled>().is_some() {
            ErrorKind::Cancelled
        } else if error.downcast_ref::<InvalidUpload>().is_some() {
            ErrorKind::Input
        } else {
            ErrorKind::Infrastructure
        };
        Self { kind, error }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.error
    }
}

/// Outcome of resolving a commit against source control.
#[derive(Debug, Error)]
pub enum RevisionError {
    #[error("revision {commit} not found in repository {repository}")]
    NotFound { repository: String, commit: String },
    #[error("repository {repository} is still being cloned")]
    Cloning { repository: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RevisionError {
    /// Whether the upload should be retried later instead of failing.
    pub fn is_transient(&self) -> bool {
        matches!(self, RevisionError::NotFound { .. } | RevisionError::Cloning { .. })
    }
}

/// Marker for a violated uniqueness constraint in a store.
#[derive(Debug, Error)]
#[error("unique constraint violated: {0}")]
pub struct UniqueViolation(pub String);

/// Marker for an upload whose content cannot be processed.
#[derive(Debug, Error)]
#[error("invalid upload: {0}")]
pub struct InvalidUpload(pub String);

/// Marker for work abandoned because its cancellation token fired.
#[derive(Debug, Clone, Copy, Error)]
#[error("processing cancelled")]
pub struct Cancelled;

/// Marker for a store write that gave up waiting on a lock held elsewhere.
#[derive(Debug, Error)]
#[error("store busy: {0}")]
pub struct StoreBusy(pub String);

/// Whether `error` or any error in its chain is a [`StoreBusy`].
pub fn is_store_busy(error: &anyhow::Error) -> bool {
    error.downcast_ref::<StoreBusy>().is_some()
        || error
            .chain()
            .any(|cause| cause.downcast_ref::<StoreBusy>().is_some())
}

/// Whether `error` or any error in its chain is a [`UniqueViolation`].
pub fn is_unique_violation(error: &anyhow::Error) -> bool {
    error.downcast_ref::<UniqueViolation>().is_some()
        || error
            .chain()
            .any(|cause| cause.downcast_ref::<UniqueViolation>().is_some())
}
