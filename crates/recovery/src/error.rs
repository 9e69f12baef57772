use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::document::DocumentId;

/// Structural problems found while validating a record or the manifest.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("malformed JSON: {0}")]
    Syntax(#[from] serde_json::Error),
    #[error("unsupported schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("checksum mismatch: stored {stored}, computed {computed}")]
    ChecksumMismatch { stored: String, computed: String },
    #[error("record belongs to document {found}, expected {expected}")]
    DocumentMismatch {
        expected: DocumentId,
        found: DocumentId,
    },
    #[error("invalid record locator {0:?}")]
    InvalidLocator(String),
}

/// Coarse classification of a [`WriteError`], used for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailureKind {
    DiskFull,
    PermissionDenied,
    Write,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("insufficient space on recovery volume: {available_bytes} bytes free, {required_bytes} required")]
    DiskFull {
        available_bytes: u64,
        required_bytes: u64,
    },
    #[error("permission denied writing {}", path.display())]
    PermissionDenied { path: PathBuf },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize recovery data: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl WriteError {
    /// Maps an I/O failure on `path` onto the write taxonomy.
    pub fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                Self::PermissionDenied { path }
            }
            io::ErrorKind::StorageFull => Self::DiskFull {
                available_bytes: 0,
                required_bytes: 0,
            },
            _ => Self::Write { path, source },
        }
    }

    pub fn kind(&self) -> WriteFailureKind {
        match self {
            Self::DiskFull { .. } => WriteFailureKind::DiskFull,
            Self::PermissionDenied { .. } => WriteFailureKind::PermissionDenied,
            Self::Write { .. } | Self::Serialize(_) => WriteFailureKind::Write,
        }
    }
}

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("no recovery record for document {0}")]
    NotFound(DocumentId),
    #[error("recovery record for document {document_id} is corrupted: {source}")]
    Corrupted {
        document_id: DocumentId,
        #[source]
        source: ValidationError,
    },
    #[error("failed to read recovery record for document {document_id}: {source}")]
    Read {
        document_id: DocumentId,
        #[source]
        source: io::Error,
    },
}

impl PreviewError {
    pub fn is_corrupted(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch {}: {source}", path.display())]
    Backend {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("no pending conflict for document {0}")]
    NoConflict(DocumentId),
    #[error("source file {} for document {document_id} no longer exists", path.display())]
    SourceMissing {
        document_id: DocumentId,
        path: PathBuf,
    },
}
