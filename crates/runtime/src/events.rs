use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use salvage_recovery::{ConflictDescriptor, DocumentId, EpochMillis, WriteFailureKind};

/// Why the last flush cycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    DiskFull,
    PermissionDenied,
    WriteError,
}

impl From<WriteFailureKind> for FailureReason {
    fn from(kind: WriteFailureKind) -> Self {
        match kind {
            WriteFailureKind::DiskFull => Self::DiskFull,
            WriteFailureKind::PermissionDenied => Self::PermissionDenied,
            WriteFailureKind::Write => Self::WriteError,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::DiskFull => "not enough free space for recovery data",
            Self::PermissionDenied => "recovery directory is not writable",
            Self::WriteError => "recovery data could not be written",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AutosaveStatus {
    Idle,
    Saving,
    Saved {
        at: EpochMillis,
    },
    Failed {
        reason: FailureReason,
        consecutive_failures: u32,
    },
}

/// Everything the editing layer hears from the autosave service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutosaveEvent {
    Status(AutosaveStatus),
    /// Sustained or user-actionable failure; should stay visible until the
    /// next successful cycle.
    PersistentWarning {
        reason: FailureReason,
        consecutive_failures: u32,
    },
    Conflict(ConflictDescriptor),
    /// The source changed on disk and the document has nothing unsaved.
    CleanSourceUpdated { document_id: DocumentId, path: PathBuf },
    /// The source was deleted externally. Dirty state and recovery data are
    /// kept.
    SourceRemoved { document_id: DocumentId, path: PathBuf },
}
