use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::document::{DocumentId, EpochMillis};

/// A dirty document whose source file changed on disk behind its back.
/// Lives only until the user picks a [`Resolution`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDescriptor {
    pub document_id: DocumentId,
    pub path: PathBuf,
    pub detected_at_ms: EpochMillis,
    pub on_disk_modified_at_ms: Option<EpochMillis>,
    pub recovery_saved_at_ms: Option<EpochMillis>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Replace in-memory content with the on-disk version.
    Reload,
    /// Keep the in-memory content; dismiss the conflict.
    KeepMine,
}

/// What the editing layer must do after a conflict is resolved. The
/// recovery core never swaps document content itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictOutcome {
    ReloadFromDisk {
        document_id: DocumentId,
        path: PathBuf,
        on_disk_modified_at_ms: EpochMillis,
    },
    KeepMine {
        document_id: DocumentId,
    },
}

impl ConflictOutcome {
    pub fn document_id(&self) -> DocumentId {
        match self {
            Self::ReloadFromDisk { document_id, .. } | Self::KeepMine { document_id } => *document_id,
        }
    }
}

/// How the manager classified one watcher event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Stale or self-inflicted notification; nothing newer on disk.
    Ignored,
    /// The source changed but the document has nothing unsaved, so the
    /// editing layer may reload silently.
    CleanSourceUpdated {
        document_id: DocumentId,
        path: PathBuf,
    },
    Conflict(ConflictDescriptor),
    SourceRemoved {
        document_id: DocumentId,
        path: PathBuf,
    },
}
