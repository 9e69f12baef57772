use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub type EpochMillis = i64;

pub fn now_ms() -> EpochMillis {
    Utc::now().timestamp_millis()
}

/// Process-unique identifier of an open or recoverable document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// File name of the recovery record for this document.
    pub fn record_file_name(&self) -> String {
        format!("{}.record.json", self.0)
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for DocumentId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a document lives on disk, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum DocumentOrigin {
    Untitled,
    AtPath(PathBuf),
}

impl DocumentOrigin {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Untitled => None,
            Self::AtPath(path) => Some(path),
        }
    }
}

impl fmt::Display for DocumentOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Untitled => f.write_str("(untitled)"),
            Self::AtPath(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Latest unsaved content of one document, as held by the dirty register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyEntry {
    pub document_id: DocumentId,
    pub origin: DocumentOrigin,
    pub display_name: String,
    pub content: String,
    /// Bumped by the register on every edit; used to tell whether a flushed
    /// snapshot is still the latest content.
    pub revision: u64,
}
