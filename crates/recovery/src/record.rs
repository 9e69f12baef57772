use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::document::{DirtyEntry, DocumentId, DocumentOrigin, EpochMillis};
use crate::error::ValidationError;

pub const RECORD_VERSION: u32 = 1;

/// One document's durable recovery snapshot.
///
/// A record is valid iff `checksum == digest(content)`; [`decode`] enforces
/// this on every read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub version: u32,
    pub document_id: DocumentId,
    pub origin: DocumentOrigin,
    pub display_name: String,
    pub content: String,
    pub saved_at_ms: EpochMillis,
    pub checksum: String,
}

impl RecoveryRecord {
    /// Builds a record from a dirty snapshot, computing its checksum.
    pub fn seal(entry: &DirtyEntry, saved_at_ms: EpochMillis) -> Self {
        Self {
            version: RECORD_VERSION,
            document_id: entry.document_id,
            origin: entry.origin.clone(),
            display_name: entry.display_name.clone(),
            content: entry.content.clone(),
            saved_at_ms,
            checksum: checksum::digest(&entry.content),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }
}

/// Parses and verifies a record read from disk.
pub fn decode(bytes: &[u8]) -> Result<RecoveryRecord, ValidationError> {
    let record: RecoveryRecord = serde_json::from_slice(bytes)?;
    if record.version != RECORD_VERSION {
        return Err(ValidationError::UnsupportedVersion {
            found: record.version,
            expected: RECORD_VERSION,
        });
    }

    let computed = checksum::digest(&record.content);
    if !computed.eq_ignore_ascii_case(&record.checksum) {
        return Err(ValidationError::ChecksumMismatch {
            stored: record.checksum,
            computed,
        });
    }

    Ok(record)
}

/// Like [`decode`], additionally checking that the record belongs to `expected`.
pub fn decode_for(expected: DocumentId, bytes: &[u8]) -> Result<RecoveryRecord, ValidationError> {
    let record = decode(bytes)?;
    if record.document_id != expected {
        return Err(ValidationError::DocumentMismatch {
            expected,
            found: record.document_id,
        });
    }
    Ok(record)
}
