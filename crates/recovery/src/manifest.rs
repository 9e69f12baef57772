//! Index of every recoverable document.
//!
//! Stored as a list so the on-disk form is plain JSON; held in memory as a
//! map keyed by document id. When two rows name the same document the one
//! with the later `saved_at_ms` wins.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::document::{DocumentId, DocumentOrigin, EpochMillis};
use crate::error::ValidationError;
use crate::record::RecoveryRecord;

pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub document_id: DocumentId,
    pub origin: DocumentOrigin,
    pub display_name: String,
    pub saved_at_ms: EpochMillis,
    /// Bare file name of the record inside the recovery directory.
    pub record_locator: String,
}

impl ManifestEntry {
    pub fn for_record(record: &RecoveryRecord) -> Self {
        Self {
            document_id: record.document_id,
            origin: record.origin.clone(),
            display_name: record.display_name.clone(),
            saved_at_ms: record.saved_at_ms,
            record_locator: record.document_id.record_file_name(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestFile {
    version: u32,
    entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: BTreeMap<DocumentId, ManifestEntry>,
}

impl Manifest {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &DocumentId) -> Option<&ManifestEntry> {
        self.entries.get(id)
    }

    /// Inserts `entry` unless a later row for the same document is present.
    /// Returns whether the manifest changed.
    pub fn upsert(&mut self, entry: ManifestEntry) -> bool {
        match self.entries.get(&entry.document_id) {
            Some(existing) if existing.saved_at_ms > entry.saved_at_ms => false,
            Some(existing) if *existing == entry => false,
            _ => {
                self.entries.insert(entry.document_id, entry);
                true
            }
        }
    }

    pub fn remove(&mut self, id: &DocumentId) -> Option<ManifestEntry> {
        self.entries.remove(id)
    }

    /// Entries ordered newest first.
    pub fn newest_first(&self) -> Vec<&ManifestEntry> {
        let mut entries = self.entries.values().collect::<Vec<_>>();
        entries.sort_by(|left, right| {
            right
                .saved_at_ms
                .cmp(&left.saved_at_ms)
                .then_with(|| left.document_id.cmp(&right.document_id))
        });
        entries
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let file = ManifestFile {
            version: MANIFEST_VERSION,
            entries: self.newest_first().into_iter().cloned().collect(),
        };
        serde_json::to_vec_pretty(&file)
    }

    /// Parses and structurally validates manifest bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ValidationError> {
        let file: ManifestFile = serde_json::from_slice(bytes)?;
        if file.version != MANIFEST_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: file.version,
                expected: MANIFEST_VERSION,
            });
        }

        let mut manifest = Self::default();
        for entry in file.entries {
            validate_locator(&entry.record_locator)?;
            manifest.upsert(entry);
        }
        Ok(manifest)
    }
}

/// A locator must be a bare file name so it can never escape the recovery
/// directory.
pub fn validate_locator(locator: &str) -> Result<(), ValidationError> {
    let bare = !locator.is_empty()
        && locator != "."
        && locator != ".."
        && !locator.contains(['/', '\\'])
        && !locator.contains('\0');
    if bare {
        Ok(())
    } else {
        Err(ValidationError::InvalidLocator(locator.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: DocumentId, saved_at_ms: EpochMillis) -> ManifestEntry {
        ManifestEntry {
            document_id: id,
            origin: DocumentOrigin::Untitled,
            display_name: "Untitled-1".to_string(),
            saved_at_ms,
            record_locator: id.record_file_name(),
        }
    }

    #[test]
    fn upsert_keeps_the_later_write() {
        let id = DocumentId::new();
        let mut manifest = Manifest::default();
        assert!(manifest.upsert(entry(id, 200)));
        assert!(!manifest.upsert(entry(id, 100)));
        assert_eq!(manifest.get(&id).unwrap().saved_at_ms, 200);
        assert!(manifest.upsert(entry(id, 300)));
        assert_eq!(manifest.get(&id).unwrap().saved_at_ms, 300);
    }

    #[test]
    fn decode_resolves_duplicate_rows_by_timestamp() {
        let id = DocumentId::new();
        let file = ManifestFile {
            version: MANIFEST_VERSION,
            entries: vec![entry(id, 5), entry(id, 9), entry(id, 7)],
        };
        let manifest = Manifest::decode(&serde_json::to_vec(&file).unwrap()).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.get(&id).unwrap().saved_at_ms, 9);
    }

    #[test]
    fn encode_decode_preserves_entries() {
        let mut manifest = Manifest::default();
        manifest.upsert(entry(DocumentId::new(), 1));
        manifest.upsert(entry(DocumentId::new(), 2));
        let decoded = Manifest::decode(&manifest.encode().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn newest_first_orders_by_saved_at() {
        let mut manifest = Manifest::default();
        let old = DocumentId::new();
        let new = DocumentId::new();
        manifest.upsert(entry(old, 10));
        manifest.upsert(entry(new, 20));
        let order = manifest
            .newest_first()
            .iter()
            .map(|e| e.document_id)
            .collect::<Vec<_>>();
        assert_eq!(order, vec![new, old]);
    }

    #[test]
    fn decode_rejects_escaping_locator() {
        let id = DocumentId::new();
        let mut bad = entry(id, 1);
        bad.record_locator = "../../etc/passwd".to_string();
        let file = ManifestFile {
            version: MANIFEST_VERSION,
            entries: vec![bad],
        };
        let err = Manifest::decode(&serde_json::to_vec(&file).unwrap()).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidLocator(_)));
    }

    #[test]
    fn decode_rejects_wrong_shape_and_version() {
        assert!(Manifest::decode(b"[]").is_err());
        assert!(Manifest::decode(b"{\"version\":1}").is_err());
        assert!(matches!(
            Manifest::decode(b"{\"version\":7,\"entries\":[]}"),
            Err(ValidationError::UnsupportedVersion { found: 7, .. })
        ));
    }

    #[test]
    fn locator_validation() {
        assert!(validate_locator("abc.record.json").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b"] {
            assert!(validate_locator(bad).is_err(), "{bad:?}");
        }
    }
}
