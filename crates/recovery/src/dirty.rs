//! In-memory register of documents with unsaved changes.
//!
//! Mutations are synchronous and never fail. Snapshots clone `Arc`s under a
//! short read lock, so a flush in progress never blocks editing.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::document::{DirtyEntry, DocumentId, DocumentOrigin};

#[derive(Debug)]
struct Slot {
    entry: Arc<DirtyEntry>,
    flushed_revision: Option<u64>,
}

#[derive(Debug, Default)]
pub struct DirtyRegister {
    slots: RwLock<HashMap<DocumentId, Slot>>,
}

impl DirtyRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the latest content for a document. Returns `true` when the
    /// document was not dirty before this call.
    pub fn mark_dirty(
        &self,
        document_id: DocumentId,
        origin: DocumentOrigin,
        display_name: impl Into<String>,
        content: impl Into<String>,
    ) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let (revision, flushed_revision, newly_dirty) = match slots.get(&document_id) {
            Some(slot) => (slot.entry.revision + 1, slot.flushed_revision, false),
            None => (1, None, true),
        };
        let entry = DirtyEntry {
            document_id,
            origin,
            display_name: display_name.into(),
            content: content.into(),
            revision,
        };
        slots.insert(
            document_id,
            Slot {
                entry: Arc::new(entry),
                flushed_revision,
            },
        );
        newly_dirty
    }

    /// Forgets a document. Idempotent; returns whether an entry was removed.
    pub fn clear(&self, document_id: DocumentId) -> bool {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&document_id)
            .is_some()
    }

    /// Point-in-time copy of every dirty entry.
    pub fn snapshot_all(&self) -> Vec<Arc<DirtyEntry>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.values().map(|slot| Arc::clone(&slot.entry)).collect()
    }

    /// Entries whose current revision has not been durably written yet.
    pub fn snapshot_pending(&self) -> Vec<Arc<DirtyEntry>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .values()
            .filter(|slot| slot.flushed_revision != Some(slot.entry.revision))
            .map(|slot| Arc::clone(&slot.entry))
            .collect()
    }

    /// Notes that `revision` of a document reached durable storage. A newer
    /// edit made meanwhile stays pending.
    pub fn mark_flushed(&self, document_id: DocumentId, revision: u64) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(&document_id) {
            let newest = slot.flushed_revision.map_or(revision, |r| r.max(revision));
            slot.flushed_revision = Some(newest.min(slot.entry.revision));
        }
    }

    pub fn get(&self, document_id: DocumentId) -> Option<Arc<DirtyEntry>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(&document_id).map(|slot| Arc::clone(&slot.entry))
    }

    pub fn contains(&self, document_id: DocumentId) -> bool {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&document_id)
    }

    /// `true` when the latest revision of a document is durable.
    pub fn is_durable(&self, document_id: DocumentId) -> bool {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(&document_id)
            .is_some_and(|slot| slot.flushed_revision == Some(slot.entry.revision))
    }

    pub fn ids(&self) -> Vec<DocumentId> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
