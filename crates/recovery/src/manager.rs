//! Recovery Manager: startup discovery, user-mediated restore/discard, and
//! conflict authority for documents whose source file changes externally.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, instrument, warn};

use crate::conflict::{ConflictDescriptor, ConflictOutcome, Resolution, WatchOutcome};
use crate::dirty::DirtyRegister;
use crate::document::{DocumentId, DocumentOrigin, EpochMillis, now_ms};
use crate::error::{ConflictError, PreviewError, WriteError};
use crate::manifest::ManifestEntry;
use crate::watcher::{ChangeKind, WatchEvent};
use crate::writer::{DurableWriter, ReconcileSummary, file_modified_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryCheck {
    pub has_recovery_data: bool,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverableDocument {
    pub document_id: DocumentId,
    pub display_name: String,
    pub origin: DocumentOrigin,
    pub saved_at_ms: EpochMillis,
}

impl From<&ManifestEntry> for RecoverableDocument {
    fn from(entry: &ManifestEntry) -> Self {
        Self {
            document_id: entry.document_id,
            display_name: entry.display_name.clone(),
            origin: entry.origin.clone(),
            saved_at_ms: entry.saved_at_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub document: RecoverableDocument,
    pub content: String,
    pub conflict: Option<ConflictDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreDecision {
    pub document_ids: BTreeSet<DocumentId>,
}

impl RestoreDecision {
    pub fn new(ids: impl IntoIterator<Item = DocumentId>) -> Self {
        Self {
            document_ids: ids.into_iter().collect(),
        }
    }
}

/// Content handed back to the editing layer, to be reopened as dirty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredDocument {
    pub document_id: DocumentId,
    pub origin: DocumentOrigin,
    pub display_name: String,
    pub content: String,
    pub saved_at_ms: EpochMillis,
    /// Set when the source changed on disk after this content was saved.
    pub conflict: Option<ConflictDescriptor>,
}

#[derive(Debug, Default)]
pub struct RestoreOutcome {
    pub restored: Vec<RestoredDocument>,
    /// Selections that could not be read; their records stay in place.
    pub failed: Vec<(DocumentId, PreviewError)>,
}

#[derive(Debug, Default)]
pub struct DiscardOutcome {
    pub discarded_count: usize,
    pub failed: Vec<(DocumentId, WriteError)>,
}

#[derive(Debug, Clone)]
struct DiskBaseline {
    path: PathBuf,
    modified_ms: Option<EpochMillis>,
}

pub struct RecoveryManager {
    writer: Arc<DurableWriter>,
    register: Arc<DirtyRegister>,
    conflicts: Mutex<HashMap<DocumentId, ConflictDescriptor>>,
    baselines: Mutex<HashMap<DocumentId, DiskBaseline>>,
}

impl RecoveryManager {
    pub fn new(writer: Arc<DurableWriter>, register: Arc<DirtyRegister>) -> Self {
        Self {
            writer,
            register,
            conflicts: Mutex::new(HashMap::new()),
            baselines: Mutex::new(HashMap::new()),
        }
    }

    pub fn writer(&self) -> &Arc<DurableWriter> {
        &self.writer
    }

    /// Clears crash debris and re-indexes orphaned records. Run once before
    /// any document is opened.
    pub async fn startup_maintenance(&self) -> Result<ReconcileSummary, WriteError> {
        self.writer.reconcile().await
    }

    // ── Discovery ───────────────────────────────────────────────────────────

    /// Manifest-only; no record bodies are read.
    pub async fn check_for_recovery(&self) -> RecoveryCheck {
        let count = self.writer.read_manifest().await.len();
        RecoveryCheck {
            has_recovery_data: count > 0,
            count,
        }
    }

    /// Recoverable documents, newest first.
    pub async fn list_recoverable(&self) -> Vec<RecoverableDocument> {
        self.writer
            .read_manifest()
            .await
            .newest_first()
            .into_iter()
            .map(RecoverableDocument::from)
            .collect()
    }

    pub async fn get_preview(&self, document_id: DocumentId) -> Result<Preview, PreviewError> {
        let manifest = self.writer.read_manifest().await;
        let entry = manifest
            .get(&document_id)
            .ok_or(PreviewError::NotFound(document_id))?;
        let record = self.writer.read_record(entry).await?;
        let conflict = self.check_source_against(entry).await;

        Ok(Preview {
            document: RecoverableDocument::from(entry),
            content: record.content,
            conflict,
        })
    }

    // ── Resolution ──────────────────────────────────────────────────────────

    /// Reads back each selected record and removes it from recovery storage.
    /// Unselected documents are left for a later session; unreadable
    /// selections are reported and kept.
    #[instrument(skip(self, decision), fields(selected = decision.document_ids.len()))]
    pub async fn restore(&self, decision: &RestoreDecision) -> RestoreOutcome {
        let manifest = self.writer.read_manifest().await;
        let mut outcome = RestoreOutcome::default();

        for &document_id in &decision.document_ids {
            let Some(entry) = manifest.get(&document_id) else {
                outcome.failed.push((document_id, PreviewError::NotFound(document_id)));
                continue;
            };
            let record = match self.writer.read_record(entry).await {
                Ok(record) => record,
                Err(err) => {
                    warn!(%document_id, error = %err, "recovery record not restorable");
                    outcome.failed.push((document_id, err));
                    continue;
                }
            };

            let conflict = self.check_source_against(entry).await;
            if let Some(path) = record.origin.path() {
                // Edits are only known to be based on the disk state as of
                // the last autosave.
                self.set_baseline(document_id, path.to_path_buf(), Some(record.saved_at_ms));
            }

            if let Err(err) = self.writer.delete_record(document_id).await {
                warn!(%document_id, error = %err, "restored document but could not clear its record");
            }
            outcome.restored.push(RestoredDocument {
                document_id,
                origin: record.origin,
                display_name: record.display_name,
                content: record.content,
                saved_at_ms: record.saved_at_ms,
                conflict,
            });
        }

        info!(
            restored = outcome.restored.len(),
            failed = outcome.failed.len(),
            "recovery restore complete"
        );
        outcome
    }

    /// Deletes records without restoring them. Safe to repeat.
    #[instrument(skip(self, document_ids))]
    pub async fn discard_recovery(
        &self,
        document_ids: impl IntoIterator<Item = DocumentId>,
    ) -> DiscardOutcome {
        let mut outcome = DiscardOutcome::default();
        for document_id in document_ids {
            match self.writer.delete_record(document_id).await {
                Ok(true) => outcome.discarded_count += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(%document_id, error = %err, "failed to discard recovery record");
                    outcome.failed.push((document_id, err));
                }
            }
            self.dismiss(document_id);
        }
        if outcome.discarded_count > 0 {
            info!(discarded = outcome.discarded_count, "recovery records discarded");
        }
        outcome
    }

    // ── Conflicts ───────────────────────────────────────────────────────────

    /// Records the current on-disk state of a document's source as known,
    /// e.g. after opening, saving or reloading it.
    pub async fn note_disk_state(&self, document_id: DocumentId, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let modified_ms = file_modified_ms(&path).await;
        self.set_baseline(document_id, path, modified_ms);
    }

    /// Like [`Self::note_disk_state`], but keeps an existing baseline. Used
    /// when watching starts for a document whose state may already be known,
    /// such as one just restored.
    pub async fn note_disk_state_if_untracked(&self, document_id: DocumentId, path: impl AsRef<Path>) {
        if self.baseline(document_id).is_none() {
            self.note_disk_state(document_id, path).await;
        }
    }

    /// Classifies a watcher notification. Events are advisory: the file's
    /// modification time is re-read instead of trusting event order.
    pub async fn handle_watch_event(&self, event: &WatchEvent) -> WatchOutcome {
        let document_id = event.document_id;
        if event.kind == ChangeKind::Removed {
            info!(%document_id, path = %event.path.display(), "source file removed externally");
            return WatchOutcome::SourceRemoved {
                document_id,
                path: event.path.clone(),
            };
        }

        let on_disk = file_modified_ms(&event.path).await;
        let baseline = self.baseline(document_id).and_then(|b| b.modified_ms);
        if let (Some(disk), Some(known)) = (on_disk, baseline) {
            if disk <= known {
                debug!(%document_id, "change notification not newer than known state");
                return WatchOutcome::Ignored;
            }
        }

        let recovery_saved_at = self
            .writer
            .read_manifest()
            .await
            .get(&document_id)
            .map(|entry| entry.saved_at_ms);
        let has_unsaved = self.register.contains(document_id)
            || recovery_saved_at.is_some_and(|saved| baseline.is_none_or(|known| saved > known));

        if !has_unsaved {
            self.set_baseline(document_id, event.path.clone(), on_disk);
            return WatchOutcome::CleanSourceUpdated {
                document_id,
                path: event.path.clone(),
            };
        }

        let descriptor = ConflictDescriptor {
            document_id,
            path: event.path.clone(),
            detected_at_ms: now_ms(),
            on_disk_modified_at_ms: on_disk,
            recovery_saved_at_ms: recovery_saved_at,
        };
        warn!(%document_id, path = %event.path.display(), "external modification conflicts with unsaved edits");
        self.conflicts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(document_id, descriptor.clone());
        WatchOutcome::Conflict(descriptor)
    }

    pub fn pending_conflict(&self, document_id: DocumentId) -> Option<ConflictDescriptor> {
        self.conflicts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&document_id)
            .cloned()
    }

    pub fn pending_conflicts(&self) -> Vec<ConflictDescriptor> {
        self.conflicts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Settles a pending conflict. The manager only signals the decision;
    /// the editing layer performs any content swap.
    pub async fn resolve_conflict(
        &self,
        document_id: DocumentId,
        resolution: Resolution,
    ) -> Result<ConflictOutcome, ConflictError> {
        let descriptor = self
            .pending_conflict(document_id)
            .ok_or(ConflictError::NoConflict(document_id))?;
        let current = file_modified_ms(&descriptor.path).await;

        let outcome = match resolution {
            Resolution::Reload => {
                let Some(on_disk_modified_at_ms) = current else {
                    return Err(ConflictError::SourceMissing {
                        document_id,
                        path: descriptor.path,
                    });
                };
                ConflictOutcome::ReloadFromDisk {
                    document_id,
                    path: descriptor.path.clone(),
                    on_disk_modified_at_ms,
                }
            }
            Resolution::KeepMine => ConflictOutcome::KeepMine { document_id },
        };

        self.conflicts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&document_id);
        self.set_baseline(document_id, descriptor.path, current);
        info!(%document_id, ?resolution, "conflict resolved");
        Ok(outcome)
    }

    /// Compares a recovery record with its source file. A source modified
    /// after the record was saved conflicts with the recovered edits; the
    /// conflict is recorded as pending unless one already is.
    async fn check_source_against(&self, entry: &ManifestEntry) -> Option<ConflictDescriptor> {
        let document_id = entry.document_id;
        if let Some(pending) = self.pending_conflict(document_id) {
            return Some(pending);
        }
        let path = entry.origin.path()?;
        let on_disk = file_modified_ms(path).await?;
        if on_disk <= entry.saved_at_ms {
            return None;
        }

        let descriptor = ConflictDescriptor {
            document_id,
            path: path.to_path_buf(),
            detected_at_ms: now_ms(),
            on_disk_modified_at_ms: Some(on_disk),
            recovery_saved_at_ms: Some(entry.saved_at_ms),
        };
        warn!(%document_id, path = %path.display(), "source changed after recovery data was saved");
        Some(
            self.conflicts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(document_id)
                .or_insert(descriptor)
                .clone(),
        )
    }

    /// Drops conflict and baseline state for a closed or discarded document.
    pub fn dismiss(&self, document_id: DocumentId) {
        self.conflicts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&document_id);
        self.baselines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&document_id);
    }

    fn baseline(&self, document_id: DocumentId) -> Option<DiskBaseline> {
        self.baselines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&document_id)
            .cloned()
    }

    fn set_baseline(&self, document_id: DocumentId, path: PathBuf, modified_ms: Option<EpochMillis>) {
        self.baselines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(document_id, DiskBaseline { path, modified_ms });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::FixedSpaceProbe;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        register: Arc<DirtyRegister>,
        manager: RecoveryManager,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let writer = DurableWriter::open(
                dir.path().join("recovery"),
                Arc::new(FixedSpaceProbe(u64::MAX)),
                100 * 1024 * 1024,
            )
            .await
            .unwrap();
            let register = Arc::new(DirtyRegister::new());
            let manager = RecoveryManager::new(Arc::new(writer), Arc::clone(&register));
            Self { dir, register, manager }
        }

        async fn persist(&self, path: &str, name: &str, content: &str) -> DocumentId {
            let id = DocumentId::new();
            self.register
                .mark_dirty(id, DocumentOrigin::AtPath(path.into()), name, content);
            let entry = self.register.get(id).unwrap();
            self.manager.writer().save_document(&entry).await.unwrap();
            id
        }
    }

    fn set_mtime(path: &Path, at: SystemTime) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(at).unwrap();
    }

    #[tokio::test]
    async fn check_and_list_reflect_manifest() {
        let fx = Fixture::new().await;
        assert_eq!(
            fx.manager.check_for_recovery().await,
            RecoveryCheck {
                has_recovery_data: false,
                count: 0
            }
        );

        let a = fx.persist("/salvage-test/a.md", "a.md", "hello").await;
        let b = fx.persist("/salvage-test/b.md", "b.md", "world").await;

        let check = fx.manager.check_for_recovery().await;
        assert!(check.has_recovery_data);
        assert_eq!(check.count, 2);

        let listed = fx.manager.list_recoverable().await;
        assert_eq!(listed.iter().map(|d| d.document_id).collect::<Vec<_>>(), vec![b, a]);
        assert_eq!(listed[1].display_name, "a.md");
        assert_eq!(listed[1].origin, DocumentOrigin::AtPath("/salvage-test/a.md".into()));
    }

    #[tokio::test]
    async fn preview_returns_verified_content() {
        let fx = Fixture::new().await;
        let id = fx.persist("/salvage-test/a.md", "a.md", "hello").await;
        let preview = fx.manager.get_preview(id).await.unwrap();
        assert_eq!(preview.content, "hello");
        assert!(preview.conflict.is_none());

        let unknown = DocumentId::new();
        assert!(matches!(
            fx.manager.get_preview(unknown).await,
            Err(PreviewError::NotFound(id)) if id == unknown
        ));
    }

    #[tokio::test]
    async fn corrupted_checksum_surfaces_as_corrupted_and_stays_listed() {
        let fx = Fixture::new().await;
        let id = fx.persist("/salvage-test/a.md", "a.md", "hello").await;

        let path = fx.manager.writer().record_path(id);
        let mut value: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let checksum = value["checksum"].as_str().unwrap().to_string();
        let flipped = if checksum.starts_with('a') { "b" } else { "a" };
        value["checksum"] = serde_json::Value::String(format!("{flipped}{}", &checksum[1..]));
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        let err = fx.manager.get_preview(id).await.unwrap_err();
        assert!(err.is_corrupted(), "{err}");
        assert!(fx.manager.list_recoverable().await.iter().any(|d| d.document_id == id));

        // Restore refuses it and keeps it; nothing is auto-discarded.
        let outcome = fx.manager.restore(&RestoreDecision::new([id])).await;
        assert!(outcome.restored.is_empty());
        assert!(outcome.failed[0].1.is_corrupted());
        assert!(path.exists());
        assert_eq!(fx.manager.check_for_recovery().await.count, 1);
    }

    #[tokio::test]
    async fn restore_selected_removes_only_those() {
        let fx = Fixture::new().await;
        let doc1 = fx.persist("/salvage-test/a.md", "a.md", "hello").await;
        let doc2 = fx.persist("/salvage-test/b.md", "b.md", "later").await;

        let outcome = fx.manager.restore(&RestoreDecision::new([doc1])).await;
        assert_eq!(outcome.restored.len(), 1);
        assert!(outcome.failed.is_empty());
        let restored = &outcome.restored[0];
        assert_eq!(restored.document_id, doc1);
        assert_eq!(restored.content, "hello");
        assert_eq!(restored.display_name, "a.md");

        let listed = fx.manager.list_recoverable().await;
        assert!(listed.iter().all(|d| d.document_id != doc1));
        assert!(listed.iter().any(|d| d.document_id == doc2));
        assert!(!fx.manager.writer().record_path(doc1).exists());
    }

    #[tokio::test]
    async fn restore_reports_unknown_and_missing_records() {
        let fx = Fixture::new().await;
        let present = fx.persist("/salvage-test/a.md", "a.md", "x").await;
        std::fs::remove_file(fx.manager.writer().record_path(present)).unwrap();
        let unknown = DocumentId::new();

        let outcome = fx.manager.restore(&RestoreDecision::new([present, unknown])).await;
        assert!(outcome.restored.is_empty());
        assert_eq!(outcome.failed.len(), 2);
        assert!(outcome
            .failed
            .iter()
            .all(|(_, err)| matches!(err, PreviewError::NotFound(_))));
    }

    #[tokio::test]
    async fn discard_twice_reports_zero_the_second_time() {
        let fx = Fixture::new().await;
        let id = fx.persist("/salvage-test/a.md", "a.md", "x").await;

        assert_eq!(fx.manager.discard_recovery([id]).await.discarded_count, 1);
        let second = fx.manager.discard_recovery([id]).await;
        assert_eq!(second.discarded_count, 0);
        assert!(second.failed.is_empty());
        assert!(!fx.manager.check_for_recovery().await.has_recovery_data);
    }

    #[tokio::test]
    async fn external_change_to_dirty_document_raises_conflict() {
        let fx = Fixture::new().await;
        let source = fx.dir.path().join("a.md");
        std::fs::write(&source, "on disk v1").unwrap();
        let base = SystemTime::now() - Duration::from_secs(60);
        set_mtime(&source, base);

        let id = DocumentId::new();
        fx.manager.note_disk_state(id, &source).await;
        fx.register
            .mark_dirty(id, DocumentOrigin::AtPath(source.clone()), "a.md", "my edits");

        std::fs::write(&source, "on disk v2").unwrap();
        set_mtime(&source, base + Duration::from_secs(30));
        let event = WatchEvent {
            document_id: id,
            path: source.clone(),
            kind: ChangeKind::Changed,
        };

        let WatchOutcome::Conflict(descriptor) = fx.manager.handle_watch_event(&event).await else {
            panic!("expected a conflict");
        };
        assert_eq!(descriptor.document_id, id);
        assert!(descriptor.on_disk_modified_at_ms.is_some());
        assert_eq!(fx.manager.pending_conflict(id), Some(descriptor));
    }

    #[tokio::test]
    async fn change_not_newer_than_baseline_is_ignored() {
        let fx = Fixture::new().await;
        let source = fx.dir.path().join("a.md");
        std::fs::write(&source, "saved by us").unwrap();
        let id = DocumentId::new();
        fx.register
            .mark_dirty(id, DocumentOrigin::AtPath(source.clone()), "a.md", "edits");
        fx.manager.note_disk_state(id, &source).await;

        let event = WatchEvent {
            document_id: id,
            path: source,
            kind: ChangeKind::Changed,
        };
        assert_eq!(fx.manager.handle_watch_event(&event).await, WatchOutcome::Ignored);
        assert!(fx.manager.pending_conflict(id).is_none());
    }

    #[tokio::test]
    async fn change_to_clean_document_is_not_a_conflict() {
        let fx = Fixture::new().await;
        let source = fx.dir.path().join("a.md");
        std::fs::write(&source, "v1").unwrap();
        let base = SystemTime::now() - Duration::from_secs(60);
        set_mtime(&source, base);
        let id = DocumentId::new();
        fx.manager.note_disk_state(id, &source).await;

        set_mtime(&source, base + Duration::from_secs(10));
        let event = WatchEvent {
            document_id: id,
            path: source.clone(),
            kind: ChangeKind::Changed,
        };
        assert_eq!(
            fx.manager.handle_watch_event(&event).await,
            WatchOutcome::CleanSourceUpdated { document_id: id, path: source }
        );
    }

    #[tokio::test]
    async fn removal_is_reported_distinctly() {
        let fx = Fixture::new().await;
        let id = DocumentId::new();
        let path = fx.dir.path().join("gone.md");
        let event = WatchEvent {
            document_id: id,
            path: path.clone(),
            kind: ChangeKind::Removed,
        };
        assert_eq!(
            fx.manager.handle_watch_event(&event).await,
            WatchOutcome::SourceRemoved { document_id: id, path }
        );
        assert!(fx.manager.pending_conflict(id).is_none());
    }

    #[tokio::test]
    async fn resolve_conflict_reload_and_keep_mine() {
        let fx = Fixture::new().await;
        let source = fx.dir.path().join("a.md");
        std::fs::write(&source, "v1").unwrap();
        let base = SystemTime::now() - Duration::from_secs(60);
        set_mtime(&source, base);

        let id = DocumentId::new();
        fx.manager.note_disk_state(id, &source).await;
        fx.register
            .mark_dirty(id, DocumentOrigin::AtPath(source.clone()), "a.md", "mine");
        let event = WatchEvent {
            document_id: id,
            path: source.clone(),
            kind: ChangeKind::Changed,
        };

        set_mtime(&source, base + Duration::from_secs(5));
        assert!(matches!(fx.manager.handle_watch_event(&event).await, WatchOutcome::Conflict(_)));
        let outcome = fx.manager.resolve_conflict(id, Resolution::KeepMine).await.unwrap();
        assert_eq!(outcome, ConflictOutcome::KeepMine { document_id: id });
        assert!(fx.manager.pending_conflict(id).is_none());
        // The same on-disk state does not re-trigger after keeping mine.
        assert_eq!(fx.manager.handle_watch_event(&event).await, WatchOutcome::Ignored);

        set_mtime(&source, base + Duration::from_secs(10));
        assert!(matches!(fx.manager.handle_watch_event(&event).await, WatchOutcome::Conflict(_)));
        let outcome = fx.manager.resolve_conflict(id, Resolution::Reload).await.unwrap();
        assert!(matches!(
            outcome,
            ConflictOutcome::ReloadFromDisk { document_id, .. } if document_id == id
        ));

        assert!(matches!(
            fx.manager.resolve_conflict(id, Resolution::Reload).await,
            Err(ConflictError::NoConflict(_))
        ));
    }

    #[tokio::test]
    async fn reload_of_deleted_source_keeps_conflict_pending() {
        let fx = Fixture::new().await;
        let source = fx.dir.path().join("a.md");
        std::fs::write(&source, "v1").unwrap();
        let id = DocumentId::new();
        fx.register
            .mark_dirty(id, DocumentOrigin::AtPath(source.clone()), "a.md", "mine");
        let event = WatchEvent {
            document_id: id,
            path: source.clone(),
            kind: ChangeKind::Changed,
        };
        assert!(matches!(fx.manager.handle_watch_event(&event).await, WatchOutcome::Conflict(_)));

        std::fs::remove_file(&source).unwrap();
        assert!(matches!(
            fx.manager.resolve_conflict(id, Resolution::Reload).await,
            Err(ConflictError::SourceMissing { .. })
        ));
        assert!(fx.manager.pending_conflict(id).is_some());
    }

    #[tokio::test]
    async fn preview_carries_pending_conflict() {
        let fx = Fixture::new().await;
        let source = fx.dir.path().join("a.md");
        std::fs::write(&source, "disk").unwrap();
        let id = DocumentId::new();
        fx.register
            .mark_dirty(id, DocumentOrigin::AtPath(source.clone()), "a.md", "mine");
        let entry = fx.register.get(id).unwrap();
        fx.manager.writer().save_document(&entry).await.unwrap();

        let event = WatchEvent {
            document_id: id,
            path: source,
            kind: ChangeKind::Changed,
        };
        fx.manager.handle_watch_event(&event).await;
        let preview = fx.manager.get_preview(id).await.unwrap();
        let conflict = preview.conflict.expect("conflict attached to preview");
        assert!(conflict.recovery_saved_at_ms.is_some());
    }

    #[tokio::test]
    async fn startup_maintenance_reindexes_orphans() {
        let fx = Fixture::new().await;
        let id = fx.persist("/salvage-test/a.md", "a.md", "kept").await;
        std::fs::write(fx.manager.writer().manifest_path(), b"truncat").unwrap();
        assert_eq!(fx.manager.check_for_recovery().await.count, 0);

        let summary = fx.manager.startup_maintenance().await.unwrap();
        assert_eq!(summary.records_adopted, 1);
        assert_eq!(fx.manager.get_preview(id).await.unwrap().content, "kept");
    }

    #[tokio::test]
    async fn source_edited_before_restart_conflicts_on_preview_and_restore() {
        let fx = Fixture::new().await;
        let source = fx.dir.path().join("a.md");
        std::fs::write(&source, "v1").unwrap();
        let id = DocumentId::new();
        fx.register
            .mark_dirty(id, DocumentOrigin::AtPath(source.clone()), "a.md", "unsaved edits");
        let entry = fx.register.get(id).unwrap();
        let saved_at = fx.manager.writer().save_document(&entry).await.unwrap();

        // Another program rewrites the file while the editor is down.
        std::fs::write(&source, "edited elsewhere").unwrap();
        set_mtime(&source, SystemTime::now() + Duration::from_secs(60));

        let writer = DurableWriter::open(
            fx.dir.path().join("recovery"),
            Arc::new(FixedSpaceProbe(u64::MAX)),
            100 * 1024 * 1024,
        )
        .await
        .unwrap();
        let manager = RecoveryManager::new(Arc::new(writer), Arc::new(DirtyRegister::new()));

        let preview = manager.get_preview(id).await.unwrap();
        let conflict = preview.conflict.expect("conflict detected after restart");
        assert_eq!(conflict.path, source);
        assert_eq!(conflict.recovery_saved_at_ms, Some(saved_at));
        assert!(conflict.on_disk_modified_at_ms.unwrap() > saved_at);

        let outcome = manager.restore(&RestoreDecision::new([id])).await;
        assert_eq!(outcome.restored.len(), 1);
        assert_eq!(outcome.restored[0].conflict.as_ref(), Some(&conflict));
        assert_eq!(manager.pending_conflict(id), Some(conflict));

        // Watching starts after restore; the baseline from the record stays.
        manager.note_disk_state_if_untracked(id, &source).await;
        manager.resolve_conflict(id, Resolution::KeepMine).await.unwrap();
        assert!(manager.pending_conflicts().is_empty());
    }

    #[tokio::test]
    async fn untouched_source_restores_without_conflict() {
        let fx = Fixture::new().await;
        let source = fx.dir.path().join("a.md");
        std::fs::write(&source, "v1").unwrap();
        set_mtime(&source, SystemTime::now() - Duration::from_secs(60));
        let id = DocumentId::new();
        fx.register
            .mark_dirty(id, DocumentOrigin::AtPath(source.clone()), "a.md", "edits");
        let entry = fx.register.get(id).unwrap();
        fx.manager.writer().save_document(&entry).await.unwrap();

        assert!(fx.manager.get_preview(id).await.unwrap().conflict.is_none());
        let outcome = fx.manager.restore(&RestoreDecision::new([id])).await;
        assert!(outcome.restored[0].conflict.is_none());

        // A later external write is judged against the record's save time.
        let event = WatchEvent {
            document_id: id,
            path: source.clone(),
            kind: ChangeKind::Changed,
        };
        fx.manager.note_disk_state_if_untracked(id, &source).await;
        set_mtime(&source, SystemTime::now() + Duration::from_secs(30));
        assert!(matches!(fx.manager.handle_watch_event(&event).await, WatchOutcome::Conflict(_)));
    }

    #[tokio::test]
    async fn resolution_uses_disk_state_at_resolve_time() {
        let fx = Fixture::new().await;
        let source = fx.dir.path().join("a.md");
        std::fs::write(&source, "v1").unwrap();
        let base = SystemTime::now() - Duration::from_secs(120);
        set_mtime(&source, base);

        let id = DocumentId::new();
        fx.manager.note_disk_state(id, &source).await;
        fx.register
            .mark_dirty(id, DocumentOrigin::AtPath(source.clone()), "a.md", "mine");
        let event = WatchEvent {
            document_id: id,
            path: source.clone(),
            kind: ChangeKind::Changed,
        };

        set_mtime(&source, base + Duration::from_secs(10));
        let WatchOutcome::Conflict(raised) = fx.manager.handle_watch_event(&event).await else {
            panic!("expected a conflict");
        };

        // The file moves on again before the user answers.
        set_mtime(&source, base + Duration::from_secs(20));
        let latest = file_modified_ms(&source).await.unwrap();
        assert!(raised.on_disk_modified_at_ms.unwrap() < latest);
        let outcome = fx.manager.resolve_conflict(id, Resolution::Reload).await.unwrap();
        assert_eq!(
            outcome,
            ConflictOutcome::ReloadFromDisk {
                document_id: id,
                path: source.clone(),
                on_disk_modified_at_ms: latest,
            }
        );
        assert_eq!(fx.manager.handle_watch_event(&event).await, WatchOutcome::Ignored);

        // Keeping mine accepts the disk state seen at resolve time, not the
        // one in the original notification.
        set_mtime(&source, base + Duration::from_secs(30));
        assert!(matches!(fx.manager.handle_watch_event(&event).await, WatchOutcome::Conflict(_)));
        set_mtime(&source, base + Duration::from_secs(40));
        fx.manager.resolve_conflict(id, Resolution::KeepMine).await.unwrap();
        assert_eq!(fx.manager.handle_watch_event(&event).await, WatchOutcome::Ignored);

        set_mtime(&source, base + Duration::from_secs(50));
        assert!(matches!(fx.manager.handle_watch_event(&event).await, WatchOutcome::Conflict(_)));
    }
}
