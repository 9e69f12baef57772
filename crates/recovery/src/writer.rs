//! Durable Writer: checksum-protected atomic persistence of recovery records
//! and the manifest that indexes them.
//!
//! The writer owns the recovery directory. It is the only component that
//! touches `manifest.json`, and every mutation of it happens under
//! `manifest_lock` through [`atomic::write_atomic`]. Writes for the same
//! document are additionally serialized by a per-document lock so two
//! flushes never interleave their temp-write + rename sequences.
//!
//! Ordering invariant: a manifest row is added only after its record has
//! been renamed into place, and removed only after the record is deleted.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::atomic;
use crate::document::{DirtyEntry, DocumentId, DocumentOrigin, EpochMillis, now_ms};
use crate::error::{PreviewError, WriteError};
use crate::manifest::{MANIFEST_FILE_NAME, Manifest, ManifestEntry, validate_locator};
use crate::record::{self, RecoveryRecord};
use crate::space::SpaceProbe;

const RECORD_SUFFIX: &str = ".record.json";
const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Limits applied by [`DurableWriter::prune`]. Zero disables a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention_days: u64,
    pub max_files: usize,
    pub max_storage_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneSummary {
    pub expired: usize,
    pub over_count: usize,
    pub over_size: usize,
}

impl PruneSummary {
    pub fn total(&self) -> usize {
        self.expired + self.over_count + self.over_size
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub temp_files_removed: usize,
    pub records_adopted: usize,
}

enum ManifestState {
    Loaded(Manifest),
    Missing,
    Unreadable(String),
}

pub struct DurableWriter {
    dir: PathBuf,
    probe: Arc<dyn SpaceProbe>,
    min_free_bytes: AtomicU64,
    manifest_lock: Mutex<()>,
    doc_locks: std::sync::Mutex<HashMap<DocumentId, Arc<Mutex<()>>>>,
    last_commit_ms: AtomicI64,
}

impl DurableWriter {
    /// Opens (creating if needed) the recovery directory at `dir`.
    pub async fn open(
        dir: impl Into<PathBuf>,
        probe: Arc<dyn SpaceProbe>,
        min_free_bytes: u64,
    ) -> Result<Self, WriteError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| WriteError::from_io(&dir, err))?;
        info!(dir = %dir.display(), min_free_bytes, "recovery store opened");

        Ok(Self {
            dir,
            probe,
            min_free_bytes: AtomicU64::new(min_free_bytes),
            manifest_lock: Mutex::new(()),
            doc_locks: std::sync::Mutex::new(HashMap::new()),
            last_commit_ms: AtomicI64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE_NAME)
    }

    pub fn record_path(&self, id: DocumentId) -> PathBuf {
        self.dir.join(id.record_file_name())
    }

    pub fn set_min_free_bytes(&self, bytes: u64) {
        self.min_free_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn min_free_bytes(&self) -> u64 {
        self.min_free_bytes.load(Ordering::Relaxed)
    }

    // ── Writes ──────────────────────────────────────────────────────────────

    /// Persists `entry` as a new recovery record and indexes it.
    ///
    /// Either the complete new record is in place afterwards, or the previous
    /// one is untouched. Returns the commit timestamp.
    #[instrument(skip(self, entry), fields(document_id = %entry.document_id))]
    pub async fn save_document(&self, entry: &DirtyEntry) -> Result<EpochMillis, WriteError> {
        let lock = self.doc_lock(entry.document_id);
        let _guard = lock.lock().await;

        self.ensure_free_space().await?;

        let saved_at_ms = self.next_commit_ms();
        let record = RecoveryRecord::seal(entry, saved_at_ms);
        let bytes = record.encode()?;
        let path = self.record_path(entry.document_id);
        atomic::write_atomic(&path, &bytes)
            .await
            .map_err(|err| WriteError::from_io(&path, err))?;

        let manifest_entry = ManifestEntry::for_record(&record);
        self.update_manifest(move |manifest| manifest.upsert(manifest_entry))
            .await?;

        debug!(saved_at_ms, bytes = bytes.len(), "recovery record committed");
        Ok(saved_at_ms)
    }

    /// Deletes the record and its manifest row. Returns whether either existed.
    #[instrument(skip(self))]
    pub async fn delete_record(&self, id: DocumentId) -> Result<bool, WriteError> {
        let lock = self.doc_lock(id);
        let _guard = lock.lock().await;

        let mut paths = vec![self.record_path(id)];
        if let Some(entry) = self.read_manifest().await.get(&id) {
            if validate_locator(&entry.record_locator).is_ok() {
                let located = self.dir.join(&entry.record_locator);
                if !paths.contains(&located) {
                    paths.push(located);
                }
            }
        }

        let mut removed_file = false;
        for path in &paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => removed_file = true,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(WriteError::from_io(path, err)),
            }
        }

        let removed_entry = self
            .update_manifest(move |manifest| manifest.remove(&id).is_some())
            .await?;

        if removed_file || removed_entry {
            debug!(removed_file, removed_entry, "recovery record deleted");
        }
        Ok(removed_file || removed_entry)
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// Reads the manifest; absent, unreadable or invalid manifests yield an
    /// empty one.
    pub async fn read_manifest(&self) -> Manifest {
        match self.load_manifest().await {
            ManifestState::Loaded(manifest) => manifest,
            ManifestState::Missing => Manifest::default(),
            ManifestState::Unreadable(reason) => {
                warn!(
                    path = %self.manifest_path().display(),
                    %reason,
                    "manifest unusable; treating as empty"
                );
                Manifest::default()
            }
        }
    }

    /// Reads and checksum-verifies the record behind a manifest row.
    pub async fn read_record(&self, entry: &ManifestEntry) -> Result<RecoveryRecord, PreviewError> {
        let document_id = entry.document_id;
        validate_locator(&entry.record_locator)
            .map_err(|source| PreviewError::Corrupted { document_id, source })?;

        let path = self.dir.join(&entry.record_locator);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(PreviewError::NotFound(document_id));
            }
            Err(source) => return Err(PreviewError::Read { document_id, source }),
        };

        record::decode_for(document_id, &bytes).map_err(|source| {
            warn!(%document_id, path = %path.display(), error = %source, "recovery record failed validation");
            PreviewError::Corrupted { document_id, source }
        })
    }

    /// Total size in bytes of the record files currently on disk.
    pub async fn storage_bytes(&self) -> u64 {
        let mut total = 0;
        for (_, path) in self.record_files().await {
            total += file_len(&path).await;
        }
        total
    }

    // ── Maintenance ─────────────────────────────────────────────────────────

    /// Removes temp files left behind by a write interrupted before rename.
    pub async fn sweep_temp_files(&self) -> usize {
        let mut removed = 0;
        let Ok(mut dir) = tokio::fs::read_dir(&self.dir).await else {
            return 0;
        };
        while let Ok(Some(item)) = dir.next_entry().await {
            let name = item.file_name().to_string_lossy().to_string();
            if !atomic::is_temp_file_name(&name) {
                continue;
            }
            match tokio::fs::remove_file(item.path()).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(file = %name, error = %err, "failed to remove stale temp file"),
            }
        }
        if removed > 0 {
            info!(removed, "swept stale temp files from interrupted writes");
        }
        removed
    }

    /// Sweeps temp files and indexes record files the manifest does not know
    /// about (a crash between record rename and manifest rename, or a
    /// manifest that had to be discarded). Unreadable orphans are indexed
    /// too, so they surface as corrupted instead of vanishing.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileSummary, WriteError> {
        let temp_files_removed = self.sweep_temp_files().await;
        let _guard = self.manifest_lock.lock().await;

        let (mut manifest, was_corrupt) = match self.load_manifest().await {
            ManifestState::Loaded(manifest) => (manifest, false),
            ManifestState::Missing => (Manifest::default(), false),
            ManifestState::Unreadable(reason) => {
                warn!(%reason, "manifest unusable; rebuilding from record files");
                self.preserve_corrupt_manifest().await;
                (Manifest::default(), true)
            }
        };

        let mut adopted = 0;
        for (id, path) in self.record_files().await {
            if self.absorb_record_file(&mut manifest, id, &path).await {
                adopted += 1;
            }
        }

        if adopted > 0 || was_corrupt {
            self.write_manifest(&manifest).await?;
            info!(adopted, "manifest reconciled with record files");
        }

        Ok(ReconcileSummary {
            temp_files_removed,
            records_adopted: adopted,
        })
    }

    /// Deletes records outside `policy`, oldest first, never touching ids in
    /// `protected`.
    #[instrument(skip(self, protected))]
    pub async fn prune(
        &self,
        policy: RetentionPolicy,
        protected: &HashSet<DocumentId>,
        now: EpochMillis,
    ) -> Result<PruneSummary, WriteError> {
        let manifest = self.read_manifest().await;
        let mut summary = PruneSummary::default();
        let mut victims = Vec::new();

        // A window too long to represent reaches before the epoch: no cutoff.
        let cutoff = (policy.retention_days > 0)
            .then(|| {
                i64::try_from(policy.retention_days)
                    .ok()
                    .and_then(|days| days.checked_mul(MS_PER_DAY))
                    .and_then(|span| now.checked_sub(span))
            })
            .flatten();

        let mut kept = Vec::new();
        for entry in manifest.newest_first() {
            if protected.contains(&entry.document_id) {
                continue;
            }
            if cutoff.is_some_and(|cutoff| entry.saved_at_ms < cutoff) {
                victims.push(entry.document_id);
                summary.expired += 1;
            } else {
                kept.push(entry);
            }
        }

        if policy.max_files > 0 && kept.len() > policy.max_files {
            for entry in kept.drain(policy.max_files..) {
                victims.push(entry.document_id);
                summary.over_count += 1;
            }
        }

        if policy.max_storage_bytes > 0 {
            let mut total = 0u64;
            for entry in kept {
                let len = match validate_locator(&entry.record_locator) {
                    Ok(()) => file_len(&self.dir.join(&entry.record_locator)).await,
                    Err(_) => 0,
                };
                total = total.saturating_add(len);
                if total > policy.max_storage_bytes {
                    victims.push(entry.document_id);
                    summary.over_size += 1;
                }
            }
        }

        for id in victims {
            self.delete_record(id).await?;
        }

        if summary.total() > 0 {
            info!(
                expired = summary.expired,
                over_count = summary.over_count,
                over_size = summary.over_size,
                "pruned recovery records"
            );
        }
        Ok(summary)
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn doc_lock(&self, id: DocumentId) -> Arc<Mutex<()>> {
        let mut locks = self
            .doc_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id).or_default())
    }

    /// Wall-clock milliseconds, forced strictly increasing across commits.
    fn next_commit_ms(&self) -> EpochMillis {
        let now = now_ms();
        let previous = self
            .last_commit_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or_else(|prev| prev);
        now.max(previous + 1)
    }

    async fn ensure_free_space(&self) -> Result<(), WriteError> {
        let required_bytes = self.min_free_bytes();
        if required_bytes == 0 {
            return Ok(());
        }

        let probe = Arc::clone(&self.probe);
        let dir = self.dir.clone();
        match tokio::task::spawn_blocking(move || probe.available_bytes(&dir)).await {
            Ok(Ok(available_bytes)) if available_bytes < required_bytes => {
                warn!(available_bytes, required_bytes, "recovery volume below free-space threshold");
                Err(WriteError::DiskFull {
                    available_bytes,
                    required_bytes,
                })
            }
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => {
                warn!(error = %err, "could not determine free space; attempting write");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "free-space probe did not complete; attempting write");
                Ok(())
            }
        }
    }

    async fn load_manifest(&self) -> ManifestState {
        let bytes = match tokio::fs::read(self.manifest_path()).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return ManifestState::Missing,
            Err(err) => return ManifestState::Unreadable(err.to_string()),
        };
        match Manifest::decode(&bytes) {
            Ok(manifest) => ManifestState::Loaded(manifest),
            Err(err) => ManifestState::Unreadable(err.to_string()),
        }
    }

    async fn write_manifest(&self, manifest: &Manifest) -> Result<(), WriteError> {
        let path = self.manifest_path();
        let bytes = manifest.encode()?;
        atomic::write_atomic(&path, &bytes)
            .await
            .map_err(|err| WriteError::from_io(&path, err))
    }

    /// Read-modify-write of the manifest under the manifest lock. `apply`
    /// returns whether it changed anything; unchanged manifests are not
    /// rewritten.
    async fn update_manifest<F>(&self, apply: F) -> Result<bool, WriteError>
    where
        F: FnOnce(&mut Manifest) -> bool,
    {
        let _guard = self.manifest_lock.lock().await;

        let (mut manifest, rebuilt) = match self.load_manifest().await {
            ManifestState::Loaded(manifest) => (manifest, false),
            ManifestState::Missing => (Manifest::default(), false),
            ManifestState::Unreadable(reason) => {
                warn!(%reason, "manifest unusable during update; rebuilding from record files");
                self.preserve_corrupt_manifest().await;
                (self.rebuild_manifest().await, true)
            }
        };

        let changed = apply(&mut manifest);
        if changed || rebuilt {
            self.write_manifest(&manifest).await?;
        }
        Ok(changed)
    }

    async fn rebuild_manifest(&self) -> Manifest {
        let mut manifest = Manifest::default();
        for (id, path) in self.record_files().await {
            self.absorb_record_file(&mut manifest, id, &path).await;
        }
        manifest
    }

    /// Keeps a copy of an unusable manifest for inspection before it gets
    /// replaced.
    async fn preserve_corrupt_manifest(&self) {
        let path = self.manifest_path();
        let sidecar = path.with_extension("json.corrupt");
        if let Err(err) = tokio::fs::copy(&path, &sidecar).await {
            debug!(error = %err, "could not preserve corrupt manifest");
        }
    }

    /// Manifest row describing the record file at `path`. Unreadable records
    /// get a placeholder row so they remain visible as corrupted.
    async fn index_row_for(&self, id: DocumentId, path: &Path) -> ManifestEntry {
        let record_locator = id.record_file_name();
        let reason = match tokio::fs::read(path).await {
            Ok(bytes) => match record::decode_for(id, &bytes) {
                Ok(record) => return ManifestEntry::for_record(&record),
                Err(err) => err.to_string(),
            },
            Err(err) => err.to_string(),
        };

        warn!(%id, path = %path.display(), %reason, "indexing unreadable recovery record");
        ManifestEntry {
            document_id: id,
            origin: DocumentOrigin::Untitled,
            display_name: format!("(unreadable) {record_locator}"),
            saved_at_ms: file_modified_ms(path).await.unwrap_or(0),
            record_locator,
        }
    }

    /// Folds the record file for `id` into `manifest`. Rows the manifest
    /// already has are only replaced by a valid, later record.
    async fn absorb_record_file(&self, manifest: &mut Manifest, id: DocumentId, path: &Path) -> bool {
        if manifest.get(&id).is_none() {
            return manifest.upsert(self.index_row_for(id, path).await);
        }
        match tokio::fs::read(path).await.ok().map(|bytes| record::decode_for(id, &bytes)) {
            Some(Ok(record)) => manifest.upsert(ManifestEntry::for_record(&record)),
            _ => false,
        }
    }

    /// Record files currently in the directory, keyed by the id in their name.
    async fn record_files(&self) -> Vec<(DocumentId, PathBuf)> {
        let mut files = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(&self.dir).await else {
            return files;
        };
        while let Ok(Some(item)) = dir.next_entry().await {
            let name = item.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(RECORD_SUFFIX) else {
                continue;
            };
            if let Ok(id) = stem.parse::<DocumentId>() {
                files.push((id, item.path()));
            }
        }
        files
    }
}

async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0)
}

/// Modification time of `path` in epoch milliseconds.
pub async fn file_modified_ms(path: &Path) -> Option<EpochMillis> {
    let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_millis()).ok()
}
