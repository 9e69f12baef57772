//! Autosave service: wires the recovery components together and exposes the
//! editing-layer boundary.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use anyhow::{Context, Result};
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use salvage_config::{AppConfig, AutosaveConfig};
use salvage_recovery::{
    ConflictOutcome, DirtyRegister, DocumentId, DocumentOrigin, DurableWriter, EpochMillis,
    ExternalChangeWatcher, PruneSummary, RecoveryManager, Resolution, RestoreDecision,
    RestoreOutcome, RetentionPolicy, SpaceProbe, VolumeSpaceProbe, WatchEvent, WatchOutcome,
    WriteError, WriteFailureKind, now_ms,
};

use crate::events::{AutosaveEvent, AutosaveStatus, FailureReason};
use crate::tasks;

/// Broadcast channel capacity. Old events are dropped when subscribers lag.
const BROADCAST_CAP: usize = 256;

/// Result of one flush cycle.
#[derive(Debug, Default)]
pub struct FlushSummary {
    pub attempted: usize,
    pub saved: usize,
    pub last_saved_at: Option<EpochMillis>,
    pub failed: Vec<(DocumentId, WriteError)>,
    pub pruned: PruneSummary,
}

impl FlushSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
struct FailureStreak {
    consecutive_failures: u32,
    warned: bool,
}

pub(crate) struct Shared {
    pub(crate) register: Arc<DirtyRegister>,
    pub(crate) writer: Arc<DurableWriter>,
    pub(crate) manager: Arc<RecoveryManager>,
    pub(crate) watcher: ExternalChangeWatcher,
    pub(crate) config_tx: watch::Sender<AutosaveConfig>,
    pub(crate) flush_trigger: Notify,
    event_tx: broadcast::Sender<AutosaveEvent>,
    status_tx: watch::Sender<AutosaveStatus>,
    /// Held for a whole flush cycle and by operations that clear recovery
    /// data, so a cycle never re-creates a record that was just deleted.
    flush_lock: Mutex<FailureStreak>,
}

impl Shared {
    pub(crate) fn config(&self) -> AutosaveConfig {
        self.config_tx.borrow().clone()
    }

    fn emit(&self, event: AutosaveEvent) {
        if let AutosaveEvent::Status(status) = &event {
            self.status_tx.send_replace(status.clone());
        }
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    fn set_idle_if_clean(&self) {
        if self.register.is_empty() {
            self.emit(AutosaveEvent::Status(AutosaveStatus::Idle));
        }
    }

    /// Writes every entry whose latest revision is not yet durable.
    pub(crate) async fn flush_cycle(&self) -> FlushSummary {
        let mut streak = self.flush_lock.lock().await;
        self.watcher.rearm_pending();
        let config = self.config();
        self.writer.set_min_free_bytes(config.min_free_space_bytes());

        let pending = self.register.snapshot_pending();
        let mut summary = FlushSummary {
            attempted: pending.len(),
            ..FlushSummary::default()
        };
        if pending.is_empty() {
            return summary;
        }

        self.emit(AutosaveEvent::Status(AutosaveStatus::Saving));
        for entry in pending {
            match self.writer.save_document(&entry).await {
                Ok(saved_at) => {
                    self.register.mark_flushed(entry.document_id, entry.revision);
                    summary.saved += 1;
                    summary.last_saved_at = Some(saved_at);
                }
                Err(err) => {
                    if streak.consecutive_failures == 0 {
                        warn!(document_id = %entry.document_id, error = %err, "autosave write failed");
                    } else {
                        debug!(document_id = %entry.document_id, error = %err, "autosave write still failing");
                    }
                    summary.failed.push((entry.document_id, err));
                }
            }
        }

        if summary.is_success() {
            if streak.consecutive_failures > 0 {
                info!(after = streak.consecutive_failures, "autosave recovered");
            }
            *streak = FailureStreak::default();
            let at = summary.last_saved_at.unwrap_or_else(now_ms);
            self.emit(AutosaveEvent::Status(AutosaveStatus::Saved { at }));
            summary.pruned = self.prune_with(&config).await;
            return summary;
        }

        streak.consecutive_failures = streak.consecutive_failures.saturating_add(1);
        let disk_full = summary
            .failed
            .iter()
            .any(|(_, err)| err.kind() == WriteFailureKind::DiskFull);
        let reason = if disk_full {
            FailureReason::DiskFull
        } else {
            summary
                .failed
                .first()
                .map(|(_, err)| FailureReason::from(err.kind()))
                .unwrap_or(FailureReason::WriteError)
        };
        let consecutive_failures = streak.consecutive_failures;
        self.emit(AutosaveEvent::Status(AutosaveStatus::Failed {
            reason,
            consecutive_failures,
        }));

        let threshold = config.failure_warning_threshold;
        let sustained = threshold > 0 && consecutive_failures >= threshold;
        if !streak.warned && (disk_full || sustained) {
            streak.warned = true;
            warn!(%reason, consecutive_failures, "autosave failing persistently");
            self.emit(AutosaveEvent::PersistentWarning {
                reason,
                consecutive_failures,
            });
        }
        summary
    }

    async fn prune_with(&self, config: &AutosaveConfig) -> PruneSummary {
        let policy = RetentionPolicy {
            retention_days: config.retention_days,
            max_files: config.max_files,
            max_storage_bytes: config.max_storage_bytes(),
        };
        let protected = self.register.ids().into_iter().collect();
        match self.writer.prune(policy, &protected, now_ms()).await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(error = %err, "recovery retention pass failed");
                PruneSummary::default()
            }
        }
    }

    pub(crate) async fn handle_watch_event(&self, event: WatchEvent) {
        match self.manager.handle_watch_event(&event).await {
            WatchOutcome::Ignored => {}
            WatchOutcome::CleanSourceUpdated { document_id, path } => {
                self.emit(AutosaveEvent::CleanSourceUpdated { document_id, path });
            }
            WatchOutcome::Conflict(descriptor) => {
                self.emit(AutosaveEvent::Conflict(descriptor));
            }
            WatchOutcome::SourceRemoved { document_id, path } => {
                self.emit(AutosaveEvent::SourceRemoved { document_id, path });
            }
        }
    }

    /// Starts watching a document's source and, unless the manager already
    /// knows a baseline for it, records its current state as one.
    async fn track_source(&self, document_id: DocumentId, origin: &DocumentOrigin) {
        let Some(path) = origin.path() else {
            return;
        };
        match self.watcher.watch(document_id, path) {
            Ok(state) if state.is_new() => {
                self.manager.note_disk_state_if_untracked(document_id, path).await;
            }
            Ok(_) => {}
            Err(err) => warn!(%document_id, error = %err, "could not watch source file"),
        }
    }
}

/// Owns the background tasks. Dropping it without [`AutosaveService::shutdown`]
/// aborts them without a final flush.
pub struct AutosaveService {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl AutosaveService {
    /// Opens the recovery directory, runs startup maintenance and spawns the
    /// flush loop and watcher consumer. Requires a Tokio runtime.
    pub async fn start(config: &AppConfig) -> Result<Self> {
        Self::start_with_probe(config, Arc::new(VolumeSpaceProbe)).await
    }

    pub async fn start_with_probe(config: &AppConfig, probe: Arc<dyn SpaceProbe>) -> Result<Self> {
        let recovery_dir = config.recovery_dir();
        let writer = DurableWriter::open(recovery_dir.clone(), probe, config.autosave.min_free_space_bytes())
            .await
            .with_context(|| format!("opening recovery directory {}", recovery_dir.display()))?;
        let writer = Arc::new(writer);
        let register = Arc::new(DirtyRegister::new());
        let manager = Arc::new(RecoveryManager::new(Arc::clone(&writer), Arc::clone(&register)));

        match manager.startup_maintenance().await {
            Ok(summary) if summary.temp_files_removed > 0 || summary.records_adopted > 0 => {
                info!(
                    temp_files_removed = summary.temp_files_removed,
                    records_adopted = summary.records_adopted,
                    "recovery startup maintenance complete"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "recovery startup maintenance failed"),
        }

        let (watcher, watch_rx) =
            ExternalChangeWatcher::new(std::time::Duration::from_millis(config.watcher.debounce_ms));
        let (config_tx, _) = watch::channel(config.autosave.clone());
        let (event_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = watch::channel(AutosaveStatus::Idle);

        let shared = Arc::new(Shared {
            register,
            writer,
            manager,
            watcher,
            config_tx,
            flush_trigger: Notify::new(),
            event_tx,
            status_tx,
            flush_lock: Mutex::new(FailureStreak::default()),
        });

        let (shutdown_tx, _) = watch::channel(false);
        let tasks = vec![
            tasks::spawn_flush_loop(Arc::clone(&shared), &shutdown_tx),
            tasks::spawn_watch_consumer(Arc::clone(&shared), watch_rx, &shutdown_tx),
        ];
        info!(
            dir = %recovery_dir.display(),
            interval_ms = config.autosave.interval_ms,
            enabled = config.autosave.enabled,
            "autosave service started"
        );

        Ok(Self {
            shared,
            shutdown_tx,
            tasks: StdMutex::new(tasks),
        })
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.shared.manager
    }

    pub fn register(&self) -> &DirtyRegister {
        &self.shared.register
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AutosaveEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn status(&self) -> AutosaveStatus {
        self.shared.status_tx.borrow().clone()
    }

    pub fn config(&self) -> AutosaveConfig {
        self.shared.config()
    }

    /// Applies new autosave settings from the next cycle on.
    pub fn update_config(&self, config: AutosaveConfig) {
        self.shared.writer.set_min_free_bytes(config.min_free_space_bytes());
        self.shared.config_tx.send_replace(config);
        debug!("autosave config updated");
    }

    // ── Editing-layer hooks ─────────────────────────────────────────────────

    /// Starts conflict tracking for a freshly opened, clean document.
    pub async fn on_document_opened(&self, document_id: DocumentId, origin: &DocumentOrigin) {
        self.shared.track_source(document_id, origin).await;
    }

    pub async fn on_content_changed(
        &self,
        document_id: DocumentId,
        origin: DocumentOrigin,
        display_name: impl Into<String>,
        content: impl Into<String>,
    ) {
        let newly_dirty = self
            .shared
            .register
            .mark_dirty(document_id, origin.clone(), display_name, content);
        if newly_dirty {
            self.shared.track_source(document_id, &origin).await;
            self.shared.flush_trigger.notify_one();
        }
    }

    /// The document was written to its source: its recovery data is obsolete.
    #[instrument(skip(self))]
    pub async fn on_manual_save_succeeded(&self, document_id: DocumentId) -> Result<()> {
        let _cycle = self.shared.flush_lock.lock().await;
        let origin = self.shared.register.get(document_id).map(|entry| entry.origin.clone());
        self.shared.register.clear(document_id);
        self.shared
            .writer
            .delete_record(document_id)
            .await
            .context("removing recovery record after save")?;

        let path = origin
            .as_ref()
            .and_then(|origin| origin.path().map(ToOwned::to_owned))
            .or_else(|| self.shared.watcher.watched_path(document_id));
        if let Some(path) = path {
            self.shared.manager.note_disk_state(document_id, &path).await;
        }
        self.shared.set_idle_if_clean();
        Ok(())
    }

    /// Final flush for the document, then stop tracking it. Its durable
    /// record stays behind as recoverable data. If the final flush fails the
    /// entry stays in the register and later cycles keep retrying it.
    #[instrument(skip(self))]
    pub async fn on_document_closed(&self, document_id: DocumentId) -> Result<()> {
        let _cycle = self.shared.flush_lock.lock().await;
        let pending = self
            .shared
            .register
            .get(document_id)
            .filter(|_| !self.shared.register.is_durable(document_id));
        if let Some(entry) = pending {
            self.shared
                .writer
                .save_document(&entry)
                .await
                .with_context(|| format!("final autosave of {document_id}"))?;
        }

        self.shared.register.clear(document_id);
        self.shared.watcher.unwatch(document_id);
        self.shared.manager.dismiss(document_id);
        self.shared.set_idle_if_clean();
        Ok(())
    }

    /// Runs one flush cycle now, regardless of the `enabled` setting.
    pub async fn flush_now(&self) -> FlushSummary {
        self.shared.flush_cycle().await
    }

    // ── Recovery ────────────────────────────────────────────────────────────

    /// Restores the selected documents as dirty, watched documents and
    /// schedules them for re-persistence. Sources that changed while the
    /// editor was down are reported as conflicts.
    pub async fn restore(&self, decision: &RestoreDecision) -> RestoreOutcome {
        let outcome = self.shared.manager.restore(decision).await;
        for doc in &outcome.restored {
            self.shared.register.mark_dirty(
                doc.document_id,
                doc.origin.clone(),
                doc.display_name.clone(),
                doc.content.clone(),
            );
            self.shared.track_source(doc.document_id, &doc.origin).await;
            if let Some(conflict) = &doc.conflict {
                self.shared.emit(AutosaveEvent::Conflict(conflict.clone()));
            }
        }
        if !outcome.restored.is_empty() {
            self.shared.flush_trigger.notify_one();
        }
        outcome
    }

    /// On `Reload` the document's unsaved state and recovery record are
    /// dropped; the caller swaps in the on-disk content.
    pub async fn resolve_conflict(
        &self,
        document_id: DocumentId,
        resolution: Resolution,
    ) -> Result<ConflictOutcome> {
        let outcome = self.shared.manager.resolve_conflict(document_id, resolution).await?;
        if let ConflictOutcome::ReloadFromDisk { .. } = outcome {
            let _cycle = self.shared.flush_lock.lock().await;
            self.shared.register.clear(document_id);
            self.shared
                .writer
                .delete_record(document_id)
                .await
                .context("removing recovery record after reload")?;
            self.shared.set_idle_if_clean();
        }
        Ok(outcome)
    }

    /// Best-effort final flush, then releases every watch and stops the
    /// background tasks. Safe to call more than once.
    pub async fn shutdown(&self) -> FlushSummary {
        let summary = if self.shared.config().enabled {
            self.shared.flush_cycle().await
        } else {
            FlushSummary::default()
        };
        let released = self.shared.watcher.close_all();
        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "autosave task ended abnormally");
                }
            }
        }
        info!(saved = summary.saved, watches_released = released, "autosave service stopped");
        summary
    }
}

impl Drop for AutosaveService {
    fn drop(&mut self) {
        let handles = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for handle in handles.drain(..) {
            handle.abort();
        }
    }
}
