//! External Change Watcher.
//!
//! One `notify` backend serves every document. Each watched document has its
//! parent directory observed (reference-counted, so the file may not exist
//! yet and rename-into-place saves are seen) and a tokio task that debounces
//! the raw signals routed to it by full path. Once a burst has been quiet
//! for the debounce window, the task checks whether the file still exists
//! and emits a single `Changed` or `Removed` event on the outbound channel.
//! Sends are fire-and-forget; the watcher never waits on the consumer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::document::DocumentId;
use crate::error::WatchError;

/// A burst longer than this many debounce windows is flushed anyway.
const CEILING_WINDOWS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Changed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub document_id: DocumentId,
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Result of [`ExternalChangeWatcher::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// The file's directory is observed.
    Armed,
    /// The parent directory does not exist yet. The document is registered
    /// and [`ExternalChangeWatcher::rearm_pending`] arms it once it appears.
    ParentMissing,
    /// The document was already watched; nothing changed.
    AlreadyWatched,
}

impl WatchState {
    pub fn is_new(self) -> bool {
        self != Self::AlreadyWatched
    }
}

/// Raw-signal senders keyed by the full path the backend reports.
type Routes = Arc<Mutex<HashMap<PathBuf, HashMap<DocumentId, mpsc::UnboundedSender<()>>>>>;

struct ActiveWatch {
    path: PathBuf,
    route_key: PathBuf,
    parent: PathBuf,
    armed: bool,
    task: JoinHandle<()>,
}

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct Registry {
    backend: Option<RecommendedWatcher>,
    dir_refs: HashMap<PathBuf, usize>,
    docs: HashMap<DocumentId, ActiveWatch>,
}

impl Registry {
    /// Takes a reference on `parent`, registering it with the backend on
    /// first use. The backend itself is created lazily.
    fn arm(&mut self, parent: &Path, routes: &Routes) -> notify::Result<()> {
        if let Some(count) = self.dir_refs.get_mut(parent) {
            *count += 1;
            return Ok(());
        }
        if self.backend.is_none() {
            self.backend = Some(notify::recommended_watcher(route_handler(Arc::clone(routes)))?);
        }
        if let Some(backend) = self.backend.as_mut() {
            backend.watch(parent, RecursiveMode::NonRecursive)?;
        }
        self.dir_refs.insert(parent.to_path_buf(), 1);
        Ok(())
    }

    fn disarm(&mut self, parent: &Path) {
        let Some(count) = self.dir_refs.get_mut(parent) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.dir_refs.remove(parent);
        if let Some(backend) = self.backend.as_mut() {
            if let Err(err) = backend.unwatch(parent) {
                debug!(dir = %parent.display(), error = %err, "directory watch already gone");
            }
        }
    }
}

pub struct ExternalChangeWatcher {
    debounce: Duration,
    events_tx: mpsc::UnboundedSender<WatchEvent>,
    routes: Routes,
    registry: Mutex<Registry>,
}

impl ExternalChangeWatcher {
    /// Creates a watcher and the receiving end of its event channel.
    pub fn new(debounce: Duration) -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            debounce,
            events_tx,
            routes: Arc::new(Mutex::new(HashMap::new())),
            registry: Mutex::new(Registry::default()),
        };
        (watcher, events_rx)
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Starts observing `path` for `document_id`. A missing parent directory
    /// is tolerated and reported as [`WatchState::ParentMissing`]. Must be
    /// called inside a tokio runtime.
    pub fn watch(&self, document_id: DocumentId, path: impl AsRef<Path>) -> Result<WatchState, WatchError> {
        let path = path.as_ref().to_path_buf();
        let mut registry = self.lock_registry();
        if registry.docs.contains_key(&document_id) {
            return Ok(WatchState::AlreadyWatched);
        }

        let (parent, route_key) = split_target(&path);
        let armed = if parent.is_dir() {
            registry
                .arm(&parent, &self.routes)
                .map_err(|source| WatchError::Backend {
                    path: path.clone(),
                    source,
                })?;
            true
        } else {
            warn!(path = %path.display(), "parent directory missing; source file not observed yet");
            false
        };

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<()>();
        self.lock_routes()
            .entry(route_key.clone())
            .or_default()
            .insert(document_id, raw_tx);
        let task = tokio::spawn(debounce_loop(
            document_id,
            path.clone(),
            raw_rx,
            self.debounce,
            self.events_tx.clone(),
        ));

        debug!(%document_id, path = %path.display(), armed, "watching source file");
        registry.docs.insert(
            document_id,
            ActiveWatch {
                path,
                route_key,
                parent,
                armed,
                task,
            },
        );
        Ok(if armed {
            WatchState::Armed
        } else {
            WatchState::ParentMissing
        })
    }

    /// Stops observing a document. Idempotent.
    pub fn unwatch(&self, document_id: DocumentId) -> bool {
        let mut registry = self.lock_registry();
        let Some(watch) = registry.docs.remove(&document_id) else {
            return false;
        };
        self.remove_route(&watch.route_key, document_id);
        if watch.armed {
            registry.disarm(&watch.parent);
        }
        debug!(%document_id, path = %watch.path.display(), "stopped watching source file");
        true
    }

    /// Arms documents whose parent directory has appeared since they were
    /// registered. Returns how many were armed.
    pub fn rearm_pending(&self) -> usize {
        let mut registry = self.lock_registry();
        let ready = registry
            .docs
            .iter()
            .filter(|(_, watch)| !watch.armed && watch.parent.is_dir())
            .map(|(id, watch)| (*id, watch.parent.clone()))
            .collect::<Vec<_>>();

        let mut armed = 0;
        for (document_id, parent) in ready {
            match registry.arm(&parent, &self.routes) {
                Ok(()) => {
                    if let Some(watch) = registry.docs.get_mut(&document_id) {
                        watch.armed = true;
                    }
                    armed += 1;
                }
                Err(err) => warn!(%document_id, error = %err, "could not arm deferred watch"),
            }
        }
        if armed > 0 {
            debug!(armed, "armed deferred source watches");
        }
        armed
    }

    /// Releases every active watch and the OS backend. Returns how many
    /// documents were released.
    pub fn close_all(&self) -> usize {
        let mut registry = self.lock_registry();
        let drained = std::mem::take(&mut registry.docs);
        registry.dir_refs.clear();
        registry.backend = None;
        drop(registry);
        self.lock_routes().clear();

        let count = drained.len();
        drop(drained);
        if count > 0 {
            info!(count, "released all source file watches");
        }
        count
    }

    pub fn active_count(&self) -> usize {
        self.lock_registry().docs.len()
    }

    /// Documents registered without an OS watch.
    pub fn pending_count(&self) -> usize {
        self.lock_registry().docs.values().filter(|watch| !watch.armed).count()
    }

    /// Directories currently registered with the backend.
    pub fn observed_dir_count(&self) -> usize {
        self.lock_registry().dir_refs.len()
    }

    pub fn watched_path(&self, document_id: DocumentId) -> Option<PathBuf> {
        self.lock_registry()
            .docs
            .get(&document_id)
            .map(|watch| watch.path.clone())
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_routes(&self) -> MutexGuard<'_, HashMap<PathBuf, HashMap<DocumentId, mpsc::UnboundedSender<()>>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_route(&self, route_key: &Path, document_id: DocumentId) {
        let mut routes = self.lock_routes();
        if let Some(targets) = routes.get_mut(route_key) {
            targets.remove(&document_id);
            if targets.is_empty() {
                routes.remove(route_key);
            }
        }
    }
}

impl Drop for ExternalChangeWatcher {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Parent directory to observe, and the path the backend will report for
/// the file itself.
fn split_target(path: &Path) -> (PathBuf, PathBuf) {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let route_key = match path.file_name() {
        Some(name) => parent.join(name),
        None => path.to_path_buf(),
    };
    (parent, route_key)
}

/// Forwards backend events to the debounce task of every document whose
/// file the event names.
fn route_handler(routes: Routes) -> impl FnMut(notify::Result<Event>) + Send + 'static {
    move |result: notify::Result<Event>| match result {
        Ok(event) => {
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            let routes = routes.lock().unwrap_or_else(PoisonError::into_inner);
            for path in &event.paths {
                if let Some(targets) = routes.get(path) {
                    for raw_tx in targets.values() {
                        let _ = raw_tx.send(());
                    }
                }
            }
        }
        Err(err) => warn!(error = %err, "filesystem notification error"),
    }
}

/// Collapses bursts of raw signals into one event per quiet period.
pub(crate) async fn debounce_loop(
    document_id: DocumentId,
    path: PathBuf,
    mut raw_rx: mpsc::UnboundedReceiver<()>,
    window: Duration,
    events_tx: mpsc::UnboundedSender<WatchEvent>,
) {
    let ceiling = window * CEILING_WINDOWS;
    while raw_rx.recv().await.is_some() {
        let burst_started = Instant::now();
        loop {
            let left = ceiling.saturating_sub(burst_started.elapsed());
            if left.is_zero() {
                break;
            }
            match tokio::time::timeout(window.min(left), raw_rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        let kind = match tokio::fs::try_exists(&path).await {
            Ok(true) => ChangeKind::Changed,
            _ => ChangeKind::Removed,
        };
        debug!(%document_id, path = %path.display(), ?kind, "external change detected");
        let event = WatchEvent {
            document_id,
            path: path.clone(),
            kind,
        };
        if events_tx.send(event).is_err() {
            return;
        }
    }
}
