//! Background tasks spawned by the autosave service.
//!
//! Both loops stop when the shutdown watch channel flips to `true`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use salvage_recovery::WatchEvent;

use crate::service::Shared;

/// Lower bound on the flush interval so a zero in the config cannot spin.
const MIN_INTERVAL_MS: u64 = 250;

/// Periodic flush. Also wakes on a document's clean→dirty transition and
/// restarts its timer when the config changes.
pub(crate) fn spawn_flush_loop(shared: Arc<Shared>, shutdown_tx: &watch::Sender<bool>) -> JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut config_rx = shared.config_tx.subscribe();
    tokio::spawn(async move {
        loop {
            let interval_ms = config_rx.borrow_and_update().interval_ms.max(MIN_INTERVAL_MS);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
                _ = shared.flush_trigger.notified() => {}
                changed = config_rx.changed() => {
                    if changed.is_err() { break; }
                    continue;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() { break; }
                    continue;
                }
            }

            if !shared.config().enabled {
                continue;
            }
            let summary = shared.flush_cycle().await;
            if summary.saved > 0 {
                debug!(saved = summary.saved, pruned = summary.pruned.total(), "autosave cycle complete");
            }
        }
        info!("autosave flush loop stopped");
    })
}

/// Feeds debounced watcher events into conflict detection.
pub(crate) fn spawn_watch_consumer(
    shared: Arc<Shared>,
    mut events_rx: mpsc::UnboundedReceiver<WatchEvent>,
    shutdown_tx: &watch::Sender<bool>,
) -> JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    shared.handle_watch_event(event).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() { break; }
                }
            }
        }
        debug!("watch event consumer stopped");
    })
}
