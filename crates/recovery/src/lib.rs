//! Durable autosave and crash recovery for unsaved documents.
//!
//! Dirty content lives in a [`DirtyRegister`]; a [`DurableWriter`] persists
//! it as checksummed records indexed by a manifest; the [`RecoveryManager`]
//! offers those records back after a crash and arbitrates conflicts raised
//! by the [`ExternalChangeWatcher`].

pub mod atomic;
pub mod checksum;
pub mod conflict;
pub mod dirty;
pub mod document;
pub mod error;
pub mod manager;
pub mod manifest;
pub mod record;
pub mod space;
pub mod watcher;
pub mod writer;

pub use conflict::{ConflictDescriptor, ConflictOutcome, Resolution, WatchOutcome};
pub use dirty::DirtyRegister;
pub use document::{DirtyEntry, DocumentId, DocumentOrigin, EpochMillis, now_ms};
pub use error::{
    ConflictError, PreviewError, ValidationError, WatchError, WriteError, WriteFailureKind,
};
pub use manager::{
    DiscardOutcome, Preview, RecoverableDocument, RecoveryCheck, RecoveryManager, RestoreDecision,
    RestoreOutcome, RestoredDocument,
};
pub use manifest::{Manifest, ManifestEntry};
pub use record::RecoveryRecord;
pub use space::{FixedSpaceProbe, SpaceProbe, VolumeSpaceProbe};
pub use watcher::{ChangeKind, ExternalChangeWatcher, WatchEvent, WatchState};
pub use writer::{DurableWriter, PruneSummary, ReconcileSummary, RetentionPolicy};
