//! Crash-safe whole-file replacement.
//!
//! New content goes to a hidden `.tmp` sibling, is `fsync`'d, then renamed
//! over the destination. A crash before the rename leaves the destination
//! untouched; a crash after it leaves the complete new file. The rename is
//! the commit point and is never cancelled once started.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const TEMP_SUFFIX: &str = ".tmp";

/// A fully written and synced temp file that has not been committed yet.
#[derive(Debug)]
#[must_use = "a staged write does nothing until committed"]
pub struct StagedWrite {
    tmp_path: PathBuf,
    final_path: PathBuf,
}

impl StagedWrite {
    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Atomically renames the temp file over the destination.
    pub async fn commit(self) -> io::Result<()> {
        if let Err(err) = tokio::fs::rename(&self.tmp_path, &self.final_path).await {
            let _ = tokio::fs::remove_file(&self.tmp_path).await;
            return Err(err);
        }
        sync_parent_dir(&self.final_path).await;
        Ok(())
    }

    /// Removes the temp file without touching the destination.
    pub async fn abort(self) {
        let _ = tokio::fs::remove_file(&self.tmp_path).await;
    }
}

/// Temp sibling used while replacing `path`: `.<name>.<uuid>.tmp`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!(".{filename}.{}{TEMP_SUFFIX}", Uuid::new_v4().simple()))
}

pub fn is_temp_file_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

/// Writes `bytes` to a temp sibling of `path` and syncs it, without renaming.
pub async fn stage(path: &Path, bytes: &[u8]) -> io::Result<StagedWrite> {
    let tmp_path = temp_path_for(path);

    let write_result: io::Result<()> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .await?;
        file.write_all(bytes).await?;
        // Flush userspace buffers and sync to disk before rename.
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }

    Ok(StagedWrite {
        tmp_path,
        final_path: path.to_path_buf(),
    })
}

/// Replaces `path` with `bytes` via temp-write + atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    stage(path, bytes).await?.commit().await
}

/// Best-effort: make the rename itself durable.
#[cfg(unix)]
async fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = tokio::fs::File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }
}

#[cfg(not(unix))]
async fn sync_parent_dir(_path: &Path) {}
