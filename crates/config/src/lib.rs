use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Environment variable that overrides `storage.recovery_dir`.
pub const RECOVERY_DIR_ENV: &str = "SALVAGE_RECOVERY_DIR";

// ── Autosave ────────────────────────────────────────────────────────────────

/// Settings consumed by the flush loop.
///
/// Every field is re-read at the top of each flush cycle, so changes pushed
/// through `AutosaveService::update_config` apply without a restart.
///
/// | Field                       | `0` means                     |
/// |-----------------------------|-------------------------------|
/// | `retention_days`            | keep records forever          |
/// | `max_files`                 | no limit on record count      |
/// | `max_storage_mb`            | no limit on total record size |
/// | `min_free_space_mb`         | skip the free-space pre-check |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub retention_days: u64,
    pub max_files: usize,
    pub max_storage_mb: u64,
    /// Writes are refused with `DiskFull` when the recovery volume has less
    /// than this much space available.
    pub min_free_space_mb: u64,
    /// Consecutive failed flush cycles before the editing layer is told to
    /// show a persistent warning.
    pub failure_warning_threshold: u32,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            retention_days: 7,
            max_files: 50,
            max_storage_mb: 500,
            min_free_space_mb: 100,
            failure_warning_threshold: 3,
        }
    }
}

impl AutosaveConfig {
    pub fn min_free_space_bytes(&self) -> u64 {
        self.min_free_space_mb.saturating_mul(1024 * 1024)
    }

    pub fn max_storage_bytes(&self) -> u64 {
        self.max_storage_mb.saturating_mul(1024 * 1024)
    }
}

// ── External change watcher ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Raw filesystem events closer together than this collapse into one
    /// logical notification.
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

// ── Storage ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub recovery_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            recovery_dir: ".salvage/recovery".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub autosave: AutosaveConfig,
    pub watcher: WatcherConfig,
    pub storage: StorageConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(dir) = env::var(RECOVERY_DIR_ENV) {
            if !dir.is_empty() {
                config.storage.recovery_dir = dir;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn recovery_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.recovery_dir)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
