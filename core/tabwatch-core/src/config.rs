//! Settings and filesystem locations.
//!
//! Handles paths and persistence for:
//! - User settings (`~/.tabwatch/settings.toml`)
//! - The durable session database and the ephemeral state file
//! - The daemon socket

use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::detector::{
    DetectorConfig, DEFAULT_COMPLETION_GRACE_MS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_PREVIEW_CHARS,
    DEFAULT_STABILITY_WINDOW_MS,
};
use crate::error::{MonitorError, Result};
use crate::validation::merge_settings;

pub const SOCKET_ENV: &str = "TABWATCH_DAEMON_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const DEFAULT_DISCOVERY_INTERVAL_MS: u64 = 2000;
const DEFAULT_DEDUPE_WINDOW_MS: u64 = 2000;
const DEFAULT_RESTORE_GRACE_MS: u64 = 60_000;
const DEFAULT_LIVENESS_TTL_MS: u64 = 30_000;

/// Recognized user settings. Unknown or invalid keys in the settings file are
/// ignored field by field (see [`merge_settings`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub sound_enabled: bool,
    pub sound_volume: f64,
    pub selected_sound: String,
    pub notifications_enabled: bool,
    /// Characters of reply text shown in a notification; 0 hides the preview.
    pub preview_length: usize,
    /// Newly discovered sessions start monitored.
    pub auto_enable_enabled: bool,
    pub stability_window_ms: u64,
    pub poll_interval_ms: u64,
    pub completion_grace_ms: u64,
    pub discovery_interval_ms: u64,
    pub dedupe_window_ms: u64,
    /// How long restored records wait for their session to be rediscovered
    /// before discovery purges them.
    pub restore_grace_ms: u64,
    /// A session that has not reported or been reopened for this long drops
    /// out of the discovery enumeration.
    pub liveness_ttl_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sound_enabled: true,
            sound_volume: 0.7,
            selected_sound: "chime".to_string(),
            notifications_enabled: true,
            preview_length: DEFAULT_PREVIEW_CHARS,
            auto_enable_enabled: true,
            stability_window_ms: DEFAULT_STABILITY_WINDOW_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            completion_grace_ms: DEFAULT_COMPLETION_GRACE_MS,
            discovery_interval_ms: DEFAULT_DISCOVERY_INTERVAL_MS,
            dedupe_window_ms: DEFAULT_DEDUPE_WINDOW_MS,
            restore_grace_ms: DEFAULT_RESTORE_GRACE_MS,
            liveness_ttl_ms: DEFAULT_LIVENESS_TTL_MS,
        }
    }
}

impl Settings {
    /// Detector parameters for detectors started from now on.
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            poll_interval_ms: self.poll_interval_ms,
            stability_window_ms: self.stability_window_ms,
            completion_grace_ms: self.completion_grace_ms,
            preview_chars: self.preview_length.max(DEFAULT_PREVIEW_CHARS),
        }
    }

    /// Applies a partial update, returning the keys that were rejected.
    pub fn merged_with(&self, patch: &serde_json::Value) -> (Settings, Vec<String>) {
        merge_settings(self, patch)
    }
}

/// Returns the Tabwatch state directory (~/.tabwatch).
pub fn get_tabwatch_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".tabwatch"))
}

pub fn get_settings_path() -> Option<PathBuf> {
    get_tabwatch_dir().map(|d| d.join("settings.toml"))
}

/// SQLite database holding the durable subset of every session.
pub fn get_durable_db_path() -> Option<PathBuf> {
    get_tabwatch_dir().map(|d| d.join("daemon").join("state.db"))
}

/// The ephemeral subset lives in the per-boot runtime directory so it
/// survives daemon restarts but not a reboot.
pub fn get_ephemeral_state_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(env::temp_dir)
        .join("tabwatch")
        .join("ephemeral.json")
}

pub fn get_log_dir() -> Option<PathBuf> {
    get_tabwatch_dir().map(|d| d.join("logs"))
}

pub fn daemon_socket_path() -> Result<PathBuf> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    get_tabwatch_dir()
        .map(|d| d.join(SOCKET_NAME))
        .ok_or_else(|| MonitorError::Store("Home directory not found".to_string()))
}

/// Loads settings, returning defaults if the file doesn't exist.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let content = fs::read_to_string(path).map_err(|source| MonitorError::Io {
        context: format!("read settings {}", path.display()),
        source,
    })?;
    let parsed: toml::Value =
        toml::from_str(&content).map_err(|err| MonitorError::ConfigMalformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })?;
    let record = serde_json::to_value(parsed).map_err(|source| MonitorError::Json {
        context: format!("convert settings {}", path.display()),
        source,
    })?;

    let (settings, rejected) = merge_settings(&Settings::default(), &record);
    if !rejected.is_empty() {
        warn!(
            path = %path.display(),
            fields = ?rejected,
            "Ignoring invalid settings fields"
        );
    }
    Ok(settings)
}

/// Saves settings to disk, creating the parent directory when needed.
pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| MonitorError::Io {
            context: "create settings dir".to_string(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(settings).map_err(|err| MonitorError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })?;
    fs::write(path, content).map_err(|source| MonitorError::Io {
        context: format!("write settings {}", path.display()),
        source,
    })
}
