//! Node configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.chorus/
//!   chorus.yaml     (this file, mode 0600)
//!   log/            (mutation log, one JSON-lines file per source)
//! ```
//!
//! Like every path helper in chorus, each function has an explicit-home
//! `_at` form; tests only ever call the `_at` variants.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};
use crate::types::SourceId;

pub const CONFIG_FILE: &str = "chorus.yaml";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Identity of the local source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: SourceId,
    pub name: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            id: SourceId::generate(),
            name: "local".to_string(),
        }
    }
}

/// Sync session tuning. All durations in milliseconds on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub handshake_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub batch_size: usize,
    pub tick_ms: u64,
    pub redial_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            ack_timeout_ms: 10_000,
            batch_size: 64,
            tick_ms: 250,
            redial_interval_ms: 3_000,
        }
    }
}

impl SyncConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn redial_interval(&self) -> Duration {
        Duration::from_millis(self.redial_interval_ms)
    }

    /// Batch size clamped to at least one entry.
    pub fn batch(&self) -> usize {
        self.batch_size.max(1)
    }
}

/// Mutation log housekeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Run compaction on this interval. `None` disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compact_interval_secs: Option<u64>,
}

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChorusConfig {
    pub source: SourceConfig,
    /// Data directory; defaults to the directory holding the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// `host:port` to accept peers on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    /// `host:port` of peers to dial.
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for ChorusConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            data_dir: None,
            listen: None,
            peers: Vec::new(),
            sync: SyncConfig::default(),
            log: LogConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `<home>/.chorus/`
pub fn chorus_root(home: &Path) -> PathBuf {
    home.join(".chorus")
}

/// `<home>/.chorus/chorus.yaml`
pub fn config_path_at(home: &Path) -> PathBuf {
    chorus_root(home).join(CONFIG_FILE)
}

/// `config_path_at` convenience wrapper.
pub fn config_path() -> Result<PathBuf, CoreError> {
    Ok(config_path_at(&home()?))
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load the config at `path`. A missing file yields defaults (with a fresh
/// source id); malformed YAML or an invalid source id is a
/// [`CoreError::Parse`].
pub fn load_at(path: &Path) -> Result<ChorusConfig, CoreError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config missing, using defaults");
        return Ok(ChorusConfig::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let config: ChorusConfig = serde_yaml::from_str(&contents).map_err(|e| CoreError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(config)
}

/// Save atomically: write `<path>.tmp`, then rename over `<path>`.
pub fn save_at(path: &Path, config: &ChorusConfig) -> Result<(), CoreError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    let yaml = serde_yaml::to_string(config)?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

impl ChorusConfig {
    /// Data directory, falling back to the directory the config lives in.
    pub fn data_dir_for(&self, config_path: &Path) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.clone(),
            None => config_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

fn home() -> Result<PathBuf, CoreError> {
    dirs::home_dir().ok_or(CoreError::HomeNotFound)
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), CoreError> {
    Ok(())
}
