pub mod config;
pub mod log;
pub mod serve;
pub mod track;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use chorus_core::{config as core_config, ChorusConfig};

/// `--config` if given, else `~/.chorus/chorus.yaml`.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => core_config::config_path().context("could not determine home directory"),
    }
}

/// Load the config and resolve its data directory.
pub fn load(config_path: &Path) -> Result<(ChorusConfig, PathBuf)> {
    if !config_path.exists() {
        anyhow::bail!(
            "no config at {}; run `chorus config init` first",
            config_path.display()
        );
    }
    let config = core_config::load_at(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let data_dir = config.data_dir_for(config_path);
    Ok((config, data_dir))
}
