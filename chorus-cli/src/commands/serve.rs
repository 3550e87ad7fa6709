//! `chorus serve`

use std::path::Path;

use anyhow::{Context, Result};

pub fn run(config_path: &Path) -> Result<()> {
    // Fail early with a CLI-friendly message before the runtime starts.
    super::load(config_path)?;
    chorus_node::start_blocking(config_path).context("node exited with error")
}
