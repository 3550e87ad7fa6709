use std::path::{Path, PathBuf};
use std::time::Duration;

pub const LOG_DIR: &str = "log";

/// How long shutdown waits for sessions to say goodbye.
pub const SESSION_DRAIN: Duration = Duration::from_secs(2);

/// `<data>/log/`
pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR)
}
