use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use tracing_subscriber::EnvFilter;

use crate::config;

const DEFAULT_FILTER: &str = "info,dreamlog=debug";

/// Log to `<config dir>/logs/dreamlog.log`.
pub fn init() {
    init_in(&config::get_config_dir().join("logs"));
}

/// Rotate the previous log to `dreamlog.log.old` and install a file-backed
/// subscriber. Calling this more than once keeps the first subscriber.
pub fn init_in(log_dir: &Path) {
    fs::create_dir_all(log_dir).ok();

    let log_path = log_dir.join("dreamlog.log");

    if log_path.exists() {
        let old_path = log_dir.join("dreamlog.log.old");
        // Remove the old log first so the rename succeeds on every platform.
        if old_path.exists() {
            let _ = fs::remove_file(&old_path);
        }
        let _ = fs::rename(&log_path, old_path);
    }

    let mut options = OpenOptions::new();
    options.create(true).append(true);

    #[cfg(unix)]
    {
        options.mode(0o600);
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match options.open(&log_path) {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(e) => {
            // No log file: fall back to stderr, warnings only.
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new("warn"))
                .with_writer(std::io::stderr)
                .try_init();
            tracing::warn!(error = %e, path = %log_path.display(), "could not open log file");
        }
    }
}
