//! Log file setup for the hub binary.
//!
//! Library code only emits `tracing` events. The binary installs one fmt
//! subscriber writing plain text to `<run>/log/<name>.txt`.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::fmt;

use crate::error::ConfigError;
use crate::parameters::LogLevel;

/// Installs the global subscriber writing to `path`.
///
/// Returns `Ok(false)` if a subscriber was already installed (tests run
/// several pipelines in one process).
///
/// # Errors
///
/// Returns [`ConfigError::LogFile`] if the file cannot be opened.
pub fn init(path: &Path, level: LogLevel) -> Result<bool, ConfigError> {
    let log_error = |source| ConfigError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(log_error)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(log_error)?;

    let installed = fmt()
        .with_max_level(level.tracing_level())
        .with_ansi(false)
        .with_thread_names(true)
        .with_target(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .is_ok();
    Ok(installed)
}

/// Log file name of one pipeline process.
#[must_use]
pub fn log_name(direction: &str, instance: &str, rank: Option<usize>) -> String {
    match rank {
        Some(rank) => format!("{direction}_{instance}_rank{rank}"),
        None => format!("{direction}_{instance}"),
    }
}
