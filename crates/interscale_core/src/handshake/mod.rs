//! # Filesystem Handshake
//!
//! Discovery between participants that do not share memory and may start
//! in any order.
//!
//! ## Protocol
//!
//! ```text
//! publisher                               waiter
//! ─────────                               ──────
//! write  <path>.tmp.<pid>
//! fsync + rename  ──► <path>
//! create          ──► <path>.unlock  ···► poll until marker exists
//!                                          read <path>
//!                                          (optional) receipt
//! owner removes   ──✕ <path>.unlock
//! ```
//!
//! The data file is renamed into place before the marker is created, so a
//! waiter that sees the marker always reads complete data. Exactly one
//! designated participant removes the marker. Removing an already removed
//! marker reports [`CleanupOutcome::AlreadyRemoved`] instead of failing.

mod clock;

pub use clock::{CancelToken, Clock, SystemClock, WaitOptions, DEFAULT_POLL_INTERVAL};

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Suffix appended to a data file name to form its marker.
pub const UNLOCK_SUFFIX: &str = ".unlock";

/// Handshake failures.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The awaited condition did not hold within the timeout.
    #[error("timed out after {waited:?} waiting for {}", .path.display())]
    Timeout {
        /// Path that was awaited.
        path: PathBuf,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The wait was cancelled through its token.
    #[error("wait for {} cancelled", .0.display())]
    Cancelled(PathBuf),

    /// Reading or writing a handshake artifact failed.
    #[error("handshake i/o on {}: {source}", .path.display())]
    Io {
        /// Artifact path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl HandshakeError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result type for handshake operations.
pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Outcome of a cleanup call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The artifact existed and was removed by this call.
    Removed,
    /// The artifact was already gone.
    AlreadyRemoved,
}

/// Returns `<path>.unlock`.
#[must_use]
pub fn marker_path(path: &Path) -> PathBuf {
    with_suffix(path, UNLOCK_SUFFIX)
}

/// Returns `<path>.consumed.<instance>.<stage>`.
#[must_use]
pub fn receipt_path(path: &Path, instance: usize, stage: &str) -> PathBuf {
    with_suffix(path, &format!(".consumed.{instance}.{stage}"))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// A `(data file, unlock marker)` pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeRecord {
    data: PathBuf,
    marker: PathBuf,
}

impl HandshakeRecord {
    /// Creates the record for a data file path.
    #[must_use]
    pub fn new(data: impl Into<PathBuf>) -> Self {
        let data = data.into();
        let marker = marker_path(&data);
        Self { data, marker }
    }

    /// Path of the data file.
    #[must_use]
    pub fn data_path(&self) -> &Path {
        &self.data
    }

    /// Path of the unlock marker.
    #[must_use]
    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    /// Returns true if the marker exists.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.marker.exists()
    }

    /// Writes `data`, then creates the marker.
    ///
    /// A stale marker from a previous publication is removed first so no
    /// waiter can pair it with the data being rewritten.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Io`] if any filesystem step fails.
    pub fn publish(&self, data: &[u8]) -> HandshakeResult<()> {
        if let Some(parent) = self.data.parent() {
            fs::create_dir_all(parent).map_err(|e| HandshakeError::io(parent, e))?;
        }
        remove_if_exists(&self.marker)?;

        let temp = with_suffix(&self.data, &format!(".tmp.{}", std::process::id()));
        {
            let mut file = File::create(&temp).map_err(|e| HandshakeError::io(&temp, e))?;
            file.write_all(data).map_err(|e| HandshakeError::io(&temp, e))?;
            file.sync_all().map_err(|e| HandshakeError::io(&temp, e))?;
        }
        fs::rename(&temp, &self.data).map_err(|e| HandshakeError::io(&self.data, e))?;

        let marker = File::create(&self.marker).map_err(|e| HandshakeError::io(&self.marker, e))?;
        marker.sync_all().map_err(|e| HandshakeError::io(&self.marker, e))?;

        tracing::debug!(path = %self.data.display(), bytes = data.len(), "handshake published");
        Ok(())
    }

    /// Blocks until the marker exists, then reads the data file.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Timeout`] or [`HandshakeError::Cancelled`]
    /// according to `options`, or [`HandshakeError::Io`] if the data file
    /// cannot be read.
    pub fn await_and_consume(&self, options: &WaitOptions, clock: &dyn Clock) -> HandshakeResult<Vec<u8>> {
        wait_until(&self.marker, options, clock, || self.marker.exists())?;
        fs::read(&self.data).map_err(|e| HandshakeError::io(&self.data, e))
    }

    /// Blocks until the marker no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Timeout`] or [`HandshakeError::Cancelled`]
    /// according to `options`.
    pub fn await_consumed(&self, options: &WaitOptions, clock: &dyn Clock) -> HandshakeResult<()> {
        wait_until(&self.marker, options, clock, || !self.marker.exists())
    }

    /// Removes the marker. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Io`] for failures other than "not found".
    pub fn remove_marker(&self) -> HandshakeResult<CleanupOutcome> {
        remove_if_exists(&self.marker)
    }

    /// Removes the marker and then the data file.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Io`] for failures other than "not found".
    pub fn remove(&self) -> HandshakeResult<CleanupOutcome> {
        let marker = remove_if_exists(&self.marker)?;
        let data = remove_if_exists(&self.data)?;
        Ok(if marker == CleanupOutcome::Removed || data == CleanupOutcome::Removed {
            CleanupOutcome::Removed
        } else {
            CleanupOutcome::AlreadyRemoved
        })
    }

    /// Records that `stage` of transformer `instance` consumed the data.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Io`] if the receipt cannot be created.
    pub fn record_receipt(&self, instance: usize, stage: &str) -> HandshakeResult<()> {
        let receipt = receipt_path(&self.data, instance, stage);
        File::create(&receipt).map_err(|e| HandshakeError::io(&receipt, e))?;
        Ok(())
    }

    /// Blocks until every `(instance, stage)` receipt exists.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Timeout`] or [`HandshakeError::Cancelled`]
    /// according to `options`.
    pub fn await_receipts(
        &self,
        expected: &[(usize, &str)],
        options: &WaitOptions,
        clock: &dyn Clock,
    ) -> HandshakeResult<()> {
        let receipts: Vec<PathBuf> = expected
            .iter()
            .map(|(instance, stage)| receipt_path(&self.data, *instance, stage))
            .collect();
        wait_until(&self.data, options, clock, || receipts.iter().all(|r| r.exists()))
    }

    /// Removes the given receipts. Missing receipts are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Io`] for failures other than "not found".
    pub fn clear_receipts(&self, expected: &[(usize, &str)]) -> HandshakeResult<()> {
        for (instance, stage) in expected {
            remove_if_exists(&receipt_path(&self.data, *instance, stage))?;
        }
        Ok(())
    }
}

/// Writes `data` to `path`, then creates `path.unlock`.
///
/// # Errors
///
/// See [`HandshakeRecord::publish`].
pub fn publish(path: impl AsRef<Path>, data: &[u8]) -> HandshakeResult<HandshakeRecord> {
    let record = HandshakeRecord::new(path.as_ref());
    record.publish(data)?;
    Ok(record)
}

/// Polls for `path.unlock` with the system clock, then reads `path`.
///
/// # Errors
///
/// See [`HandshakeRecord::await_and_consume`].
pub fn await_and_consume(path: impl AsRef<Path>, options: &WaitOptions) -> HandshakeResult<Vec<u8>> {
    HandshakeRecord::new(path.as_ref()).await_and_consume(options, &SystemClock::new())
}

/// Removes `path.unlock`. Safe to call repeatedly.
///
/// # Errors
///
/// See [`HandshakeRecord::remove_marker`].
pub fn remove_marker(path: impl AsRef<Path>) -> HandshakeResult<CleanupOutcome> {
    HandshakeRecord::new(path.as_ref()).remove_marker()
}

fn remove_if_exists(path: &Path) -> HandshakeResult<CleanupOutcome> {
    match fs::remove_file(path) {
        Ok(()) => Ok(CleanupOutcome::Removed),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(CleanupOutcome::AlreadyRemoved),
        Err(e) => Err(HandshakeError::io(path, e)),
    }
}

fn wait_until(
    path: &Path,
    options: &WaitOptions,
    clock: &dyn Clock,
    mut ready: impl FnMut() -> bool,
) -> HandshakeResult<()> {
    let start = clock.now();
    let mut polls = 0u64;
    loop {
        if ready() {
            return Ok(());
        }
        if options.is_cancelled() {
            return Err(HandshakeError::Cancelled(path.to_path_buf()));
        }

        let waited = clock.now().saturating_sub(start);
        let mut pause = options.poll_interval;
        if let Some(timeout) = options.timeout {
            if waited >= timeout {
                return Err(HandshakeError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            pause = pause.min(timeout - waited);
        }

        if polls == 0 {
            tracing::info!(path = %path.display(), "not found yet, retry in {:?}", options.poll_interval);
        } else {
            tracing::trace!(path = %path.display(), polls, "still waiting");
        }
        polls += 1;
        clock.sleep(pause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_path_appends_suffix() {
        let marker = marker_path(Path::new("/run/nest/spike_generator.txt"));
        assert_eq!(marker, PathBuf::from("/run/nest/spike_generator.txt.unlock"));
    }

    #[test]
    fn test_receipt_path() {
        let receipt = receipt_path(Path::new("/run/table.txt"), 1, "consumer");
        assert_eq!(receipt, PathBuf::from("/run/table.txt.consumed.1.consumer"));
    }

    #[test]
    fn test_publish_then_consume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/data.txt");

        let record = publish(&path, b"5 2\n7 3\n").unwrap();
        assert!(record.is_unlocked());

        let options = WaitOptions::default().with_timeout(Some(Duration::from_millis(1)));
        let data = await_and_consume(&path, &options).unwrap();
        assert_eq!(data, b"5 2\n7 3\n");
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        publish(&path, b"1").unwrap();

        assert_eq!(remove_marker(&path).unwrap(), CleanupOutcome::Removed);
        assert_eq!(remove_marker(&path).unwrap(), CleanupOutcome::AlreadyRemoved);
        // Data survives marker cleanup.
        assert!(path.exists());
    }

    #[test]
    fn test_republish_replaces_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        publish(&path, b"old").unwrap();
        publish(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert!(marker_path(&path).exists());
    }
}
