//! Cross-process advisory lock for reconciliation sweeps.
//!
//! The lock is a file created atomically (`create_new`) at a well-known path
//! inside the storage root. A lock file whose mtime is older than the
//! staleness timeout is treated as abandoned by a crashed holder and
//! reclaimed. Acquisition never blocks; contention is reported to the caller,
//! which is expected to defer to the concurrent holder.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

/// Name of the lock file inside a storage root.
pub const LOCK_FILE_NAME: &str = ".cleanup.lock";

/// Exclusive sweep lock, released on drop.
#[derive(Debug)]
pub struct SweepLock {
    path: PathBuf,
    released: bool,
}

impl SweepLock {
    /// Try to acquire the lock at `lock_path` without blocking.
    ///
    /// Returns `Ok(None)` on contention. A pre-existing lock file older than
    /// `staleness` is removed first and acquisition proceeds.
    pub fn try_acquire(lock_path: &Path, staleness: Duration) -> Result<Option<Self>> {
        if let Ok(meta) = fs::metadata(lock_path) {
            let age = meta
                .modified()
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .unwrap_or_default();
            if age > staleness {
                tracing::warn!(
                    path = %lock_path.display(),
                    age_secs = age.as_secs(),
                    staleness_secs = staleness.as_secs(),
                    "Removing stale sweep lock left by a crashed holder"
                );
                if let Err(e) = fs::remove_file(lock_path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(e).with_context(|| {
                            format!("Failed to remove stale lock {}", lock_path.display())
                        });
                    }
                }
            }
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(mut file) => {
                // Holder pid, for diagnostics only
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Some(Self {
                    path: lock_path.to_path_buf(),
                    released: false,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to create lock file {}", lock_path.display())),
        }
    }

    /// Remove the lock file. Also happens automatically on drop.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove sweep lock file"
                );
            }
        }
    }
}

impl Drop for SweepLock {
    fn drop(&mut self) {
        self.release();
    }
}
