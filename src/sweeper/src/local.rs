//! Orphan cleanup for a local durable tier root.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use common::FileWhitelist;
use common::config::SweepConfig;
use common::lock::{LOCK_FILE_NAME, SweepLock};
use common::metrics::SyncMetrics;
use common::storage::{FILES_PREFIX, THUMBNAILS_PREFIX, is_promote_tmp};

/// Per-sweep options.
#[derive(Debug, Clone)]
pub struct SweepOptions {
    /// Report orphans without deleting them
    pub dry_run: bool,
    /// Age after which a foreign lock is treated as abandoned
    pub lock_timeout: Duration,
}

impl From<&SweepConfig> for SweepOptions {
    fn from(config: &SweepConfig) -> Self {
        Self {
            dry_run: config.dry_run,
            lock_timeout: config.lock_timeout,
        }
    }
}

/// Result of one cleanup sweep.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    /// Orphans deleted (or, in dry-run, that would be deleted)
    pub deleted: Vec<String>,
    /// Files that could not be inspected or deleted, with error messages
    pub failed: Vec<(String, String)>,
    pub deleted_count: usize,
    pub failed_count: usize,
    /// The sweep deferred to a concurrent holder of the lock
    pub skipped: bool,
}

impl CleanupReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    fn finish(deleted: Vec<String>, failed: Vec<(String, String)>) -> Self {
        Self {
            deleted_count: deleted.len(),
            failed_count: failed.len(),
            deleted,
            failed,
            skipped: false,
        }
    }
}

/// Walks a durable tier root and deletes everything the whitelist does not
/// vouch for.
pub struct ReconciliationSweeper {
    whitelist: Arc<FileWhitelist>,
    metrics: SyncMetrics,
}

impl ReconciliationSweeper {
    pub fn new(whitelist: Arc<FileWhitelist>, metrics: SyncMetrics) -> Self {
        Self { whitelist, metrics }
    }

    /// Sweep `target_root`, deleting orphaned files and thumbnails.
    ///
    /// At most one sweep runs per storage root cluster-wide; when the lock
    /// is held elsewhere the report comes back with `skipped = true`, which
    /// is deference, not an error. The whitelist snapshot is refreshed
    /// unconditionally before any file is judged.
    pub async fn cleanup_orphaned_files(
        &self,
        target_root: &Path,
        options: &SweepOptions,
    ) -> Result<CleanupReport> {
        fs::create_dir_all(target_root)
            .with_context(|| format!("Cannot create tier root {}", target_root.display()))?;

        let lock_path = target_root.join(LOCK_FILE_NAME);
        let Some(_lock) = SweepLock::try_acquire(&lock_path, options.lock_timeout)? else {
            tracing::info!(
                root = %target_root.display(),
                "Another sweep holds the lock, deferring"
            );
            return Ok(CleanupReport::skipped());
        };

        self.whitelist.reload().await;

        tracing::info!(
            root = %target_root.display(),
            dry_run = options.dry_run,
            whitelist_size = self.whitelist.len(),
            "Starting orphan cleanup sweep"
        );

        let mut deleted = Vec::new();
        let mut failed = Vec::new();

        self.sweep_subtree(target_root, FILES_PREFIX, options, &mut deleted, &mut failed);
        self.sweep_subtree(
            target_root,
            THUMBNAILS_PREFIX,
            options,
            &mut deleted,
            &mut failed,
        );

        if !options.dry_run {
            self.metrics.record_cleaned(deleted.len());
        }

        let report = CleanupReport::finish(deleted, failed);
        tracing::info!(
            deleted = report.deleted_count,
            failed = report.failed_count,
            dry_run = options.dry_run,
            "Orphan cleanup sweep complete"
        );
        Ok(report)
        // _lock released on drop, success or not
    }

    fn sweep_subtree(
        &self,
        target_root: &Path,
        subtree: &str,
        options: &SweepOptions,
        deleted: &mut Vec<String>,
        failed: &mut Vec<(String, String)>,
    ) {
        let subtree_root = target_root.join(subtree);
        if !subtree_root.is_dir() {
            return;
        }

        // Depth-first with an explicit stack so deep trees cannot exhaust
        // the call stack
        let mut pending = vec![subtree_root];
        while let Some(dir) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Cannot list directory");
                    continue;
                }
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }

                let name = entry.file_name().to_string_lossy().into_owned();
                if name == LOCK_FILE_NAME || is_promote_tmp(&name) {
                    continue;
                }

                let identifier = if subtree == THUMBNAILS_PREFIX {
                    path.strip_prefix(target_root)
                        .map(|rel| rel.to_string_lossy().into_owned())
                        .unwrap_or_else(|_| name.clone())
                } else {
                    name.clone()
                };

                let verdict = if subtree == THUMBNAILS_PREFIX {
                    self.whitelist
                        .validate_thumbnail(&identifier)
                        .err()
                        .map(|e| e.to_string())
                } else {
                    match fs::read(&path) {
                        Ok(content) => self
                            .whitelist
                            .validate(&name, &content)
                            .err()
                            .map(|e| e.to_string()),
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "Cannot read file");
                            failed.push((identifier, e.to_string()));
                            self.metrics.record_cleanup_failure();
                            continue;
                        }
                    }
                };

                let Some(reason) = verdict else {
                    continue;
                };

                if options.dry_run {
                    tracing::info!(
                        path = %path.display(),
                        reason = %reason,
                        "[DRY-RUN] Would delete orphan file"
                    );
                    deleted.push(identifier);
                } else {
                    match fs::remove_file(&path) {
                        Ok(()) => {
                            tracing::info!(
                                path = %path.display(),
                                reason = %reason,
                                "Deleted orphan file"
                            );
                            deleted.push(identifier);
                        }
                        Err(e) => {
                            tracing::error!(
                                path = %path.display(),
                                error = %e,
                                "Failed to delete orphan file"
                            );
                            failed.push((identifier, e.to_string()));
                            self.metrics.record_cleanup_failure();
                        }
                    }
                }
            }
        }
    }
}
