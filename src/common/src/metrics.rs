//! Sync/restore/cleanup metrics tracking
//!
//! Thread-safe, process-local counters using atomics. Counters only grow;
//! they are reset only on an explicit `reset()` call.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Thread-safe metrics for storage consistency operations
#[derive(Debug, Clone, Default)]
pub struct SyncMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    files_synced: AtomicUsize,
    files_restored: AtomicUsize,
    files_cleaned: AtomicUsize,
    sync_failures: AtomicUsize,
    restore_failures: AtomicUsize,
    cleanup_failures: AtomicUsize,
    last_sync_unix: AtomicU64,
    last_restore_unix: AtomicU64,
    last_cleanup_unix: AtomicU64,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record files uploaded to the remote tier
    pub fn record_synced(&self, count: usize) {
        self.inner.files_synced.fetch_add(count, Ordering::Relaxed);
        self.inner.last_sync_unix.store(now_unix(), Ordering::Relaxed);
    }

    pub fn record_sync_failure(&self) {
        self.inner.sync_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record files restored from the remote tier
    pub fn record_restored(&self, count: usize) {
        self.inner
            .files_restored
            .fetch_add(count, Ordering::Relaxed);
        self.inner
            .last_restore_unix
            .store(now_unix(), Ordering::Relaxed);
    }

    pub fn record_restore_failure(&self) {
        self.inner.restore_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record orphans deleted by a cleanup pass
    pub fn record_cleaned(&self, count: usize) {
        self.inner.files_cleaned.fetch_add(count, Ordering::Relaxed);
        self.inner
            .last_cleanup_unix
            .store(now_unix(), Ordering::Relaxed);
    }

    pub fn record_cleanup_failure(&self) {
        self.inner.cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn files_synced(&self) -> usize {
        self.inner.files_synced.load(Ordering::Relaxed)
    }

    pub fn files_restored(&self) -> usize {
        self.inner.files_restored.load(Ordering::Relaxed)
    }

    pub fn files_cleaned(&self) -> usize {
        self.inner.files_cleaned.load(Ordering::Relaxed)
    }

    pub fn sync_failures(&self) -> usize {
        self.inner.sync_failures.load(Ordering::Relaxed)
    }

    pub fn restore_failures(&self) -> usize {
        self.inner.restore_failures.load(Ordering::Relaxed)
    }

    pub fn cleanup_failures(&self) -> usize {
        self.inner.cleanup_failures.load(Ordering::Relaxed)
    }

    /// Get a summary of all counters
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            files_synced: self.files_synced(),
            files_restored: self.files_restored(),
            files_cleaned: self.files_cleaned(),
            sync_failures: self.sync_failures(),
            restore_failures: self.restore_failures(),
            cleanup_failures: self.cleanup_failures(),
            last_sync_unix: self.inner.last_sync_unix.load(Ordering::Relaxed),
            last_restore_unix: self.inner.last_restore_unix.load(Ordering::Relaxed),
            last_cleanup_unix: self.inner.last_cleanup_unix.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero
    pub fn reset(&self) {
        self.inner.files_synced.store(0, Ordering::Relaxed);
        self.inner.files_restored.store(0, Ordering::Relaxed);
        self.inner.files_cleaned.store(0, Ordering::Relaxed);
        self.inner.sync_failures.store(0, Ordering::Relaxed);
        self.inner.restore_failures.store(0, Ordering::Relaxed);
        self.inner.cleanup_failures.store(0, Ordering::Relaxed);
        self.inner.last_sync_unix.store(0, Ordering::Relaxed);
        self.inner.last_restore_unix.store(0, Ordering::Relaxed);
        self.inner.last_cleanup_unix.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub files_synced: usize,
    pub files_restored: usize,
    pub files_cleaned: usize,
    pub sync_failures: usize,
    pub restore_failures: usize,
    pub cleanup_failures: usize,
    pub last_sync_unix: u64,
    pub last_restore_unix: u64,
    pub last_cleanup_unix: u64,
}

impl MetricsSummary {
    /// Log the metrics summary
    pub fn log(&self) {
        tracing::info!(
            synced = self.files_synced,
            restored = self.files_restored,
            cleaned = self.files_cleaned,
            sync_failures = self.sync_failures,
            restore_failures = self.restore_failures,
            cleanup_failures = self.cleanup_failures,
            "Storage consistency metrics"
        );
    }
}
