//! Delayed background promotion queue.
//!
//! Freshly written ephemeral files are held back for a fixed promotion delay
//! (so that aborted uploads and immediate re-writes settle) and then
//! forwarded in batches to the Promotion Authority over one authenticated
//! call per batch.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use common::FileWhitelist;
use common::config::PromoterConfig;
use common::lock::LOCK_FILE_NAME;
use common::metrics::SyncMetrics;
use common::storage::{FILES_PREFIX, is_promote_tmp};

use crate::authority::AuthorityClient;

/// One queued promotion, holding its payload in memory until forwarded.
#[derive(Debug, Clone)]
pub struct PromotionTask {
    pub file_id: String,
    pub payload: Vec<u8>,
    pub expected_hash: Option<String>,
    pub expected_size: u64,
    pub enqueued_at: Instant,
    pub due_at: Instant,
}

/// Result of an eager pre-rotation queue pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EagerQueueReport {
    /// Valid files queued for immediate promotion
    pub queued: usize,
    /// Invalid files deleted from the ephemeral tier
    pub deleted: usize,
}

/// Background queue that defers, validates, and batches promotions.
pub struct BatchCachePromoter {
    whitelist: Arc<FileWhitelist>,
    client: AuthorityClient,
    metrics: SyncMetrics,
    config: PromoterConfig,
    queue: Mutex<VecDeque<PromotionTask>>,
}

impl BatchCachePromoter {
    pub fn new(
        whitelist: Arc<FileWhitelist>,
        client: AuthorityClient,
        metrics: SyncMetrics,
        config: PromoterConfig,
    ) -> Self {
        Self {
            whitelist,
            client,
            metrics,
            config,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Validate a freshly written ephemeral file and queue it for delayed
    /// promotion.
    ///
    /// Returns `Ok(false)` when the file is rejected; a rejected file is
    /// deleted rather than queued.
    pub async fn queue_for_promotion(&self, file_id: &str, path: &Path) -> Result<bool> {
        // The row for this file was typically inserted moments ago
        self.whitelist.reload().await;

        let payload = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(
                    file_id = %file_id,
                    error = %e,
                    "Cannot read file queued for promotion"
                );
                return Ok(false);
            }
        };

        if let Err(reason) = self.whitelist.validate(file_id, &payload) {
            tracing::warn!(
                file_id = %file_id,
                reason = %reason,
                "Rejected file at queue time, deleting"
            );
            if let Err(e) = fs::remove_file(path) {
                tracing::warn!(file_id = %file_id, error = %e, "Failed to delete rejected file");
            }
            return Ok(false);
        }

        let record = self.whitelist.record(file_id);
        let now = Instant::now();
        let task = PromotionTask {
            file_id: file_id.to_string(),
            expected_hash: record.as_ref().and_then(|r| r.expected_hash.clone()),
            expected_size: payload.len() as u64,
            payload,
            enqueued_at: now,
            due_at: now + self.config.promotion_delay,
        };

        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(task);
        tracing::debug!(file_id = %file_id, "Queued file for delayed promotion");
        Ok(true)
    }

    /// Run the poll loop until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            promotion_delay_secs = self.config.promotion_delay.as_secs(),
            batch_size = self.config.batch_size,
            "Batch promoter starting"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {},
                _ = shutdown.cancelled() => {
                    tracing::info!("Batch promoter shutting down");
                    return;
                }
            }

            self.flush_due().await;
        }
    }

    /// Forward one batch of due tasks to the Promotion Authority.
    ///
    /// Tasks leave the queue before the call is made and are not re-queued
    /// when the call fails. A missing shared secret is a configuration
    /// problem, not a send failure: nothing is dequeued and the cycle is
    /// skipped so the tasks survive until the secret is provided.
    pub async fn flush_due(&self) {
        if !self.client.has_shared_secret() {
            if self.queue_len() > 0 {
                tracing::warn!(
                    queued = self.queue_len(),
                    "promoter.shared_secret is not configured, keeping queued tasks"
                );
            }
            return;
        }

        let batch = self.take_due_batch(Instant::now());
        if batch.is_empty() {
            return;
        }

        tracing::info!(count = batch.len(), "Forwarding promotion batch to authority");

        match self.client.promote_files(&batch).await {
            Ok(response) => {
                tracing::info!(
                    promoted = response.promoted,
                    failed = response.failed,
                    "Authority processed promotion batch"
                );
                for error in &response.errors {
                    tracing::warn!(error = %error, "Authority reported item failure");
                }
                self.metrics.record_synced(response.promoted);
                if response.failed > 0 {
                    self.metrics.record_sync_failure();
                }
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    dropped = batch.len(),
                    "Promotion batch failed, dequeued tasks dropped"
                );
                self.metrics.record_sync_failure();
            }
        }
    }

    /// Remove and return up to `batch_size` of the oldest due tasks.
    fn take_due_batch(&self, now: Instant) -> Vec<PromotionTask> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let mut due = Vec::new();
        let mut rest = VecDeque::with_capacity(queue.len());

        for task in queue.drain(..) {
            if task.due_at <= now && due.len() < self.config.batch_size {
                due.push(task);
            } else {
                rest.push_back(task);
            }
        }

        *queue = rest;
        due
    }

    /// Eager variant used before planned rotation: validate the whole
    /// ephemeral tier, delete anything invalid, and queue everything valid
    /// as immediately due instead of waiting out the delay.
    pub async fn promote_all_validated_files(
        &self,
        ephemeral_root: &Path,
    ) -> Result<EagerQueueReport> {
        self.whitelist.reload().await;

        let mut report = EagerQueueReport::default();
        let files_root = ephemeral_root.join(FILES_PREFIX);
        if !files_root.is_dir() {
            return Ok(report);
        }

        // Explicit stack keeps recursion depth independent of tree depth
        let mut pending = vec![files_root];
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

                let payload = match fs::read(&path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Cannot read file");
                        continue;
                    }
                };

                if let Err(reason) = self.whitelist.validate(&name, &payload) {
                    tracing::warn!(
                        file_id = %name,
                        reason = %reason,
                        "Deleting invalid ephemeral file before rotation"
                    );
                    if fs::remove_file(&path).is_ok() {
                        report.deleted += 1;
                    }
                    continue;
                }

                let record = self.whitelist.record(&name);
                let now = Instant::now();
                self.queue
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push_back(PromotionTask {
                        file_id: name,
                        expected_hash: record.as_ref().and_then(|r| r.expected_hash.clone()),
                        expected_size: payload.len() as u64,
                        payload,
                        enqueued_at: now,
                        due_at: now,
                    });
                report.queued += 1;
            }
        }

        tracing::info!(
            queued = report.queued,
            deleted = report.deleted,
            "Eager promotion pass complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::testing::{StaticRecordStore, whitelisted_record};
    use std::time::Duration;
    use tempfile::TempDir;

    fn promoter_with(
        records: Vec<common::FileRecord>,
        config: PromoterConfig,
    ) -> BatchCachePromoter {
        let store = Arc::new(StaticRecordStore::new(records));
        let whitelist = Arc::new(FileWhitelist::new(store));
        let client = AuthorityClient::new(&config).unwrap();
        BatchCachePromoter::new(whitelist, client, SyncMetrics::new(), config)
    }

    fn write_ephemeral(root: &Path, file_id: &str, content: &[u8]) -> std::path::PathBuf {
        let path = root.join(FILES_PREFIX).join(file_id);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_queue_accepts_valid_file() {
        let dir = TempDir::new().unwrap();
        let content = b"0123456789";
        let promoter = promoter_with(
            vec![whitelisted_record("f1", content)],
            PromoterConfig::default(),
        );
        let path = write_ephemeral(dir.path(), "f1", content);

        let accepted = promoter.queue_for_promotion("f1", &path).await.unwrap();
        assert!(accepted);
        assert_eq!(promoter.queue_len(), 1);
        assert!(path.exists(), "accepted file stays on disk");
    }

    #[tokio::test]
    async fn test_queue_rejects_and_deletes_invalid_file() {
        let dir = TempDir::new().unwrap();
        let promoter = promoter_with(vec![], PromoterConfig::default());
        let path = write_ephemeral(dir.path(), "rogue", b"data");

        let accepted = promoter.queue_for_promotion("rogue", &path).await.unwrap();
        assert!(!accepted);
        assert_eq!(promoter.queue_len(), 0);
        assert!(!path.exists(), "rejected file is deleted");
    }

    #[tokio::test]
    async fn test_take_due_batch_respects_delay_and_cap() {
        let dir = TempDir::new().unwrap();
        let content = b"0123456789";
        let config = PromoterConfig {
            promotion_delay: Duration::from_secs(300),
            batch_size: 2,
            ..Default::default()
        };
        let records = (0..4)
            .map(|i| whitelisted_record(&format!("f{i}"), content))
            .collect();
        let promoter = promoter_with(records, config);

        for i in 0..4 {
            let path = write_ephemeral(dir.path(), &format!("f{i}"), content);
            promoter
                .queue_for_promotion(&format!("f{i}"), &path)
                .await
                .unwrap();
        }

        // Nothing is due before the promotion delay elapses
        assert!(promoter.take_due_batch(Instant::now()).is_empty());
        assert_eq!(promoter.queue_len(), 4);

        // Past the delay, only batch_size oldest tasks are drained per call
        let later = Instant::now() + Duration::from_secs(301);
        let batch = promoter.take_due_batch(later);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].file_id, "f0");
        assert_eq!(batch[1].file_id, "f1");
        assert_eq!(promoter.queue_len(), 2);

        let batch = promoter.take_due_batch(later);
        assert_eq!(batch.len(), 2);
        assert_eq!(promoter.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_eager_pass_queues_valid_and_deletes_invalid() {
        let dir = TempDir::new().unwrap();
        let content = b"0123456789";
        let promoter = promoter_with(
            vec![whitelisted_record("good", content)],
            PromoterConfig::default(),
        );
        write_ephemeral(dir.path(), "good", content);
        let bad = write_ephemeral(dir.path(), "bad", b"unlisted");
        // In-flight staging artifacts are never touched
        let tmp = write_ephemeral(dir.path(), ".promote_ab12.tmp", b"partial");

        let report = promoter
            .promote_all_validated_files(dir.path())
            .await
            .unwrap();

        assert_eq!(report, EagerQueueReport { queued: 1, deleted: 1 });
        assert!(!bad.exists());
        assert!(tmp.exists());

        // Eagerly queued tasks are due immediately
        let batch = promoter.take_due_batch(Instant::now());
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].file_id, "good");
    }

    #[tokio::test]
    async fn test_flush_without_secret_keeps_tasks_queued() {
        let dir = TempDir::new().unwrap();
        let content = b"0123456789";
        let config = PromoterConfig {
            promotion_delay: Duration::ZERO,
            shared_secret: None,
            ..Default::default()
        };
        let promoter = promoter_with(vec![whitelisted_record("f1", content)], config);
        let path = write_ephemeral(dir.path(), "f1", content);
        promoter.queue_for_promotion("f1", &path).await.unwrap();

        promoter.flush_due().await;

        // A configuration problem skips the cycle without consuming the queue
        assert_eq!(promoter.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_flush_due_drops_batch_when_authority_unreachable() {
        let dir = TempDir::new().unwrap();
        let content = b"0123456789";
        let config = PromoterConfig {
            promotion_delay: Duration::ZERO,
            authority_url: "http://127.0.0.1:1".to_string(),
            shared_secret: Some("secret".to_string()),
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let promoter = promoter_with(vec![whitelisted_record("f1", content)], config);
        let path = write_ephemeral(dir.path(), "f1", content);
        promoter.queue_for_promotion("f1", &path).await.unwrap();

        promoter.flush_due().await;

        // The dequeued task is not re-queued after the network failure
        assert_eq!(promoter.queue_len(), 0);
    }
}
