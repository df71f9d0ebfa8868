//! Orphan cleanup for the remote object tier.

use std::sync::Arc;

use anyhow::{Context, Result};
use object_store::{ObjectStore, path::Path as ObjectPath};
use tokio_stream::StreamExt;

use common::FileWhitelist;
use common::metrics::SyncMetrics;
use common::storage::{FILES_PREFIX, THUMBNAILS_PREFIX};

use crate::local::CleanupReport;

/// Whitelist-validates every object under `files/` and `thumbnails/` in the
/// remote tier and deletes the orphans.
///
/// No advisory lock here: remote deletes are idempotent and the worker loop
/// is the only caller within a deployment.
pub struct RemoteSweeper {
    whitelist: Arc<FileWhitelist>,
    store: Arc<dyn ObjectStore>,
    metrics: SyncMetrics,
}

impl RemoteSweeper {
    pub fn new(
        whitelist: Arc<FileWhitelist>,
        store: Arc<dyn ObjectStore>,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            whitelist,
            store,
            metrics,
        }
    }

    pub async fn cleanup_remote_orphans(&self, dry_run: bool) -> Result<CleanupReport> {
        self.whitelist.reload().await;

        tracing::info!(
            dry_run,
            whitelist_size = self.whitelist.len(),
            "Starting remote orphan cleanup"
        );

        let mut deleted = Vec::new();
        let mut failed = Vec::new();

        self.sweep_prefix(FILES_PREFIX, dry_run, &mut deleted, &mut failed)
            .await?;
        self.sweep_prefix(THUMBNAILS_PREFIX, dry_run, &mut deleted, &mut failed)
            .await?;

        if !dry_run {
            self.metrics.record_cleaned(deleted.len());
        }

        let report = CleanupReport {
            deleted_count: deleted.len(),
            failed_count: failed.len(),
            deleted,
            failed,
            skipped: false,
        };
        tracing::info!(
            deleted = report.deleted_count,
            failed = report.failed_count,
            dry_run,
            "Remote orphan cleanup complete"
        );
        Ok(report)
    }

    async fn sweep_prefix(
        &self,
        prefix: &str,
        dry_run: bool,
        deleted: &mut Vec<String>,
        failed: &mut Vec<(String, String)>,
    ) -> Result<()> {
        let list_prefix = ObjectPath::from(prefix);
        let mut objects = self.store.list(Some(&list_prefix));

        while let Some(meta) = objects.next().await {
            let meta = meta.with_context(|| format!("Failed to list remote {prefix}/"))?;
            let location = meta.location.clone();
            let key = location.to_string();

            let verdict = if prefix == THUMBNAILS_PREFIX {
                self.whitelist
                    .validate_thumbnail(&key)
                    .err()
                    .map(|e| e.to_string())
            } else {
                let file_id = match key.strip_prefix(&format!("{FILES_PREFIX}/")) {
                    Some(id) => id.to_string(),
                    None => continue,
                };
                match self.fetch(&location).await {
                    Ok(content) => self
                        .whitelist
                        .validate(&file_id, &content)
                        .err()
                        .map(|e| e.to_string()),
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Cannot fetch remote object");
                        failed.push((key, e.to_string()));
                        self.metrics.record_cleanup_failure();
                        continue;
                    }
                }
            };

            let Some(reason) = verdict else {
                continue;
            };

            if dry_run {
                tracing::info!(key = %key, reason = %reason, "[DRY-RUN] Would delete remote orphan");
                deleted.push(key);
            } else {
                match self.store.delete(&location).await {
                    Ok(()) => {
                        tracing::info!(key = %key, reason = %reason, "Deleted remote orphan");
                        deleted.push(key);
                    }
                    Err(e) => {
                        tracing::error!(key = %key, error = %e, "Failed to delete remote orphan");
                        failed.push((key, e.to_string()));
                        self.metrics.record_cleanup_failure();
                    }
                }
            }
        }
        Ok(())
    }

    async fn fetch(&self, location: &ObjectPath) -> Result<Vec<u8>> {
        let bytes = self
            .store
            .get(location)
            .await
            .context("get failed")?
            .bytes()
            .await
            .context("read failed")?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::FileRecord;
    use common::storage::remote_file_key;
    use common::testing::{StaticRecordStore, whitelisted_record};
    use object_store::memory::InMemory;

    fn remote_sweeper(
        records: Vec<FileRecord>,
        store: Arc<dyn ObjectStore>,
    ) -> RemoteSweeper {
        let record_store = Arc::new(StaticRecordStore::new(records));
        RemoteSweeper::new(
            Arc::new(FileWhitelist::new(record_store)),
            store,
            SyncMetrics::new(),
        )
    }

    async fn put(store: &Arc<dyn ObjectStore>, key: &str, content: &[u8]) {
        store
            .put(&ObjectPath::from(key), content.to_vec().into())
            .await
            .unwrap();
    }

    async fn exists(store: &Arc<dyn ObjectStore>, key: &str) -> bool {
        store.head(&ObjectPath::from(key)).await.is_ok()
    }

    #[tokio::test]
    async fn test_remote_orphan_deleted_valid_kept() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let content = b"0123456789";
        put(&store, &remote_file_key("a"), content).await;
        put(&store, &remote_file_key("orphan"), b"not listed").await;

        let sweeper = remote_sweeper(vec![whitelisted_record("a", content)], store.clone());
        let report = sweeper.cleanup_remote_orphans(false).await.unwrap();

        assert_eq!(report.deleted, vec!["files/orphan".to_string()]);
        assert!(exists(&store, "files/a").await);
        assert!(!exists(&store, "files/orphan").await);
    }

    #[tokio::test]
    async fn test_remote_dry_run_keeps_orphans() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        put(&store, &remote_file_key("orphan"), b"leftover").await;

        let sweeper = remote_sweeper(vec![], store.clone());
        let report = sweeper.cleanup_remote_orphans(true).await.unwrap();

        assert_eq!(report.deleted_count, 1);
        assert!(exists(&store, "files/orphan").await);
    }

    #[tokio::test]
    async fn test_remote_hash_mismatch_deleted() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        put(&store, &remote_file_key("a"), b"tampered!!").await;

        let sweeper = remote_sweeper(vec![whitelisted_record("a", b"original!!")], store.clone());
        let report = sweeper.cleanup_remote_orphans(false).await.unwrap();

        assert_eq!(report.deleted_count, 1);
        assert!(!exists(&store, "files/a").await);
    }

    #[tokio::test]
    async fn test_remote_thumbnails_by_membership() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let content = b"0123456789";
        let mut record = whitelisted_record("a", content);
        record.thumbnail_paths = vec!["thumbnails/a_small.enc".to_string()];

        put(&store, "thumbnails/a_small.enc", b"derived").await;
        put(&store, "thumbnails/zz.enc", b"derived").await;

        let sweeper = remote_sweeper(vec![record], store.clone());
        let report = sweeper.cleanup_remote_orphans(false).await.unwrap();

        assert_eq!(report.deleted, vec!["thumbnails/zz.enc".to_string()]);
        assert!(exists(&store, "thumbnails/a_small.enc").await);
        assert!(!exists(&store, "thumbnails/zz.enc").await);
    }

    #[tokio::test]
    async fn test_remote_empty_tier_is_clean() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let sweeper = remote_sweeper(vec![], store);
        let report = sweeper.cleanup_remote_orphans(false).await.unwrap();
        assert_eq!(report.deleted_count, 0);
        assert_eq!(report.failed_count, 0);
    }
}
