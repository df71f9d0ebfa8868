//! Background replication between the local durable tier and the remote
//! object tier.
//!
//! One worker loop, three behaviors depending on the storage mode read at
//! the top of each cycle:
//! - `local`: nothing to replicate, idle poll
//! - `s3`: the remote tier is authoritative, sweep it for orphans
//! - `hybrid`: converge both tiers (upload, restore, delete), local wins
//!   for validated content

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use object_store::{ObjectStore, path::Path as ObjectPath};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::FileWhitelist;
use common::config::{Configuration, StorageMode, SyncConfig};
use common::lock::LOCK_FILE_NAME;
use common::metrics::SyncMetrics;
use common::storage::{FILES_PREFIX, PROMOTE_TMP_PREFIX, is_promote_tmp, remote_file_key};
use sweeper::RemoteSweeper;

/// Where the worker reads the current storage mode from at the top of each
/// cycle. The production binary uses [`ConfigFileMode`] so a mode change in
/// the configuration takes effect at the next cycle without a restart;
/// [`FixedMode`] pins the mode for tests and one-shot tooling.
pub trait ModeSource: Send + Sync {
    fn current_mode(&self) -> StorageMode;
}

/// A mode fixed at startup.
pub struct FixedMode(pub StorageMode);

impl ModeSource for FixedMode {
    fn current_mode(&self) -> StorageMode {
        self.0
    }
}

/// Re-extracts the configuration (file plus environment overrides) on every
/// call. An unreadable or invalid configuration keeps the last known mode
/// rather than silently flipping behavior.
pub struct ConfigFileMode {
    path: PathBuf,
    last_known: std::sync::Mutex<StorageMode>,
}

impl ConfigFileMode {
    pub fn new(path: PathBuf, initial_mode: StorageMode) -> Self {
        Self {
            path,
            last_known: std::sync::Mutex::new(initial_mode),
        }
    }
}

impl ModeSource for ConfigFileMode {
    fn current_mode(&self) -> StorageMode {
        let mut last_known = self.last_known.lock().unwrap_or_else(|e| e.into_inner());
        match Configuration::load_from_path(&self.path) {
            Ok(config) => {
                if config.storage.mode != *last_known {
                    tracing::info!(
                        from = ?*last_known,
                        to = ?config.storage.mode,
                        "Storage mode changed in configuration"
                    );
                    *last_known = config.storage.mode;
                }
                config.storage.mode
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Cannot re-read configuration, keeping current storage mode"
                );
                *last_known
            }
        }
    }
}

/// What one hybrid cycle did.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub uploaded: usize,
    pub restored: usize,
    pub deleted: usize,
    pub failed: usize,
}

pub struct ReplicationSyncWorker {
    whitelist: Arc<FileWhitelist>,
    remote: Arc<dyn ObjectStore>,
    durable_root: PathBuf,
    mode_source: Arc<dyn ModeSource>,
    metrics: SyncMetrics,
    config: SyncConfig,
}

impl ReplicationSyncWorker {
    pub fn new(
        whitelist: Arc<FileWhitelist>,
        remote: Arc<dyn ObjectStore>,
        durable_root: PathBuf,
        mode_source: Arc<dyn ModeSource>,
        metrics: SyncMetrics,
        config: SyncConfig,
    ) -> Self {
        Self {
            whitelist,
            remote,
            durable_root,
            mode_source,
            metrics,
            config,
        }
    }

    /// Worker loop. Errors inside a cycle are logged and the loop keeps
    /// going; only cancellation ends it.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!("Replication sync worker started");
        loop {
            let pause = self.run_cycle().await;

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("Replication sync worker stopping");
                    return;
                }
            }
        }
    }

    /// One cycle: read the current mode, do that mode's work, and return how
    /// long to sleep before the next cycle.
    pub async fn run_cycle(&self) -> Duration {
        match self.mode_source.current_mode() {
            StorageMode::Local => self.config.idle_interval,
            StorageMode::S3 => {
                if let Err(e) = self.remote_cycle().await {
                    tracing::error!(error = %e, "Remote sweep cycle failed");
                }
                self.config.cycle_interval
            }
            StorageMode::Hybrid => {
                match self.sync_cycle().await {
                    Ok(report) => {
                        self.metrics.summary().log();
                        tracing::info!(
                            uploaded = report.uploaded,
                            restored = report.restored,
                            deleted = report.deleted,
                            failed = report.failed,
                            "Hybrid sync cycle complete"
                        );
                    }
                    Err(e) => tracing::error!(error = %e, "Hybrid sync cycle failed"),
                }
                self.config.cycle_interval
            }
        }
    }

    async fn remote_cycle(&self) -> Result<()> {
        let sweeper = RemoteSweeper::new(
            self.whitelist.clone(),
            self.remote.clone(),
            self.metrics.clone(),
        );
        sweeper.cleanup_remote_orphans(self.config.dry_run).await?;
        Ok(())
    }

    /// One hybrid convergence pass: upload what only exists locally, restore
    /// what only exists remotely, delete what the whitelist disowns.
    pub async fn sync_cycle(&self) -> Result<SyncReport> {
        self.whitelist.reload().await;

        let mut report = SyncReport::default();
        self.upload_pass(&mut report).await;
        self.restore_pass(&mut report).await?;

        let cleanup = RemoteSweeper::new(
            self.whitelist.clone(),
            self.remote.clone(),
            self.metrics.clone(),
        )
        .cleanup_remote_orphans(self.config.dry_run)
        .await?;
        report.deleted = cleanup.deleted_count;
        report.failed += cleanup.failed_count;

        Ok(report)
    }

    /// Validated local durable files absent from the remote tier are
    /// uploaded. Invalid local files are left for the reconciliation sweep.
    async fn upload_pass(&self, report: &mut SyncReport) {
        let files_root = self.durable_root.join(FILES_PREFIX);
        if !files_root.is_dir() {
            return;
        }

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

                if let Err(e) = self.upload_one(&name, &path, report).await {
                    tracing::warn!(file_id = %name, error = %e, "Upload failed");
                    report.failed += 1;
                    self.metrics.record_sync_failure();
                }
            }
        }
    }

    async fn upload_one(
        &self,
        file_id: &str,
        path: &Path,
        report: &mut SyncReport,
    ) -> Result<()> {
        let key = ObjectPath::from(remote_file_key(file_id));
        if self.remote.head(&key).await.is_ok() {
            return Ok(());
        }

        let content = fs::read(path).context("read local file")?;
        if let Err(reason) = self.whitelist.validate(file_id, &content) {
            tracing::debug!(file_id = %file_id, reason = %reason, "Skipping invalid local file");
            return Ok(());
        }

        if self.config.dry_run {
            tracing::info!(file_id = %file_id, "[DRY-RUN] Would upload to remote tier");
        } else {
            self.remote
                .put(&key, content.into())
                .await
                .context("put remote object")?;
            tracing::info!(file_id = %file_id, "Uploaded file to remote tier");
            self.metrics.record_synced(1);
        }
        report.uploaded += 1;
        Ok(())
    }

    /// Validated remote files absent from the local durable tier are written
    /// back, temp-then-rename so local readers never see a partial file.
    async fn restore_pass(&self, report: &mut SyncReport) -> Result<()> {
        let prefix = ObjectPath::from(FILES_PREFIX);
        let mut objects = self.remote.list(Some(&prefix));

        while let Some(meta) = objects.next().await {
            let meta = meta.context("Failed to list remote files/")?;
            let key = meta.location.to_string();
            let Some(file_id) = key.strip_prefix(&format!("{FILES_PREFIX}/")) else {
                continue;
            };

            let local = common::storage::tier_file_path(&self.durable_root, file_id);
            if local.is_file() {
                continue;
            }

            match self.restore_one(file_id, &meta.location, &local).await {
                Ok(true) => report.restored += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(file_id = %file_id, error = %e, "Restore failed");
                    report.failed += 1;
                    self.metrics.record_restore_failure();
                }
            }
        }
        Ok(())
    }

    async fn restore_one(
        &self,
        file_id: &str,
        location: &ObjectPath,
        local: &Path,
    ) -> Result<bool> {
        let content = self
            .remote
            .get(location)
            .await
            .context("get remote object")?
            .bytes()
            .await
            .context("read remote object")?;

        if let Err(reason) = self.whitelist.validate(file_id, &content) {
            tracing::debug!(file_id = %file_id, reason = %reason, "Skipping invalid remote file");
            return Ok(false);
        }

        if self.config.dry_run {
            tracing::info!(file_id = %file_id, "[DRY-RUN] Would restore from remote tier");
            return Ok(true);
        }

        let dir = local
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.durable_root.clone());
        fs::create_dir_all(&dir).context("create local files dir")?;

        let staging = dir.join(format!(
            "{PROMOTE_TMP_PREFIX}{}.tmp",
            Uuid::new_v4().simple()
        ));
        let result = fs::write(&staging, &content)
            .and_then(|()| fs::rename(&staging, local))
            .context("write local file");
        if result.is_err() {
            let _ = fs::remove_file(&staging);
            return result.map(|_| false);
        }

        tracing::info!(file_id = %file_id, "Restored file from remote tier");
        self.metrics.record_restored(1);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::FileRecord;
    use common::storage::tier_file_path;
    use common::testing::{StaticRecordStore, whitelisted_record};
    use object_store::memory::InMemory;
    use tempfile::TempDir;

    fn worker_with_mode(
        records: Vec<FileRecord>,
        remote: Arc<dyn ObjectStore>,
        durable_root: &Path,
        dry_run: bool,
        mode_source: Arc<dyn ModeSource>,
    ) -> ReplicationSyncWorker {
        let store = Arc::new(StaticRecordStore::new(records));
        ReplicationSyncWorker::new(
            Arc::new(FileWhitelist::new(store)),
            remote,
            durable_root.to_path_buf(),
            mode_source,
            SyncMetrics::new(),
            SyncConfig {
                dry_run,
                ..Default::default()
            },
        )
    }

    fn worker(
        records: Vec<FileRecord>,
        remote: Arc<dyn ObjectStore>,
        durable_root: &Path,
        dry_run: bool,
    ) -> ReplicationSyncWorker {
        worker_with_mode(
            records,
            remote,
            durable_root,
            dry_run,
            Arc::new(FixedMode(StorageMode::Hybrid)),
        )
    }

    fn write_local(root: &Path, file_id: &str, content: &[u8]) -> PathBuf {
        let path = tier_file_path(root, file_id);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    async fn put_remote(store: &Arc<dyn ObjectStore>, file_id: &str, content: &[u8]) {
        store
            .put(
                &ObjectPath::from(remote_file_key(file_id)),
                content.to_vec().into(),
            )
            .await
            .unwrap();
    }

    async fn remote_exists(store: &Arc<dyn ObjectStore>, file_id: &str) -> bool {
        store
            .head(&ObjectPath::from(remote_file_key(file_id)))
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn test_upload_missing_remote_file() {
        let durable = TempDir::new().unwrap();
        let remote: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let content = b"0123456789";
        write_local(durable.path(), "a", content);

        let worker = worker(
            vec![whitelisted_record("a", content)],
            remote.clone(),
            durable.path(),
            false,
        );
        let report = worker.sync_cycle().await.unwrap();

        assert_eq!(report.uploaded, 1);
        assert_eq!(report.restored, 0);
        assert!(remote_exists(&remote, "a").await);
    }

    #[tokio::test]
    async fn test_restore_missing_local_file() {
        let durable = TempDir::new().unwrap();
        let remote: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let content = b"0123456789";
        put_remote(&remote, "a", content).await;

        let worker = worker(
            vec![whitelisted_record("a", content)],
            remote.clone(),
            durable.path(),
            false,
        );
        let report = worker.sync_cycle().await.unwrap();

        assert_eq!(report.restored, 1);
        let restored = fs::read(tier_file_path(durable.path(), "a")).unwrap();
        assert_eq!(restored, content);
        // No staging leftovers
        let names: Vec<String> = fs::read_dir(durable.path().join(FILES_PREFIX))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_both_present_is_noop() {
        let durable = TempDir::new().unwrap();
        let remote: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let content = b"0123456789";
        write_local(durable.path(), "a", content);
        put_remote(&remote, "a", content).await;

        let worker = worker(
            vec![whitelisted_record("a", content)],
            remote,
            durable.path(),
            false,
        );
        let report = worker.sync_cycle().await.unwrap();

        assert_eq!(report.uploaded, 0);
        assert_eq!(report.restored, 0);
        assert_eq!(report.deleted, 0);
    }

    #[tokio::test]
    async fn test_invalid_local_file_not_uploaded() {
        let durable = TempDir::new().unwrap();
        let remote: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        write_local(durable.path(), "rogue", b"not listed");

        let worker = worker(vec![], remote.clone(), durable.path(), false);
        let report = worker.sync_cycle().await.unwrap();

        assert_eq!(report.uploaded, 0);
        assert!(!remote_exists(&remote, "rogue").await);
        // Upload skips it; the local sweep owns its deletion
        assert!(tier_file_path(durable.path(), "rogue").exists());
    }

    #[tokio::test]
    async fn test_invalid_remote_file_deleted_not_restored() {
        let durable = TempDir::new().unwrap();
        let remote: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        put_remote(&remote, "rogue", b"not listed").await;

        let worker = worker(vec![], remote.clone(), durable.path(), false);
        let report = worker.sync_cycle().await.unwrap();

        assert_eq!(report.restored, 0);
        assert_eq!(report.deleted, 1);
        assert!(!remote_exists(&remote, "rogue").await);
        assert!(!tier_file_path(durable.path(), "rogue").exists());
    }

    #[tokio::test]
    async fn test_dry_run_moves_nothing() {
        let durable = TempDir::new().unwrap();
        let remote: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let content = b"0123456789";
        write_local(durable.path(), "up", content);
        put_remote(&remote, "down", content).await;
        put_remote(&remote, "rogue", b"not listed").await;

        let mut records = vec![whitelisted_record("up", content)];
        records.push(whitelisted_record("down", content));
        let worker = worker(records, remote.clone(), durable.path(), true);
        let report = worker.sync_cycle().await.unwrap();

        assert_eq!(report.uploaded, 1);
        assert_eq!(report.restored, 1);
        assert_eq!(report.deleted, 1);
        assert!(!remote_exists(&remote, "up").await);
        assert!(!tier_file_path(durable.path(), "down").exists());
        assert!(remote_exists(&remote, "rogue").await);
    }

    #[tokio::test]
    async fn test_config_file_mode_rereads_on_every_call() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("blobvault.toml");
        fs::write(&config_path, "[storage]\nmode = \"local\"\n").unwrap();

        let source = ConfigFileMode::new(config_path.clone(), StorageMode::Local);
        assert_eq!(source.current_mode(), StorageMode::Local);

        fs::write(
            &config_path,
            "[storage]\nmode = \"hybrid\"\nremote_dsn = \"memory://\"\n",
        )
        .unwrap();
        assert_eq!(source.current_mode(), StorageMode::Hybrid);

        // A broken file keeps the last known mode
        fs::write(&config_path, "[storage\nmode = ???").unwrap();
        assert_eq!(source.current_mode(), StorageMode::Hybrid);
    }

    #[tokio::test]
    async fn test_mode_flip_takes_effect_next_cycle() {
        let durable = TempDir::new().unwrap();
        let config_dir = TempDir::new().unwrap();
        let config_path = config_dir.path().join("blobvault.toml");
        fs::write(&config_path, "[storage]\nmode = \"local\"\n").unwrap();

        let remote: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let content = b"0123456789";
        write_local(durable.path(), "a", content);

        let worker = worker_with_mode(
            vec![whitelisted_record("a", content)],
            remote.clone(),
            durable.path(),
            false,
            Arc::new(ConfigFileMode::new(config_path.clone(), StorageMode::Local)),
        );

        // Local mode: idle pause, nothing replicated
        let pause = worker.run_cycle().await;
        assert_eq!(pause, worker.config.idle_interval);
        assert!(!remote_exists(&remote, "a").await);

        // Flip the file to hybrid; the very next cycle converges the tiers
        fs::write(
            &config_path,
            "[storage]\nmode = \"hybrid\"\nremote_dsn = \"memory://\"\n",
        )
        .unwrap();
        let pause = worker.run_cycle().await;
        assert_eq!(pause, worker.config.cycle_interval);
        assert!(remote_exists(&remote, "a").await);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let durable = TempDir::new().unwrap();
        let remote: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let worker = Arc::new(worker(vec![], remote, durable.path(), false));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker must stop promptly")
            .unwrap();
    }
}
