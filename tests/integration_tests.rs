use std::fs;
use std::sync::Arc;
use std::time::Duration;

use common::FileWhitelist;
use common::config::{PromoterConfig, StorageMode, SyncConfig};
use common::metrics::SyncMetrics;
use common::storage::{remote_file_key, tier_file_path};
use common::testing::{StaticRecordStore, whitelisted_record};
use object_store::{ObjectStore, path::Path as ObjectPath};
use promoter::{AuthorityClient, BatchCachePromoter, PromotionEngine, authority_router};
use sweeper::{ReconciliationSweeper, SweepOptions};
use syncer::{FixedMode, ReplicationSyncWorker};
use tempfile::TempDir;

fn whitelist_for(records: Vec<common::FileRecord>) -> Arc<FileWhitelist> {
    Arc::new(FileWhitelist::new(Arc::new(StaticRecordStore::new(records))))
}

async fn start_authority(
    whitelist: Arc<FileWhitelist>,
    durable_root: &std::path::Path,
    secret: &str,
) -> (String, tokio::task::JoinHandle<()>) {
    let engine = Arc::new(PromotionEngine::new(whitelist));
    let router = authority_router(engine, durable_root.to_path_buf(), secret);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), server)
}

#[tokio::test]
async fn test_rotation_lifecycle_queue_promote_sweep_sync() {
    let ephemeral = TempDir::new().unwrap();
    let durable = TempDir::new().unwrap();
    let content = b"encrypted-payload-bytes";

    let whitelist = whitelist_for(vec![whitelisted_record("f1", content)]);
    let (authority_url, server) = start_authority(whitelist.clone(), durable.path(), "s").await;

    // A rotating node queues a freshly uploaded file and flushes it to the
    // authority immediately (zero delay stands in for the elapsed window)
    let config = PromoterConfig {
        authority_url,
        shared_secret: Some("s".to_string()),
        promotion_delay: Duration::ZERO,
        request_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let metrics = SyncMetrics::new();
    let promoter = BatchCachePromoter::new(
        whitelist.clone(),
        AuthorityClient::new(&config).unwrap(),
        metrics.clone(),
        config,
    );

    let source = tier_file_path(ephemeral.path(), "f1");
    fs::create_dir_all(source.parent().unwrap()).unwrap();
    fs::write(&source, content).unwrap();

    assert!(promoter.queue_for_promotion("f1", &source).await.unwrap());
    promoter.flush_due().await;

    let promoted = tier_file_path(durable.path(), "f1");
    assert_eq!(fs::read(&promoted).unwrap(), content);
    assert_eq!(metrics.files_synced(), 1);

    // A stray file in the durable tier is removed by the sweep; the
    // promoted file survives it
    let orphan = tier_file_path(durable.path(), "stray");
    fs::write(&orphan, b"leftover").unwrap();

    let sweeper = ReconciliationSweeper::new(whitelist.clone(), metrics.clone());
    let report = sweeper
        .cleanup_orphaned_files(
            durable.path(),
            &SweepOptions {
                dry_run: false,
                lock_timeout: Duration::from_secs(300),
            },
        )
        .await
        .unwrap();
    assert_eq!(report.deleted, vec!["stray".to_string()]);
    assert!(promoted.exists());
    assert!(!orphan.exists());

    // A hybrid sync cycle replicates the durable tier to the remote store
    let remote: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
    let worker = ReplicationSyncWorker::new(
        whitelist,
        remote.clone(),
        durable.path().to_path_buf(),
        Arc::new(FixedMode(StorageMode::Hybrid)),
        metrics,
        SyncConfig {
            dry_run: false,
            ..Default::default()
        },
    );
    let sync_report = worker.sync_cycle().await.unwrap();
    assert_eq!(sync_report.uploaded, 1);
    assert_eq!(sync_report.deleted, 0);
    assert!(
        remote
            .head(&ObjectPath::from(remote_file_key("f1")))
            .await
            .is_ok()
    );

    server.abort();
}

#[tokio::test]
async fn test_unlisted_file_never_reaches_any_tier() {
    let ephemeral = TempDir::new().unwrap();
    let durable = TempDir::new().unwrap();

    let whitelist = whitelist_for(vec![]);
    let (authority_url, server) = start_authority(whitelist.clone(), durable.path(), "s").await;

    let config = PromoterConfig {
        authority_url,
        shared_secret: Some("s".to_string()),
        promotion_delay: Duration::ZERO,
        request_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let promoter = BatchCachePromoter::new(
        whitelist,
        AuthorityClient::new(&config).unwrap(),
        SyncMetrics::new(),
        config,
    );

    let source = tier_file_path(ephemeral.path(), "rogue");
    fs::create_dir_all(source.parent().unwrap()).unwrap();
    fs::write(&source, b"not in the system of record").unwrap();

    // Rejected at queue time and deleted from the ephemeral tier
    assert!(!promoter.queue_for_promotion("rogue", &source).await.unwrap());
    assert!(!source.exists());
    assert!(!tier_file_path(durable.path(), "rogue").exists());

    server.abort();
}
