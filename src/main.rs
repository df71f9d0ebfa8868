//! blobvault service binary.
//!
//! Wires the system-of-record whitelist to the promotion, sweep, and
//! replication workers, and optionally serves the promote-files authority
//! endpoint on durable nodes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use common::config::{Configuration, StorageMode};
use common::metrics::SyncMetrics;
use common::records::SqlRecordStore;
use common::storage::create_object_store_from_dsn;
use common::{FileWhitelist, RecordStore};
use promoter::{AuthorityClient, BatchCachePromoter, PromotionEngine, authority_router};
use sweeper::{ReconciliationSweeper, SweepOptions};
use syncer::{ConfigFileMode, ReplicationSyncWorker};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "blobvault.toml")]
    config: String,

    /// Queue every valid ephemeral file as immediately due, flush the queue
    /// once, and exit (run this before planned node rotation)
    #[arg(long)]
    pre_rotation: bool,
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = if Path::new(&args.config).exists() {
        Configuration::load_from_path(Path::new(&args.config))
            .context("Failed to load configuration")?
    } else {
        log::info!("Configuration file not found, using defaults");
        Configuration::default()
    };
    config.validate().context("Invalid configuration")?;

    let store = SqlRecordStore::connect(&config.database.dsn)
        .await
        .context("Failed to connect to system-of-record")?;
    let store: Arc<dyn RecordStore> = Arc::new(store);
    let whitelist = Arc::new(FileWhitelist::new(store));
    whitelist.load().await;
    log::info!("Whitelist loaded with {} records", whitelist.len());

    let metrics = SyncMetrics::new();
    let engine = Arc::new(PromotionEngine::new(whitelist.clone()));
    let ephemeral_root = PathBuf::from(&config.storage.ephemeral_dir);
    let durable_root = PathBuf::from(&config.storage.durable_dir);

    if args.pre_rotation {
        return pre_rotation(&config, whitelist, metrics, &ephemeral_root).await;
    }

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    // Durable nodes serve the promote-files endpoint
    if let (Some(listen), Some(secret)) = (
        config.promoter.authority_listen.clone(),
        config.promoter.shared_secret.as_deref(),
    ) {
        let router = authority_router(engine.clone(), durable_root.clone(), secret);
        let listener = tokio::net::TcpListener::bind(&listen)
            .await
            .with_context(|| format!("Failed to bind authority listener on {listen}"))?;
        log::info!("Serving promote-files authority on {listen}");
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                log::error!("Authority server failed: {e:?}");
            }
        }));
    }

    // Rotating nodes queue ephemeral writes toward the authority
    if config.promoter.enabled {
        let client =
            AuthorityClient::new(&config.promoter).context("Failed to build authority client")?;
        let promoter = Arc::new(BatchCachePromoter::new(
            whitelist.clone(),
            client,
            metrics.clone(),
            config.promoter.clone(),
        ));
        tasks.push(tokio::spawn(promoter.run(shutdown.clone())));
    } else {
        log::info!("Promoter is disabled in configuration (promoter.enabled = false)");
    }

    if config.sweep.enabled {
        let sweeper = ReconciliationSweeper::new(whitelist.clone(), metrics.clone());
        let options = SweepOptions::from(&config.sweep);
        let interval = config.sweep.interval;
        let root = durable_root.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match sweeper.cleanup_orphaned_files(&root, &options).await {
                    Ok(report) if report.skipped => {
                        log::info!("Sweep skipped, another process holds the lock")
                    }
                    Ok(report) => log::info!(
                        "Sweep complete: {} deleted, {} failed",
                        report.deleted_count,
                        report.failed_count
                    ),
                    Err(e) => log::error!("Sweep failed: {e:?}"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = token.cancelled() => return,
                }
            }
        }));
    } else {
        log::info!("Sweep is disabled in configuration (sweep.enabled = false)");
    }

    if let Some(remote_dsn) = &config.storage.remote_dsn {
        let remote = create_object_store_from_dsn(remote_dsn)
            .context("Failed to create remote object store")?;
        // Mode changes in the config file take effect at the next cycle
        let mode_source = ConfigFileMode::new(PathBuf::from(&args.config), config.storage.mode);
        let worker = Arc::new(ReplicationSyncWorker::new(
            whitelist.clone(),
            remote,
            durable_root.clone(),
            Arc::new(mode_source),
            metrics.clone(),
            config.sync.clone(),
        ));
        tasks.push(tokio::spawn(worker.run(shutdown.clone())));
    } else if config.storage.mode != StorageMode::Local {
        // validate() rules this out, kept as a guard for hand-built configs
        anyhow::bail!("storage.remote_dsn is required for mode {:?}", config.storage.mode);
    }

    log::info!(
        "blobvault running in {:?} mode, waiting for shutdown signal",
        config.storage.mode
    );
    wait_for_shutdown_signal().await?;

    log::info!("Shutting down workers");
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = tokio::time::timeout(Duration::from_secs(5), task).await {
            log::warn!("Worker did not stop within 5s: {e}");
        }
    }

    metrics.summary().log();
    log::info!("blobvault stopped");
    Ok(())
}

/// One-shot eager promotion before planned rotation: every valid ephemeral
/// file is queued as immediately due and flushed to the authority now.
async fn pre_rotation(
    config: &Configuration,
    whitelist: Arc<FileWhitelist>,
    metrics: SyncMetrics,
    ephemeral_root: &Path,
) -> Result<()> {
    let client =
        AuthorityClient::new(&config.promoter).context("Failed to build authority client")?;
    let promoter = BatchCachePromoter::new(
        whitelist,
        client,
        metrics.clone(),
        config.promoter.clone(),
    );

    let report = promoter
        .promote_all_validated_files(ephemeral_root)
        .await
        .context("Eager promotion pass failed")?;
    log::info!(
        "Eager pass queued {} files, deleted {} invalid files",
        report.queued,
        report.deleted
    );

    while promoter.queue_len() > 0 {
        promoter.flush_due().await;
    }
    metrics.summary().log();
    Ok(())
}
