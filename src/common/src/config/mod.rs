use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Storage mode for the replication worker.
///
/// Re-read from configuration on every worker cycle so that a mode change
/// takes effect without a process restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Durable-local tier only, no remote replication.
    Local,
    /// Remote object storage is authoritative; local durable tier unused.
    S3,
    /// Durable-local tier replicated to remote object storage.
    Hybrid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// DSN of the system-of-record holding file rows (PostgreSQL or SQLite)
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://.data/blobvault.db"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Active storage mode (local, s3, hybrid)
    pub mode: StorageMode,
    /// Root of the rotation-destroyed ephemeral tier
    pub ephemeral_dir: String,
    /// Root of the durable tier that survives node rotation
    pub durable_dir: String,
    /// DSN of the remote object-storage tier (required for s3/hybrid modes)
    pub remote_dsn: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Local,
            ephemeral_dir: String::from(".data/ephemeral"),
            durable_dir: String::from(".data/durable"),
            remote_dsn: None,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ephemeral_dir.is_empty() {
            anyhow::bail!("storage.ephemeral_dir must not be empty");
        }
        if self.durable_dir.is_empty() {
            anyhow::bail!("storage.durable_dir must not be empty");
        }
        if matches!(self.mode, StorageMode::S3 | StorageMode::Hybrid) && self.remote_dsn.is_none() {
            anyhow::bail!(
                "storage.remote_dsn is required when storage.mode is {:?}",
                self.mode
            );
        }
        Ok(())
    }
}

/// Configuration for the batched asynchronous promoter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromoterConfig {
    /// Enable the background promotion queue
    pub enabled: bool,
    /// Interval at which the queue is scanned for due tasks
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Age a queued file must reach before it is forwarded for promotion
    #[serde(with = "humantime_serde")]
    pub promotion_delay: Duration,
    /// Maximum number of tasks forwarded in one authority call
    pub batch_size: usize,
    /// Base URL of the Promotion Authority
    pub authority_url: String,
    /// Shared secret for deriving the authority bearer token
    pub shared_secret: Option<String>,
    /// Listen address for serving the authority endpoint on durable nodes
    /// (unset on rotating nodes)
    pub authority_listen: Option<String>,
    /// Timeout for one authority call
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for PromoterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(10),
            promotion_delay: Duration::from_secs(300),
            batch_size: 10,
            authority_url: String::from("http://localhost:8462"),
            shared_secret: None,
            authority_listen: None,
            request_timeout: Duration::from_secs(300),
        }
    }
}

impl PromoterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("promoter.batch_size must be positive, got 0");
        }
        if self.poll_interval.is_zero() {
            anyhow::bail!("promoter.poll_interval must be positive");
        }
        if self.authority_url.is_empty() {
            anyhow::bail!("promoter.authority_url must not be empty");
        }
        Ok(())
    }
}

/// Configuration for the orphan reconciliation sweep.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Enable the periodic sweep of the durable tier
    pub enabled: bool,
    /// Interval between sweeps
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Report orphans without deleting them
    pub dry_run: bool,
    /// Age after which a foreign lock file is treated as abandoned
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3600),
            // Dry-run enabled by default for safety
            dry_run: true,
            lock_timeout: Duration::from_secs(300),
        }
    }
}

impl SweepConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval.is_zero() {
            anyhow::bail!("sweep.interval must be positive");
        }
        if self.lock_timeout.is_zero() {
            anyhow::bail!("sweep.lock_timeout must be positive");
        }
        Ok(())
    }
}

/// Configuration for the hybrid/remote replication worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Sleep between cycles when the mode is local (mode-change polling only)
    #[serde(with = "humantime_serde")]
    pub idle_interval: Duration,
    /// Sleep after a completed sync or remote-cleanup pass
    #[serde(with = "humantime_serde")]
    pub cycle_interval: Duration,
    /// Report remote orphans without deleting them
    pub dry_run: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(60),
            cycle_interval: Duration::from_secs(3600),
            dry_run: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    /// System-of-record connection (read-only at this layer)
    pub database: DatabaseConfig,
    /// Tier roots and storage mode
    pub storage: StorageConfig,
    /// Batched promoter settings
    pub promoter: PromoterConfig,
    /// Reconciliation sweep settings
    pub sweep: SweepConfig,
    /// Replication worker settings
    pub sync: SyncConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::load_from_path(std::path::Path::new("blobvault.toml"))
    }

    pub fn load_from_path(path: &std::path::Path) -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("BLOBVAULT__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.storage.validate()?;
        self.promoter.validate()?;
        self.sweep.validate()?;
        Ok(())
    }
}
