//! Processor configuration

use crate::block_cache::default_cache_root;
use crate::downloader::DEFAULT_DOWNLOAD_BUFFER;
use crate::model::{BlockHeight, SyncAlgorithm};
use crate::ranges::{ReorgPolicy, DEFAULT_REWIND_DISTANCE, MAX_REORG_SIZE};
use crate::sapling_params::SaplingParamsConfig;
use crate::sync_progress::DEFAULT_ALIAS;
use crate::{Error, Result};
use directories::ProjectDirs;
use std::path::PathBuf;
use std::time::Duration;
use zsync_params::Network;

/// Default blocks per download/scan batch
pub const DEFAULT_BATCH_SIZE: u64 = 100;

/// Default attempts for a failing action
pub const DEFAULT_RETRIES: u32 = 5;

/// Default upper bound on the retry backoff
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Default pause between sync passes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(20);

/// File name of the progress store inside the data directory
pub const PROGRESS_DB_NAME: &str = "sync_progress.sqlite";

/// Base directory for persistent data, overridable with `ZSYNC_DATA_DIR`
pub fn data_base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ZSYNC_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    ProjectDirs::from("cash", "zsync", "zsync")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Compact block processor configuration
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Synchronizer alias; separates caches and progress of several wallets
    pub alias: String,
    /// Root of the chain cache
    pub fs_block_cache_root: PathBuf,
    /// Legacy single-file cache to migrate away from, if any
    pub legacy_cache_db_path: Option<PathBuf>,
    /// Progress store database
    pub progress_db_path: PathBuf,
    /// Sapling parameter locations
    pub sapling_params: SaplingParamsConfig,
    /// Blocks per download/scan batch
    pub batch_size: u64,
    /// Attempts per failing action
    pub retries: u32,
    /// Upper bound on the retry backoff
    pub max_backoff: Duration,
    /// Blocks rewound after the first reorg
    pub rewind_distance: u64,
    /// Upper bound on the reorg rewind distance
    pub max_reorg_size: u64,
    /// Blocks buffered between the stream and the cache writer
    pub download_buffer_size: usize,
    /// Pause between sync passes
    pub poll_interval: Duration,
    /// Network parameters
    pub network: Network,
    /// Height the wallet was created at
    pub wallet_birthday: BlockHeight,
    /// Preferred sync algorithm
    pub sync_algorithm: SyncAlgorithm,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::for_network(Network::mainnet(), DEFAULT_ALIAS)
    }
}

impl ProcessorConfig {
    /// Default configuration for `network` and `alias`
    pub fn for_network(network: Network, alias: &str) -> Self {
        let data_dir = data_base_dir();
        let progress_db = if alias == DEFAULT_ALIAS {
            PROGRESS_DB_NAME.to_string()
        } else {
            format!("{}_{}", alias, PROGRESS_DB_NAME)
        };
        Self {
            alias: alias.to_string(),
            fs_block_cache_root: default_cache_root(alias),
            legacy_cache_db_path: None,
            progress_db_path: data_dir.join(progress_db),
            sapling_params: SaplingParamsConfig::in_dir(data_dir.join("params")),
            batch_size: DEFAULT_BATCH_SIZE,
            retries: DEFAULT_RETRIES,
            max_backoff: DEFAULT_MAX_BACKOFF,
            rewind_distance: DEFAULT_REWIND_DISTANCE,
            max_reorg_size: MAX_REORG_SIZE,
            download_buffer_size: DEFAULT_DOWNLOAD_BUFFER,
            poll_interval: DEFAULT_POLL_INTERVAL,
            network,
            wallet_birthday: network.sapling_activation_height,
            sync_algorithm: SyncAlgorithm::default(),
        }
    }

    /// Reorg rewind policy
    pub fn reorg_policy(&self) -> ReorgPolicy {
        ReorgPolicy {
            rewind_distance: self.rewind_distance,
            max_reorg_size: self.max_reorg_size,
        }
    }

    /// Whether this processor uses the default alias
    pub fn is_default_alias(&self) -> bool {
        self.alias == DEFAULT_ALIAS
    }

    /// Reject settings the processor cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.alias.trim().is_empty() {
            return Err(Error::Configuration("alias must not be empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Configuration("batch size must be positive".to_string()));
        }
        if self.retries == 0 {
            return Err(Error::Configuration("retries must be positive".to_string()));
        }
        if self.rewind_distance == 0 || self.rewind_distance > self.max_reorg_size {
            return Err(Error::Configuration(format!(
                "rewind distance {} must be in 1..={}",
                self.rewind_distance, self.max_reorg_size
            )));
        }
        if self.wallet_birthday < self.network.sapling_activation_height {
            return Err(Error::Configuration(format!(
                "wallet birthday {} is below sapling activation {}",
                self.wallet_birthday, self.network.sapling_activation_height
            )));
        }
        Ok(())
    }
}
