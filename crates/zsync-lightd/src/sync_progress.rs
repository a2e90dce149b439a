//! Internal sync progress: persisted markers that survive restarts and the
//! range computations derived from them.

use crate::model::{BlockHeight, CompactBlockRange, SyncRanges};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, warn};
use zsync_storage_sqlite::ProgressStore;

/// Alias of the default synchronizer
pub const DEFAULT_ALIAS: &str = "default";

/// Key-value storage for progress markers
pub trait ProgressStorage: Send + Sync {
    /// Read an integer (0 when missing)
    fn integer(&self, key: &str) -> Result<u64>;
    /// Write an integer
    fn set_integer(&self, key: &str, value: u64) -> Result<()>;
    /// Read a boolean (`false` when missing)
    fn bool(&self, key: &str) -> Result<bool>;
    /// Write a boolean
    fn set_bool(&self, key: &str, value: bool) -> Result<()>;
}

impl ProgressStorage for ProgressStore {
    fn integer(&self, key: &str) -> Result<u64> {
        Ok(ProgressStore::integer(self, key)?)
    }

    fn set_integer(&self, key: &str, value: u64) -> Result<()> {
        Ok(ProgressStore::set_integer(self, key, value)?)
    }

    fn bool(&self, key: &str) -> Result<bool> {
        Ok(ProgressStore::bool(self, key)?)
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        Ok(ProgressStore::set_bool(self, key, value)?)
    }
}

/// Persisted progress markers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKey {
    /// Highest block height stored in the chain cache
    LatestDownloadedBlockHeight,
    /// Highest height whose transactions were enhanced
    LatestEnhancedHeight,
    /// Highest height up to which transparent UTXOs were fetched
    LatestUtxoFetchedHeight,
}

impl ProgressKey {
    /// Every marker
    pub const ALL: [ProgressKey; 3] = [
        ProgressKey::LatestDownloadedBlockHeight,
        ProgressKey::LatestEnhancedHeight,
        ProgressKey::LatestUtxoFetchedHeight,
    ];

    /// Stored key name
    pub fn name(&self) -> &'static str {
        match self {
            Self::LatestDownloadedBlockHeight => "latestDownloadedBlockHeight",
            Self::LatestEnhancedHeight => "latestEnhancedHeight",
            Self::LatestUtxoFetchedHeight => "latestUTXOFetchedHeight",
        }
    }

    /// Key name for `alias`; non-default aliases get a `_alias` suffix
    pub fn with_alias(&self, alias: &str) -> String {
        if alias == DEFAULT_ALIAS {
            self.name().to_string()
        } else {
            format!("{}_{}", self.name(), alias)
        }
    }
}

/// What a linear pass should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextState {
    /// Local state is ahead of the server; wait for it to catch up
    Wait {
        /// Server tip
        latest_height: BlockHeight,
        /// Local downloaded height
        latest_download_height: BlockHeight,
    },
    /// New blocks to process
    ProcessNewBlocks(SyncRanges),
    /// Nothing to do
    FinishProcessing(BlockHeight),
}

/// Progress markers for one synchronizer alias
#[derive(Clone)]
pub struct InternalSyncProgress {
    alias: String,
    storage: Arc<dyn ProgressStorage>,
}

impl InternalSyncProgress {
    /// Progress for `alias` backed by `storage`
    pub fn new(alias: impl Into<String>, storage: Arc<dyn ProgressStorage>) -> Self {
        Self {
            alias: alias.into(),
            storage,
        }
    }

    /// Synchronizer alias
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Read a marker
    pub fn load(&self, key: ProgressKey) -> Result<BlockHeight> {
        self.storage.integer(&key.with_alias(&self.alias))
    }

    /// Write a marker
    pub fn set(&self, key: ProgressKey, value: BlockHeight) -> Result<()> {
        self.storage.set_integer(&key.with_alias(&self.alias), value)
    }

    /// Highest block height stored in the chain cache
    pub fn latest_downloaded_block_height(&self) -> Result<BlockHeight> {
        self.load(ProgressKey::LatestDownloadedBlockHeight)
    }

    /// Highest enhanced height
    pub fn latest_enhanced_height(&self) -> Result<BlockHeight> {
        self.load(ProgressKey::LatestEnhancedHeight)
    }

    /// Highest UTXO-fetched height
    pub fn latest_utxo_fetched_height(&self) -> Result<BlockHeight> {
        self.load(ProgressKey::LatestUtxoFetchedHeight)
    }

    /// Lower every marker to `min(current, height)`
    pub fn rewind(&self, height: BlockHeight) -> Result<()> {
        for key in ProgressKey::ALL {
            let current = self.load(key)?;
            self.set(key, current.min(height))?;
        }
        debug!("Rewound internal sync progress to {}", height);
        Ok(())
    }

    /// Reset every marker to 0
    pub fn reset(&self) -> Result<()> {
        for key in ProgressKey::ALL {
            self.set(key, 0)?;
        }
        Ok(())
    }

    /// Decide what a linear pass should do
    pub fn compute_next_state(
        &self,
        latest_block_height: BlockHeight,
        latest_scanned_height: BlockHeight,
        wallet_birthday: BlockHeight,
    ) -> Result<NextState> {
        let downloaded = self.latest_downloaded_block_height()?;
        let enhanced = self.latest_enhanced_height()?;
        let utxo_fetched = self.latest_utxo_fetched_height()?;

        debug!(
            latest_block_height,
            downloaded, latest_scanned_height, enhanced, utxo_fetched, "Init numbers"
        );

        if downloaded > latest_block_height
            || latest_scanned_height > latest_block_height
            || enhanced > latest_block_height
            || utxo_fetched > latest_block_height
        {
            Ok(NextState::Wait {
                latest_height: latest_block_height,
                latest_download_height: downloaded,
            })
        } else if downloaded < latest_block_height
            || latest_scanned_height < latest_block_height
            || enhanced < latest_block_height
            || utxo_fetched < latest_block_height
        {
            let ranges =
                self.compute_sync_ranges(wallet_birthday, latest_block_height, latest_scanned_height)?;
            Ok(NextState::ProcessNewBlocks(ranges))
        } else {
            Ok(NextState::FinishProcessing(latest_block_height))
        }
    }

    /// Compute the ranges of work for a linear pass
    pub fn compute_sync_ranges(
        &self,
        birthday: BlockHeight,
        latest_block_height: BlockHeight,
        latest_scanned_height: BlockHeight,
    ) -> Result<SyncRanges> {
        let downloaded = self.latest_downloaded_block_height()?;
        let enhanced = self.latest_enhanced_height()?;
        let utxo_fetched = self.latest_utxo_fetched_height()?;

        let downloaded_but_unscanned_range =
            (latest_scanned_height < downloaded).then(|| latest_scanned_height + 1..=downloaded);

        if latest_scanned_height > downloaded {
            warn!(
                latest_block_height,
                downloaded,
                latest_scanned_height,
                enhanced,
                utxo_fetched,
                "Inconsistent sync progress: scanned height is above the downloaded height"
            );
        }

        Ok(SyncRanges {
            latest_block_height,
            downloaded_but_unscanned_range,
            download_and_scan_range: compute_range(
                downloaded.max(latest_scanned_height),
                birthday,
                latest_block_height,
            ),
            enhance_range: compute_range(enhanced, birthday, latest_block_height),
            fetch_utxo_range: compute_range(utxo_fetched, birthday, latest_block_height),
            latest_scanned_height: Some(latest_scanned_height),
            latest_downloaded_block_height: Some(downloaded),
        })
    }
}

/// Range of heights after `latest_height` up to the tip, starting no lower than the birthday
pub fn compute_range(
    latest_height: BlockHeight,
    birthday: BlockHeight,
    latest_block_height: BlockHeight,
) -> Option<CompactBlockRange> {
    if latest_height >= latest_block_height {
        return None;
    }
    let lower = if latest_height <= birthday {
        birthday
    } else {
        latest_height + 1
    };
    (lower <= latest_block_height).then_some(lower..=latest_block_height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn progress(alias: &str) -> InternalSyncProgress {
        InternalSyncProgress::new(alias, Arc::new(ProgressStore::in_memory().unwrap()))
    }

    #[test]
    fn test_key_aliases() {
        assert_eq!(
            ProgressKey::LatestDownloadedBlockHeight.with_alias(DEFAULT_ALIAS),
            "latestDownloadedBlockHeight"
        );
        assert_eq!(
            ProgressKey::LatestUtxoFetchedHeight.with_alias("wallet2"),
            "latestUTXOFetchedHeight_wallet2"
        );
    }

    #[test]
    fn test_aliases_are_isolated() {
        let storage: Arc<dyn ProgressStorage> = Arc::new(ProgressStore::in_memory().unwrap());
        let a = InternalSyncProgress::new(DEFAULT_ALIAS, storage.clone());
        let b = InternalSyncProgress::new("other", storage);

        a.set(ProgressKey::LatestEnhancedHeight, 500).unwrap();
        assert_eq!(b.latest_enhanced_height().unwrap(), 0);
    }

    #[test]
    fn test_rewind_lowers_only() {
        let p = progress(DEFAULT_ALIAS);
        p.set(ProgressKey::LatestDownloadedBlockHeight, 1000).unwrap();
        p.set(ProgressKey::LatestEnhancedHeight, 800).unwrap();
        p.set(ProgressKey::LatestUtxoFetchedHeight, 1200).unwrap();

        p.rewind(900).unwrap();

        assert_eq!(p.latest_downloaded_block_height().unwrap(), 900);
        assert_eq!(p.latest_enhanced_height().unwrap(), 800);
        assert_eq!(p.latest_utxo_fetched_height().unwrap(), 900);
    }

    #[test]
    fn test_compute_range() {
        assert_eq!(compute_range(0, 1000, 2000), Some(1000..=2000));
        assert_eq!(compute_range(1000, 1000, 2000), Some(1000..=2000));
        assert_eq!(compute_range(1500, 1000, 2000), Some(1501..=2000));
        assert_eq!(compute_range(2000, 1000, 2000), None);
        assert_eq!(compute_range(0, 3000, 2000), None);
    }

    #[test]
    fn test_sync_ranges_with_unscanned_cache() {
        let p = progress(DEFAULT_ALIAS);
        p.set(ProgressKey::LatestDownloadedBlockHeight, 1200).unwrap();

        let ranges = p.compute_sync_ranges(1000, 2000, 1100).unwrap();
        assert_eq!(ranges.downloaded_but_unscanned_range, Some(1101..=1200));
        assert_eq!(ranges.download_and_scan_range, Some(1201..=2000));
        assert_eq!(ranges.enhance_range, Some(1000..=2000));
        assert_eq!(ranges.fetch_utxo_range, Some(1000..=2000));
    }

    #[test]
    fn test_next_state() {
        let p = progress(DEFAULT_ALIAS);
        p.set(ProgressKey::LatestDownloadedBlockHeight, 2100).unwrap();
        assert!(matches!(
            p.compute_next_state(2000, 1900, 1000).unwrap(),
            NextState::Wait { latest_height: 2000, latest_download_height: 2100 }
        ));

        p.rewind(1950).unwrap();
        assert!(matches!(
            p.compute_next_state(2000, 1900, 1000).unwrap(),
            NextState::ProcessNewBlocks(_)
        ));

        for key in ProgressKey::ALL {
            p.set(key, 2000).unwrap();
        }
        assert_eq!(
            p.compute_next_state(2000, 2000, 1000).unwrap(),
            NextState::FinishProcessing(2000)
        );
    }

    proptest! {
        #[test]
        fn prop_ranges_within_bounds(
            birthday in 419_200u64..2_000_000,
            tip_offset in 0u64..500_000,
            downloaded in 0u64..3_000_000,
            scanned in 0u64..3_000_000,
            enhanced in 0u64..3_000_000,
        ) {
            let latest = birthday + tip_offset;
            let p = progress(DEFAULT_ALIAS);
            p.set(ProgressKey::LatestDownloadedBlockHeight, downloaded.min(latest)).unwrap();
            p.set(ProgressKey::LatestEnhancedHeight, enhanced.min(latest)).unwrap();
            let ranges = p.compute_sync_ranges(birthday, latest, scanned.min(latest)).unwrap();

            for range in [&ranges.download_and_scan_range, &ranges.enhance_range, &ranges.fetch_utxo_range]
                .into_iter()
                .flatten()
            {
                prop_assert!(*range.start() >= birthday);
                prop_assert!(*range.end() <= latest);
                prop_assert!(range.start() <= range.end());
            }
            if let (Some(scan), Some(download)) = (ranges.scan_range(), ranges.download_range()) {
                prop_assert!(scan.start() >= download.start());
            }
        }
    }
}
