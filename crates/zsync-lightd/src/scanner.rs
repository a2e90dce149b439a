//! Block scanner: feeds cached blocks to the scanning engine in batches

use crate::cancel::CancelToken;
use crate::engine::ScanningEngine;
use crate::model::{BlockHeight, BlockProgress, CompactBlockRange};
use crate::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use zsync_params::{Network, NetworkType};

/// Mainnet height above which blocks are dense enough to scan in small batches
const DENSE_BLOCKS_HEIGHT: BlockHeight = 1_600_000;

/// Batch size used on dense mainnet blocks
const DENSE_BLOCKS_BATCH_SIZE: u32 = 5;

/// Scans cached blocks through a [`ScanningEngine`]
pub struct BlockScanner {
    engine: Arc<dyn ScanningEngine>,
    network: Network,
    batch_size: u32,
}

impl BlockScanner {
    /// Create a scanner
    pub fn new(engine: Arc<dyn ScanningEngine>, network: Network, batch_size: u32) -> Self {
        Self {
            engine,
            network,
            batch_size: batch_size.max(1),
        }
    }

    /// Engine batch size for a scan starting at `height`
    pub fn batch_size_at(&self, height: BlockHeight) -> u32 {
        if self.network.network_type == NetworkType::Mainnet && height > DENSE_BLOCKS_HEIGHT {
            DENSE_BLOCKS_BATCH_SIZE
        } else {
            self.batch_size
        }
    }

    /// Scan `range`, reporting progress against `total_progress_range`
    ///
    /// Heights below `range.start()` are taken as scanned. Stops early when
    /// the engine stops advancing or `cancel` fires. Returns the last scanned
    /// height.
    pub async fn scan_blocks<F>(
        &self,
        range: CompactBlockRange,
        total_progress_range: CompactBlockRange,
        cancel: &CancelToken,
        mut did_scan: F,
    ) -> Result<BlockHeight>
    where
        F: FnMut(BlockHeight, BlockProgress) + Send,
    {
        cancel.check()?;

        let target = *range.end();
        let mut last_scanned = range.start().saturating_sub(1);

        while last_scanned < target {
            cancel.check()?;
            let previous = last_scanned;
            let from = previous + 1;
            let remaining = u32::try_from(target - previous).unwrap_or(u32::MAX);
            let limit = self.batch_size_at(from).min(remaining);

            let started = Instant::now();
            let summary = self.engine.scan_blocks(from, limit).await?;
            let reached = summary
                .scanned_range
                .map(|scanned| *scanned.end())
                .unwrap_or(previous);

            if reached <= previous {
                debug!("Engine made no progress scanning from {}", from);
                break;
            }
            last_scanned = reached;

            let progress = BlockProgress {
                start_height: *total_progress_range.start(),
                target_height: *total_progress_range.end(),
                progress_height: last_scanned,
            };
            did_scan(last_scanned, progress);
            debug!(
                "Scanned {} blocks in {:?} ({} sapling, {} orchard notes)",
                last_scanned - previous,
                started.elapsed(),
                summary.received_sapling_note_count,
                summary.received_orchard_note_count
            );
            tokio::task::yield_now().await;
        }

        Ok(last_scanned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BlockMeta;
    use crate::testing::{synthetic_block, MockEngine};

    #[test]
    fn test_dense_mainnet_batch() {
        let engine = Arc::new(MockEngine::new(Network::mainnet()));
        let scanner = BlockScanner::new(engine, Network::mainnet(), 100);
        assert_eq!(scanner.batch_size_at(1_500_000), 100);
        assert_eq!(scanner.batch_size_at(1_600_001), 5);

        let engine = Arc::new(MockEngine::new(Network::testnet()));
        let scanner = BlockScanner::new(engine, Network::testnet(), 100);
        assert_eq!(scanner.batch_size_at(2_000_000), 100);
    }

    #[tokio::test]
    async fn test_scan_reports_progress() {
        let engine = Arc::new(MockEngine::new(Network::regtest()));
        let metas: Vec<BlockMeta> = (1..=250).map(|h| BlockMeta::from(&synthetic_block(h))).collect();
        engine.write_blocks_metadata(&metas).await.unwrap();

        let scanner = BlockScanner::new(engine.clone(), Network::regtest(), 100);
        let mut reports = Vec::new();
        let last = scanner
            .scan_blocks(1..=250, 1..=250, &CancelToken::new(), |height, progress| {
                reports.push((height, progress.progress_height));
            })
            .await
            .unwrap();

        assert_eq!(last, 250);
        assert_eq!(reports, vec![(100, 100), (200, 200), (250, 250)]);
        assert_eq!(engine.scan_calls(), vec![(1, 100), (101, 100), (201, 50)]);
    }

    #[tokio::test]
    async fn test_scan_stops_without_progress() {
        let engine = Arc::new(MockEngine::new(Network::regtest()));
        let metas: Vec<BlockMeta> = (1..=10).map(|h| BlockMeta::from(&synthetic_block(h))).collect();
        engine.write_blocks_metadata(&metas).await.unwrap();
        let scanner = BlockScanner::new(engine, Network::regtest(), 100);

        let last = scanner
            .scan_blocks(11..=50, 1..=50, &CancelToken::new(), |_, _| {})
            .await
            .unwrap();
        assert_eq!(last, 10);
    }
}
