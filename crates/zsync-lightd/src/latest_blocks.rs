//! Cached view of the chain tip and the wallet's scan heights
//!
//! Single writer (the running action), many readers (status queries).

use crate::engine::ScanningEngine;
use crate::model::BlockHeight;
use crate::service::ChainDataService;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
struct Snapshot {
    fully_scanned_height: BlockHeight,
    max_scanned_height: BlockHeight,
    latest_block_height: BlockHeight,
    wallet_birthday: BlockHeight,
}

/// Latest chain data known to the processor
#[derive(Clone)]
pub struct LatestBlocksCache {
    service: Arc<dyn ChainDataService>,
    engine: Arc<dyn ScanningEngine>,
    inner: Arc<RwLock<Snapshot>>,
}

impl LatestBlocksCache {
    /// Create an empty cache
    pub fn new(service: Arc<dyn ChainDataService>, engine: Arc<dyn ScanningEngine>) -> Self {
        Self {
            service,
            engine,
            inner: Arc::new(RwLock::new(Snapshot::default())),
        }
    }

    /// Height below which every block is scanned
    pub fn fully_scanned_height(&self) -> BlockHeight {
        self.inner.read().fully_scanned_height
    }

    /// Highest scanned height
    pub fn max_scanned_height(&self) -> BlockHeight {
        self.inner.read().max_scanned_height
    }

    /// Highest remote tip seen
    pub fn latest_block_height(&self) -> BlockHeight {
        self.inner.read().latest_block_height
    }

    /// Wallet birthday
    pub fn wallet_birthday(&self) -> BlockHeight {
        self.inner.read().wallet_birthday
    }

    /// Set the wallet birthday
    pub fn update_wallet_birthday(&self, birthday: BlockHeight) {
        self.inner.write().wallet_birthday = birthday;
    }

    /// Refresh scan heights from the engine, falling back to the birthday
    pub async fn update_scanned_data(&self) {
        let birthday = self.wallet_birthday();
        let fully = self.engine.fully_scanned_height().await.ok().flatten();
        let max = self.engine.latest_scanned_height().await.ok().flatten();

        let mut inner = self.inner.write();
        inner.fully_scanned_height = fully.unwrap_or(birthday);
        inner.max_scanned_height = max.unwrap_or(birthday);
    }

    /// Refresh the remote tip; failures keep the previous value
    pub async fn update_block_data(&self) {
        match self.service.latest_block_height().await {
            Ok(height) => self.update(height),
            Err(e) => debug!("Failed to refresh latest block height: {}", e),
        }
    }

    /// Record a remote tip; the stored tip never decreases
    pub fn update(&self, latest_block_height: BlockHeight) {
        let mut inner = self.inner.write();
        if inner.latest_block_height < latest_block_height {
            inner.latest_block_height = latest_block_height;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockWorld;
    use zsync_params::Network;

    #[tokio::test]
    async fn test_tip_never_decreases() {
        let world = MockWorld::new(Network::mainnet(), 2_000_000);
        let cache = LatestBlocksCache::new(world.service.clone(), world.engine.clone());

        cache.update_block_data().await;
        assert_eq!(cache.latest_block_height(), 2_000_000);

        world.service.set_tip(1_999_990);
        cache.update_block_data().await;
        assert_eq!(cache.latest_block_height(), 2_000_000);
    }

    #[tokio::test]
    async fn test_scanned_falls_back_to_birthday() {
        let world = MockWorld::new(Network::mainnet(), 2_000_000);
        let cache = LatestBlocksCache::new(world.service.clone(), world.engine.clone());
        cache.update_wallet_birthday(1_900_000);

        cache.update_scanned_data().await;
        assert_eq!(cache.max_scanned_height(), 1_900_000);

        world.engine.set_scanned(Some(1_950_000));
        cache.update_scanned_data().await;
        assert_eq!(cache.max_scanned_height(), 1_950_000);
        assert_eq!(cache.fully_scanned_height(), 1_950_000);
    }
}
