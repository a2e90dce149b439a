//! Chain continuity validation over cached blocks

use crate::block_cache::ChainCache;
use crate::engine::ScanningEngine;
use crate::model::{BlockHeight, CompactBlockRange};
use crate::proto_types as proto;
use crate::service::LightdInfo;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use zsync_params::{BranchId, Network, NetworkType};

/// Validates that cached blocks extend the scanned chain
pub struct BlockValidator {
    cache: Arc<dyn ChainCache>,
    engine: Arc<dyn ScanningEngine>,
}

impl BlockValidator {
    /// Create a validator
    pub fn new(cache: Arc<dyn ChainCache>, engine: Arc<dyn ScanningEngine>) -> Self {
        Self { cache, engine }
    }

    /// Validate cached blocks in `range`, then the engine's combined chain
    ///
    /// A discontinuity is reported as `Error::InvalidChain(height)`.
    pub async fn validate(&self, range: Option<CompactBlockRange>) -> Result<()> {
        let started = Instant::now();

        if let Some(range) = range {
            let blocks = self.cache.load_range(range)?;
            if let Some(height) = find_discontinuity(&blocks) {
                warn!("Cached chain is discontinuous at {}", height);
                return Err(Error::InvalidChain(height));
            }
        }

        match self.engine.validate_combined_chain(0).await {
            Ok(()) => {
                debug!("Chain validated in {:?}", started.elapsed());
                Ok(())
            }
            Err(Error::InvalidChain(height)) => {
                warn!("Engine reports invalid chain at {}", height);
                Err(Error::InvalidChain(height))
            }
            Err(e) => Err(e),
        }
    }
}

/// First height whose block does not link to its predecessor
pub fn find_discontinuity(blocks: &[proto::CompactBlock]) -> Option<BlockHeight> {
    blocks.windows(2).find_map(|pair| {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.height != prev.height + 1 || next.prev_hash != prev.hash {
            Some(next.height)
        } else {
            None
        }
    })
}

/// Check that `info` describes the chain of `network`
///
/// `local_branch` is the consensus branch the wallet expects at the
/// server's tip.
pub fn check_server_info(info: &LightdInfo, network: &Network, local_branch: BranchId) -> Result<()> {
    let remote_type = match info.chain_name.as_str() {
        "main" => NetworkType::Mainnet,
        "test" => NetworkType::Testnet,
        other => return Err(Error::UnknownChainName(other.to_string())),
    };
    if remote_type != network.network_type {
        return Err(Error::NetworkMismatch {
            expected: network.chain_name().to_string(),
            found: info.chain_name.clone(),
        });
    }

    if info.sapling_activation_height != network.sapling_activation_height {
        return Err(Error::SaplingActivationMismatch {
            expected: network.sapling_activation_height,
            found: info.sapling_activation_height,
        });
    }

    let remote_branch = BranchId::parse_hex(&info.consensus_branch_id)
        .map_err(|_| Error::InvalidConsensusBranchId(info.consensus_branch_id.clone()))?;
    if remote_branch != local_branch {
        return Err(Error::ConsensusBranchIdMismatch {
            expected: local_branch.to_hex(),
            found: remote_branch.to_hex(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_cache::SqliteChainCache;
    use crate::testing::{synthetic_block, MockChainService, MockEngine};
    use tempfile::TempDir;
    use zsync_params::Network;

    #[test]
    fn test_find_discontinuity() {
        let mut blocks: Vec<_> = (100..110).map(synthetic_block).collect();
        assert_eq!(find_discontinuity(&blocks), None);

        blocks[5].prev_hash = vec![0xff; 8];
        assert_eq!(find_discontinuity(&blocks), Some(105));
    }

    #[tokio::test]
    async fn test_validate_reports_engine_reorg() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(SqliteChainCache::new(dir.path()));
        cache.create().unwrap();
        let blocks: Vec<_> = (1..=20).map(synthetic_block).collect();
        cache.write(&blocks).unwrap();

        let engine = Arc::new(MockEngine::new(Network::regtest()));
        let validator = BlockValidator::new(cache, engine.clone());
        validator.validate(Some(1..=20)).await.unwrap();

        engine.invalidate_chain_at(15);
        let err = validator.validate(Some(1..=20)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidChain(15)));
    }

    #[test]
    fn test_server_info_checks() {
        let network = Network::mainnet();
        let info = MockChainService::default_info(&network, 2_500_000);
        let branch = BranchId::for_height(&network, 2_500_000);
        check_server_info(&info, &network, branch).unwrap();

        let err = check_server_info(&info, &Network::testnet(), branch).unwrap_err();
        assert!(matches!(err, Error::NetworkMismatch { .. }));

        let err = check_server_info(&info, &network, BranchId(0)).unwrap_err();
        assert!(matches!(err, Error::ConsensusBranchIdMismatch { .. }));
    }
}
