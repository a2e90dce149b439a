//! Transparent UTXO fetching for the wallet's transparent receivers

use crate::cancel::CancelToken;
use crate::engine::{ScanningEngine, UtxoStoreOutcome};
use crate::model::CompactBlockRange;
use crate::service::{ChainDataService, UnspentTransactionOutput};
use crate::sync_progress::{InternalSyncProgress, ProgressKey};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, error};

/// UTXOs stored by one fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoFetchResult {
    /// Newly stored outputs
    pub inserted: Vec<UnspentTransactionOutput>,
    /// Outputs already known or rejected by the engine
    pub skipped: Vec<UnspentTransactionOutput>,
}

/// Fetches transparent UTXOs and stores them through the engine
pub struct UtxoFetcher {
    service: Arc<dyn ChainDataService>,
    engine: Arc<dyn ScanningEngine>,
    progress: InternalSyncProgress,
}

impl UtxoFetcher {
    /// Create a fetcher
    pub fn new(
        service: Arc<dyn ChainDataService>,
        engine: Arc<dyn ScanningEngine>,
        progress: InternalSyncProgress,
    ) -> Self {
        Self {
            service,
            engine,
            progress,
        }
    }

    /// Fetch UTXOs for every transparent receiver mined within `range`
    pub async fn fetch(&self, range: CompactBlockRange, cancel: &CancelToken) -> Result<UtxoFetchResult> {
        cancel.check()?;

        let addresses = self.engine.list_transparent_receivers().await?;
        let result = self.fetch_for(&addresses, *range.start(), cancel).await?;
        self.progress.set(ProgressKey::LatestUtxoFetchedHeight, *range.end())?;
        Ok(result)
    }

    /// Fetch UTXOs for `addresses` mined at or after `start_height`
    ///
    /// Does not move the UTXO progress marker.
    pub async fn fetch_for(
        &self,
        addresses: &[String],
        start_height: u64,
        cancel: &CancelToken,
    ) -> Result<UtxoFetchResult> {
        if addresses.is_empty() {
            debug!("No transparent receivers to refresh");
            return Ok(UtxoFetchResult::default());
        }

        let utxos = self.service.fetch_utxos(addresses, start_height).await?;
        let mut result = UtxoFetchResult::default();
        for utxo in utxos {
            cancel.check()?;
            match self.engine.put_unspent_transparent_output(&utxo).await {
                Ok(UtxoStoreOutcome::Inserted) => result.inserted.push(utxo),
                Ok(UtxoStoreOutcome::Skipped) => result.skipped.push(utxo),
                Err(e) => {
                    error!("Failed to store UTXO {}:{}: {}", hex::encode(&utxo.txid), utxo.index, e);
                    result.skipped.push(utxo);
                }
            }
        }

        debug!(
            "Stored {} UTXOs, skipped {}",
            result.inserted.len(),
            result.skipped.len()
        );
        Ok(result)
    }
}
