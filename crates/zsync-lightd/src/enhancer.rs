//! Transaction enhancement: fetch full transactions for scanned wallet
//! activity so memos and transparent details can be decrypted and stored.

use crate::cancel::CancelToken;
use crate::engine::{ScanningEngine, TransactionRepository, WalletTransaction};
use crate::model::CompactBlockRange;
use crate::service::ChainDataService;
use crate::sync_progress::{InternalSyncProgress, ProgressKey};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, error};

/// Attempts per transaction before enhancement fails
pub const MAX_ENHANCE_ATTEMPTS: u32 = 5;

/// Progress of one enhancement pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancementProgress {
    /// Transactions in the pass
    pub total_transactions: usize,
    /// Transactions enhanced so far
    pub enhanced_transactions: usize,
    /// Transaction just enhanced
    pub last_found_transaction: WalletTransaction,
    /// Range being enhanced
    pub range: CompactBlockRange,
    /// The transaction was unmined before this pass and is mined now
    pub newly_mined: bool,
}

/// Enhances wallet transactions in a block range
pub struct BlockEnhancer {
    service: Arc<dyn ChainDataService>,
    engine: Arc<dyn ScanningEngine>,
    transactions: Arc<dyn TransactionRepository>,
    progress: InternalSyncProgress,
}

impl BlockEnhancer {
    /// Create an enhancer
    pub fn new(
        service: Arc<dyn ChainDataService>,
        engine: Arc<dyn ScanningEngine>,
        transactions: Arc<dyn TransactionRepository>,
        progress: InternalSyncProgress,
    ) -> Self {
        Self {
            service,
            engine,
            transactions,
            progress,
        }
    }

    async fn enhance_one(&self, tx: &WalletTransaction) -> Result<WalletTransaction> {
        debug!("Enhancing transaction {}", hex::encode(&tx.txid));
        let fetched = self.service.fetch_transaction(&tx.txid).await?;
        self.engine
            .decrypt_and_store_transaction(&fetched.raw, fetched.mined_height)
            .await?;
        Ok(WalletTransaction {
            mined_height: fetched.mined_height.or(tx.mined_height),
            raw: Some(fetched.raw),
            ..tx.clone()
        })
    }

    /// Enhance every wallet transaction mined in `range`
    ///
    /// Returns the transactions of the range after enhancement.
    pub async fn enhance<F>(
        &self,
        range: CompactBlockRange,
        cancel: &CancelToken,
        mut did_enhance: F,
    ) -> Result<Vec<WalletTransaction>>
    where
        F: FnMut(EnhancementProgress) + Send,
    {
        cancel.check()?;
        debug!("Started enhancing range {:?}", range);

        let transactions = self.transactions.transactions_in(range.clone()).await?;
        if transactions.is_empty() {
            self.progress.set(ProgressKey::LatestEnhancedHeight, *range.end())?;
            debug!("No transactions detected in {:?}", range);
            return Ok(Vec::new());
        }

        for (index, tx) in transactions.iter().enumerate() {
            let mut attempts = 0;
            let enhanced = loop {
                cancel.check()?;
                match self.enhance_one(tx).await {
                    Ok(enhanced) => break enhanced,
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        attempts += 1;
                        error!(
                            "Could not enhance {} (attempt {}/{}): {}",
                            hex::encode(&tx.txid),
                            attempts,
                            MAX_ENHANCE_ATTEMPTS,
                            e
                        );
                        if attempts >= MAX_ENHANCE_ATTEMPTS {
                            return Err(e);
                        }
                    }
                }
            };

            if let Some(mined) = enhanced.mined_height {
                self.progress.set(ProgressKey::LatestEnhancedHeight, mined)?;
            }
            did_enhance(EnhancementProgress {
                total_transactions: transactions.len(),
                enhanced_transactions: index + 1,
                newly_mined: tx.mined_height.is_none() && enhanced.mined_height.is_some(),
                last_found_transaction: enhanced,
                range: range.clone(),
            });
        }

        self.progress.set(ProgressKey::LatestEnhancedHeight, *range.end())?;
        Ok(self
            .transactions
            .transactions_in(range)
            .await
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::FetchedTransaction;
    use crate::sync_progress::DEFAULT_ALIAS;
    use crate::testing::MockWorld;
    use zsync_params::Network;
    use zsync_storage_sqlite::ProgressStore;

    fn wallet_tx(id: u8, height: u64) -> WalletTransaction {
        WalletTransaction {
            txid: vec![id; 32],
            mined_height: Some(height),
            raw: None,
            created_at: 0,
            expiry_height: None,
        }
    }

    fn setup() -> (MockWorld, InternalSyncProgress, BlockEnhancer) {
        let world = MockWorld::new(Network::regtest(), 1_000);
        let progress = InternalSyncProgress::new(DEFAULT_ALIAS, Arc::new(ProgressStore::in_memory().unwrap()));
        let enhancer = BlockEnhancer::new(
            world.service.clone(),
            world.engine.clone(),
            world.transactions.clone(),
            progress.clone(),
        );
        (world, progress, enhancer)
    }

    #[tokio::test]
    async fn test_empty_range_advances_marker() {
        let (_world, progress, enhancer) = setup();
        let found = enhancer.enhance(100..=200, &CancelToken::new(), |_| {}).await.unwrap();
        assert!(found.is_empty());
        assert_eq!(progress.latest_enhanced_height().unwrap(), 200);
    }

    #[tokio::test]
    async fn test_enhances_with_retries() {
        let (world, progress, enhancer) = setup();
        world.transactions.insert(wallet_tx(1, 150));
        world.service.add_transaction(FetchedTransaction {
            txid: vec![1; 32],
            raw: vec![0xde, 0xad],
            mined_height: Some(150),
        });
        world.service.fail_fetches(MAX_ENHANCE_ATTEMPTS - 1);

        let mut reports = Vec::new();
        let found = enhancer
            .enhance(100..=200, &CancelToken::new(), |p| reports.push(p.enhanced_transactions))
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(reports, vec![1]);
        assert_eq!(world.engine.stored_transactions(), vec![vec![0xde, 0xad]]);
        assert_eq!(progress.latest_enhanced_height().unwrap(), 200);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (world, _progress, enhancer) = setup();
        world.transactions.insert(wallet_tx(2, 150));
        world.service.add_transaction(FetchedTransaction {
            txid: vec![2; 32],
            raw: vec![1],
            mined_height: Some(150),
        });
        world.service.fail_fetches(MAX_ENHANCE_ATTEMPTS);

        let result = enhancer.enhance(100..=200, &CancelToken::new(), |_| {}).await;
        assert!(result.is_err());
        assert!(world.engine.stored_transactions().is_empty());
    }
}
