//! In-memory collaborators for tests and offline harness runs
//!
//! `MockChainService` serves a synthetic chain whose block hashes are the
//! little-endian height bytes, `MockEngine` tracks scan state from the block
//! metadata it is fed, and `MemoryTransactionRepository` holds wallet
//! transactions in a vector.

#![allow(missing_docs)]

use crate::config::ProcessorConfig;
use crate::engine::{
    BlockMeta, ScanSummary, ScanningEngine, TransactionRepository, UtxoStoreOutcome, WalletBalance,
    WalletTransaction,
};
use crate::model::{BlockHeight, CompactBlockRange, ScanRange};
use crate::proto_types as proto;
use crate::sapling_params::{ParamsFetcher, SaplingParamsConfig};
use crate::service::{
    ChainDataService, FetchedTransaction, LightdInfo, ShieldedProtocol, SubtreeRoot,
    SubtreeRootsRequest, UnspentTransactionOutput,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use zsync_params::{BranchId, Network};

/// Synthetic compact block at `height`
pub fn synthetic_block(height: BlockHeight) -> proto::CompactBlock {
    proto::CompactBlock {
        proto_version: 1,
        height,
        hash: height.to_le_bytes().to_vec(),
        prev_hash: height.saturating_sub(1).to_le_bytes().to_vec(),
        time: 1_600_000_000u32.wrapping_add(height as u32),
        ..Default::default()
    }
}

/// Lightwalletd stand-in serving synthetic blocks
pub struct MockChainService {
    network: Network,
    tip: Mutex<BlockHeight>,
    info_override: Mutex<Option<LightdInfo>>,
    subtree_roots: Mutex<Result<Vec<SubtreeRoot>>>,
    orchard_roots: Mutex<Vec<SubtreeRoot>>,
    utxos: Mutex<Vec<UnspentTransactionOutput>>,
    transactions: Mutex<BTreeMap<Vec<u8>, FetchedTransaction>>,
    submitted: Mutex<Vec<Vec<u8>>>,
    failing_block_ranges: AtomicU32,
    failing_fetches: AtomicU32,
    pub block_range_calls: AtomicUsize,
    pub info_calls: AtomicUsize,
    pub utxo_calls: AtomicUsize,
}

impl MockChainService {
    pub fn new(network: Network, tip: BlockHeight) -> Self {
        Self {
            network,
            tip: Mutex::new(tip),
            info_override: Mutex::new(None),
            subtree_roots: Mutex::new(Ok(Vec::new())),
            orchard_roots: Mutex::new(Vec::new()),
            utxos: Mutex::new(Vec::new()),
            transactions: Mutex::new(BTreeMap::new()),
            submitted: Mutex::new(Vec::new()),
            failing_block_ranges: AtomicU32::new(0),
            failing_fetches: AtomicU32::new(0),
            block_range_calls: AtomicUsize::new(0),
            info_calls: AtomicUsize::new(0),
            utxo_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_tip(&self, tip: BlockHeight) {
        *self.tip.lock() = tip;
    }

    pub fn set_info(&self, info: LightdInfo) {
        *self.info_override.lock() = Some(info);
    }

    pub fn set_subtree_roots(&self, roots: Result<Vec<SubtreeRoot>>) {
        *self.subtree_roots.lock() = roots;
    }

    pub fn set_orchard_subtree_roots(&self, roots: Vec<SubtreeRoot>) {
        *self.orchard_roots.lock() = roots;
    }

    pub fn add_utxo(&self, utxo: UnspentTransactionOutput) {
        self.utxos.lock().push(utxo);
    }

    pub fn add_transaction(&self, tx: FetchedTransaction) {
        self.transactions.lock().insert(tx.txid.clone(), tx);
    }

    /// Fail the next `n` block range streams with a connection error
    pub fn fail_block_ranges(&self, n: u32) {
        self.failing_block_ranges.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` transaction fetches with a connection error
    pub fn fail_fetches(&self, n: u32) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<Vec<u8>> {
        self.submitted.lock().clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Info a correctly configured server for this network would report
    pub fn default_info(network: &Network, tip: BlockHeight) -> LightdInfo {
        LightdInfo {
            version: "v0.4.17".to_string(),
            vendor: "mock".to_string(),
            taddr_support: true,
            chain_name: network.chain_name().to_string(),
            sapling_activation_height: network.sapling_activation_height,
            consensus_branch_id: BranchId::for_height(network, tip).to_hex(),
            block_height: tip,
            estimated_height: tip,
        }
    }
}

#[async_trait]
impl ChainDataService for MockChainService {
    async fn get_info(&self) -> Result<LightdInfo> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        let tip = *self.tip.lock();
        Ok(self
            .info_override
            .lock()
            .clone()
            .unwrap_or_else(|| Self::default_info(&self.network, tip)))
    }

    async fn latest_block_height(&self) -> Result<BlockHeight> {
        Ok(*self.tip.lock())
    }

    async fn block_range(
        &self,
        range: CompactBlockRange,
        sink: mpsc::Sender<proto::CompactBlock>,
    ) -> Result<u64> {
        self.block_range_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_block_ranges) {
            return Err(Error::Connection("mock stream reset".to_string()));
        }
        let tip = *self.tip.lock();
        let mut sent = 0;
        for height in range {
            if height > tip {
                break;
            }
            if sink.send(synthetic_block(height)).await.is_err() {
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }

    async fn subtree_roots(&self, request: SubtreeRootsRequest) -> Result<Vec<SubtreeRoot>> {
        if request.protocol == ShieldedProtocol::Orchard {
            return Ok(self.orchard_roots.lock().clone());
        }
        match &*self.subtree_roots.lock() {
            Ok(roots) => Ok(roots.clone()),
            Err(Error::Timeout(msg)) => Err(Error::Timeout(msg.clone())),
            Err(e) => Err(Error::Network(e.to_string())),
        }
    }

    async fn fetch_transaction(&self, txid: &[u8]) -> Result<FetchedTransaction> {
        if Self::take_failure(&self.failing_fetches) {
            return Err(Error::Connection("mock fetch failed".to_string()));
        }
        self.transactions
            .lock()
            .get(txid)
            .cloned()
            .ok_or_else(|| Error::Network(format!("transaction {} not found", hex::encode(txid))))
    }

    async fn fetch_utxos(
        &self,
        addresses: &[String],
        start_height: BlockHeight,
    ) -> Result<Vec<UnspentTransactionOutput>> {
        self.utxo_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .utxos
            .lock()
            .iter()
            .filter(|u| u.height >= start_height && addresses.contains(&u.address))
            .cloned()
            .collect())
    }

    async fn submit(&self, raw_tx: &[u8]) -> Result<()> {
        self.submitted.lock().push(raw_tx.to_vec());
        Ok(())
    }

    async fn close_connection(&self) {}
}

#[derive(Default)]
struct EngineState {
    metadata_tip: BlockHeight,
    scanned: Option<BlockHeight>,
    invalid_chain_at: Option<BlockHeight>,
    suggested: Vec<ScanRange>,
    first_unenhanced: Option<BlockHeight>,
    balance: WalletBalance,
    receivers: Vec<String>,
    stored_utxos: HashSet<(Vec<u8>, i32)>,
    stored_transactions: Vec<Vec<u8>>,
    rewinds: Vec<BlockHeight>,
    chain_tips: Vec<BlockHeight>,
    sapling_roots: Vec<(u64, usize)>,
    orchard_roots: Vec<(u64, usize)>,
    metadata_db_inits: usize,
    scan_calls: Vec<(BlockHeight, u32)>,
    fail_root_puts: bool,
}

/// Scanning engine stand-in
pub struct MockEngine {
    network: Network,
    state: Mutex<EngineState>,
}

impl MockEngine {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn set_scanned(&self, height: Option<BlockHeight>) {
        self.state.lock().scanned = height;
    }

    pub fn scanned(&self) -> Option<BlockHeight> {
        self.state.lock().scanned
    }

    /// Report a chain discontinuity at `height` on the next validation
    pub fn invalidate_chain_at(&self, height: BlockHeight) {
        self.state.lock().invalid_chain_at = Some(height);
    }

    pub fn set_suggested_ranges(&self, ranges: Vec<ScanRange>) {
        self.state.lock().suggested = ranges;
    }

    pub fn set_first_unenhanced(&self, height: Option<BlockHeight>) {
        self.state.lock().first_unenhanced = height;
    }

    pub fn set_balance(&self, balance: WalletBalance) {
        self.state.lock().balance = balance;
    }

    pub fn set_receivers(&self, receivers: Vec<String>) {
        self.state.lock().receivers = receivers;
    }

    pub fn fail_root_puts(&self) {
        self.state.lock().fail_root_puts = true;
    }

    pub fn rewinds(&self) -> Vec<BlockHeight> {
        self.state.lock().rewinds.clone()
    }

    pub fn chain_tips(&self) -> Vec<BlockHeight> {
        self.state.lock().chain_tips.clone()
    }

    pub fn sapling_root_puts(&self) -> Vec<(u64, usize)> {
        self.state.lock().sapling_roots.clone()
    }

    pub fn orchard_root_puts(&self) -> Vec<(u64, usize)> {
        self.state.lock().orchard_roots.clone()
    }

    pub fn metadata_db_inits(&self) -> usize {
        self.state.lock().metadata_db_inits
    }

    pub fn scan_calls(&self) -> Vec<(BlockHeight, u32)> {
        self.state.lock().scan_calls.clone()
    }

    pub fn stored_transactions(&self) -> Vec<Vec<u8>> {
        self.state.lock().stored_transactions.clone()
    }

    pub fn metadata_tip(&self) -> BlockHeight {
        self.state.lock().metadata_tip
    }
}

#[async_trait]
impl ScanningEngine for MockEngine {
    async fn init_block_metadata_db(&self) -> Result<()> {
        self.state.lock().metadata_db_inits += 1;
        Ok(())
    }

    async fn write_blocks_metadata(&self, blocks: &[BlockMeta]) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(last) = blocks.last() {
            state.metadata_tip = state.metadata_tip.max(last.height);
        }
        Ok(())
    }

    async fn scan_blocks(&self, from: BlockHeight, limit: u32) -> Result<ScanSummary> {
        let mut state = self.state.lock();
        state.scan_calls.push((from, limit));
        let end = from
            .saturating_add(u64::from(limit.max(1)))
            .saturating_sub(1)
            .min(state.metadata_tip);
        if end < from {
            return Ok(ScanSummary::default());
        }
        state.scanned = Some(state.scanned.map_or(end, |s| s.max(end)));
        for suggested in state.suggested.iter_mut() {
            if (from..=end).contains(&suggested.range.start) {
                suggested.range.start = suggested.range.end.min(end + 1);
            }
        }
        state.suggested.retain(|suggested| !suggested.is_empty());
        Ok(ScanSummary {
            scanned_range: Some(from..=end),
            ..Default::default()
        })
    }

    async fn validate_combined_chain(&self, _limit: u32) -> Result<()> {
        match self.state.lock().invalid_chain_at.take() {
            Some(height) => Err(Error::InvalidChain(height)),
            None => Ok(()),
        }
    }

    async fn update_chain_tip(&self, height: BlockHeight) -> Result<()> {
        self.state.lock().chain_tips.push(height);
        Ok(())
    }

    async fn suggest_scan_ranges(&self) -> Result<Vec<ScanRange>> {
        Ok(self.state.lock().suggested.clone())
    }

    async fn put_sapling_subtree_roots(&self, start_index: u64, roots: &[SubtreeRoot]) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_root_puts {
            return Err(Error::Engine("mock root insertion failure".to_string()));
        }
        state.sapling_roots.push((start_index, roots.len()));
        Ok(())
    }

    async fn put_orchard_subtree_roots(&self, start_index: u64, roots: &[SubtreeRoot]) -> Result<()> {
        self.state.lock().orchard_roots.push((start_index, roots.len()));
        Ok(())
    }

    async fn rewind_to_height(&self, height: BlockHeight) -> Result<()> {
        let mut state = self.state.lock();
        state.rewinds.push(height);
        state.scanned = state.scanned.map(|s| s.min(height));
        state.metadata_tip = state.metadata_tip.min(height);
        Ok(())
    }

    async fn get_nearest_rewind_height(&self, height: BlockHeight) -> Result<BlockHeight> {
        Ok(height)
    }

    async fn consensus_branch_id_for(&self, height: BlockHeight) -> Result<BranchId> {
        Ok(BranchId::for_height(&self.network, height))
    }

    async fn latest_scanned_height(&self) -> Result<Option<BlockHeight>> {
        Ok(self.state.lock().scanned)
    }

    async fn fully_scanned_height(&self) -> Result<Option<BlockHeight>> {
        Ok(self.state.lock().scanned)
    }

    async fn first_unenhanced_height(&self) -> Result<Option<BlockHeight>> {
        Ok(self.state.lock().first_unenhanced)
    }

    async fn decrypt_and_store_transaction(&self, raw: &[u8], _mined_height: Option<BlockHeight>) -> Result<()> {
        self.state.lock().stored_transactions.push(raw.to_vec());
        Ok(())
    }

    async fn list_transparent_receivers(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().receivers.clone())
    }

    async fn put_unspent_transparent_output(&self, utxo: &UnspentTransactionOutput) -> Result<UtxoStoreOutcome> {
        let inserted = self
            .state
            .lock()
            .stored_utxos
            .insert((utxo.txid.clone(), utxo.index));
        Ok(if inserted {
            UtxoStoreOutcome::Inserted
        } else {
            UtxoStoreOutcome::Skipped
        })
    }

    async fn balance(&self) -> Result<WalletBalance> {
        Ok(self.state.lock().balance)
    }
}

/// Wallet transactions held in memory
#[derive(Default)]
pub struct MemoryTransactionRepository {
    transactions: Mutex<Vec<WalletTransaction>>,
}

impl MemoryTransactionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tx: WalletTransaction) {
        self.transactions.lock().push(tx);
    }

    pub fn all(&self) -> Vec<WalletTransaction> {
        self.transactions.lock().clone()
    }
}

#[async_trait]
impl TransactionRepository for MemoryTransactionRepository {
    async fn transactions_in(&self, range: CompactBlockRange) -> Result<Vec<WalletTransaction>> {
        Ok(self
            .transactions
            .lock()
            .iter()
            .filter(|tx| tx.mined_height.is_some_and(|h| range.contains(&h)))
            .cloned()
            .collect())
    }

    async fn find_for_resubmission(&self, latest_height: BlockHeight) -> Result<Vec<WalletTransaction>> {
        Ok(self
            .transactions
            .lock()
            .iter()
            .filter(|tx| {
                tx.mined_height.is_none()
                    && tx.raw.is_some()
                    && tx.expiry_height.map_or(true, |e| e == 0 || e > latest_height)
            })
            .cloned()
            .collect())
    }

    async fn mark_submitted(&self, txid: &[u8], at: i64) -> Result<()> {
        for tx in self.transactions.lock().iter_mut() {
            if tx.txid == txid {
                tx.created_at = at;
            }
        }
        Ok(())
    }
}

/// Shared handles to a complete set of in-memory collaborators
#[derive(Clone)]
pub struct MockWorld {
    pub network: Network,
    pub service: Arc<MockChainService>,
    pub engine: Arc<MockEngine>,
    pub transactions: Arc<MemoryTransactionRepository>,
}

impl MockWorld {
    pub fn new(network: Network, tip: BlockHeight) -> Self {
        Self {
            network,
            service: Arc::new(MockChainService::new(network, tip)),
            engine: Arc::new(MockEngine::new(network)),
            transactions: Arc::new(MemoryTransactionRepository::new()),
        }
    }
}

/// Parameter fetcher writing a fixed body instead of downloading
#[derive(Default)]
pub struct MockParamsFetcher {
    requested: Mutex<Vec<String>>,
}

impl MockParamsFetcher {
    pub const BODY: &'static [u8] = b"params";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl ParamsFetcher for MockParamsFetcher {
    async fn download(&self, url: &str, dest: &Path) -> Result<String> {
        self.requested.lock().push(url.to_string());
        tokio::fs::write(dest, Self::BODY).await?;
        Ok(hex::encode(Sha256::digest(Self::BODY)))
    }
}

/// Configuration keeping every file under `dir`, with fast retries
pub fn test_config(network: Network, dir: &Path) -> ProcessorConfig {
    let mut config = ProcessorConfig::for_network(network, crate::sync_progress::DEFAULT_ALIAS);
    config.fs_block_cache_root = dir.join("fs_cache");
    config.progress_db_path = dir.join("progress.sqlite");
    config.sapling_params = SaplingParamsConfig {
        spend_sha256: None,
        output_sha256: None,
        ..SaplingParamsConfig::in_dir(dir.join("params"))
    };
    config.batch_size = 10;
    config.retries = 3;
    config.max_backoff = Duration::from_millis(20);
    config.poll_interval = Duration::from_millis(50);
    config
}
