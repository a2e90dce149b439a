//! Interfaces to the wallet-side collaborators: the scanning engine (trial
//! decryption, note commitment trees, wallet database) and the transaction
//! repository.

use crate::model::{BlockHeight, CompactBlockRange, ScanRange};
use crate::proto_types as proto;
use crate::service::{SubtreeRoot, UnspentTransactionOutput};
use crate::Result;
use async_trait::async_trait;
use zsync_params::BranchId;

/// Per-block metadata written into the engine's block metadata store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    /// Block height
    pub height: BlockHeight,
    /// Block hash
    pub hash: Vec<u8>,
    /// Block time (unix seconds)
    pub time: u32,
    /// Sapling outputs in the block
    pub sapling_outputs_count: u32,
    /// Orchard actions in the block
    pub orchard_actions_count: u32,
}

impl From<&proto::CompactBlock> for BlockMeta {
    fn from(block: &proto::CompactBlock) -> Self {
        Self {
            height: block.height,
            hash: block.hash.clone(),
            time: block.time,
            sapling_outputs_count: block.sapling_outputs_count(),
            orchard_actions_count: block.orchard_actions_count(),
        }
    }
}

/// Summary of one `scan_blocks` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Heights actually scanned
    pub scanned_range: Option<CompactBlockRange>,
    /// Sapling notes received
    pub received_sapling_note_count: u64,
    /// Orchard notes received
    pub received_orchard_note_count: u64,
}

/// Shielded balance snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalletBalance {
    /// Spendable + pending shielded value in zatoshis
    pub total_shielded: u64,
    /// Spendable shielded value in zatoshis
    pub verified_shielded: u64,
}

/// A wallet transaction as the enhancer and resubmission see it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletTransaction {
    /// Transaction ID (internal byte order)
    pub txid: Vec<u8>,
    /// Mined height, `None` while unmined
    pub mined_height: Option<BlockHeight>,
    /// Raw bytes, for transactions the wallet created
    pub raw: Option<Vec<u8>>,
    /// Unix seconds when the transaction was created or last submitted
    pub created_at: i64,
    /// Expiry height, if any
    pub expiry_height: Option<BlockHeight>,
}

/// Outcome of storing a fetched UTXO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtxoStoreOutcome {
    /// Newly inserted
    Inserted,
    /// Already known or not relevant
    Skipped,
}

/// Scanning engine (note decryption, trees and wallet database)
#[async_trait]
pub trait ScanningEngine: Send + Sync {
    /// Create the block metadata database if needed
    async fn init_block_metadata_db(&self) -> Result<()>;

    /// Record metadata for freshly cached blocks
    async fn write_blocks_metadata(&self, blocks: &[BlockMeta]) -> Result<()>;

    /// Scan up to `limit` cached blocks starting at `from`
    async fn scan_blocks(&self, from: BlockHeight, limit: u32) -> Result<ScanSummary>;

    /// Validate the cached chain against scanned state
    ///
    /// Returns `Error::InvalidChain(height)` when a discontinuity is found.
    async fn validate_combined_chain(&self, limit: u32) -> Result<()>;

    /// Inform the engine of the current chain tip
    async fn update_chain_tip(&self, height: BlockHeight) -> Result<()>;

    /// Prioritized ranges still to be scanned, highest priority first
    async fn suggest_scan_ranges(&self) -> Result<Vec<ScanRange>>;

    /// Insert Sapling subtree roots starting at `start_index`
    async fn put_sapling_subtree_roots(&self, start_index: u64, roots: &[SubtreeRoot]) -> Result<()>;

    /// Insert Orchard subtree roots starting at `start_index`
    async fn put_orchard_subtree_roots(&self, start_index: u64, roots: &[SubtreeRoot]) -> Result<()>;

    /// Rewind scanned state to `height`
    async fn rewind_to_height(&self, height: BlockHeight) -> Result<()>;

    /// Nearest height at or below `height` the engine can rewind to
    async fn get_nearest_rewind_height(&self, height: BlockHeight) -> Result<BlockHeight>;

    /// Consensus branch ID at `height`
    async fn consensus_branch_id_for(&self, height: BlockHeight) -> Result<BranchId>;

    /// Latest scanned height, `None` for a wallet that has scanned nothing
    async fn latest_scanned_height(&self) -> Result<Option<BlockHeight>>;

    /// Fully scanned height in spend-before-sync mode
    async fn fully_scanned_height(&self) -> Result<Option<BlockHeight>>;

    /// First height holding transactions that still need enhancing
    async fn first_unenhanced_height(&self) -> Result<Option<BlockHeight>>;

    /// Store a fetched full transaction, decrypting memos
    async fn decrypt_and_store_transaction(&self, raw: &[u8], mined_height: Option<BlockHeight>) -> Result<()>;

    /// Transparent receivers the wallet watches
    async fn list_transparent_receivers(&self) -> Result<Vec<String>>;

    /// Store a fetched UTXO
    async fn put_unspent_transparent_output(&self, utxo: &UnspentTransactionOutput) -> Result<UtxoStoreOutcome>;

    /// Shielded balance across accounts
    async fn balance(&self) -> Result<WalletBalance>;
}

/// Read access to wallet transactions
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Transactions mined within `range`
    async fn transactions_in(&self, range: CompactBlockRange) -> Result<Vec<WalletTransaction>>;

    /// Unmined, unexpired wallet-created transactions as of `latest_height`
    async fn find_for_resubmission(&self, latest_height: BlockHeight) -> Result<Vec<WalletTransaction>>;

    /// Record a resubmission attempt
    async fn mark_submitted(&self, txid: &[u8], at: i64) -> Result<()>;
}
