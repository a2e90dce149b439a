//! Remote chain-data service interface

use crate::model::{BlockHeight, CompactBlockRange};
use crate::proto_types as proto;
use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Lightwalletd server information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightdInfo {
    /// Server version
    pub version: String,
    /// Server vendor
    pub vendor: String,
    /// Whether transparent address queries are supported
    pub taddr_support: bool,
    /// Chain name (`main` or `test`)
    pub chain_name: String,
    /// Sapling activation height
    pub sapling_activation_height: u64,
    /// Consensus branch ID (hex) at the server's tip
    pub consensus_branch_id: String,
    /// Server chain tip
    pub block_height: u64,
    /// Estimated network height
    pub estimated_height: u64,
}

impl From<proto::LightdInfo> for LightdInfo {
    fn from(pb: proto::LightdInfo) -> Self {
        Self {
            version: pb.version,
            vendor: pb.vendor,
            taddr_support: pb.taddr_support,
            chain_name: pb.chain_name,
            sapling_activation_height: pb.sapling_activation_height,
            consensus_branch_id: pb.consensus_branch_id,
            block_height: pb.block_height,
            estimated_height: pb.estimated_height,
        }
    }
}

/// Shielded protocol selector for subtree roots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShieldedProtocol {
    /// Sapling
    Sapling,
    /// Orchard
    Orchard,
}

impl ShieldedProtocol {
    fn code(&self) -> i32 {
        match self {
            Self::Sapling => 0,
            Self::Orchard => 1,
        }
    }
}

/// Subtree roots request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtreeRootsRequest {
    /// First subtree index
    pub start_index: u32,
    /// Protocol
    pub protocol: ShieldedProtocol,
    /// Maximum entries (0 = unlimited)
    pub max_entries: u32,
}

impl From<SubtreeRootsRequest> for proto::GetSubtreeRootsArg {
    fn from(req: SubtreeRootsRequest) -> Self {
        Self {
            start_index: req.start_index,
            shielded_protocol: req.protocol.code(),
            max_entries: req.max_entries,
        }
    }
}

/// A completed note commitment subtree root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtreeRoot {
    /// Root hash
    pub root_hash: Vec<u8>,
    /// Hash of the block that completed the subtree
    pub completing_block_hash: Vec<u8>,
    /// Height of the block that completed the subtree
    pub completing_block_height: BlockHeight,
}

impl From<proto::SubtreeRoot> for SubtreeRoot {
    fn from(pb: proto::SubtreeRoot) -> Self {
        Self {
            root_hash: pb.root_hash,
            completing_block_hash: pb.completing_block_hash,
            completing_block_height: pb.completing_block_height,
        }
    }
}

/// An unspent transparent output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentTransactionOutput {
    /// Transaction ID (internal byte order)
    pub txid: Vec<u8>,
    /// Output index
    pub index: i32,
    /// Locking script
    pub script: Vec<u8>,
    /// Value in zatoshis
    pub value_zat: i64,
    /// Mined height
    pub height: BlockHeight,
    /// Owning address
    pub address: String,
}

impl From<proto::GetAddressUtxosReply> for UnspentTransactionOutput {
    fn from(pb: proto::GetAddressUtxosReply) -> Self {
        Self {
            txid: pb.txid,
            index: pb.index,
            script: pb.script,
            value_zat: pb.value_zat,
            height: pb.height,
            address: pb.address,
        }
    }
}

/// A full transaction fetched from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedTransaction {
    /// Transaction ID (internal byte order)
    pub txid: Vec<u8>,
    /// Raw transaction bytes
    pub raw: Vec<u8>,
    /// Mined height, `None` when still in the mempool
    pub mined_height: Option<BlockHeight>,
}

/// Remote chain-data service (lightwalletd)
#[async_trait]
pub trait ChainDataService: Send + Sync {
    /// Server information
    async fn get_info(&self) -> Result<LightdInfo>;

    /// Current chain tip
    async fn latest_block_height(&self) -> Result<BlockHeight>;

    /// Stream compact blocks for `range` into `sink`, in height order
    ///
    /// Returns the number of blocks sent. Stops early without error when the
    /// receiving side is dropped.
    async fn block_range(
        &self,
        range: CompactBlockRange,
        sink: mpsc::Sender<proto::CompactBlock>,
    ) -> Result<u64>;

    /// Note commitment subtree roots
    async fn subtree_roots(&self, request: SubtreeRootsRequest) -> Result<Vec<SubtreeRoot>>;

    /// Full transaction by ID
    async fn fetch_transaction(&self, txid: &[u8]) -> Result<FetchedTransaction>;

    /// Transparent UTXOs for `addresses` mined at or after `start_height`
    async fn fetch_utxos(
        &self,
        addresses: &[String],
        start_height: BlockHeight,
    ) -> Result<Vec<UnspentTransactionOutput>>;

    /// Submit a raw transaction
    async fn submit(&self, raw_tx: &[u8]) -> Result<()>;

    /// Drop any open connection
    async fn close_connection(&self);
}
