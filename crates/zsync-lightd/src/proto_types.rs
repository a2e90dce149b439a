//! Lightwalletd gRPC proto type definitions
//!
//! These types mirror `compact_formats.proto` and `service.proto` of the
//! Zcash lightwalletd `CompactTxStreamer` service. They are written by hand
//! so builds do not require `protoc`.
//!
//! - Service: `cash.z.wallet.sdk.rpc.CompactTxStreamer`
//! - Wire format: Protocol Buffers v3

#![allow(missing_docs)] // Proto fields don't need individual docs

use prost::Message;

/// Compact block format for efficient sync.
/// Contains only the data needed for trial decryption.
#[derive(Clone, PartialEq, Message)]
pub struct CompactBlock {
    #[prost(uint32, tag = "1")]
    pub proto_version: u32,
    #[prost(uint64, tag = "2")]
    pub height: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub prev_hash: Vec<u8>,
    #[prost(uint32, tag = "5")]
    pub time: u32,
    #[prost(bytes = "vec", tag = "6")]
    pub header: Vec<u8>,
    #[prost(message, repeated, tag = "7")]
    pub vtx: Vec<CompactTx>,
    #[prost(message, optional, tag = "8")]
    pub chain_metadata: Option<ChainMetadata>,
}

impl CompactBlock {
    /// Number of Sapling outputs across all transactions
    pub fn sapling_outputs_count(&self) -> u32 {
        self.vtx.iter().map(|tx| tx.outputs.len() as u32).sum()
    }

    /// Number of Orchard actions across all transactions
    pub fn orchard_actions_count(&self) -> u32 {
        self.vtx.iter().map(|tx| tx.actions.len() as u32).sum()
    }
}

/// Note commitment tree sizes at the end of a block.
#[derive(Clone, PartialEq, Message)]
pub struct ChainMetadata {
    #[prost(uint32, tag = "1")]
    pub sapling_commitment_tree_size: u32,
    #[prost(uint32, tag = "2")]
    pub orchard_commitment_tree_size: u32,
}

/// Compact transaction containing only shielded outputs.
#[derive(Clone, PartialEq, Message)]
pub struct CompactTx {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub hash: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub fee: u32,
    #[prost(message, repeated, tag = "4")]
    pub spends: Vec<CompactSaplingSpend>,
    #[prost(message, repeated, tag = "5")]
    pub outputs: Vec<CompactSaplingOutput>,
    #[prost(message, repeated, tag = "6")]
    pub actions: Vec<CompactOrchardAction>,
}

/// Compact Sapling spend (nullifier only).
#[derive(Clone, PartialEq, Message)]
pub struct CompactSaplingSpend {
    #[prost(bytes = "vec", tag = "1")]
    pub nf: Vec<u8>,
}

/// Compact Sapling output for trial decryption.
#[derive(Clone, PartialEq, Message)]
pub struct CompactSaplingOutput {
    #[prost(bytes = "vec", tag = "1")]
    pub cmu: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub ephemeral_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub ciphertext: Vec<u8>,
}

/// Compact Orchard action for trial decryption.
#[derive(Clone, PartialEq, Message)]
pub struct CompactOrchardAction {
    #[prost(bytes = "vec", tag = "1")]
    pub nullifier: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub cmx: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub ephemeral_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub ciphertext: Vec<u8>,
}

/// Block identifier by height and/or hash.
#[derive(Clone, PartialEq, Message)]
pub struct BlockId {
    #[prost(uint64, tag = "1")]
    pub height: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub hash: Vec<u8>,
}

/// Block range request (inclusive on both ends).
#[derive(Clone, PartialEq, Message)]
pub struct BlockRange {
    #[prost(message, optional, tag = "1")]
    pub start: Option<BlockId>,
    #[prost(message, optional, tag = "2")]
    pub end: Option<BlockId>,
}

/// Transaction filter (by block + index, or by hash).
#[derive(Clone, PartialEq, Message)]
pub struct TxFilter {
    #[prost(message, optional, tag = "1")]
    pub block: Option<BlockId>,
    #[prost(uint64, tag = "2")]
    pub index: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub hash: Vec<u8>,
}

/// Empty request.
#[derive(Clone, PartialEq, Message)]
pub struct Empty {}

/// Chain specification (currently unused by servers).
#[derive(Clone, PartialEq, Message)]
pub struct ChainSpec {
    #[prost(string, tag = "1")]
    pub network: String,
}

/// Raw transaction bytes with the height it was mined at (0 if unmined).
#[derive(Clone, PartialEq, Message)]
pub struct RawTransaction {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub height: u64,
}

/// Result of SendTransaction.
#[derive(Clone, PartialEq, Message)]
pub struct SendResponse {
    #[prost(int32, tag = "1")]
    pub error_code: i32,
    #[prost(string, tag = "2")]
    pub error_message: String,
}

/// Lightwalletd server information.
#[derive(Clone, PartialEq, Message)]
pub struct LightdInfo {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(string, tag = "2")]
    pub vendor: String,
    #[prost(bool, tag = "3")]
    pub taddr_support: bool,
    #[prost(string, tag = "4")]
    pub chain_name: String,
    #[prost(uint64, tag = "5")]
    pub sapling_activation_height: u64,
    #[prost(string, tag = "6")]
    pub consensus_branch_id: String,
    #[prost(uint64, tag = "7")]
    pub block_height: u64,
    #[prost(string, tag = "8")]
    pub git_commit: String,
    #[prost(string, tag = "9")]
    pub branch: String,
    #[prost(string, tag = "10")]
    pub build_date: String,
    #[prost(string, tag = "11")]
    pub build_user: String,
    #[prost(uint64, tag = "12")]
    pub estimated_height: u64,
    #[prost(string, tag = "13")]
    pub zcashd_build: String,
    #[prost(string, tag = "14")]
    pub zcashd_subversion: String,
}

/// Request for note commitment subtree roots.
#[derive(Clone, PartialEq, Message)]
pub struct GetSubtreeRootsArg {
    #[prost(uint32, tag = "1")]
    pub start_index: u32,
    /// 0 = Sapling, 1 = Orchard
    #[prost(int32, tag = "2")]
    pub shielded_protocol: i32,
    /// 0 means unlimited
    #[prost(uint32, tag = "3")]
    pub max_entries: u32,
}

/// A completed note commitment subtree.
#[derive(Clone, PartialEq, Message)]
pub struct SubtreeRoot {
    #[prost(bytes = "vec", tag = "2")]
    pub root_hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub completing_block_hash: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub completing_block_height: u64,
}

/// Request for transparent UTXOs of a set of addresses.
#[derive(Clone, PartialEq, Message)]
pub struct GetAddressUtxosArg {
    #[prost(string, repeated, tag = "1")]
    pub addresses: Vec<String>,
    #[prost(uint64, tag = "2")]
    pub start_height: u64,
    /// 0 means unlimited
    #[prost(uint32, tag = "3")]
    pub max_entries: u32,
}

/// A single transparent UTXO.
#[derive(Clone, PartialEq, Message)]
pub struct GetAddressUtxosReply {
    #[prost(bytes = "vec", tag = "1")]
    pub txid: Vec<u8>,
    #[prost(int32, tag = "2")]
    pub index: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub script: Vec<u8>,
    #[prost(int64, tag = "4")]
    pub value_zat: i64,
    #[prost(uint64, tag = "5")]
    pub height: u64,
    #[prost(string, tag = "6")]
    pub address: String,
}

// ============================================================================
// gRPC Client Implementation
// ============================================================================

/// Generated-equivalent client for CompactTxStreamer service.
pub mod compact_tx_streamer_client {
    #![allow(unused_variables, dead_code, clippy::wildcard_imports, clippy::let_unit_value)]

    use super::*;
    use tonic::codegen::http::Uri;
    use tonic::codegen::*;

    const SERVICE: &str = "cash.z.wallet.sdk.rpc.CompactTxStreamer";

    /// CompactTxStreamer gRPC client.
    #[derive(Debug, Clone)]
    pub struct CompactTxStreamerClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl CompactTxStreamerClient<tonic::transport::Channel> {
        /// Create a new client from a channel.
        pub fn new(channel: tonic::transport::Channel) -> Self {
            let inner = tonic::client::Grpc::new(channel);
            Self { inner }
        }
    }

    impl<T> CompactTxStreamerClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        /// Create client with a custom transport.
        pub fn with_inner(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        /// Create client with origin URI.
        pub fn with_origin(inner: T, origin: Uri) -> Self {
            let inner = tonic::client::Grpc::with_origin(inner, origin);
            Self { inner }
        }

        async fn ready(&mut self) -> std::result::Result<(), tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })
        }

        fn request<M>(
            request: impl tonic::IntoRequest<M>,
            method: &'static str,
        ) -> tonic::Request<M> {
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new(SERVICE, method));
            req
        }

        /// Get the latest block ID (height + hash).
        pub async fn get_latest_block(
            &mut self,
            request: impl tonic::IntoRequest<ChainSpec>,
        ) -> std::result::Result<tonic::Response<BlockId>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetLatestBlock",
            );
            let req = Self::request(request, "GetLatestBlock");
            self.inner.unary(req, path, codec).await
        }

        /// Stream compact blocks in a range (inclusive on both ends).
        pub async fn get_block_range(
            &mut self,
            request: impl tonic::IntoRequest<BlockRange>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<CompactBlock>>,
            tonic::Status,
        > {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetBlockRange",
            );
            let req = Self::request(request, "GetBlockRange");
            self.inner.server_streaming(req, path, codec).await
        }

        /// Get full transaction by hash or by block + index.
        pub async fn get_transaction(
            &mut self,
            request: impl tonic::IntoRequest<TxFilter>,
        ) -> std::result::Result<tonic::Response<RawTransaction>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetTransaction",
            );
            let req = Self::request(request, "GetTransaction");
            self.inner.unary(req, path, codec).await
        }

        /// Submit a raw transaction to the network.
        pub async fn send_transaction(
            &mut self,
            request: impl tonic::IntoRequest<RawTransaction>,
        ) -> std::result::Result<tonic::Response<SendResponse>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/SendTransaction",
            );
            let req = Self::request(request, "SendTransaction");
            self.inner.unary(req, path, codec).await
        }

        /// Get server information.
        pub async fn get_lightd_info(
            &mut self,
            request: impl tonic::IntoRequest<Empty>,
        ) -> std::result::Result<tonic::Response<LightdInfo>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetLightdInfo",
            );
            let req = Self::request(request, "GetLightdInfo");
            self.inner.unary(req, path, codec).await
        }

        /// Stream note commitment subtree roots.
        pub async fn get_subtree_roots(
            &mut self,
            request: impl tonic::IntoRequest<GetSubtreeRootsArg>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<SubtreeRoot>>,
            tonic::Status,
        > {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetSubtreeRoots",
            );
            let req = Self::request(request, "GetSubtreeRoots");
            self.inner.server_streaming(req, path, codec).await
        }

        /// Stream transparent UTXOs for a set of addresses.
        pub async fn get_address_utxos_stream(
            &mut self,
            request: impl tonic::IntoRequest<GetAddressUtxosArg>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<GetAddressUtxosReply>>,
            tonic::Status,
        > {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetAddressUtxosStream",
            );
            let req = Self::request(request, "GetAddressUtxosStream");
            self.inner.server_streaming(req, path, codec).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_block_encoding() {
        let block = CompactBlock {
            proto_version: 1,
            height: 1000,
            hash: vec![0u8; 32],
            prev_hash: vec![0u8; 32],
            time: 1234567890,
            header: vec![],
            vtx: vec![],
            chain_metadata: Some(ChainMetadata {
                sapling_commitment_tree_size: 42,
                orchard_commitment_tree_size: 7,
            }),
        };

        let encoded = block.encode_to_vec();
        let decoded = CompactBlock::decode(&encoded[..]).unwrap();

        assert_eq!(block, decoded);
    }

    #[test]
    fn test_output_counts() {
        let output = CompactSaplingOutput {
            cmu: vec![1; 32],
            ephemeral_key: vec![2; 32],
            ciphertext: vec![3; 52],
        };
        let tx = CompactTx {
            index: 0,
            hash: vec![0; 32],
            fee: 0,
            spends: vec![],
            outputs: vec![output.clone(), output],
            actions: vec![CompactOrchardAction::default()],
        };
        let block = CompactBlock {
            vtx: vec![tx.clone(), tx],
            ..Default::default()
        };

        assert_eq!(block.sapling_outputs_count(), 4);
        assert_eq!(block.orchard_actions_count(), 2);
    }

    #[test]
    fn test_subtree_root_skips_tag_one() {
        let root = SubtreeRoot {
            root_hash: vec![9; 32],
            completing_block_hash: vec![8; 32],
            completing_block_height: 2_000_000,
        };
        let decoded = SubtreeRoot::decode(&root.encode_to_vec()[..]).unwrap();
        assert_eq!(decoded.completing_block_height, 2_000_000);
        assert_eq!(decoded.root_hash, vec![9; 32]);
    }
}
