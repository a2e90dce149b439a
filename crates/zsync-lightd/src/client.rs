//! Lightwalletd gRPC client
//!
//! Provides connection to lightwalletd servers with:
//! - TLS (system roots) for `https://` endpoints
//! - Retry logic with exponential backoff and jitter
//! - Compact block streaming into a bounded channel

use crate::model::{BlockHeight, CompactBlockRange};
use crate::proto_types as proto;
use crate::service::{
    ChainDataService, FetchedTransaction, LightdInfo, SubtreeRoot, SubtreeRootsRequest,
    UnspentTransactionOutput,
};
use crate::{Error, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, error, info, warn};

use proto::compact_tx_streamer_client::CompactTxStreamerClient;
use proto::{BlockId, BlockRange, ChainSpec, Empty, GetAddressUtxosArg, RawTransaction, TxFilter};

/// Default lightwalletd endpoint (mainnet)
pub const DEFAULT_LIGHTD_URL: &str = "https://zec.rocks:443";

/// Retry configuration for network operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retry attempts
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff to wait after the given (1-based) failed attempt
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1).min(32) as i32);
        let millis = (self.initial_backoff.as_millis() as f64 * factor) as u64;
        std::cmp::min(Duration::from_millis(millis), self.max_backoff)
    }
}

/// TLS configuration for gRPC connection
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS
    pub enabled: bool,
    /// Server name for TLS verification (uses endpoint host if None)
    pub server_name: Option<String>,
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct LightClientConfig {
    /// Endpoint URL (e.g., "https://zec.rocks:443")
    pub endpoint: String,
    /// TLS configuration
    pub tls: TlsConfig,
    /// Retry configuration
    pub retry: RetryConfig,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Request timeout
    pub request_timeout: Duration,
    /// Timeout for a whole block range stream
    pub stream_timeout: Duration,
}

impl Default for LightClientConfig {
    fn default() -> Self {
        Self::for_endpoint(DEFAULT_LIGHTD_URL)
    }
}

impl LightClientConfig {
    /// Config for `endpoint`; TLS is inferred from the URL scheme
    pub fn for_endpoint(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            tls: TlsConfig {
                enabled: endpoint.trim_start().starts_with("https://"),
                server_name: None,
            },
            retry: RetryConfig::default(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
            stream_timeout: Duration::from_secs(600),
        }
    }
}

/// Lightwalletd client
pub struct LightClient {
    config: LightClientConfig,
    channel: Arc<Mutex<Option<Channel>>>,
}

pub(crate) fn jitter_duration(duration: Duration) -> Duration {
    let millis = duration.as_millis() as u64;
    if millis == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    let jittered = (millis as f64 * jitter) as u64;
    Duration::from_millis(jittered.max(1))
}

impl LightClient {
    /// Create client for `endpoint` with default settings
    pub fn new(endpoint: &str) -> Self {
        Self::with_config(LightClientConfig::for_endpoint(endpoint))
    }

    /// Create client with custom configuration
    pub fn with_config(config: LightClientConfig) -> Self {
        Self {
            config,
            channel: Arc::new(Mutex::new(None)),
        }
    }

    /// Get current endpoint URL
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Check if client is connected
    pub fn is_connected(&self) -> bool {
        self.channel
            .try_lock()
            .map(|g| g.is_some())
            .unwrap_or(false)
    }

    /// Connect to lightwalletd server with retry
    pub async fn connect(&self) -> Result<()> {
        let mut attempt = 0;

        loop {
            match self.try_connect().await {
                Ok(channel) => {
                    info!("Connected to lightwalletd at {}", self.config.endpoint);
                    *self.channel.lock().await = Some(channel);
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.retry.max_attempts {
                        error!("Failed to connect after {} attempts: {}", attempt, e);
                        return Err(e);
                    }

                    let backoff = self.config.retry.backoff_for(attempt);
                    warn!(
                        "Connection attempt {} failed, retrying in {:?}: {}",
                        attempt, backoff, e
                    );
                    tokio::time::sleep(jitter_duration(backoff)).await;
                }
            }
        }
    }

    /// Disconnect from server
    pub async fn disconnect(&self) {
        *self.channel.lock().await = None;
        info!("Disconnected from lightwalletd");
    }

    async fn try_connect(&self) -> Result<Channel> {
        let endpoint_url = &self.config.endpoint;
        debug!("Connecting to {}", endpoint_url);

        let mut endpoint = Endpoint::from_shared(endpoint_url.to_string()).map_err(|e| {
            Error::Configuration(format!(
                "Invalid endpoint URL format '{}': {}. Expected format: https://host:port",
                endpoint_url, e
            ))
        })?;

        endpoint = endpoint
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout);

        if self.config.tls.enabled {
            let mut tls_config = ClientTlsConfig::new().with_native_roots();
            let server_name = self
                .config
                .tls
                .server_name
                .clone()
                .or_else(|| extract_host(endpoint_url));
            if let Some(host) = server_name {
                debug!("Using TLS server name: {}", host);
                tls_config = tls_config.domain_name(host);
            }
            endpoint = endpoint.tls_config(tls_config).map_err(|e| {
                Error::Configuration(format!("TLS configuration failed: {}", e))
            })?;
        }

        endpoint.connect().await.map_err(|e| {
            error!("Connection failed to {}: {}", endpoint_url, e);
            Error::Connection(format!("Transport connection failed: {}", e))
        })
    }

    async fn get_client(&self) -> Result<CompactTxStreamerClient<Channel>> {
        let mut guard = self.channel.lock().await;
        if guard.is_none() {
            *guard = Some(self.try_connect().await?);
        }
        let channel = guard
            .as_ref()
            .ok_or_else(|| Error::Connection("Not connected".to_string()))?
            .clone();
        Ok(CompactTxStreamerClient::new(channel))
    }

    /// Execute operation with retry logic
    async fn with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T>> + Send,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retryable() || e.is_timeout() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.retry.max_attempts {
                        return Err(e);
                    }

                    let backoff = self.config.retry.backoff_for(attempt);
                    warn!(
                        "Operation failed (attempt {}), retrying in {:?}: {:?}",
                        attempt, backoff, e
                    );
                    tokio::time::sleep(jitter_duration(backoff)).await;
                }
            }
        }
    }
}

impl Clone for LightClient {
    fn clone(&self) -> Self {
        // Clone shares the existing channel to avoid reconnect races.
        Self {
            config: self.config.clone(),
            channel: Arc::clone(&self.channel),
        }
    }
}

#[async_trait]
impl ChainDataService for LightClient {
    async fn get_info(&self) -> Result<LightdInfo> {
        self.with_retry(|| async {
            let mut client = self.get_client().await?;
            let response = client.get_lightd_info(tonic::Request::new(Empty {})).await?;
            Ok(LightdInfo::from(response.into_inner()))
        })
        .await
    }

    async fn latest_block_height(&self) -> Result<BlockHeight> {
        self.with_retry(|| async {
            let mut client = self.get_client().await?;
            let request = tonic::Request::new(ChainSpec {
                network: String::new(),
            });
            let block_id = client.get_latest_block(request).await?.into_inner();

            debug!(
                "Latest block: height={}, hash={}",
                block_id.height,
                hex::encode(&block_id.hash)
            );
            Ok(block_id.height)
        })
        .await
    }

    async fn block_range(
        &self,
        range: CompactBlockRange,
        sink: mpsc::Sender<proto::CompactBlock>,
    ) -> Result<u64> {
        if range.is_empty() {
            return Ok(0);
        }

        let mut client = self.get_client().await?;
        let start_instant = Instant::now();
        let request = tonic::Request::new(BlockRange {
            start: Some(BlockId {
                height: *range.start(),
                hash: Vec::new(),
            }),
            end: Some(BlockId {
                height: *range.end(),
                hash: Vec::new(),
            }),
        });

        debug!("Requesting blocks {}..={}", range.start(), range.end());

        let stream_timeout = self.config.stream_timeout;
        let streamed = tokio::time::timeout(stream_timeout, async move {
            let mut stream = client.get_block_range(request).await?.into_inner();
            let mut sent = 0u64;
            while let Some(block) = stream.message().await? {
                if sink.send(block).await.is_err() {
                    debug!("Block receiver dropped, stopping stream");
                    break;
                }
                sent += 1;
            }
            Ok::<u64, Error>(sent)
        })
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "block stream {}..={} exceeded {:?}",
                range.start(),
                range.end(),
                stream_timeout
            ))
        })??;

        debug!(
            "Streamed {} blocks in {}ms",
            streamed,
            start_instant.elapsed().as_millis()
        );
        Ok(streamed)
    }

    async fn subtree_roots(&self, request: SubtreeRootsRequest) -> Result<Vec<SubtreeRoot>> {
        let mut client = self.get_client().await?;
        let arg = proto::GetSubtreeRootsArg::from(request);
        let stream_timeout = self.config.stream_timeout;

        tokio::time::timeout(stream_timeout, async move {
            let mut stream = client
                .get_subtree_roots(tonic::Request::new(arg))
                .await?
                .into_inner();
            let mut roots = Vec::new();
            while let Some(root) = stream.message().await? {
                roots.push(SubtreeRoot::from(root));
            }
            Ok::<_, Error>(roots)
        })
        .await
        .map_err(|_| Error::Timeout("subtree roots stream".to_string()))?
    }

    async fn fetch_transaction(&self, txid: &[u8]) -> Result<FetchedTransaction> {
        let filter = TxFilter {
            block: None,
            index: 0,
            hash: txid.to_vec(),
        };

        self.with_retry(|| async {
            let mut client = self.get_client().await?;
            let raw_tx = client
                .get_transaction(tonic::Request::new(filter.clone()))
                .await?
                .into_inner();

            debug!(
                "Received full transaction {} ({} bytes)",
                hex::encode(txid),
                raw_tx.data.len()
            );
            Ok(FetchedTransaction {
                txid: txid.to_vec(),
                raw: raw_tx.data,
                // lightwalletd reports u64::MAX / 0 for mempool transactions
                mined_height: match raw_tx.height {
                    0 | u64::MAX => None,
                    h => Some(h),
                },
            })
        })
        .await
    }

    async fn fetch_utxos(
        &self,
        addresses: &[String],
        start_height: BlockHeight,
    ) -> Result<Vec<UnspentTransactionOutput>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }

        let arg = GetAddressUtxosArg {
            addresses: addresses.to_vec(),
            start_height,
            max_entries: 0,
        };

        self.with_retry(|| async {
            let mut client = self.get_client().await?;
            let mut stream = client
                .get_address_utxos_stream(tonic::Request::new(arg.clone()))
                .await?
                .into_inner();
            let mut utxos = Vec::new();
            while let Some(reply) = stream.message().await? {
                utxos.push(UnspentTransactionOutput::from(reply));
            }
            Ok(utxos)
        })
        .await
    }

    async fn submit(&self, raw_tx: &[u8]) -> Result<()> {
        info!("Submitting transaction ({} bytes)", raw_tx.len());

        self.with_retry(|| async {
            let mut client = self.get_client().await?;
            let request = tonic::Request::new(RawTransaction {
                data: raw_tx.to_vec(),
                height: 0,
            });

            let send_response = client.send_transaction(request).await?.into_inner();
            if send_response.error_code != 0 {
                error!(
                    "Transaction submission failed: code={}, message={}",
                    send_response.error_code, send_response.error_message
                );
                return Err(Error::Network(format!(
                    "Submission failed: {} (code {})",
                    send_response.error_message, send_response.error_code
                )));
            }

            info!("Transaction submitted: {}", compute_txid(raw_tx));
            Ok(())
        })
        .await
    }

    async fn close_connection(&self) {
        self.disconnect().await;
    }
}

/// Extract hostname from URL
fn extract_host(url: &str) -> Option<String> {
    let without_proto = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);

    without_proto
        .split(['/', ':'])
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Compute transaction ID from raw v4 transaction bytes
fn compute_txid(raw_tx: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let hash1 = Sha256::digest(raw_tx);
    let hash2 = Sha256::digest(hash1);

    let mut txid_bytes: [u8; 32] = hash2.into();
    txid_bytes.reverse();

    hex::encode(txid_bytes)
}
