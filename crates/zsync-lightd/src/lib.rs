//! Lightwalletd compact block processor
//!
//! Downloads compact blocks into a local cache, validates and scans them
//! through a wallet scanning engine, enhances found transactions and keeps
//! transparent UTXOs fresh. Sync runs as a state machine of actions driven
//! by [`CompactBlockProcessor`], in linear or spend-before-sync order.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

mod actions;
pub mod block_cache;
pub mod cancel;
pub mod client;
pub mod config;
pub mod context;
pub mod downloader;
pub mod engine;
pub mod enhancer;
pub mod error;
pub mod events;
pub mod latest_blocks;
pub mod logging;
pub mod model;
pub mod processor;
pub mod proto_types;
pub mod ranges;
pub mod sapling_params;
pub mod scanner;
pub mod service;
pub mod sync_progress;
#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;
pub mod utxo;
pub mod validator;

pub use block_cache::{ChainCache, SqliteChainCache};
pub use cancel::CancelToken;
pub use client::{
    LightClient, LightClientConfig, RetryConfig, TlsConfig, DEFAULT_LIGHTD_URL,
};
pub use config::ProcessorConfig;
pub use context::{ActionContext, State};
pub use engine::{
    BlockMeta, ScanSummary, ScanningEngine, TransactionRepository, UtxoStoreOutcome, WalletBalance,
    WalletTransaction,
};
pub use error::{Error, ErrorKind, Result};
pub use events::{EventBus, SyncEvent, SyncStatus};
pub use logging::{init_logging, spawn_event_logger, LogFormat, SyncLogger};
pub use model::{
    BlockHeight, BlockProgress, CompactBlockRange, ScanPriority, ScanRange, SyncAlgorithm,
    SyncControlData, SyncRanges,
};
pub use processor::CompactBlockProcessor;
pub use ranges::{determine_lower_bound, ReorgPolicy};
pub use sapling_params::{HttpParamsFetcher, ParamsFetcher, SaplingParamsConfig};
pub use service::{ChainDataService, LightdInfo, ShieldedProtocol, SubtreeRoot, UnspentTransactionOutput};
pub use utxo::UtxoFetchResult;
