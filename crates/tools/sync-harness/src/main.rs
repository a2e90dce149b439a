//! CLI harness for exercising the compact block processor against a live
//! lightwalletd server
//!
//! - `check-server`: validate the server's chain parameters
//! - `download`: stream a block range into a chain cache and check continuity
//! - `sync`: run the processor with in-memory wallet collaborators

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use zsync_lightd::block_cache::ChainCache;
use zsync_lightd::testing::{MemoryTransactionRepository, MockEngine};
use zsync_lightd::validator::{check_server_info, find_discontinuity};
use zsync_lightd::{
    init_logging, ChainDataService, CompactBlockProcessor, LightClient, LogFormat, ProcessorConfig,
    SqliteChainCache, SyncAlgorithm, SyncEvent, DEFAULT_LIGHTD_URL,
};
use zsync_params::{BranchId, Network, NetworkType};

/// Blocks written to the cache per transaction
const WRITE_BATCH: usize = 100;

#[derive(Parser)]
#[command(name = "sync-harness")]
#[command(about = "Zcash compact block sync testing harness", long_about = None)]
struct Cli {
    /// Emit JSON logs
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Chain {
    Main,
    Test,
}

impl Chain {
    fn network(self) -> Network {
        match self {
            Chain::Main => Network::from_type(NetworkType::Mainnet),
            Chain::Test => Network::from_type(NetworkType::Testnet),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check the server serves the expected chain
    CheckServer {
        /// Lightwalletd endpoint
        #[arg(short, long, default_value = DEFAULT_LIGHTD_URL)]
        endpoint: String,

        /// Expected chain
        #[arg(short, long, value_enum, default_value = "main")]
        chain: Chain,
    },

    /// Stream a block range into a chain cache and validate it
    Download {
        /// Lightwalletd endpoint
        #[arg(short, long, default_value = DEFAULT_LIGHTD_URL)]
        endpoint: String,

        /// First height (defaults to `blocks` below the tip)
        #[arg(short, long)]
        start: Option<u64>,

        /// Number of blocks
        #[arg(short, long, default_value = "1000")]
        blocks: u64,

        /// Cache directory
        #[arg(long, default_value = "./harness-cache")]
        cache_dir: PathBuf,
    },

    /// Sync the last blocks with an in-memory wallet
    Sync {
        /// Lightwalletd endpoint
        #[arg(short, long, default_value = DEFAULT_LIGHTD_URL)]
        endpoint: String,

        /// Expected chain
        #[arg(short, long, value_enum, default_value = "main")]
        chain: Chain,

        /// Blocks below the tip to start from
        #[arg(short, long, default_value = "500")]
        depth: u64,

        /// Data directory for the cache and progress store
        #[arg(long, default_value = "./harness-data")]
        data_dir: PathBuf,

        /// Use spend-before-sync
        #[arg(long)]
        spend_before_sync: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(if cli.json { LogFormat::Json } else { LogFormat::Text });

    match cli.command {
        Commands::CheckServer { endpoint, chain } => run_check_server(endpoint, chain.network()).await,
        Commands::Download {
            endpoint,
            start,
            blocks,
            cache_dir,
        } => run_download(endpoint, start, blocks, cache_dir).await,
        Commands::Sync {
            endpoint,
            chain,
            depth,
            data_dir,
            spend_before_sync,
        } => run_sync(endpoint, chain.network(), depth, data_dir, spend_before_sync).await,
    }
}

fn progress_bar(len: u64) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );
    Ok(pb)
}

async fn run_check_server(endpoint: String, network: Network) -> anyhow::Result<()> {
    info!("Checking {} for {}", endpoint, network.chain_name());
    let client = LightClient::new(&endpoint);
    let server = client.get_info().await.context("get_info")?;
    info!(
        "{} {} at height {} (branch {})",
        server.vendor, server.version, server.block_height, server.consensus_branch_id
    );

    let local_branch = BranchId::for_height(&network, server.block_height);
    check_server_info(&server, &network, local_branch)?;
    info!("Server matches {}", network.name);

    client.close_connection().await;
    Ok(())
}

async fn run_download(endpoint: String, start: Option<u64>, blocks: u64, cache_dir: PathBuf) -> anyhow::Result<()> {
    if blocks == 0 {
        bail!("nothing to download");
    }
    let client = LightClient::new(&endpoint);
    let tip = client.latest_block_height().await.context("latest block height")?;
    let start = start.unwrap_or_else(|| tip.saturating_sub(blocks - 1));
    let end = start.saturating_add(blocks - 1).min(tip);
    let range = start..=end;
    info!("Downloading {:?} from {} into {}", range, endpoint, cache_dir.display());

    let cache = SqliteChainCache::new(cache_dir);
    cache.create()?;
    cache.rewind(start.saturating_sub(1))?;

    let pb = progress_bar(end - start + 1)?;
    let started = Instant::now();
    let (tx, mut rx) = mpsc::channel(WRITE_BATCH);
    let producer = client.block_range(range.clone(), tx);
    let consumer = async {
        let mut batch = Vec::with_capacity(WRITE_BATCH);
        while let Some(block) = rx.recv().await {
            batch.push(block);
            if batch.len() >= WRITE_BATCH {
                cache.write(&batch)?;
                pb.inc(batch.len() as u64);
                batch.clear();
            }
        }
        if !batch.is_empty() {
            cache.write(&batch)?;
            pb.inc(batch.len() as u64);
        }
        Ok::<_, zsync_lightd::Error>(())
    };
    let (streamed, written) = tokio::join!(producer, consumer);
    written?;
    let streamed = streamed?;
    pb.finish_with_message("downloaded");

    let elapsed = started.elapsed();
    info!(
        "Streamed {} blocks in {:.2}s ({:.0} blocks/s)",
        streamed,
        elapsed.as_secs_f64(),
        streamed as f64 / elapsed.as_secs_f64().max(0.001)
    );

    let cached = cache.load_range(range)?;
    if let Some(height) = find_discontinuity(&cached) {
        bail!("cached chain is discontinuous at {}", height);
    }
    info!("Cache holds {} continuous blocks up to {}", cached.len(), cache.latest_height()?);
    Ok(())
}

async fn run_sync(
    endpoint: String,
    network: Network,
    depth: u64,
    data_dir: PathBuf,
    spend_before_sync: bool,
) -> anyhow::Result<()> {
    let client = Arc::new(LightClient::new(&endpoint));
    let tip = client.latest_block_height().await.context("latest block height")?;

    let mut config = ProcessorConfig::for_network(network, "harness");
    config.fs_block_cache_root = data_dir.join("fs_cache");
    config.progress_db_path = data_dir.join("progress.sqlite");
    config.sapling_params = zsync_lightd::SaplingParamsConfig::in_dir(data_dir.join("params"));
    config.wallet_birthday = tip
        .saturating_sub(depth)
        .max(network.sapling_activation_height);
    if spend_before_sync {
        config.sync_algorithm = SyncAlgorithm::SpendBeforeSync;
    }
    let birthday = config.wallet_birthday;
    info!("Syncing {}..={} from {}", birthday, tip, endpoint);

    let engine = Arc::new(MockEngine::new(network));
    let processor = CompactBlockProcessor::new(
        config,
        client,
        engine.clone(),
        Arc::new(MemoryTransactionRepository::new()),
    )?;
    let mut events = processor.events();
    let pb = progress_bar(tip - birthday)?;

    let started = Instant::now();
    processor.start();
    let outcome = loop {
        match events.recv().await {
            Ok(SyncEvent::ProgressUpdated(progress)) => {
                pb.set_position(progress.progress_height.saturating_sub(birthday));
            }
            Ok(SyncEvent::HandledReorg {
                reorg_height,
                rewind_height,
            }) => warn!("Reorg at {}, rewound to {}", reorg_height, rewind_height),
            Ok(SyncEvent::Finished { last_scanned_height }) => break Ok(last_scanned_height),
            Ok(SyncEvent::Failed { kind, message }) => break Err(anyhow::anyhow!("{:?}: {}", kind, message)),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break Err(anyhow::anyhow!("processor went away")),
        }
    };
    processor.stop().await;

    let last_scanned = outcome?;
    pb.finish_with_message("synced");
    info!(
        "Synced to {} in {:.1?} (engine scanned {:?})",
        last_scanned,
        started.elapsed(),
        engine.scanned()
    );
    Ok(())
}
