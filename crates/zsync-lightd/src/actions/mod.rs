//! Sync actions: one handler per [`State`], dispatched by `run_action`.
//!
//! Every handler takes the context by value, performs its I/O through the
//! collaborators in [`ActionEnv`], and returns the context with the next
//! state set.

mod chain_tip;
mod checks;
mod compute;
mod download;
mod enhance;
mod migrate;
mod rewind;
mod scan;
mod subtree_roots;
mod suggested_ranges;
mod utxos;
mod validate_server;

use crate::block_cache::ChainCache;
use crate::cancel::CancelToken;
use crate::config::ProcessorConfig;
use crate::context::{ActionContext, State};
use crate::downloader::{BlockDownloader, StreamingBlockDownloader};
use crate::engine::{ScanningEngine, TransactionRepository};
use crate::enhancer::BlockEnhancer;
use crate::events::EventBus;
use crate::latest_blocks::LatestBlocksCache;
use crate::sapling_params::{ParamsFetcher, SaplingParametersHandler};
use crate::scanner::BlockScanner;
use crate::service::ChainDataService;
use crate::sync_progress::{InternalSyncProgress, ProgressStorage};
use crate::utxo::UtxoFetcher;
use crate::validator::BlockValidator;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Collaborators shared by every action of a processor
pub(crate) struct ActionEnv {
    pub config: ProcessorConfig,
    pub service: Arc<dyn ChainDataService>,
    pub engine: Arc<dyn ScanningEngine>,
    pub transactions: Arc<dyn TransactionRepository>,
    pub cache: Arc<dyn ChainCache>,
    pub progress: InternalSyncProgress,
    pub latest_blocks: LatestBlocksCache,
    pub downloader: Arc<dyn BlockDownloader>,
    pub validator: BlockValidator,
    pub scanner: BlockScanner,
    pub enhancer: BlockEnhancer,
    pub utxo_fetcher: UtxoFetcher,
    pub sapling_params: SaplingParametersHandler,
    pub events: EventBus,
    pub cancel: CancelToken,
    /// Last time the resubmission queue was found empty or resubmitted
    pub last_resubmission: Mutex<Option<Instant>>,
}

impl ActionEnv {
    /// Wire the collaborators together
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ProcessorConfig,
        service: Arc<dyn ChainDataService>,
        engine: Arc<dyn ScanningEngine>,
        transactions: Arc<dyn TransactionRepository>,
        cache: Arc<dyn ChainCache>,
        progress_storage: Arc<dyn ProgressStorage>,
        params_fetcher: Arc<dyn ParamsFetcher>,
        events: EventBus,
    ) -> Self {
        let progress = InternalSyncProgress::new(config.alias.clone(), progress_storage);
        let latest_blocks = LatestBlocksCache::new(service.clone(), engine.clone());
        latest_blocks.update_wallet_birthday(config.wallet_birthday);

        let downloader: Arc<dyn BlockDownloader> = Arc::new(StreamingBlockDownloader::new(
            service.clone(),
            cache.clone(),
            engine.clone(),
            progress.clone(),
        ));
        let scan_batch = u32::try_from(config.batch_size).unwrap_or(u32::MAX);

        Self {
            validator: BlockValidator::new(cache.clone(), engine.clone()),
            scanner: BlockScanner::new(engine.clone(), config.network, scan_batch),
            enhancer: BlockEnhancer::new(
                service.clone(),
                engine.clone(),
                transactions.clone(),
                progress.clone(),
            ),
            utxo_fetcher: UtxoFetcher::new(service.clone(), engine.clone(), progress.clone()),
            sapling_params: SaplingParametersHandler::new(
                config.sapling_params.clone(),
                engine.clone(),
                params_fetcher,
            ),
            config,
            service,
            engine,
            transactions,
            cache,
            progress,
            latest_blocks,
            downloader,
            events,
            cancel: CancelToken::new(),
            last_resubmission: Mutex::new(None),
        }
    }
}

/// Run the handler of the context's current state
pub(crate) async fn run_action(env: &ActionEnv, ctx: ActionContext) -> Result<ActionContext> {
    match ctx.state() {
        State::Idle => Ok(ctx.with_state(State::MigrateLegacyCacheDb)),
        State::MigrateLegacyCacheDb => migrate::run(env, ctx).await,
        State::ValidateServer => validate_server::run(env, ctx).await,
        State::ChecksBeforeSync => checks::run(env, ctx).await,
        State::ComputeSyncControlData => compute::sync_control_data(env, ctx).await,
        State::ComputeSyncRanges => compute::sync_ranges(env, ctx).await,
        State::ProcessSuggestedScanRanges => suggested_ranges::run(env, ctx).await,
        State::Rewind => rewind::run(env, ctx).await,
        State::Download => download::download(env, ctx).await,
        State::Validate => download::validate(env, ctx).await,
        State::Scan => scan::scan(env, ctx).await,
        State::ClearAlreadyScannedBlocks => scan::clear_already_scanned(env, ctx).await,
        State::Enhance => enhance::run(env, ctx).await,
        State::FetchUtxo => utxos::fetch(env, ctx).await,
        State::HandleSaplingParams => utxos::sapling_params(env, ctx).await,
        State::UpdateSubtreeRoots => subtree_roots::run(env, ctx).await,
        State::UpdateChainTip => chain_tip::update_chain_tip(env, ctx).await,
        State::ClearCache => chain_tip::clear_cache(env, ctx).await,
        State::TxResubmission => chain_tip::tx_resubmission(env, ctx).await,
        State::Finished | State::Failed | State::Stopped => Err(Error::Invariant(format!(
            "no action for terminal state {}",
            ctx.state()
        ))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::block_cache::SqliteChainCache;
    use crate::testing::{test_config, MockParamsFetcher, MockWorld};
    use tempfile::TempDir;
    use zsync_storage_sqlite::ProgressStore;

    /// Action environment over mocks, with the cache in a temp dir
    pub fn env(world: &MockWorld) -> (TempDir, ActionEnv) {
        env_with(world, |_| {})
    }

    pub fn env_with(world: &MockWorld, configure: impl FnOnce(&mut ProcessorConfig)) -> (TempDir, ActionEnv) {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(world.network, dir.path());
        configure(&mut config);
        let cache = Arc::new(SqliteChainCache::new(config.fs_block_cache_root.clone()));
        cache.create().unwrap();
        let env = ActionEnv::new(
            config,
            world.service.clone(),
            world.engine.clone(),
            world.transactions.clone(),
            cache,
            Arc::new(ProgressStore::in_memory().unwrap()),
            Arc::new(MockParamsFetcher::new()),
            EventBus::new(),
        );
        (dir, env)
    }

    /// Context sitting in `state`, entered from `prev`
    pub fn ctx_in(prev: State, state: State) -> ActionContext {
        ActionContext::new(Default::default())
            .with_state(prev)
            .with_state(state)
    }
}
