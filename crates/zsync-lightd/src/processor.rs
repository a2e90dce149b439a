//! Compact block processor: runs sync passes through the action state
//! machine, retries connectivity failures, recovers from reorgs and polls
//! for new blocks between passes.

use crate::actions::{self, ActionEnv};
use crate::block_cache::{ChainCache, SqliteChainCache};
use crate::cancel::CancelToken;
use crate::client::{jitter_duration, RetryConfig};
use crate::config::ProcessorConfig;
use crate::context::{ActionContext, State};
use crate::engine::{ScanningEngine, TransactionRepository};
use crate::events::{EventBus, SyncEvent, SyncStatus};
use crate::model::BlockHeight;
use crate::sapling_params::{HttpParamsFetcher, ParamsFetcher};
use crate::service::ChainDataService;
use crate::sync_progress::ProgressStorage;
use crate::utxo::UtxoFetchResult;
use crate::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zsync_storage_sqlite::ProgressStore;

/// First retry delay; doubles per attempt up to the configured maximum
const INITIAL_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Work requested while a pass was running
enum AfterSyncHook {
    Rewind {
        height: Option<BlockHeight>,
        reply: oneshot::Sender<Result<BlockHeight>>,
    },
    Wipe {
        reply: oneshot::Sender<Result<()>>,
    },
    AnotherSync,
}

#[derive(Default)]
struct LoopState {
    running: bool,
    hooks: Vec<AfterSyncHook>,
}

struct Shared {
    env: ActionEnv,
    state: Mutex<LoopState>,
    /// Ends the loop; the pass token in `env.cancel` only interrupts a pass
    shutdown: CancelToken,
    wake: Notify,
}

/// Drives wallet synchronization against a lightwalletd server
pub struct CompactBlockProcessor {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[allow(dead_code)]
fn _assert_processor_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<CompactBlockProcessor>();
}

impl CompactBlockProcessor {
    /// Create a processor with the on-disk cache, progress store and HTTP
    /// parameter downloads described by `config`
    pub fn new(
        config: ProcessorConfig,
        service: Arc<dyn ChainDataService>,
        engine: Arc<dyn ScanningEngine>,
        transactions: Arc<dyn TransactionRepository>,
    ) -> Result<Self> {
        let fetcher = Arc::new(HttpParamsFetcher::new()?);
        Self::with_params_fetcher(config, service, engine, transactions, fetcher)
    }

    /// Like [`CompactBlockProcessor::new`] with a custom parameter fetcher
    pub fn with_params_fetcher(
        config: ProcessorConfig,
        service: Arc<dyn ChainDataService>,
        engine: Arc<dyn ScanningEngine>,
        transactions: Arc<dyn TransactionRepository>,
        params_fetcher: Arc<dyn ParamsFetcher>,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(parent) = config.progress_db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let progress: Arc<dyn ProgressStorage> = Arc::new(ProgressStore::open(&config.progress_db_path)?);
        let cache: Arc<dyn ChainCache> = Arc::new(SqliteChainCache::new(config.fs_block_cache_root.clone()));

        info!(
            alias = %config.alias,
            network = ?config.network.network_type,
            birthday = config.wallet_birthday,
            algorithm = ?config.sync_algorithm,
            "Creating compact block processor"
        );

        let env = ActionEnv::new(
            config,
            service,
            engine,
            transactions,
            cache,
            progress,
            params_fetcher,
            EventBus::new(),
        );
        Ok(Self {
            shared: Arc::new(Shared {
                env,
                state: Mutex::new(LoopState::default()),
                shutdown: CancelToken::new(),
                wake: Notify::new(),
            }),
            task: Mutex::new(None),
        })
    }

    /// Subscribe to processor events
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.env.events.subscribe()
    }

    /// Current status
    pub fn status(&self) -> SyncStatus {
        self.shared.env.events.status()
    }

    /// Watch status changes
    pub fn status_receiver(&self) -> watch::Receiver<SyncStatus> {
        self.shared.env.events.status_receiver()
    }

    /// Whether the sync loop is running
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Start the sync loop; a running loop does another pass after the
    /// current one
    pub fn start(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.running {
                debug!("Processor busy, queueing another sync");
                state.hooks.push(AfterSyncHook::AnotherSync);
                self.shared.wake.notify_one();
                return;
            }
            state.running = true;
        }

        self.shared.shutdown.reset();
        self.shared.env.cancel.reset();
        let shared = self.shared.clone();
        *self.task.lock() = Some(tokio::spawn(run_loop(shared)));
    }

    /// Stop the sync loop and wait for it to settle
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        self.shared.env.cancel.cancel();
        self.shared.wake.notify_one();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Sync loop task failed: {}", e);
            }
        }
    }

    /// Rewind the wallet to `height` (or its latest scanned height)
    ///
    /// Returns the height actually rewound to. A running pass is interrupted
    /// and the rewind is applied before the next one.
    pub async fn rewind(&self, height: Option<BlockHeight>) -> Result<BlockHeight> {
        let (reply, rx) = oneshot::channel();
        match self.queue_or_return(AfterSyncHook::Rewind { height, reply }) {
            Some(AfterSyncHook::Rewind { height, .. }) => rewind_wallet(&self.shared.env, height).await,
            _ => rx.await.map_err(|_| Error::Cancelled)?,
        }
    }

    /// Clear the chain cache and every progress marker
    pub async fn wipe(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        match self.queue_or_return(AfterSyncHook::Wipe { reply }) {
            Some(_) => wipe(&self.shared.env).await,
            None => rx.await.map_err(|_| Error::Cancelled)?,
        }
    }

    /// Latest block height reported by the server
    pub async fn latest_height(&self) -> Result<BlockHeight> {
        let height = self.shared.env.service.latest_block_height().await?;
        self.shared.env.latest_blocks.update(height);
        Ok(height)
    }

    /// Refresh transparent UTXOs of `address` mined at or after `start_height`
    pub async fn refresh_utxos(&self, address: &str, start_height: BlockHeight) -> Result<UtxoFetchResult> {
        let env = &self.shared.env;
        let result = env
            .utxo_fetcher
            .fetch_for(&[address.to_string()], start_height, &CancelToken::new())
            .await?;
        info!(
            "Refreshed UTXOs of {}: {} inserted, {} skipped",
            address,
            result.inserted.len(),
            result.skipped.len()
        );
        Ok(result)
    }

    /// Queue `hook` behind a running pass, interrupting it; hands the hook
    /// back when the loop is idle so the caller runs it directly
    fn queue_or_return(&self, hook: AfterSyncHook) -> Option<AfterSyncHook> {
        let mut state = self.shared.state.lock();
        if !state.running {
            return Some(hook);
        }
        state.hooks.push(hook);
        self.shared.env.cancel.cancel();
        self.shared.wake.notify_one();
        None
    }
}

impl Drop for CompactBlockProcessor {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        self.shared.env.cancel.cancel();
    }
}

async fn run_loop(shared: Arc<Shared>) {
    let env = &shared.env;
    let mut ctx = ActionContext::new(env.config.sync_algorithm);
    let mut consecutive_reorgs = 0;

    loop {
        if let Some(rewound_to) = run_hooks(&shared).await {
            ctx.last_enhanced_height = ctx.last_enhanced_height.map(|h| h.min(rewound_to));
        }
        if shared.shutdown.is_cancelled() {
            break;
        }
        env.cancel.reset();

        let mut fresh = ctx.reset();
        fresh.preferred_sync_algorithm = env.config.sync_algorithm;
        ctx = run_pass(env, fresh, &mut consecutive_reorgs).await;

        match ctx.state() {
            State::Failed => {
                if shared.state.lock().hooks.is_empty() {
                    break;
                }
                continue;
            }
            State::Stopped => continue,
            _ => {}
        }
        if !shared.state.lock().hooks.is_empty() {
            continue;
        }
        if has_new_blocks(env, &ctx).await {
            debug!("New blocks were mined during the pass, running again");
            continue;
        }

        let pause = poll_delay(env.config.poll_interval);
        debug!("Next sync pass in {:?}", pause);
        tokio::select! {
            _ = shared.shutdown.cancelled() => {}
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(pause) => {}
        }
    }

    let hooks = {
        let mut state = shared.state.lock();
        state.running = false;
        std::mem::take(&mut state.hooks)
    };
    for hook in hooks {
        execute_hook(env, hook).await;
    }
    env.downloader.stop_download().await;
    debug!("Sync loop ended");
}

/// Run queued hooks, returning the lowest height the wallet was rewound to
async fn run_hooks(shared: &Shared) -> Option<BlockHeight> {
    let hooks = std::mem::take(&mut shared.state.lock().hooks);
    let mut rewound_to: Option<BlockHeight> = None;
    for hook in hooks {
        if let Some(height) = execute_hook(&shared.env, hook).await {
            rewound_to = Some(rewound_to.map_or(height, |h| h.min(height)));
        }
    }
    rewound_to
}

async fn execute_hook(env: &ActionEnv, hook: AfterSyncHook) -> Option<BlockHeight> {
    match hook {
        AfterSyncHook::Rewind { height, reply } => {
            let result = rewind_wallet(env, height).await;
            let rewound_to = result.as_ref().ok().copied();
            let _ = reply.send(result);
            rewound_to
        }
        AfterSyncHook::Wipe { reply } => {
            let result = wipe(env).await;
            let wiped = result.is_ok();
            let _ = reply.send(result);
            wiped.then_some(0)
        }
        AfterSyncHook::AnotherSync => None,
    }
}

/// Drive one pass from `Idle` to a terminal state
async fn run_pass(env: &ActionEnv, mut ctx: ActionContext, consecutive_reorgs: &mut u32) -> ActionContext {
    env.events.emit(SyncEvent::StartedSyncing);
    let retry = RetryConfig {
        max_attempts: env.config.retries,
        initial_backoff: INITIAL_RETRY_BACKOFF,
        max_backoff: env.config.max_backoff,
        backoff_multiplier: 2.0,
    };
    let mut attempts = 0;

    while !ctx.state().is_terminal() {
        let state = ctx.state();
        let before = ctx.clone();
        debug!(state = %state, "Running action");

        let outcome = tokio::select! {
            biased;
            _ = env.cancel.cancelled() => None,
            result = actions::run_action(env, ctx) => Some(result),
        };

        ctx = match outcome {
            None => return stopped(env, before).await,
            Some(Err(Error::Cancelled)) if env.cancel.is_cancelled() => return stopped(env, before).await,
            Some(Ok(next)) => {
                attempts = 0;
                next
            }
            Some(Err(Error::InvalidChain(reorg_height))) => {
                match handle_reorg(env, before.clone(), reorg_height, *consecutive_reorgs).await {
                    Ok(next) => {
                        *consecutive_reorgs += 1;
                        next
                    }
                    Err(e) => return failed(env, state, before, e).await,
                }
            }
            Some(Err(e)) if state.may_retry(&e) => {
                attempts += 1;
                if attempts >= retry.max_attempts {
                    let exhausted = Error::MaxAttemptsReached {
                        attempts,
                        last: e.to_string(),
                    };
                    return failed(env, state, before, exhausted).await;
                }
                let backoff = jitter_duration(retry.backoff_for(attempts));
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    state, attempts, retry.max_attempts, backoff, e
                );
                tokio::select! {
                    _ = env.cancel.cancelled() => return stopped(env, before).await,
                    _ = tokio::time::sleep(backoff) => {}
                }
                before
            }
            Some(Err(e)) => return failed(env, state, before, e).await,
        };
    }

    if ctx.state() == State::Finished {
        *consecutive_reorgs = 0;
        let last_scanned_height = ctx
            .last_scanned_height
            .unwrap_or_else(|| env.latest_blocks.max_scanned_height());
        info!("Sync pass finished at {}", last_scanned_height);
        env.events.emit(SyncEvent::Finished { last_scanned_height });
    }
    ctx
}

async fn stopped(env: &ActionEnv, ctx: ActionContext) -> ActionContext {
    env.downloader.stop_download().await;
    info!("Sync pass stopped in {}", ctx.state());
    env.events.emit(SyncEvent::Stopped);
    ctx.with_state(State::Stopped)
}

async fn failed(env: &ActionEnv, state: State, ctx: ActionContext, error: Error) -> ActionContext {
    error!("Sync failed in {}: {}", state, error);
    env.downloader.stop_download().await;
    if state.removes_cache_on_failure() {
        if let Err(e) = env.cache.clear() {
            warn!("Failed to clear block cache after failure: {}", e);
        }
    }
    env.events.emit(SyncEvent::failed(&error));
    ctx.with_state(State::Failed)
}

/// Rewind below a chain discontinuity and resume downloading
async fn handle_reorg(
    env: &ActionEnv,
    mut ctx: ActionContext,
    reorg_height: BlockHeight,
    consecutive_reorgs: u32,
) -> Result<ActionContext> {
    let rewind_height = env.config.reorg_policy().rewind_height(
        reorg_height,
        consecutive_reorgs,
        env.config.network.sapling_activation_height,
    );
    warn!(
        reorg_height,
        rewind_height, consecutive_reorgs, "Chain reorg detected, rewinding"
    );

    env.downloader.stop_download().await;
    env.engine.rewind_to_height(rewind_height).await?;
    env.downloader.rewind(rewind_height).await;
    env.cache.rewind(rewind_height)?;
    env.progress.rewind(rewind_height)?;

    let lowered = |height: Option<BlockHeight>| Some(height.map_or(rewind_height, |h| h.min(rewind_height)));
    ctx.last_scanned_height = lowered(ctx.last_scanned_height);
    ctx.last_downloaded_height = lowered(ctx.last_downloaded_height);
    ctx.last_enhanced_height = ctx.last_enhanced_height.map(|h| h.min(rewind_height));
    if let Some(range) = ctx.sync_ranges.download_and_scan_range.clone() {
        let start = (*range.start()).min(rewind_height + 1);
        ctx.sync_ranges.download_and_scan_range = Some(start..=*range.end());
    }
    if *ctx.total_progress_range.start() > rewind_height {
        ctx.total_progress_range = rewind_height..=*ctx.total_progress_range.end();
    }

    env.events.emit(SyncEvent::HandledReorg {
        reorg_height,
        rewind_height,
    });
    Ok(ctx.with_state(State::Download))
}

/// Rewind to `max(nearest_rewind_height(height) - 1, birthday)`
async fn rewind_wallet(env: &ActionEnv, height: Option<BlockHeight>) -> Result<BlockHeight> {
    let birthday = env.config.wallet_birthday;
    let requested = match height {
        Some(height) => height,
        None => env.engine.latest_scanned_height().await?.unwrap_or(birthday),
    };
    let nearest = env.engine.get_nearest_rewind_height(requested).await?;
    let rewind_height = nearest.saturating_sub(1).max(birthday);

    env.downloader.stop_download().await;
    env.engine.rewind_to_height(rewind_height).await?;
    env.downloader.rewind(rewind_height).await;
    env.cache.rewind(rewind_height)?;
    env.progress.rewind(rewind_height)?;
    env.latest_blocks.update_scanned_data().await;

    info!("Rewound wallet to {} (requested {})", rewind_height, requested);
    Ok(rewind_height)
}

async fn wipe(env: &ActionEnv) -> Result<()> {
    env.downloader.stop_download().await;
    env.cache.clear()?;
    env.progress.reset()?;
    env.downloader.rewind(0).await;
    info!("Wiped block cache and sync progress");
    Ok(())
}

async fn has_new_blocks(env: &ActionEnv, ctx: &ActionContext) -> bool {
    let Some(scanned) = ctx.last_scanned_height else {
        return false;
    };
    match env.service.latest_block_height().await {
        Ok(tip) => {
            env.latest_blocks.update(tip);
            tip > scanned
        }
        Err(e) => {
            debug!("Could not refresh the chain tip: {}", e);
            false
        }
    }
}

/// Poll interval jittered into `[poll / 2, poll * 3 / 2]`
fn poll_delay(poll: Duration) -> Duration {
    poll.mul_f64(rand::thread_rng().gen_range(0.5..=1.5))
}
