//! Chain tip refresh, cache clearing and transaction resubmission

use super::ActionEnv;
use crate::context::{ActionContext, State};
use crate::model::BlockHeight;
use crate::Result;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Minimum time between two chain tip pushes into the engine
pub const CHAIN_TIP_UPDATE_INTERVAL: Duration = Duration::from_secs(600);

/// Minimum time between two resubmission rounds
pub const TX_RESUBMISSION_INTERVAL: Duration = Duration::from_secs(300);

fn is_due(last: Option<Instant>, interval: Duration) -> bool {
    last.map_or(true, |at| at.elapsed() > interval)
}

pub(super) async fn update_chain_tip(env: &ActionEnv, mut ctx: ActionContext) -> Result<ActionContext> {
    let due = ctx.prev_state() == Some(State::UpdateSubtreeRoots)
        || is_due(ctx.last_chain_tip_update_time, CHAIN_TIP_UPDATE_INTERVAL);
    if !due {
        return Ok(ctx.with_state(State::Download));
    }

    env.downloader.stop_download().await;
    let tip = env.service.latest_block_height().await?;
    env.engine.update_chain_tip(tip).await?;
    ctx.last_chain_tip_update_time = Some(Instant::now());
    env.latest_blocks.update(tip);
    env.latest_blocks.update_scanned_data().await;
    info!("Chain tip updated to {}", tip);

    Ok(ctx.with_state(State::ClearCache))
}

pub(super) async fn clear_cache(env: &ActionEnv, ctx: ActionContext) -> Result<ActionContext> {
    env.downloader
        .rewind(ctx.last_scanned_height.unwrap_or(0))
        .await;
    env.cache.clear()?;
    debug!("Block cache cleared");

    let next = if ctx.is_spend_before_sync() {
        State::ProcessSuggestedScanRanges
    } else {
        State::Finished
    };
    Ok(ctx.with_state(next))
}

pub(super) async fn tx_resubmission(env: &ActionEnv, ctx: ActionContext) -> Result<ActionContext> {
    if is_due(*env.last_resubmission.lock(), TX_RESUBMISSION_INTERVAL) {
        resubmit_pending(env, ctx.sync_control_data.latest_block_height).await;
    }
    Ok(ctx.with_state(State::UpdateChainTip))
}

async fn resubmit_pending(env: &ActionEnv, latest_height: BlockHeight) {
    let pending = match env.transactions.find_for_resubmission(latest_height).await {
        Ok(pending) => pending,
        Err(e) => {
            warn!("Failed to load transactions for resubmission: {}", e);
            return;
        }
    };

    for tx in &pending {
        let Some(raw) = tx.raw.as_deref() else {
            continue;
        };
        match env.service.submit(raw).await {
            Ok(()) => {
                let now = chrono::Utc::now().timestamp();
                if let Err(e) = env.transactions.mark_submitted(&tx.txid, now).await {
                    warn!("Failed to record resubmission of {}: {}", hex::encode(&tx.txid), e);
                }
            }
            Err(e) => warn!("Resubmission of {} failed: {}", hex::encode(&tx.txid), e),
        }
    }
    if !pending.is_empty() {
        info!("Resubmitted {} pending transactions", pending.len());
    }
    *env.last_resubmission.lock() = Some(Instant::now());
}
