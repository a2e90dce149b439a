//! Transparent UTXO refresh and Sapling parameter checks

use super::ActionEnv;
use crate::context::{ActionContext, State};
use crate::events::SyncEvent;
use crate::model::CompactBlockRange;
use crate::Result;
use tracing::debug;

/// Heights not yet refreshed for a spend-before-sync pass, up to the remote tip
async fn spend_before_sync_range(env: &ActionEnv) -> Result<Option<CompactBlockRange>> {
    env.latest_blocks.update_block_data().await;
    let tip = env.latest_blocks.latest_block_height();
    let start = env
        .progress
        .latest_utxo_fetched_height()?
        .saturating_add(1)
        .max(env.config.wallet_birthday);
    Ok((start <= tip).then_some(start..=tip))
}

pub(super) async fn fetch(env: &ActionEnv, ctx: ActionContext) -> Result<ActionContext> {
    let next = if ctx.prev_state() == Some(State::ChecksBeforeSync) {
        State::Download
    } else {
        State::HandleSaplingParams
    };

    let range = match ctx.sync_ranges.fetch_utxo_range.clone() {
        Some(range) => Some(range),
        None if ctx.is_spend_before_sync() => spend_before_sync_range(env).await?,
        None => None,
    };

    if let Some(range) = range {
        debug!("Fetching UTXOs mined in {:?}", range);
        env.events.emit(SyncEvent::StartedFetching);
        let result = env.utxo_fetcher.fetch(range, &env.cancel).await?;
        env.events.emit(SyncEvent::StoredUtxos(result));
    } else {
        debug!("No UTXO range pending");
    }

    Ok(ctx.with_state(next))
}

pub(super) async fn sapling_params(env: &ActionEnv, ctx: ActionContext) -> Result<ActionContext> {
    env.sapling_params.handle_if_needed().await?;

    let next = if ctx.is_spend_before_sync() {
        State::UpdateSubtreeRoots
    } else {
        State::ComputeSyncControlData
    };
    Ok(ctx.with_state(next))
}
