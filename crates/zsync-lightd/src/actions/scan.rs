//! Scan the next batch and drop the cached blocks it covered

use super::ActionEnv;
use crate::context::{ActionContext, State};
use crate::events::SyncEvent;
use crate::ranges::scan_window;
use crate::{Error, Result};
use tracing::debug;

pub(super) async fn scan(env: &ActionEnv, mut ctx: ActionContext) -> Result<ActionContext> {
    let Some(range) = ctx.sync_ranges.scan_range() else {
        return Ok(ctx.with_state(State::ClearAlreadyScannedBlocks));
    };
    let last_scanned = ctx
        .last_scanned_height
        .unwrap_or_else(|| range.start().saturating_sub(1));

    let Some(batch) = scan_window(last_scanned, env.config.batch_size, &range) else {
        debug!("Already scanned up to {}", last_scanned);
        return Ok(ctx.with_state(State::ClearAlreadyScannedBlocks));
    };

    let events = &env.events;
    let reached = env
        .scanner
        .scan_blocks(batch, ctx.total_progress_range.clone(), &env.cancel, |_, progress| {
            events.emit(SyncEvent::ProgressUpdated(progress));
        })
        .await?;
    ctx.last_scanned_height = Some(reached.max(last_scanned));

    Ok(ctx.with_state(State::ClearAlreadyScannedBlocks))
}

pub(super) async fn clear_already_scanned(env: &ActionEnv, ctx: ActionContext) -> Result<ActionContext> {
    let scanned = ctx.last_scanned_height.ok_or(Error::MissingScannedHeight)?;
    // the next window starts at the last scanned block, keep it cached
    env.cache.clear_up_to(scanned.saturating_sub(1))?;
    Ok(ctx.with_state(State::Enhance))
}
