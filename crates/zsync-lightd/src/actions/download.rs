//! Download the next batch into the chain cache and validate it

use super::ActionEnv;
use crate::context::{ActionContext, State};
use crate::model::CompactBlockRange;
use crate::ranges::scan_window;
use crate::Result;
use tracing::debug;

/// Next batch of the pending range, `None` when nothing is left
fn pending_batch(env: &ActionEnv, ctx: &ActionContext) -> Option<(CompactBlockRange, CompactBlockRange)> {
    let range = ctx.sync_ranges.download_range()?;
    let last_scanned = ctx
        .last_scanned_height
        .unwrap_or_else(|| range.start().saturating_sub(1));
    let batch = scan_window(last_scanned, env.config.batch_size, &range)?;
    Some((range, batch))
}

pub(super) async fn download(env: &ActionEnv, mut ctx: ActionContext) -> Result<ActionContext> {
    let Some((range, batch)) = pending_batch(env, &ctx) else {
        debug!("Nothing left to download");
        return Ok(ctx.with_state(State::Validate));
    };

    let batch_size = env.config.batch_size;
    env.downloader.set_sync_range(range, batch_size);
    env.downloader
        .set_download_limit(batch.end().saturating_add(batch_size.saturating_mul(2)));
    env.downloader.start_download(env.config.download_buffer_size);

    debug!("Waiting for blocks {:?}", batch);
    env.downloader
        .wait_until_requested_blocks_are_downloaded(batch)
        .await?;
    ctx.last_downloaded_height = Some(env.downloader.latest_downloaded_height());

    Ok(ctx.with_state(State::Validate))
}

pub(super) async fn validate(env: &ActionEnv, ctx: ActionContext) -> Result<ActionContext> {
    if let Some((_, batch)) = pending_batch(env, &ctx) {
        env.validator.validate(Some(batch)).await?;
    }
    Ok(ctx.with_state(State::Scan))
}
