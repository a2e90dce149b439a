//! Apply a rewind requested by a `verify` scan range

use super::ActionEnv;
use crate::context::{ActionContext, State};
use crate::Result;
use tracing::debug;

pub(super) async fn run(env: &ActionEnv, mut ctx: ActionContext) -> Result<ActionContext> {
    if let Some(height) = ctx.requested_rewind_height.take() {
        debug!("Executing requested rewind to {}", height);
        env.downloader.rewind(height).await;
        env.engine.rewind_to_height(height).await?;
        env.cache.rewind(height)?;
        env.progress.rewind(height)?;
    }
    Ok(ctx.with_state(State::Download))
}
