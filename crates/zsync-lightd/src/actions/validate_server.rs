//! Check the server serves the chain this wallet was created for

use super::ActionEnv;
use crate::context::{ActionContext, State};
use crate::validator::check_server_info;
use crate::Result;
use tracing::{debug, info};

pub(super) async fn run(env: &ActionEnv, ctx: ActionContext) -> Result<ActionContext> {
    let info = env.service.get_info().await?;
    let network = &env.config.network;
    debug!(
        chain = %info.chain_name,
        height = info.block_height,
        branch = %info.consensus_branch_id,
        "Validating server {} {}",
        info.vendor,
        info.version
    );

    let local_branch = env.engine.consensus_branch_id_for(info.block_height).await?;
    check_server_info(&info, network, local_branch)?;

    env.latest_blocks.update(info.block_height);
    info!("Server validated at height {}", info.block_height);
    Ok(ctx.with_state(State::FetchUtxo))
}
