//! Load note commitment subtree roots for spend-before-sync

use super::ActionEnv;
use crate::context::{ActionContext, State};
use crate::model::SyncAlgorithm;
use crate::service::{ShieldedProtocol, SubtreeRootsRequest};
use crate::Result;
use tracing::{debug, info, warn};
use zsync_params::NetworkType;

/// Entries requested per call on testnet; unlimited elsewhere
const TESTNET_MAX_ENTRIES: u32 = 65_536;

fn request(env: &ActionEnv, protocol: ShieldedProtocol) -> SubtreeRootsRequest {
    let max_entries = match env.config.network.network_type {
        NetworkType::Testnet => TESTNET_MAX_ENTRIES,
        _ => 0,
    };
    SubtreeRootsRequest {
        start_index: 0,
        protocol,
        max_entries,
    }
}

pub(super) async fn run(env: &ActionEnv, mut ctx: ActionContext) -> Result<ActionContext> {
    let roots = match env
        .service
        .subtree_roots(request(env, ShieldedProtocol::Sapling))
        .await
    {
        Ok(roots) => roots,
        Err(e) if e.is_timeout() => return Err(e),
        Err(e) => {
            warn!("Subtree roots unavailable, falling back to linear sync: {}", e);
            Vec::new()
        }
    };

    if roots.is_empty() {
        ctx.preferred_sync_algorithm = SyncAlgorithm::Linear;
        return Ok(ctx.with_state(State::ComputeSyncControlData));
    }

    info!("Loaded {} sapling subtree roots", roots.len());
    ctx.preferred_sync_algorithm = SyncAlgorithm::SpendBeforeSync;
    env.engine.put_sapling_subtree_roots(0, &roots).await?;

    // Orchard roots are optional
    match env
        .service
        .subtree_roots(request(env, ShieldedProtocol::Orchard))
        .await
    {
        Ok(orchard) if !orchard.is_empty() => {
            info!("Loaded {} orchard subtree roots", orchard.len());
            env.engine.put_orchard_subtree_roots(0, &orchard).await?;
        }
        Ok(_) => {}
        Err(e) if e.is_timeout() => return Err(e),
        Err(e) => debug!("Orchard subtree roots unavailable: {}", e),
    }

    Ok(ctx.with_state(State::UpdateChainTip))
}
