//! Work computation at the start of a pass

use super::ActionEnv;
use crate::context::{ActionContext, State};
use crate::model::SyncControlData;
use crate::ranges::compute_total_progress_range;
use crate::sync_progress::NextState;
use crate::Result;
use std::time::Instant;
use tracing::{debug, info};

/// Refresh chain data and compute the control data of the pass
pub(super) async fn sync_control_data(env: &ActionEnv, mut ctx: ActionContext) -> Result<ActionContext> {
    let remote_tip = env.service.latest_block_height().await?;
    env.engine.update_chain_tip(remote_tip).await?;
    ctx.last_chain_tip_update_time = Some(Instant::now());
    env.latest_blocks.update(remote_tip);
    env.latest_blocks.update_scanned_data().await;

    let latest_block_height = env.latest_blocks.latest_block_height();
    let latest_scanned_height = env
        .latest_blocks
        .max_scanned_height()
        .max(env.config.wallet_birthday);
    let first_unenhanced_height = env
        .engine
        .first_unenhanced_height()
        .await?
        .map(|height| height.min(latest_scanned_height));

    debug!(
        latest_block_height,
        latest_scanned_height,
        ?first_unenhanced_height,
        wallet_birthday = env.config.wallet_birthday,
        "Init numbers"
    );

    ctx.sync_control_data = SyncControlData {
        latest_block_height,
        latest_scanned_height: Some(latest_scanned_height),
        first_unenhanced_height,
    };
    ctx.last_downloaded_height = Some(latest_scanned_height);

    if latest_block_height <= latest_scanned_height {
        info!("Wallet is synced to {}", latest_scanned_height);
        ctx.last_scanned_height = Some(latest_scanned_height);
        return Ok(ctx.with_state(State::Finished));
    }
    ctx.total_progress_range = latest_scanned_height..=latest_block_height;

    if ctx.is_spend_before_sync() {
        ctx.sync_ranges.latest_block_height = latest_block_height;
        ctx.sync_ranges.download_and_scan_range = Some(latest_scanned_height + 1..=latest_block_height);
        ctx.last_scanned_height = Some(latest_scanned_height);
        Ok(ctx.with_state(State::Download))
    } else {
        Ok(ctx.with_state(State::ComputeSyncRanges))
    }
}

/// Compute the linear ranges of the pass from persisted progress
pub(super) async fn sync_ranges(env: &ActionEnv, mut ctx: ActionContext) -> Result<ActionContext> {
    let birthday = env.config.wallet_birthday;
    let before_birthday = birthday.saturating_sub(1);
    let latest_block_height = ctx.sync_control_data.latest_block_height;
    let latest_scanned_height = env
        .engine
        .latest_scanned_height()
        .await?
        .map_or(before_birthday, |height| height.max(before_birthday));

    match env
        .progress
        .compute_next_state(latest_block_height, latest_scanned_height, birthday)?
    {
        NextState::Wait {
            latest_height,
            latest_download_height,
        } => {
            info!(
                "Local progress {} is ahead of the server tip {}, waiting",
                latest_download_height, latest_height
            );
            Ok(ctx.with_state(State::Finished))
        }
        NextState::FinishProcessing(height) => {
            info!("Nothing to process up to {}", height);
            ctx.last_scanned_height = Some(latest_scanned_height);
            Ok(ctx.with_state(State::Finished))
        }
        NextState::ProcessNewBlocks(ranges) => {
            debug!("Sync ranges {:?}", ranges);
            ctx.total_progress_range = compute_total_progress_range(&ranges);
            ctx.last_scanned_height = ranges.latest_scanned_height;
            ctx.last_downloaded_height = ranges.latest_downloaded_block_height;
            ctx.sync_ranges = ranges;
            Ok(ctx.with_state(State::ChecksBeforeSync))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::{ctx_in, env};
    use crate::model::SyncAlgorithm;
    use crate::sync_progress::ProgressKey;
    use crate::testing::MockWorld;
    use zsync_params::Network;

    #[tokio::test]
    async fn test_control_data_linear() {
        let world = MockWorld::new(Network::testnet(), 300_000);
        world.engine.set_scanned(Some(290_000));
        world.engine.set_first_unenhanced(Some(295_000));
        let (_dir, env) = env(&world);

        let ctx = sync_control_data(&env, ctx_in(State::HandleSaplingParams, State::ComputeSyncControlData))
            .await
            .unwrap();

        assert_eq!(ctx.state(), State::ComputeSyncRanges);
        assert_eq!(ctx.sync_control_data.latest_block_height, 300_000);
        assert_eq!(ctx.sync_control_data.latest_scanned_height, Some(290_000));
        assert_eq!(ctx.sync_control_data.first_unenhanced_height, Some(290_000));
        assert_eq!(ctx.total_progress_range, 290_000..=300_000);
        assert_eq!(world.engine.chain_tips(), vec![300_000]);
        assert!(ctx.last_chain_tip_update_time.is_some());
    }

    #[tokio::test]
    async fn test_control_data_synced_finishes() {
        let world = MockWorld::new(Network::testnet(), 300_000);
        world.engine.set_scanned(Some(300_000));
        let (_dir, env) = env(&world);

        let ctx = sync_control_data(&env, ctx_in(State::HandleSaplingParams, State::ComputeSyncControlData))
            .await
            .unwrap();
        assert_eq!(ctx.state(), State::Finished);
    }

    #[tokio::test]
    async fn test_control_data_spend_before_sync_downloads() {
        let world = MockWorld::new(Network::testnet(), 300_000);
        world.engine.set_scanned(Some(290_000));
        let (_dir, env) = env(&world);

        let ctx = ActionContext::new(SyncAlgorithm::SpendBeforeSync).with_state(State::ComputeSyncControlData);
        let ctx = sync_control_data(&env, ctx).await.unwrap();
        assert_eq!(ctx.state(), State::Download);
        assert_eq!(ctx.sync_ranges.download_range(), Some(290_001..=300_000));
        assert_eq!(ctx.last_scanned_height, Some(290_000));
    }

    #[tokio::test]
    async fn test_ranges_for_fresh_wallet_start_at_birthday() {
        let world = MockWorld::new(Network::testnet(), 280_500);
        let (_dir, env) = env(&world);

        let mut ctx = ctx_in(State::ComputeSyncControlData, State::ComputeSyncRanges);
        ctx.sync_control_data.latest_block_height = 280_500;
        let ctx = sync_ranges(&env, ctx).await.unwrap();

        assert_eq!(ctx.state(), State::ChecksBeforeSync);
        assert_eq!(ctx.sync_ranges.download_range(), Some(280_000..=280_500));
        assert_eq!(ctx.last_scanned_height, Some(279_999));
        assert_eq!(ctx.total_progress_range, 280_000..=280_500);
    }

    #[tokio::test]
    async fn test_ranges_wait_when_progress_ahead() {
        let world = MockWorld::new(Network::testnet(), 280_500);
        let (_dir, env) = env(&world);
        env.progress
            .set(ProgressKey::LatestDownloadedBlockHeight, 281_000)
            .unwrap();

        let mut ctx = ctx_in(State::ComputeSyncControlData, State::ComputeSyncRanges);
        ctx.sync_control_data.latest_block_height = 280_500;
        let ctx = sync_ranges(&env, ctx).await.unwrap();
        assert_eq!(ctx.state(), State::Finished);
    }
}
