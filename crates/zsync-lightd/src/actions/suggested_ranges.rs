//! Pick the next range to scan from the engine's suggestions

use super::ActionEnv;
use crate::context::{ActionContext, State};
use crate::model::{sort_scan_ranges, ScanPriority, SyncControlData, SyncRanges};
use crate::Result;
use tracing::info;

pub(super) async fn run(env: &ActionEnv, mut ctx: ActionContext) -> Result<ActionContext> {
    let mut suggested = env.engine.suggest_scan_ranges().await?;
    sort_scan_ranges(&mut suggested);
    let Some(next) = suggested.into_iter().find(|range| !range.is_empty()) else {
        info!("No scan ranges suggested, wallet is synced");
        return Ok(ctx.with_state(State::Finished));
    };

    let lower = next.range.start.saturating_sub(1);
    let upper = next.range.end - 1;
    info!(
        "Processing suggested range {}..={} ({:?})",
        next.range.start, upper, next.priority
    );

    ctx.sync_control_data = SyncControlData {
        latest_block_height: upper,
        latest_scanned_height: Some(lower),
        first_unenhanced_height: Some(lower + 1),
    };
    ctx.sync_ranges = SyncRanges {
        latest_block_height: upper,
        download_and_scan_range: Some(next.range.start..=upper),
        latest_scanned_height: Some(lower),
        latest_downloaded_block_height: Some(lower),
        ..SyncRanges::empty()
    };
    ctx.total_progress_range = lower..=upper;
    ctx.last_scanned_height = Some(lower);
    ctx.last_downloaded_height = Some(lower);
    ctx.last_enhanced_height = Some(lower);
    env.downloader.update(lower);

    if next.priority == ScanPriority::Verify {
        if ctx.requested_rewind_height.is_none() {
            ctx.requested_rewind_height = Some(lower + 1);
        }
        return Ok(ctx.with_state(State::Rewind));
    }
    Ok(ctx.with_state(State::Download))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::{ctx_in, env};
    use crate::model::ScanRange;
    use crate::testing::MockWorld;
    use zsync_params::Network;

    #[tokio::test]
    async fn test_empty_suggestions_finish() {
        let world = MockWorld::new(Network::testnet(), 300_000);
        let (_dir, env) = env(&world);

        let ctx = run(&env, ctx_in(State::ClearCache, State::ProcessSuggestedScanRanges))
            .await
            .unwrap();
        assert_eq!(ctx.state(), State::Finished);
    }

    #[tokio::test]
    async fn test_chain_tip_range_downloads_without_rewind() {
        let world = MockWorld::new(Network::testnet(), 300_000);
        world
            .engine
            .set_suggested_ranges(vec![ScanRange::new(299_000..300_001, ScanPriority::ChainTip)]);
        let (_dir, env) = env(&world);

        let ctx = run(&env, ctx_in(State::ClearCache, State::ProcessSuggestedScanRanges))
            .await
            .unwrap();

        assert_eq!(ctx.state(), State::Download);
        assert_eq!(ctx.requested_rewind_height, None);
        assert_eq!(ctx.total_progress_range, 298_999..=300_000);
        assert_eq!(ctx.last_scanned_height, Some(298_999));
        assert_eq!(ctx.sync_ranges.download_range(), Some(299_000..=300_000));
        assert_eq!(ctx.sync_control_data.first_unenhanced_height, Some(299_000));
        assert_eq!(ctx.last_enhanced_height, Some(298_999));
        assert_eq!(env.downloader.latest_downloaded_height(), 298_999);
    }

    #[tokio::test]
    async fn test_verify_range_requests_one_rewind() {
        let world = MockWorld::new(Network::testnet(), 300_000);
        world.engine.set_suggested_ranges(vec![
            ScanRange::new(299_000..300_001, ScanPriority::ChainTip),
            ScanRange::new(298_900..298_910, ScanPriority::Verify),
        ]);
        let (_dir, env) = env(&world);

        let ctx = run(&env, ctx_in(State::ClearCache, State::ProcessSuggestedScanRanges))
            .await
            .unwrap();

        assert_eq!(ctx.state(), State::Rewind);
        assert_eq!(ctx.requested_rewind_height, Some(298_900));
        assert_eq!(ctx.sync_ranges.download_range(), Some(298_900..=298_909));
        assert!(world.engine.rewinds().is_empty());
    }
}
