//! Reconcile the chain cache with the scanned height before a linear pass

use super::ActionEnv;
use crate::context::{ActionContext, State};
use crate::ranges::compute_total_progress_range;
use crate::sync_progress::ProgressKey;
use crate::Result;
use tracing::info;

pub(super) async fn run(env: &ActionEnv, mut ctx: ActionContext) -> Result<ActionContext> {
    env.cache.create()?;

    if let Some(unscanned) = ctx.sync_ranges.downloaded_but_unscanned_range.take() {
        // Blocks above the scanned height are downloaded again so the cache
        // always starts right after it.
        let scanned = unscanned.start().saturating_sub(1);
        info!(
            "Cache holds unscanned blocks {:?}, clearing it back to {}",
            unscanned, scanned
        );
        env.downloader.rewind(scanned).await;
        env.cache.clear()?;
        env.progress
            .set(ProgressKey::LatestDownloadedBlockHeight, scanned)?;

        let end = ctx
            .sync_ranges
            .download_and_scan_range
            .as_ref()
            .map_or(*unscanned.end(), |range| (*range.end()).max(*unscanned.end()));
        ctx.sync_ranges.download_and_scan_range = Some(*unscanned.start()..=end);
        ctx.sync_ranges.latest_downloaded_block_height = Some(scanned);
        ctx.last_downloaded_height = Some(scanned);
        ctx.total_progress_range = compute_total_progress_range(&ctx.sync_ranges);
    }

    Ok(ctx.with_state(State::FetchUtxo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::{ctx_in, env};
    use crate::testing::{synthetic_block, MockWorld};
    use zsync_params::Network;

    #[tokio::test]
    async fn test_consistent_cache_is_kept() {
        let world = MockWorld::new(Network::testnet(), 300_000);
        let (_dir, env) = env(&world);
        env.cache.write(&[synthetic_block(290_000)]).unwrap();

        let mut ctx = ctx_in(State::ComputeSyncRanges, State::ChecksBeforeSync);
        ctx.sync_ranges.download_and_scan_range = Some(290_001..=300_000);
        let ctx = run(&env, ctx).await.unwrap();

        assert_eq!(ctx.state(), State::FetchUtxo);
        assert_eq!(env.cache.latest_height().unwrap(), 290_000);
        assert_eq!(ctx.sync_ranges.download_range(), Some(290_001..=300_000));
    }

    #[tokio::test]
    async fn test_unscanned_blocks_are_dropped() {
        let world = MockWorld::new(Network::testnet(), 300_000);
        let (_dir, env) = env(&world);
        let blocks: Vec<_> = (290_001..=290_050).map(synthetic_block).collect();
        env.cache.write(&blocks).unwrap();
        env.progress
            .set(ProgressKey::LatestDownloadedBlockHeight, 290_050)
            .unwrap();

        let mut ctx = ctx_in(State::ComputeSyncRanges, State::ChecksBeforeSync);
        ctx.sync_ranges.downloaded_but_unscanned_range = Some(290_001..=290_050);
        ctx.sync_ranges.download_and_scan_range = Some(290_051..=300_000);
        let ctx = run(&env, ctx).await.unwrap();

        assert_eq!(ctx.state(), State::FetchUtxo);
        assert_eq!(env.cache.latest_height().unwrap(), 0);
        assert_eq!(env.progress.latest_downloaded_block_height().unwrap(), 290_000);
        assert_eq!(ctx.sync_ranges.downloaded_but_unscanned_range, None);
        assert_eq!(ctx.sync_ranges.download_range(), Some(290_001..=300_000));
        assert_eq!(ctx.last_downloaded_height, Some(290_000));
    }
}
