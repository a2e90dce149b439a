//! Enhance wallet transactions found by scanning

use super::ActionEnv;
use crate::context::{ActionContext, State};
use crate::events::SyncEvent;
use crate::model::BlockHeight;
use crate::Result;
use tracing::debug;

/// Scanned blocks accumulated before an enhancement pass runs mid-sync
pub const ENHANCE_BATCH_SIZE: BlockHeight = 1_000;

fn after_enhance(ctx: ActionContext) -> ActionContext {
    if ctx.is_scanned_to_upper() {
        ctx.with_state(State::ClearCache)
    } else {
        ctx.with_state(State::TxResubmission)
    }
}

pub(super) async fn run(env: &ActionEnv, mut ctx: ActionContext) -> Result<ActionContext> {
    let Some(last_scanned) = ctx.last_scanned_height else {
        return Ok(after_enhance(ctx));
    };

    let first_unenhanced = match ctx.sync_control_data.first_unenhanced_height {
        Some(height) => Some(height),
        None => env.engine.first_unenhanced_height().await?,
    };
    let Some(first_unenhanced) = first_unenhanced else {
        debug!("No unenhanced transactions known");
        return Ok(after_enhance(ctx));
    };

    let last_enhanced = ctx
        .last_enhanced_height
        .unwrap_or_else(|| first_unenhanced.saturating_sub(1));
    // never go below what a previous pass already enhanced
    let floor = ctx
        .sync_ranges
        .enhance_range
        .as_ref()
        .map_or(0, |range| *range.start());
    let start = first_unenhanced.max(last_enhanced + 1).max(floor);
    let due = last_scanned.saturating_sub(last_enhanced) >= ENHANCE_BATCH_SIZE || ctx.is_scanned_to_upper();
    if start > last_scanned || !due {
        return Ok(after_enhance(ctx));
    }

    let range = start..=last_scanned;
    env.events.emit(SyncEvent::StartedEnhancing);
    let events = &env.events;
    let transactions = env
        .enhancer
        .enhance(range.clone(), &env.cancel, |progress| {
            if progress.newly_mined {
                events.emit(SyncEvent::MinedTransaction(progress.last_found_transaction.clone()));
            }
            events.emit(SyncEvent::EnhancementProgress(progress));
        })
        .await?;

    if !transactions.is_empty() {
        env.events.emit(SyncEvent::FoundTransactions {
            transactions,
            range: range.clone(),
        });
    }
    ctx.last_enhanced_height = Some(*range.end());

    Ok(after_enhance(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::{ctx_in, env};
    use crate::engine::WalletTransaction;
    use crate::service::FetchedTransaction;
    use crate::testing::MockWorld;
    use zsync_params::Network;

    fn scanned_ctx(last_scanned: BlockHeight, upper: BlockHeight) -> ActionContext {
        let mut ctx = ctx_in(State::ClearAlreadyScannedBlocks, State::Enhance);
        ctx.sync_ranges.download_and_scan_range = Some(1_000..=upper);
        ctx.last_scanned_height = Some(last_scanned);
        ctx
    }

    fn add_mined(world: &MockWorld, id: u8, height: BlockHeight) {
        world.transactions.insert(WalletTransaction {
            txid: vec![id; 32],
            mined_height: Some(height),
            raw: None,
            created_at: 0,
            expiry_height: None,
        });
        world.service.add_transaction(FetchedTransaction {
            txid: vec![id; 32],
            raw: vec![id, id],
            mined_height: Some(height),
        });
    }

    #[tokio::test]
    async fn test_unknown_first_unenhanced_skips() {
        let world = MockWorld::new(Network::testnet(), 300_000);
        let (_dir, env) = env(&world);

        let ctx = run(&env, scanned_ctx(2_000, 2_000)).await.unwrap();
        assert_eq!(ctx.state(), State::ClearCache);
        assert_eq!(ctx.last_enhanced_height, None);
        assert_eq!(env.progress.latest_enhanced_height().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_threshold_not_met_skips() {
        let world = MockWorld::new(Network::testnet(), 300_000);
        let (_dir, env) = env(&world);

        let mut ctx = scanned_ctx(1_500, 5_000);
        ctx.sync_control_data.first_unenhanced_height = Some(1_000);
        let ctx = run(&env, ctx).await.unwrap();

        assert_eq!(ctx.state(), State::TxResubmission);
        assert_eq!(ctx.last_enhanced_height, None);
        assert_eq!(env.progress.latest_enhanced_height().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enhances_at_upper_bound() {
        let world = MockWorld::new(Network::testnet(), 300_000);
        add_mined(&world, 7, 1_500);
        let (_dir, env) = env(&world);
        let mut events = env.events.subscribe();

        let mut ctx = scanned_ctx(2_000, 2_000);
        ctx.sync_control_data.first_unenhanced_height = Some(1_000);
        let ctx = run(&env, ctx).await.unwrap();

        assert_eq!(ctx.state(), State::ClearCache);
        assert_eq!(ctx.last_enhanced_height, Some(2_000));
        assert_eq!(world.engine.stored_transactions(), vec![vec![7, 7]]);

        assert_eq!(events.try_recv().unwrap(), SyncEvent::StartedEnhancing);
        assert!(matches!(events.try_recv().unwrap(), SyncEvent::EnhancementProgress(_)));
        match events.try_recv().unwrap() {
            SyncEvent::FoundTransactions { transactions, range } => {
                assert_eq!(transactions.len(), 1);
                assert_eq!(range, 1_000..=2_000);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pending_enhance_range_skips_enhanced_heights() {
        let world = MockWorld::new(Network::testnet(), 300_000);
        add_mined(&world, 5, 1_200);
        add_mined(&world, 6, 1_800);
        let (_dir, env) = env(&world);

        let mut ctx = scanned_ctx(2_000, 2_000);
        ctx.sync_control_data.first_unenhanced_height = Some(1_000);
        ctx.sync_ranges.enhance_range = Some(1_501..=2_000);
        let ctx = run(&env, ctx).await.unwrap();

        assert_eq!(ctx.state(), State::ClearCache);
        assert_eq!(ctx.last_enhanced_height, Some(2_000));
        assert_eq!(world.engine.stored_transactions(), vec![vec![6, 6]]);
    }

    #[tokio::test]
    async fn test_enhances_after_threshold_mid_sync() {
        let world = MockWorld::new(Network::testnet(), 300_000);
        world.engine.set_first_unenhanced(Some(1_000));
        let (_dir, env) = env(&world);

        let ctx = run(&env, scanned_ctx(2_100, 5_000)).await.unwrap();
        assert_eq!(ctx.state(), State::TxResubmission);
        assert_eq!(ctx.last_enhanced_height, Some(2_100));
        assert_eq!(env.progress.latest_enhanced_height().unwrap(), 2_100);

        let ctx = run(&env, ctx.with_state(State::Enhance)).await.unwrap();
        assert_eq!(ctx.last_enhanced_height, Some(2_100));
    }
}
