//! One-time move away from the legacy single-file block cache, then
//! making sure the block cache and the engine's metadata store exist

use super::ActionEnv;
use crate::context::{ActionContext, State};
use crate::sync_progress::ProgressKey;
use crate::{Error, Result};
use tracing::{debug, info};

pub(super) async fn run(env: &ActionEnv, ctx: ActionContext) -> Result<ActionContext> {
    migrate_legacy_cache(env).await?;

    env.cache.create()?;
    env.engine.init_block_metadata_db().await?;

    Ok(ctx.with_state(State::ValidateServer))
}

async fn migrate_legacy_cache(env: &ActionEnv) -> Result<()> {
    let Some(legacy) = env.config.legacy_cache_db_path.as_deref() else {
        return Ok(());
    };

    if legacy == env.cache.root() || legacy == env.config.fs_block_cache_root.as_path() {
        return Err(Error::CacheMigrationSameUrl);
    }

    if !env.config.is_default_alias() {
        debug!("Alias {} has no legacy cache to migrate", env.config.alias);
        return Ok(());
    }

    if std::fs::File::open(legacy).is_err() {
        return Ok(());
    }

    info!("Migrating legacy cache {}", legacy.display());
    std::fs::remove_file(legacy).map_err(|e| Error::LegacyCacheDeletionFailed(e.to_string()))?;

    env.cache.create()?;
    let scanned = env.engine.latest_scanned_height().await?.unwrap_or(0);
    env.progress
        .set(ProgressKey::LatestDownloadedBlockHeight, scanned)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::{ctx_in, env_with};
    use crate::testing::{synthetic_block, MockWorld};
    use zsync_params::Network;

    #[tokio::test]
    async fn test_no_legacy_path_is_noop() {
        let world = MockWorld::new(Network::testnet(), 2_000_000);
        let (_dir, env) = env_with(&world, |_| {});

        let ctx = run(&env, ctx_in(State::Idle, State::MigrateLegacyCacheDb))
            .await
            .unwrap();
        assert_eq!(ctx.state(), State::ValidateServer);
        assert_eq!(world.engine.metadata_db_inits(), 1);
    }

    #[tokio::test]
    async fn test_fresh_install_creates_cache() {
        let world = MockWorld::new(Network::testnet(), 2_000_000);
        let (_dir, env) = env_with(&world, |_| {});
        std::fs::remove_dir_all(&env.config.fs_block_cache_root).unwrap();
        assert!(env.cache.write(&[synthetic_block(1_000)]).is_err());

        let ctx = run(&env, ctx_in(State::Idle, State::MigrateLegacyCacheDb))
            .await
            .unwrap();
        assert_eq!(ctx.state(), State::ValidateServer);
        assert!(env.config.fs_block_cache_root.exists());
        env.cache.write(&[synthetic_block(1_000)]).unwrap();
        assert_eq!(env.cache.latest_height().unwrap(), 1_000);
    }

    #[tokio::test]
    async fn test_same_path_fails_without_mutation() {
        let world = MockWorld::new(Network::testnet(), 2_000_000);
        world.engine.set_scanned(Some(1_500_000));
        let (_dir, env) = env_with(&world, |config| {
            config.legacy_cache_db_path = Some(config.fs_block_cache_root.clone());
        });

        let err = run(&env, ctx_in(State::Idle, State::MigrateLegacyCacheDb))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CacheMigrationSameUrl));
        assert!(env.config.fs_block_cache_root.exists());
        assert_eq!(world.engine.metadata_db_inits(), 0);
        assert_eq!(env.progress.latest_downloaded_block_height().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_migrates_readable_legacy_cache() {
        let world = MockWorld::new(Network::testnet(), 2_000_000);
        world.engine.set_scanned(Some(1_500_000));
        let legacy_dir = tempfile::TempDir::new().unwrap();
        let legacy = legacy_dir.path().join("cache.db");
        std::fs::write(&legacy, b"legacy").unwrap();

        let (_dir, env) = env_with(&world, |config| {
            config.legacy_cache_db_path = Some(legacy.clone());
        });

        let ctx = run(&env, ctx_in(State::Idle, State::MigrateLegacyCacheDb))
            .await
            .unwrap();
        assert_eq!(ctx.state(), State::ValidateServer);
        assert!(!legacy.exists());
        assert_eq!(env.progress.latest_downloaded_block_height().unwrap(), 1_500_000);
    }

    #[tokio::test]
    async fn test_non_default_alias_skips() {
        let world = MockWorld::new(Network::testnet(), 2_000_000);
        let legacy_dir = tempfile::TempDir::new().unwrap();
        let legacy = legacy_dir.path().join("cache.db");
        std::fs::write(&legacy, b"legacy").unwrap();

        let (_dir, env) = env_with(&world, |config| {
            config.alias = "second".to_string();
            config.legacy_cache_db_path = Some(legacy.clone());
        });

        let ctx = run(&env, ctx_in(State::Idle, State::MigrateLegacyCacheDb))
            .await
            .unwrap();
        assert_eq!(ctx.state(), State::ValidateServer);
        assert!(legacy.exists());
    }
}
