//! Block downloader
//!
//! A background task streams compact blocks from the server through a bounded
//! channel into the chain cache. The sync loop moves a download limit forward
//! and waits until the blocks it needs for the next batch are cached.

use crate::block_cache::ChainCache;
use crate::cancel::CancelToken;
use crate::engine::{BlockMeta, ScanningEngine};
use crate::model::{BlockHeight, CompactBlockRange};
use crate::proto_types as proto;
use crate::service::ChainDataService;
use crate::sync_progress::{InternalSyncProgress, ProgressKey};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Default number of blocks buffered between the stream and the cache writer
pub const DEFAULT_DOWNLOAD_BUFFER: usize = 10;

/// Downloader operations used by the sync actions
#[async_trait]
pub trait BlockDownloader: Send + Sync {
    /// Set the range the downloader works within
    fn set_sync_range(&self, range: CompactBlockRange, batch_size: u64);

    /// Overwrite the latest downloaded height
    fn update(&self, latest_downloaded_height: BlockHeight);

    /// Allow downloading up to `limit`
    fn set_download_limit(&self, limit: BlockHeight);

    /// Start the download task if it is not running
    fn start_download(&self, max_block_buffer_size: usize);

    /// Wait until every block of `range` is cached
    async fn wait_until_requested_blocks_are_downloaded(&self, range: CompactBlockRange) -> Result<()>;

    /// Stop the download task and wait for it to exit
    async fn stop_download(&self);

    /// Stop downloading and lower the latest downloaded height to `height`
    async fn rewind(&self, height: BlockHeight);

    /// Highest height written to the cache by this downloader
    fn latest_downloaded_height(&self) -> BlockHeight;
}

#[derive(Default)]
struct DownloadState {
    sync_range: Option<CompactBlockRange>,
    batch_size: u64,
    download_limit: BlockHeight,
    latest_downloaded: BlockHeight,
    last_error: Option<Error>,
}

impl DownloadState {
    fn next_range(&self) -> Option<CompactBlockRange> {
        let range = self.sync_range.as_ref()?;
        let from = self.latest_downloaded.saturating_add(1).max(*range.start());
        let to = (*range.end()).min(self.download_limit);
        (from <= to).then_some(from..=to)
    }
}

struct Inner {
    service: Arc<dyn ChainDataService>,
    cache: Arc<dyn ChainCache>,
    engine: Arc<dyn ScanningEngine>,
    progress: InternalSyncProgress,
    state: Mutex<DownloadState>,
    wake: Notify,
    signal: watch::Sender<u64>,
}

impl Inner {
    fn notify_waiters(&self) {
        self.signal.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    async fn run(self: Arc<Self>, buffer: usize, cancel: CancelToken) {
        debug!("Block download task started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let next = self.state.lock().next_range();
            let Some(range) = next else {
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = cancel.cancelled() => {}
                }
                continue;
            };

            let result = tokio::select! {
                res = self.download_range(range.clone(), buffer) => res,
                _ = cancel.cancelled() => break,
            };

            if let Err(e) = result {
                error!("Block download failed for {:?}: {}", range, e);
                self.state.lock().last_error = Some(e);
                self.notify_waiters();
                break;
            }
        }
        debug!("Block download task stopped");
    }

    async fn download_range(&self, range: CompactBlockRange, buffer: usize) -> Result<()> {
        let expected_end = *range.end();
        let buffer = buffer.max(1);
        let (tx, mut rx) = mpsc::channel::<proto::CompactBlock>(buffer);

        let producer = self.service.block_range(range.clone(), tx);
        let consumer = async move {
            let mut batch = Vec::with_capacity(buffer);
            while let Some(block) = rx.recv().await {
                batch.push(block);
                if batch.len() >= buffer {
                    self.store(std::mem::take(&mut batch)).await?;
                }
            }
            if !batch.is_empty() {
                self.store(batch).await?;
            }
            Ok::<_, Error>(())
        };

        let (produced, consumed) = tokio::join!(producer, consumer);
        consumed?;
        let sent = produced?;

        let latest = self.state.lock().latest_downloaded;
        if latest < expected_end {
            return Err(Error::Network(format!(
                "Stream for {:?} ended at {} after {} blocks",
                range, latest, sent
            )));
        }
        Ok(())
    }

    async fn store(&self, blocks: Vec<proto::CompactBlock>) -> Result<()> {
        let Some(last) = blocks.last().map(|b| b.height) else {
            return Ok(());
        };

        self.cache.write(&blocks)?;
        let metas: Vec<BlockMeta> = blocks.iter().map(BlockMeta::from).collect();
        self.engine.write_blocks_metadata(&metas).await?;
        self.progress.set(ProgressKey::LatestDownloadedBlockHeight, last)?;

        self.state.lock().latest_downloaded = last;
        self.notify_waiters();
        debug!("Cached {} blocks up to {}", blocks.len(), last);
        Ok(())
    }
}

struct RunningDownload {
    handle: JoinHandle<()>,
    cancel: CancelToken,
}

/// Downloader streaming from a [`ChainDataService`] into a [`ChainCache`]
pub struct StreamingBlockDownloader {
    inner: Arc<Inner>,
    running: Mutex<Option<RunningDownload>>,
}

impl StreamingBlockDownloader {
    /// Create a downloader; nothing runs until `start_download`
    pub fn new(
        service: Arc<dyn ChainDataService>,
        cache: Arc<dyn ChainCache>,
        engine: Arc<dyn ScanningEngine>,
        progress: InternalSyncProgress,
    ) -> Self {
        let (signal, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                service,
                cache,
                engine,
                progress,
                state: Mutex::new(DownloadState::default()),
                wake: Notify::new(),
                signal,
            }),
            running: Mutex::new(None),
        }
    }

    /// Whether the download task is alive
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Batch size of the current sync range
    pub fn batch_size(&self) -> u64 {
        self.inner.state.lock().batch_size
    }
}

#[async_trait]
impl BlockDownloader for StreamingBlockDownloader {
    fn set_sync_range(&self, range: CompactBlockRange, batch_size: u64) {
        let mut state = self.inner.state.lock();
        if state.sync_range.as_ref() != Some(&range) {
            let start = *range.start();
            if state.latest_downloaded.saturating_add(1) < start || state.latest_downloaded > *range.end() {
                state.latest_downloaded = start.saturating_sub(1);
            }
            debug!("Download sync range set to {:?}", range);
            state.sync_range = Some(range);
        }
        state.batch_size = batch_size;
        drop(state);
        self.inner.wake.notify_one();
    }

    fn update(&self, latest_downloaded_height: BlockHeight) {
        self.inner.state.lock().latest_downloaded = latest_downloaded_height;
        self.inner.notify_waiters();
    }

    fn set_download_limit(&self, limit: BlockHeight) {
        self.inner.state.lock().download_limit = limit;
        self.inner.wake.notify_one();
    }

    fn start_download(&self, max_block_buffer_size: usize) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }

        self.inner.state.lock().last_error = None;
        let cancel = CancelToken::new();
        let handle = tokio::spawn(self.inner.clone().run(max_block_buffer_size, cancel.clone()));
        *running = Some(RunningDownload { handle, cancel });
        info!("Block download started (buffer {})", max_block_buffer_size);
    }

    async fn wait_until_requested_blocks_are_downloaded(&self, range: CompactBlockRange) -> Result<()> {
        let mut rx = self.inner.signal.subscribe();
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.latest_downloaded >= *range.end() {
                    return Ok(());
                }
                if let Some(e) = state.last_error.take() {
                    return Err(e);
                }
            }
            if !self.is_running() {
                return Err(self.inner.state.lock().last_error.take().unwrap_or(Error::Cancelled));
            }
            if rx.changed().await.is_err() {
                return Err(Error::Cancelled);
            }
        }
    }

    async fn stop_download(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            let _ = running.handle.await;
            debug!("Block download stopped");
        }
        self.inner.notify_waiters();
    }

    async fn rewind(&self, height: BlockHeight) {
        self.stop_download().await;
        let mut state = self.inner.state.lock();
        state.latest_downloaded = state.latest_downloaded.min(height);
        state.sync_range = None;
    }

    fn latest_downloaded_height(&self) -> BlockHeight {
        self.inner.state.lock().latest_downloaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_cache::SqliteChainCache;
    use crate::error::ErrorKind;
    use crate::sync_progress::DEFAULT_ALIAS;
    use crate::testing::MockWorld;
    use tempfile::TempDir;
    use zsync_params::Network;
    use zsync_storage_sqlite::ProgressStore;

    struct Fixture {
        _dir: TempDir,
        world: MockWorld,
        cache: Arc<SqliteChainCache>,
        progress: InternalSyncProgress,
        downloader: StreamingBlockDownloader,
    }

    fn fixture(tip: BlockHeight) -> Fixture {
        let dir = TempDir::new().unwrap();
        let world = MockWorld::new(Network::regtest(), tip);
        let cache = Arc::new(SqliteChainCache::new(dir.path().join("cache")));
        cache.create().unwrap();
        let progress = InternalSyncProgress::new(DEFAULT_ALIAS, Arc::new(ProgressStore::in_memory().unwrap()));
        let downloader = StreamingBlockDownloader::new(
            world.service.clone(),
            cache.clone(),
            world.engine.clone(),
            progress.clone(),
        );
        Fixture {
            _dir: dir,
            world,
            cache,
            progress,
            downloader,
        }
    }

    #[tokio::test]
    async fn test_downloads_up_to_limit() {
        let f = fixture(500);
        f.downloader.set_sync_range(1..=500, 100);
        f.downloader.set_download_limit(120);
        f.downloader.start_download(DEFAULT_DOWNLOAD_BUFFER);

        f.downloader.wait_until_requested_blocks_are_downloaded(1..=100).await.unwrap();
        f.downloader.stop_download().await;

        assert_eq!(f.cache.latest_height().unwrap(), 120);
        assert_eq!(f.world.engine.metadata_tip(), 120);
        assert_eq!(f.progress.latest_downloaded_block_height().unwrap(), 120);
    }

    #[tokio::test]
    async fn test_raising_limit_resumes() {
        let f = fixture(500);
        f.downloader.set_sync_range(1..=500, 100);
        f.downloader.set_download_limit(50);
        f.downloader.start_download(DEFAULT_DOWNLOAD_BUFFER);
        f.downloader.wait_until_requested_blocks_are_downloaded(1..=50).await.unwrap();

        f.downloader.set_download_limit(300);
        f.downloader.wait_until_requested_blocks_are_downloaded(51..=300).await.unwrap();
        f.downloader.stop_download().await;

        assert_eq!(f.cache.latest_height().unwrap(), 300);
        let blocks = f.cache.load_range(1..=300).unwrap();
        assert_eq!(blocks.len(), 300);
    }

    #[tokio::test]
    async fn test_stream_failure_reaches_waiter() {
        let f = fixture(500);
        f.world.service.fail_block_ranges(1);
        f.downloader.set_sync_range(1..=500, 100);
        f.downloader.set_download_limit(100);
        f.downloader.start_download(DEFAULT_DOWNLOAD_BUFFER);

        let err = f
            .downloader
            .wait_until_requested_blocks_are_downloaded(1..=100)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
    }

    #[tokio::test]
    async fn test_stopped_downloader_cancels_waiters() {
        let f = fixture(500);
        f.downloader.set_sync_range(1..=500, 100);
        f.downloader.stop_download().await;

        let err = f
            .downloader
            .wait_until_requested_blocks_are_downloaded(1..=100)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_rewind_lowers_marker() {
        let f = fixture(500);
        f.downloader.set_sync_range(1..=500, 100);
        f.downloader.set_download_limit(200);
        f.downloader.start_download(DEFAULT_DOWNLOAD_BUFFER);
        f.downloader.wait_until_requested_blocks_are_downloaded(1..=200).await.unwrap();

        f.downloader.rewind(150).await;
        assert_eq!(f.downloader.latest_downloaded_height(), 150);
        assert!(!f.downloader.is_running());
    }
}
