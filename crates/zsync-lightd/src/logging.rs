//! Structured logging of sync events
//!
//! Turns processor events into `tracing` records with stable `event` fields
//! and keeps a short history for diagnostics.

use crate::events::SyncEvent;
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Events kept in the history
pub const HISTORY_CAPACITY: usize = 512;

/// Output format of [`init_logging`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Install a global subscriber filtered by `RUST_LOG` (default `info`)
///
/// Does nothing if a subscriber is already installed.
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    let installed = match format {
        LogFormat::Text => builder.try_init().is_ok(),
        LogFormat::Json => builder
            .json()
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .is_ok(),
    };
    if installed {
        debug!("Sync logging initialized ({:?})", format);
    }
}

/// Logs sync events and remembers the latest ones
#[derive(Debug, Default)]
pub struct SyncLogger {
    history: VecDeque<SyncEvent>,
}

impl SyncLogger {
    /// Empty logger
    pub fn new() -> Self {
        Self::default()
    }

    /// Log `event` and add it to the history
    pub fn log(&mut self, event: SyncEvent) {
        match &event {
            SyncEvent::StartedSyncing => info!(event = event.name(), "Sync started"),
            SyncEvent::ProgressUpdated(progress) => debug!(
                event = event.name(),
                start_height = progress.start_height,
                target_height = progress.target_height,
                progress_height = progress.progress_height,
                percent = progress.progress() * 100.0,
                "Sync progress"
            ),
            SyncEvent::FoundTransactions { transactions, range } => info!(
                event = event.name(),
                count = transactions.len(),
                from = *range.start(),
                to = *range.end(),
                "Found wallet transactions"
            ),
            SyncEvent::MinedTransaction(tx) => info!(
                event = event.name(),
                txid = %hex::encode(&tx.txid),
                height = ?tx.mined_height,
                "Transaction mined"
            ),
            SyncEvent::StoredUtxos(result) => info!(
                event = event.name(),
                inserted = result.inserted.len(),
                skipped = result.skipped.len(),
                "Stored transparent UTXOs"
            ),
            SyncEvent::HandledReorg {
                reorg_height,
                rewind_height,
            } => warn!(
                event = event.name(),
                reorg_height, rewind_height, "Handled chain reorg"
            ),
            SyncEvent::Finished { last_scanned_height } => info!(
                event = event.name(),
                last_scanned_height, "Sync finished"
            ),
            SyncEvent::Failed { kind, message } => error!(
                event = event.name(),
                kind = ?kind,
                error = %message,
                "Sync failed"
            ),
            other => debug!(event = other.name(), "Sync event"),
        }

        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(event);
    }

    /// Logged events, oldest first
    pub fn history(&self) -> impl Iterator<Item = &SyncEvent> {
        self.history.iter()
    }

    /// Number of remembered events
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Whether nothing was logged yet
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Forget the history
    pub fn clear(&mut self) {
        self.history.clear();
    }
}

/// Log every event received on `events` until the channel closes
///
/// Returns the logger with its history once the sender side is gone.
pub fn spawn_event_logger(mut events: broadcast::Receiver<SyncEvent>) -> JoinHandle<SyncLogger> {
    tokio::spawn(async move {
        let mut logger = SyncLogger::new();
        loop {
            match events.recv().await {
                Ok(event) => logger.log(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Event logger lagged, {} events missed", missed)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        logger
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::model::BlockProgress;

    #[test]
    fn test_history_is_bounded() {
        let mut logger = SyncLogger::new();
        assert!(logger.is_empty());
        for _ in 0..HISTORY_CAPACITY + 10 {
            logger.log(SyncEvent::StartedSyncing);
        }
        logger.log(SyncEvent::Finished {
            last_scanned_height: 42,
        });

        assert_eq!(logger.len(), HISTORY_CAPACITY);
        assert_eq!(
            logger.history().last(),
            Some(&SyncEvent::Finished {
                last_scanned_height: 42
            })
        );

        logger.clear();
        assert!(logger.is_empty());
    }

    #[tokio::test]
    async fn test_spawned_logger_collects_until_closed() {
        let bus = EventBus::new();
        let handle = spawn_event_logger(bus.subscribe());

        bus.emit(SyncEvent::StartedSyncing);
        bus.emit(SyncEvent::ProgressUpdated(BlockProgress {
            start_height: 0,
            target_height: 10,
            progress_height: 5,
        }));
        drop(bus);

        let logger = handle.await.unwrap();
        assert_eq!(logger.len(), 2);
        assert_eq!(logger.history().next(), Some(&SyncEvent::StartedSyncing));
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging(LogFormat::Text);
        init_logging(LogFormat::Json);
    }
}
