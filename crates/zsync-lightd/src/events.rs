//! Processor events and the derived status snapshot

use crate::engine::WalletTransaction;
use crate::enhancer::EnhancementProgress;
use crate::error::ErrorKind;
use crate::model::{BlockHeight, BlockProgress, CompactBlockRange};
use crate::utxo::UtxoFetchResult;
use crate::Error;
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Capacity of the event channel; slow subscribers miss older events
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something observable happened during sync
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A pass started
    StartedSyncing,
    /// Scan progress moved
    ProgressUpdated(BlockProgress),
    /// Enhancement found wallet transactions
    FoundTransactions {
        /// Transactions found
        transactions: Vec<WalletTransaction>,
        /// Range they were found in
        range: CompactBlockRange,
    },
    /// A previously unmined wallet transaction was mined
    MinedTransaction(WalletTransaction),
    /// Transparent UTXOs were refreshed
    StoredUtxos(UtxoFetchResult),
    /// Enhancement started
    StartedEnhancing,
    /// Enhancement made progress
    EnhancementProgress(EnhancementProgress),
    /// UTXO fetching started
    StartedFetching,
    /// A reorg was detected and the wallet rewound
    HandledReorg {
        /// Height of the detected discontinuity
        reorg_height: BlockHeight,
        /// Height the wallet was rewound to
        rewind_height: BlockHeight,
    },
    /// The pass was stopped on request
    Stopped,
    /// The pass finished
    Finished {
        /// Latest scanned height at the end of the pass
        last_scanned_height: BlockHeight,
    },
    /// The pass failed
    Failed {
        /// Failure class
        kind: ErrorKind,
        /// Failure message
        message: String,
    },
}

impl SyncEvent {
    /// Failure event for `error`
    pub fn failed(error: &Error) -> Self {
        SyncEvent::Failed {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// Short stable name, used as the `event` field in logs
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::StartedSyncing => "started_syncing",
            SyncEvent::ProgressUpdated(_) => "progress_updated",
            SyncEvent::FoundTransactions { .. } => "found_transactions",
            SyncEvent::MinedTransaction(_) => "mined_transaction",
            SyncEvent::StoredUtxos(_) => "stored_utxos",
            SyncEvent::StartedEnhancing => "started_enhancing",
            SyncEvent::EnhancementProgress(_) => "enhancement_progress",
            SyncEvent::StartedFetching => "started_fetching",
            SyncEvent::HandledReorg { .. } => "handled_reorg",
            SyncEvent::Stopped => "stopped",
            SyncEvent::Finished { .. } => "finished",
            SyncEvent::Failed { .. } => "failed",
        }
    }
}

/// Processor status as seen by the wallet
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    /// Never started
    Unprepared,
    /// Syncing; progress in `[0, 1]`
    Syncing(f64),
    /// Enhancing transactions
    Enhancing,
    /// Fetching transparent UTXOs
    Fetching,
    /// Up to date with the chain tip
    Synced,
    /// Stopped on request
    Stopped,
    /// Server unreachable
    Disconnected,
    /// Failed with the given message
    Error(String),
}

impl SyncStatus {
    /// Whether a pass is running
    pub fn is_syncing(&self) -> bool {
        matches!(self, SyncStatus::Syncing(_) | SyncStatus::Enhancing | SyncStatus::Fetching)
    }

    fn after(&self, event: &SyncEvent) -> Option<SyncStatus> {
        match event {
            SyncEvent::StartedSyncing => Some(SyncStatus::Syncing(0.0)),
            SyncEvent::ProgressUpdated(progress) => Some(SyncStatus::Syncing(progress.progress())),
            SyncEvent::StartedEnhancing => Some(SyncStatus::Enhancing),
            SyncEvent::StartedFetching => Some(SyncStatus::Fetching),
            SyncEvent::Stopped => Some(SyncStatus::Stopped),
            SyncEvent::Finished { .. } => Some(SyncStatus::Synced),
            SyncEvent::Failed { kind: ErrorKind::Connectivity, .. } => Some(SyncStatus::Disconnected),
            SyncEvent::Failed { message, .. } => Some(SyncStatus::Error(message.clone())),
            _ => None,
        }
    }
}

/// Fan-out of events plus the latest status
#[derive(Clone)]
pub struct EventBus {
    events: broadcast::Sender<SyncEvent>,
    status: watch::Sender<SyncStatus>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with status `Unprepared`
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(SyncStatus::Unprepared);
        Self { events, status }
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Watch the status
    pub fn status_receiver(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Current status
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Emit `event` and update the status it implies
    pub fn emit(&self, event: SyncEvent) {
        let next = self.status.borrow().after(&event);
        if let Some(next) = next {
            self.status.send_replace(next);
        }
        debug!(event = event.name(), "Sync event");
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_updates_status() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert_eq!(bus.status(), SyncStatus::Unprepared);

        bus.emit(SyncEvent::StartedSyncing);
        assert!(bus.status().is_syncing());

        bus.emit(SyncEvent::ProgressUpdated(BlockProgress {
            start_height: 1_000,
            target_height: 2_000,
            progress_height: 1_500,
        }));
        assert_eq!(bus.status(), SyncStatus::Syncing(0.5));

        bus.emit(SyncEvent::Finished {
            last_scanned_height: 2_000,
        });
        assert_eq!(bus.status(), SyncStatus::Synced);

        assert_eq!(rx.recv().await.unwrap(), SyncEvent::StartedSyncing);
    }

    #[test]
    fn test_failure_status() {
        let bus = EventBus::new();
        bus.emit(SyncEvent::failed(&Error::Connection("refused".into())));
        assert_eq!(bus.status(), SyncStatus::Disconnected);

        bus.emit(SyncEvent::failed(&Error::UnknownChainName("regtest".into())));
        assert!(matches!(bus.status(), SyncStatus::Error(_)));
    }
}
