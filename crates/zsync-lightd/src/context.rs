//! Sync state machine states and the context carried between actions

use crate::model::{BlockHeight, CompactBlockRange, SyncAlgorithm, SyncControlData, SyncRanges};
use crate::Error;
use std::fmt;
use std::time::Instant;

/// Sync state machine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Not started
    Idle,
    /// Move away from the legacy single-file cache
    MigrateLegacyCacheDb,
    /// Check the server serves the expected chain
    ValidateServer,
    /// Reconcile cache contents with scan progress
    ChecksBeforeSync,
    /// Compute control data (spend-before-sync)
    ComputeSyncControlData,
    /// Compute linear sync ranges
    ComputeSyncRanges,
    /// Pick the next range from the engine's suggestions
    ProcessSuggestedScanRanges,
    /// Apply a requested rewind
    Rewind,
    /// Download the next batch
    Download,
    /// Validate cached blocks
    Validate,
    /// Scan the next batch
    Scan,
    /// Drop cached blocks that are scanned
    ClearAlreadyScannedBlocks,
    /// Enhance wallet transactions
    Enhance,
    /// Fetch transparent UTXOs
    FetchUtxo,
    /// Ensure Sapling parameters are present
    HandleSaplingParams,
    /// Load note commitment subtree roots
    UpdateSubtreeRoots,
    /// Push the chain tip into the engine
    UpdateChainTip,
    /// Clear the whole chain cache
    ClearCache,
    /// Resubmit unmined wallet transactions
    TxResubmission,
    /// Pass complete
    Finished,
    /// Pass failed
    Failed,
    /// Pass stopped on request
    Stopped,
}

impl State {
    /// Whether the loop ends in this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Finished | State::Failed | State::Stopped)
    }

    /// Whether `error` raised by this state's action may be retried
    ///
    /// Subtree root timeouts are final.
    pub fn may_retry(&self, error: &Error) -> bool {
        error.is_retryable() && !(*self == State::UpdateSubtreeRoots && error.is_timeout())
    }

    /// Whether a failure of this state's action clears the block cache
    pub fn removes_cache_on_failure(&self) -> bool {
        matches!(self, State::TxResubmission)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Cross-action state for one sync pass
///
/// Owned by the running action; every action takes the context by value and
/// returns it with the next state set.
#[derive(Debug, Clone)]
pub struct ActionContext {
    state: State,
    prev_state: Option<State>,
    /// Ranges for a linear pass
    pub sync_ranges: SyncRanges,
    /// Control data for the current pass
    pub sync_control_data: SyncControlData,
    /// Range progress is reported against
    pub total_progress_range: CompactBlockRange,
    /// Latest scanned height
    pub last_scanned_height: Option<BlockHeight>,
    /// Latest downloaded height
    pub last_downloaded_height: Option<BlockHeight>,
    /// Latest enhanced height; survives resets
    pub last_enhanced_height: Option<BlockHeight>,
    /// Last time the chain tip was pushed into the engine; survives resets
    pub last_chain_tip_update_time: Option<Instant>,
    /// Rewind requested by a `verify` scan range
    pub requested_rewind_height: Option<BlockHeight>,
    /// Algorithm used by this pass
    pub preferred_sync_algorithm: SyncAlgorithm,
}

impl ActionContext {
    /// Fresh context in `Idle`
    pub fn new(preferred_sync_algorithm: SyncAlgorithm) -> Self {
        Self {
            state: State::Idle,
            prev_state: None,
            sync_ranges: SyncRanges::empty(),
            sync_control_data: SyncControlData::empty(),
            total_progress_range: 0..=0,
            last_scanned_height: None,
            last_downloaded_height: None,
            last_enhanced_height: None,
            last_chain_tip_update_time: None,
            requested_rewind_height: None,
            preferred_sync_algorithm,
        }
    }

    /// Current state
    pub fn state(&self) -> State {
        self.state
    }

    /// State before the last transition
    pub fn prev_state(&self) -> Option<State> {
        self.prev_state
    }

    /// Transition to `state`, remembering the current one
    pub fn update_state(&mut self, state: State) {
        self.prev_state = Some(self.state);
        self.state = state;
    }

    /// Consume and transition, for action return values
    pub fn with_state(mut self, state: State) -> Self {
        self.update_state(state);
        self
    }

    /// Fresh context that keeps the cross-pass debounce markers
    pub fn reset(&self) -> Self {
        Self {
            last_enhanced_height: self.last_enhanced_height,
            last_chain_tip_update_time: self.last_chain_tip_update_time,
            ..Self::new(self.preferred_sync_algorithm)
        }
    }

    /// Whether this pass uses spend-before-sync
    pub fn is_spend_before_sync(&self) -> bool {
        self.preferred_sync_algorithm == SyncAlgorithm::SpendBeforeSync
    }

    /// Upper bound of the pending download/scan range
    pub fn scan_upper_bound(&self) -> Option<BlockHeight> {
        self.sync_ranges.scan_range().map(|range| *range.end())
    }

    /// Whether scanning reached the end of the pending range
    pub fn is_scanned_to_upper(&self) -> bool {
        match (self.scan_upper_bound(), self.last_scanned_height) {
            (None, _) => true,
            (Some(upper), Some(scanned)) => scanned >= upper,
            (Some(_), None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_records_previous() {
        let mut ctx = ActionContext::new(SyncAlgorithm::Linear);
        assert_eq!(ctx.state(), State::Idle);
        assert_eq!(ctx.prev_state(), None);

        ctx.update_state(State::MigrateLegacyCacheDb);
        ctx.update_state(State::ValidateServer);
        assert_eq!(ctx.state(), State::ValidateServer);
        assert_eq!(ctx.prev_state(), Some(State::MigrateLegacyCacheDb));
    }

    #[test]
    fn test_reset_keeps_debounce_markers() {
        let mut ctx = ActionContext::new(SyncAlgorithm::SpendBeforeSync);
        let now = Instant::now();
        ctx.last_enhanced_height = Some(1_500);
        ctx.last_chain_tip_update_time = Some(now);
        ctx.last_scanned_height = Some(2_000);
        ctx.requested_rewind_height = Some(1_900);
        ctx.update_state(State::Scan);

        let fresh = ctx.reset();
        assert_eq!(fresh.state(), State::Idle);
        assert_eq!(fresh.last_enhanced_height, Some(1_500));
        assert_eq!(fresh.last_chain_tip_update_time, Some(now));
        assert_eq!(fresh.last_scanned_height, None);
        assert_eq!(fresh.requested_rewind_height, None);
        assert!(fresh.is_spend_before_sync());
    }

    #[test]
    fn test_scanned_to_upper() {
        let mut ctx = ActionContext::new(SyncAlgorithm::Linear);
        assert!(ctx.is_scanned_to_upper());

        ctx.sync_ranges.download_and_scan_range = Some(1_001..=2_000);
        assert!(!ctx.is_scanned_to_upper());
        ctx.last_scanned_height = Some(1_999);
        assert!(!ctx.is_scanned_to_upper());
        ctx.last_scanned_height = Some(2_000);
        assert!(ctx.is_scanned_to_upper());
    }

    #[test]
    fn test_terminal_states() {
        assert!(State::Finished.is_terminal());
        assert!(State::Failed.is_terminal());
        assert!(State::Stopped.is_terminal());
        assert!(!State::Download.is_terminal());
        assert!(State::TxResubmission.removes_cache_on_failure());
        assert!(!State::Scan.removes_cache_on_failure());
    }

    #[test]
    fn test_retry_policy() {
        let timeout = Error::Timeout("slow".into());
        assert!(State::Download.may_retry(&timeout));
        assert!(!State::UpdateSubtreeRoots.may_retry(&timeout));
        assert!(State::UpdateSubtreeRoots.may_retry(&Error::Connection("reset".into())));
        assert!(!State::Scan.may_retry(&Error::InvalidChain(10)));
    }
}
