//! Range arithmetic shared by the sync actions: batch windows, overall
//! progress ranges and the reorg rewind backoff.

use crate::model::{BlockHeight, CompactBlockRange, SyncRanges};
use zsync_params::Network;

/// Blocks rewound after the first detected reorg
pub const DEFAULT_REWIND_DISTANCE: u64 = 10;

/// Largest reorg the wallet is expected to survive
pub const MAX_REORG_SIZE: u64 = 100;

/// How far to rewind after repeated chain discontinuities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorgPolicy {
    /// Rewind distance for the first consecutive error
    pub rewind_distance: u64,
    /// Upper bound on the rewind distance
    pub max_reorg_size: u64,
}

impl Default for ReorgPolicy {
    fn default() -> Self {
        Self {
            rewind_distance: DEFAULT_REWIND_DISTANCE,
            max_reorg_size: MAX_REORG_SIZE,
        }
    }
}

impl ReorgPolicy {
    /// Height to rewind to after `consecutive_errors` discontinuities at `error_height`
    ///
    /// The distance doubles per consecutive error, is capped at
    /// `max_reorg_size` and never takes the result below `activation_height`.
    pub fn rewind_height(
        &self,
        error_height: BlockHeight,
        consecutive_errors: u32,
        activation_height: BlockHeight,
    ) -> BlockHeight {
        let factor = 1u64.checked_shl(consecutive_errors).unwrap_or(u64::MAX);
        let offset = self
            .rewind_distance
            .saturating_mul(factor)
            .min(self.max_reorg_size);
        error_height.saturating_sub(offset).max(activation_height)
    }
}

/// Rewind height with the default policy, floored at Sapling activation
pub fn determine_lower_bound(
    error_height: BlockHeight,
    consecutive_errors: u32,
    network: &Network,
) -> BlockHeight {
    ReorgPolicy::default().rewind_height(
        error_height,
        consecutive_errors,
        network.sapling_activation_height,
    )
}

/// Range covered by progress reporting for a linear pass
///
/// `0..=0` unless both a download and a scan range are pending.
pub fn compute_total_progress_range(ranges: &SyncRanges) -> CompactBlockRange {
    match (ranges.download_range(), ranges.scan_range()) {
        (Some(download), Some(scan)) => *download.start()..=*scan.end(),
        _ => 0..=0,
    }
}

/// Next batch window of `range` given the last scanned height
///
/// The window starts at `max(last_scanned, range.start())`, so the last
/// scanned block is included when it lies inside `range`, and covers up to
/// `batch_size` blocks above `last_scanned`. `None` once `last_scanned` has
/// reached the end of `range`.
pub fn scan_window(
    last_scanned: BlockHeight,
    batch_size: u64,
    range: &CompactBlockRange,
) -> Option<CompactBlockRange> {
    if last_scanned >= *range.end() {
        return None;
    }
    let start = last_scanned.max(*range.start());
    let first_unscanned = last_scanned.saturating_add(1).max(*range.start());
    let end = first_unscanned
        .saturating_add(batch_size.max(1) - 1)
        .min(*range.end());
    Some(start..=end)
}
