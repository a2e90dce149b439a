//! Heights, ranges and the data the sync loop carries between actions

use std::cmp::Ordering;
use std::ops::{Range, RangeInclusive};

/// Block height
pub type BlockHeight = u64;

/// Closed range of block heights
pub type CompactBlockRange = RangeInclusive<BlockHeight>;

/// Priority the scanning engine assigns to a range of blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScanPriority {
    /// Block ranges that are ignored have lowest priority
    Ignored,
    /// Block ranges that have already been scanned
    Scanned,
    /// Block ranges to be scanned to advance the fully-scanned height
    Historic,
    /// Block ranges adjacent to heights at which the user opened the wallet
    OpenAdjacent,
    /// Blocks that must be scanned to complete note commitment tree shards
    FoundNote,
    /// Blocks that must be scanned to complete the latest note commitment tree shard
    ChainTip,
    /// A previously scanned range that must be verified to check it is still in the main chain
    Verify,
}

impl ScanPriority {
    /// Decode the integer form used by the engine FFI (0 = ignored .. 6 = verify)
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Ignored,
            1 => Self::Scanned,
            2 => Self::Historic,
            3 => Self::OpenAdjacent,
            4 => Self::FoundNote,
            5 => Self::ChainTip,
            6 => Self::Verify,
            _ => return None,
        })
    }
}

/// A range of blocks suggested for scanning, `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRange {
    /// Half-open height range
    pub range: Range<BlockHeight>,
    /// Scan priority
    pub priority: ScanPriority,
}

impl ScanRange {
    /// Create a new scan range
    pub fn new(range: Range<BlockHeight>, priority: ScanPriority) -> Self {
        Self { range, priority }
    }

    /// Whether the range contains no blocks
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Number of blocks in the range
    pub fn len(&self) -> u64 {
        self.range.end.saturating_sub(self.range.start)
    }
}

impl PartialOrd for ScanRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScanRange {
    /// Higher priority first, then lower start height first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.range.start.cmp(&other.range.start))
            .then_with(|| self.range.end.cmp(&other.range.end))
    }
}

/// Sort scan ranges in processing order
pub fn sort_scan_ranges(ranges: &mut [ScanRange]) {
    ranges.sort();
}

/// Ranges of work for one linear sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRanges {
    /// Remote chain tip
    pub latest_block_height: BlockHeight,
    /// Blocks in the cache that were never scanned
    pub downloaded_but_unscanned_range: Option<CompactBlockRange>,
    /// Blocks to download and scan
    pub download_and_scan_range: Option<CompactBlockRange>,
    /// Blocks whose transactions should be enhanced
    pub enhance_range: Option<CompactBlockRange>,
    /// Blocks whose transparent UTXOs should be fetched
    pub fetch_utxo_range: Option<CompactBlockRange>,
    /// Latest height the engine has scanned
    pub latest_scanned_height: Option<BlockHeight>,
    /// Latest height stored in the cache
    pub latest_downloaded_block_height: Option<BlockHeight>,
}

impl SyncRanges {
    /// Ranges for an empty wallet
    pub fn empty() -> Self {
        Self::default()
    }

    /// Range to download, if any
    pub fn download_range(&self) -> Option<CompactBlockRange> {
        self.download_and_scan_range.clone()
    }

    /// Range to scan
    ///
    /// Blocks cached but never scanned are dropped before a pass starts, so
    /// the scan range always coincides with the download range.
    pub fn scan_range(&self) -> Option<CompactBlockRange> {
        self.download_and_scan_range.clone()
    }
}

/// Control data for one spend-before-sync or linear pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncControlData {
    /// Remote chain tip
    pub latest_block_height: BlockHeight,
    /// Latest height the engine has scanned
    pub latest_scanned_height: Option<BlockHeight>,
    /// First height holding transactions that still need enhancing
    pub first_unenhanced_height: Option<BlockHeight>,
}

impl SyncControlData {
    /// Control data with nothing known
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Progress of a scan pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockProgress {
    /// First height of the pass
    pub start_height: BlockHeight,
    /// Last height of the pass
    pub target_height: BlockHeight,
    /// Height reached so far
    pub progress_height: BlockHeight,
}

impl BlockProgress {
    /// No progress
    pub const fn nul() -> Self {
        Self {
            start_height: 0,
            target_height: 0,
            progress_height: 0,
        }
    }

    /// Fraction of the pass completed in `[0, 1]`
    pub fn progress(&self) -> f64 {
        let overall = self.target_height.saturating_sub(self.start_height);
        if overall == 0 {
            return if self.progress_height >= self.target_height { 1.0 } else { 0.0 };
        }
        let done = self.progress_height.saturating_sub(self.start_height);
        (done as f64 / overall as f64).min(1.0)
    }
}

/// Preferred synchronization algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncAlgorithm {
    /// Download and scan strictly in height order
    #[default]
    Linear,
    /// Scan ranges in the engine's priority order so notes become spendable early
    SpendBeforeSync,
}

/// Intersection of two closed ranges, `None` when disjoint
pub fn intersect(a: &CompactBlockRange, b: &CompactBlockRange) -> Option<CompactBlockRange> {
    let start = (*a.start()).max(*b.start());
    let end = (*a.end()).min(*b.end());
    (start <= end).then_some(start..=end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(ScanPriority::Verify > ScanPriority::ChainTip);
        assert!(ScanPriority::ChainTip > ScanPriority::FoundNote);
        assert!(ScanPriority::Historic > ScanPriority::Scanned);
        assert!(ScanPriority::Scanned > ScanPriority::Ignored);
        assert_eq!(ScanPriority::from_code(6), Some(ScanPriority::Verify));
        assert_eq!(ScanPriority::from_code(7), None);
    }

    #[test]
    fn test_scan_range_sorting() {
        let mut ranges = vec![
            ScanRange::new(100..200, ScanPriority::Historic),
            ScanRange::new(300..310, ScanPriority::ChainTip),
            ScanRange::new(50..60, ScanPriority::ChainTip),
            ScanRange::new(400..410, ScanPriority::Verify),
        ];
        sort_scan_ranges(&mut ranges);

        assert_eq!(ranges[0].priority, ScanPriority::Verify);
        assert_eq!(ranges[1].range, 50..60);
        assert_eq!(ranges[2].range, 300..310);
        assert_eq!(ranges[3].priority, ScanPriority::Historic);
    }

    #[test]
    fn test_scan_range_follows_download() {
        let ranges = SyncRanges {
            latest_block_height: 2000,
            downloaded_but_unscanned_range: Some(1001..=1100),
            download_and_scan_range: Some(1101..=2000),
            ..Default::default()
        };
        assert_eq!(ranges.scan_range(), Some(1101..=2000));
        assert_eq!(SyncRanges::empty().download_range(), None);
    }

    #[test]
    fn test_block_progress() {
        let progress = BlockProgress {
            start_height: 1000,
            target_height: 2000,
            progress_height: 1500,
        };
        assert!((progress.progress() - 0.5).abs() < f64::EPSILON);
        assert_eq!(BlockProgress::nul().progress(), 1.0);
    }

    #[test]
    fn test_intersect() {
        assert_eq!(intersect(&(1..=10), &(5..=20)), Some(5..=10));
        assert_eq!(intersect(&(1..=4), &(5..=20)), None);
    }
}
