//! Height windows requested from the network before a branch switch

use bc_common::ConsensusParams;

/// Lowest height ever requested; genesis is fixed
const MIN_WINDOW_HEIGHT: u64 = 2;

/// Inclusive primary height range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpan {
    pub lowest: u64,
    pub highest: u64,
}

impl WindowSpan {
    fn new(lowest: u64, highest: u64) -> Self {
        Self {
            lowest: lowest.min(highest),
            highest,
        }
    }
}

/// Window for a block that extends the tip by hash but failed sequence
/// validation: one below the lower of the two heights up to the higher
pub fn extension_window(new_height: u64, latest_height: u64) -> WindowSpan {
    let lowest = new_height.min(latest_height).saturating_sub(1).max(MIN_WINDOW_HEIGHT);
    WindowSpan::new(lowest, new_height.max(latest_height))
}

/// Window for a stronger block on another branch. Spans at least one below
/// the lower height, widened by the whole gap when the heights are far apart.
pub fn branch_window(new_height: u64, latest_height: u64, params: &ConsensusParams) -> WindowSpan {
    let lowest = new_height.min(latest_height);
    let highest = new_height.max(latest_height);
    let gap = highest - lowest;

    let mut start = lowest.saturating_sub(1);
    if gap > params.reorg_gap_threshold {
        start = start.saturating_sub(gap);
    }
    WindowSpan::new(start.max(MIN_WINDOW_HEIGHT), highest)
}

/// Next slice to fetch while a reorg is already in progress
pub fn fetch_window(checkpoint: u64, params: &ConsensusParams) -> WindowSpan {
    let lowest = checkpoint.max(MIN_WINDOW_HEIGHT);
    WindowSpan::new(lowest, lowest.saturating_add(params.reorg_fetch_span))
}
