//! Difficulty retarget formula shared by validation and block building

use crate::child_headers::{new_block_count, newest_child_header};
use crate::params::ConsensusParams;
use crate::types::{Block, ChildHeader};
use dashu_int::{IBig, UBig};

/// Heights per exponential difficulty period
pub const EXP_DIFF_PERIOD: u64 = 66_000_000;

/// Target seconds between primary blocks
const TARGET_TIME_WINDOW: i64 = 8;

/// Seconds credited per newly embedded child block
const NEW_BLOCK_TIME_OFFSET: i64 = 4;

/// Lower bound on the per-block adjustment multiplier
const MIN_ADJUSTMENT: i64 = -99;

/// Adjustment step is previous difficulty over this
const DIFFICULTY_BOUND_DIVISOR: u64 = 148;

/// Exponential bonus added on top of the pre-exponential difficulty
pub fn exp_factor(height: u64) -> UBig {
    let period_count = height.saturating_add(1) / EXP_DIFF_PERIOD;
    if period_count > 2 {
        UBig::ONE << ((period_count - 2) as usize)
    } else {
        UBig::ZERO
    }
}

fn seconds(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Retarget `previous`'s difficulty for a block sealed at `timestamp`.
///
/// Longer gaps lower the difficulty and shorter gaps raise it. Newly embedded
/// child blocks stretch the effective gap, and stale rover data (the newest
/// child header predating `previous`) eases it by one more step.
pub fn pre_exp_difficulty(
    timestamp: u64,
    previous: &Block,
    newest_child: Option<&ChildHeader>,
    new_block_count: u64,
) -> IBig {
    let exp = exp_factor(previous.height);
    let previous_pre_exp = if previous.difficulty > exp {
        &previous.difficulty - &exp
    } else {
        UBig::ZERO
    };

    let mut elapsed = seconds(timestamp).saturating_sub(seconds(previous.timestamp));
    let count = i64::try_from(new_block_count).unwrap_or(i64::MAX);
    let bonus = elapsed
        .saturating_add(elapsed.saturating_sub(NEW_BLOCK_TIME_OFFSET).saturating_mul(count));
    if bonus > 0 {
        elapsed = bonus;
    }

    let mut adjustment = 1 - elapsed / TARGET_TIME_WINDOW;
    let stale = newest_child.map(|h| h.timestamp / 1000 < previous.timestamp).unwrap_or(true);
    if stale {
        adjustment -= 1;
    }
    let adjustment = adjustment.max(MIN_ADJUSTMENT);

    let step = &previous_pre_exp / UBig::from(DIFFICULTY_BOUND_DIVISOR);
    IBig::from(previous_pre_exp) + IBig::from(step) * IBig::from(adjustment)
}

/// Unfloored difficulty the formula assigns to `next` on top of `previous`
pub fn formula_difficulty(previous: &Block, next: &Block) -> IBig {
    let count = if previous.height == 1 {
        1
    } else {
        new_block_count(previous, next)
    };
    let pre_exp = pre_exp_difficulty(next.timestamp, previous, newest_child_header(next), count);
    pre_exp + IBig::from(exp_factor(previous.height))
}

/// Difficulty a miner should seal `next` with: the formula result, floored
pub fn expected_difficulty(params: &ConsensusParams, previous: &Block, next: &Block) -> UBig {
    let result = formula_difficulty(previous, next);
    if result < IBig::from(params.min_difficulty.clone()) {
        return params.min_difficulty.clone();
    }
    UBig::try_from(result).unwrap_or_else(|_| params.min_difficulty.clone())
}
