//! Validation of an ordered run of primary blocks: hash and height linkage, difficulty
//! progression, total distance accounting and per-chain header continuity.

use bc_common::child_headers::is_linked;
use bc_common::difficulty::formula_difficulty;
use bc_common::{
    Block, ChainId, ChildHeader, ConsensusParams, ScheduleEntry, ScheduleOperation,
    ValidationReport,
};
use dashu_int::IBig;
use tracing::debug;

/// Blocks below this height are exempt from the difficulty check
const DIFFICULTY_CHECK_HEIGHT: u64 = 4;

/// Validate a run of at least two blocks, given in any order.
///
/// Linkage, difficulty and distance failures are outright. Header continuity
/// failures instead schedule the offending chain for a later re-check at the
/// parent's height, and the run is reported invalid with those schedules.
pub fn validate_sequence(
    blocks: &[&Block],
    mount: Option<&Block>,
    params: &ConsensusParams,
) -> ValidationReport {
    if blocks.len() < 2 {
        debug!(count = blocks.len(), "Sequence too short to validate");
        return ValidationReport::invalid();
    }

    let mut sorted = blocks.to_vec();
    sorted.sort_by(|a, b| b.height.cmp(&a.height));
    let edge = sorted[0];

    for pair in sorted.windows(2) {
        let (higher, lower) = (pair[0], pair[1]);
        if higher.previous_hash != lower.hash {
            debug!(
                height = higher.height,
                previous = %higher.previous_hash,
                lower = %lower.hash,
                "Sequence is not linked"
            );
            return ValidationReport::invalid();
        }
        if lower.height.checked_add(1) != Some(higher.height) {
            debug!(
                height = higher.height,
                parent = lower.height,
                "Sequence heights are not contiguous"
            );
            return ValidationReport::invalid();
        }
    }

    for pair in sorted.windows(2).rev() {
        let (higher, lower) = (pair[0], pair[1]);
        if !validate_difficulty(params, lower, higher) {
            debug!(height = higher.height, "Difficulty does not follow from parent");
            return ValidationReport::invalid();
        }
        if !validate_total_distance(params, lower, higher) {
            debug!(height = higher.height, "Total distance does not follow from parent");
            return ValidationReport::invalid();
        }
    }

    let mut schedules = Vec::new();
    for pair in sorted.windows(2) {
        let (child, parent) = (pair[0], pair[1]);
        for chain in ChainId::CHILDREN {
            let mount_headers = mount.map(|m| m.headers(chain));
            if !headers_are_chain(child.headers(chain), parent.headers(chain), mount_headers) {
                debug!(%chain, height = child.height, "Headers do not continue from parent");
                schedules.push(ScheduleEntry {
                    height: parent.height,
                    operation: ScheduleOperation::ExtendMultiverse,
                    reference_chain: ChainId::Primary,
                    reference_hash: edge.hash,
                    target_chain: chain,
                });
            }
        }
    }

    ValidationReport {
        valid: schedules.is_empty(),
        schedules,
    }
}

/// Difficulty of `next` must be the formula result on top of `previous`,
/// unless that result falls below the floor
pub fn validate_difficulty(params: &ConsensusParams, previous: &Block, next: &Block) -> bool {
    if next.height < DIFFICULTY_CHECK_HEIGHT {
        return true;
    }

    let result = formula_difficulty(previous, next);
    if result < IBig::from(params.min_difficulty.clone()) {
        return true;
    }
    IBig::from(next.difficulty.clone()) == result
}

pub fn validate_total_distance(params: &ConsensusParams, previous: &Block, next: &Block) -> bool {
    if params.in_soft_launch(next.height, next.timestamp) {
        return true;
    }
    next.total_distance == &next.distance + &previous.total_distance
}

/// Whether a child chain's headers in a block continue from those in its
/// parent, optionally bridging through a mount block's headers
pub fn headers_are_chain(
    child: &[ChildHeader],
    parent: &[ChildHeader],
    mount: Option<&[ChildHeader]>,
) -> bool {
    let (Some(first), Some(last), Some(last_parent)) = (child.first(), child.last(), parent.last())
    else {
        return false;
    };

    let extends = first.previous_hash == last_parent.hash;
    let repeats = child.len() == 1 && first.hash == last_parent.hash;
    let bridged = child.len() > 2
        && mount.is_some_and(|m| m.iter().any(|h| h.hash == first.previous_hash))
        && first.height < last_parent.height
        && last_parent.height < last.height
        && first.previous_hash != last_parent.previous_hash
        && first.hash != last_parent.previous_hash;
    let uncle = child.len() == 1
        && first.height == last_parent.height
        && first.hash != last_parent.hash
        && first.previous_hash == last_parent.previous_hash;

    if !(extends || repeats || bridged || uncle) {
        return false;
    }

    if child.len() > 1 {
        return is_linked(child) && is_linked(parent) && mount.map_or(true, is_linked);
    }
    true
}
