//! NRG grant arithmetic

use bc_common::ConsensusParams;

/// Grant owed to the miner of a block, capped by what is left of the supply
pub fn nrg_grant(params: &ConsensusParams, emblem_bonus: u64, minted_so_far: u64) -> u64 {
    let remaining = params.max_nrg_supply.saturating_sub(minted_so_far);
    params.base_nrg_grant.saturating_add(emblem_bonus).min(remaining)
}

/// Coinbase output value a block must carry, or None on overflow
pub fn coinbase_value(grant: u64, fees: u64) -> Option<u64> {
    grant.checked_add(fees)
}
