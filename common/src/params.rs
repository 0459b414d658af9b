//! Consensus parameters, read from configuration with fixed defaults

use config::Config;
use dashu_int::UBig;

pub const DEFAULT_MIN_DIFFICULTY: u64 = 290_112_262_029_012;
pub const DEFAULT_SOFT_LAUNCH_HEIGHT: u64 = 151_000;
pub const DEFAULT_SOFT_LAUNCH_TIMESTAMP: u64 = 1_552_518_000; // seconds
pub const DEFAULT_CANDIDATE_LENGTH: usize = 24;
pub const DEFAULT_REORG_FETCH_SPAN: u64 = 10;
pub const DEFAULT_REORG_GAP_THRESHOLD: u64 = 6;
pub const DEFAULT_REORG_MIN_DEPTH: u64 = 3;
pub const DEFAULT_MOUNT_SEARCH_DEPTH: u64 = 16;
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 1_048_576;
pub const DEFAULT_COINBASE_SIZE_ESTIMATE: usize = 512;
pub const DEFAULT_BASE_NRG_GRANT: u64 = 1_600_000_000;
pub const DEFAULT_MAX_NRG_SUPPLY: u64 = 980_000_000_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusParams {
    /// Difficulty floor; formula results below it are accepted as-is
    pub min_difficulty: UBig,

    /// Total distance is not enforced below this height ...
    pub soft_launch_height: u64,

    /// ... while the block timestamp is also before this time
    pub soft_launch_timestamp: u64,

    /// Accept blocks by total distance only, without requiring hash extension
    pub naive_mode: bool,

    /// Blocks retained in the candidate chain
    pub candidate_length: usize,

    /// Width of the window opened while a reorg is already in progress
    pub reorg_fetch_span: u64,

    /// Height gap above which branch windows widen
    pub reorg_gap_threshold: u64,

    /// Local depth required before an active reorg short-circuits evaluation
    pub reorg_min_depth: u64,

    /// How far back from latest to look for mount / root blocks
    pub mount_search_depth: u64,

    pub max_block_size: usize,
    pub coinbase_size_estimate: usize,
    pub base_nrg_grant: u64,
    pub max_nrg_supply: u64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            min_difficulty: UBig::from(DEFAULT_MIN_DIFFICULTY),
            soft_launch_height: DEFAULT_SOFT_LAUNCH_HEIGHT,
            soft_launch_timestamp: DEFAULT_SOFT_LAUNCH_TIMESTAMP,
            naive_mode: false,
            candidate_length: DEFAULT_CANDIDATE_LENGTH,
            reorg_fetch_span: DEFAULT_REORG_FETCH_SPAN,
            reorg_gap_threshold: DEFAULT_REORG_GAP_THRESHOLD,
            reorg_min_depth: DEFAULT_REORG_MIN_DEPTH,
            mount_search_depth: DEFAULT_MOUNT_SEARCH_DEPTH,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            coinbase_size_estimate: DEFAULT_COINBASE_SIZE_ESTIMATE,
            base_nrg_grant: DEFAULT_BASE_NRG_GRANT,
            max_nrg_supply: DEFAULT_MAX_NRG_SUPPLY,
        }
    }
}

fn get_u64(config: &Config, key: &str, default: u64) -> u64 {
    config.get_int(key).ok().and_then(|v| u64::try_from(v).ok()).unwrap_or(default)
}

impl ConsensusParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_difficulty: UBig::from(get_u64(config, "min-difficulty", DEFAULT_MIN_DIFFICULTY)),
            soft_launch_height: get_u64(config, "soft-launch-height", DEFAULT_SOFT_LAUNCH_HEIGHT),
            soft_launch_timestamp: get_u64(
                config,
                "soft-launch-timestamp",
                DEFAULT_SOFT_LAUNCH_TIMESTAMP,
            ),
            naive_mode: config.get_bool("naive-mode").unwrap_or(false),
            candidate_length: get_u64(
                config,
                "candidate-length",
                DEFAULT_CANDIDATE_LENGTH as u64,
            ) as usize,
            reorg_fetch_span: get_u64(config, "reorg-fetch-span", DEFAULT_REORG_FETCH_SPAN),
            reorg_gap_threshold: get_u64(
                config,
                "reorg-gap-threshold",
                DEFAULT_REORG_GAP_THRESHOLD,
            ),
            reorg_min_depth: get_u64(config, "reorg-min-depth", DEFAULT_REORG_MIN_DEPTH),
            mount_search_depth: get_u64(config, "mount-search-depth", DEFAULT_MOUNT_SEARCH_DEPTH),
            max_block_size: get_u64(config, "max-block-size", DEFAULT_MAX_BLOCK_SIZE as u64)
                as usize,
            coinbase_size_estimate: get_u64(
                config,
                "coinbase-size-estimate",
                DEFAULT_COINBASE_SIZE_ESTIMATE as u64,
            ) as usize,
            base_nrg_grant: get_u64(config, "base-nrg-grant", DEFAULT_BASE_NRG_GRANT),
            max_nrg_supply: get_u64(config, "max-nrg-supply", DEFAULT_MAX_NRG_SUPPLY),
        }
    }

    /// True while total distance accounting is not yet enforced
    pub fn in_soft_launch(&self, height: u64, timestamp: u64) -> bool {
        height < self.soft_launch_height && timestamp < self.soft_launch_timestamp
    }

    /// Bytes available to non-coinbase transactions
    pub fn max_txs_size(&self) -> usize {
        self.max_block_size.saturating_sub(self.coinbase_size_estimate)
    }
}
