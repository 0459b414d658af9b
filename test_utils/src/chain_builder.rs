//! Builds primary blocks whose difficulty, total distance, chain root and
//! coinbase are all consistent with their parent, so tests only perturb the
//! field under test.

use bc_common::child_headers::{chain_root, highest_per_chain};
use bc_common::crypto::blake2b_256;
use bc_common::difficulty::expected_difficulty;
use bc_common::{
    Address, Block, ChainId, ChildHeader, ChildHeaderMap, ConsensusParams, Hash256, Transaction,
    TxOutput,
};
use dashu_int::UBig;
use std::collections::BTreeMap;

/// Genesis time, after the soft launch window so distance is enforced
pub const GENESIS_TIMESTAMP: u64 = 1_600_000_000;

/// Genesis difficulty, well above the test floor
pub const GENESIS_DIFFICULTY: u64 = 10_000_000;

/// Seconds between blocks unless overridden
pub const BLOCK_INTERVAL: u64 = 8;

/// Distance contributed per block unless overridden
pub const BLOCK_DISTANCE: u64 = 1_000;

/// Parameters with a low difficulty floor so the formula is exercised
pub fn test_params() -> ConsensusParams {
    ConsensusParams {
        min_difficulty: UBig::from(1_000u64),
        ..ConsensusParams::default()
    }
}

/// Deterministic hash of a child header identity
pub fn header_hash(chain: ChainId, height: u64, fork: u8) -> Hash256 {
    let chain_tag = [chain as u8];
    let height_bytes = height.to_be_bytes();
    let fork_tag = [fork];
    blake2b_256([
        b"header".as_slice(),
        chain_tag.as_slice(),
        height_bytes.as_slice(),
        fork_tag.as_slice(),
    ])
}

/// A child header at `height` on fork `fork`, linked to `previous_hash`
pub fn child_header(chain: ChainId, height: u64, fork: u8, previous_hash: Hash256) -> ChildHeader {
    ChildHeader {
        chain,
        height,
        hash: header_hash(chain, height, fork),
        previous_hash,
        timestamp: GENESIS_TIMESTAMP * 1_000 + height * 1_000,
        merkle_root: Hash256::default(),
        confirmations_in_parent: 1,
    }
}

/// `count` linked headers following `after`
pub fn header_run(after: &ChildHeader, count: u64, fork: u8) -> Vec<ChildHeader> {
    let mut run = Vec::new();
    let mut previous = after.hash;
    for height in after.height + 1..=after.height + count {
        let header = child_header(after.chain, height, fork, previous);
        previous = header.hash;
        run.push(header);
    }
    run
}

/// Coinbase paying `value` to `miner`
pub fn coinbase(height: u64, fork: u8, miner: &Address, value: u64) -> Transaction {
    let height_bytes = height.to_be_bytes();
    let fork_tag = [fork];
    Transaction {
        hash: blake2b_256([
            b"coinbase".as_slice(),
            height_bytes.as_slice(),
            fork_tag.as_slice(),
        ]),
        inputs: Vec::new(),
        outputs: vec![TxOutput {
            value,
            lock_script: miner.to_vec(),
        }],
    }
}

/// Recompute the chain root after editing child headers by hand
pub fn reseal(block: &mut Block) {
    block.chain_root = chain_root(&block.child_headers);
}

#[derive(Debug, Clone)]
pub struct ChainBuilder {
    pub params: ConsensusParams,
    pub miner: Address,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new(test_params())
    }
}

impl ChainBuilder {
    pub fn new(params: ConsensusParams) -> Self {
        Self {
            params,
            miner: Address::new([7u8; 20]),
        }
    }

    /// Height 1 block with one header per child chain and no transactions
    pub fn genesis(&self) -> Block {
        let child_headers: ChildHeaderMap = ChainId::CHILDREN
            .iter()
            .map(|chain| (*chain, vec![child_header(*chain, 1, 0, Hash256::default())]))
            .collect();
        Block {
            height: 1,
            hash: blake2b_256([b"genesis".as_slice()]),
            previous_hash: Hash256::default(),
            timestamp: GENESIS_TIMESTAMP,
            miner: self.miner,
            difficulty: UBig::from(GENESIS_DIFFICULTY),
            distance: UBig::from(BLOCK_DISTANCE),
            total_distance: UBig::from(BLOCK_DISTANCE),
            chain_root: chain_root(&child_headers),
            merkle_root: Hash256::default(),
            nrg_grant: 0,
            child_headers,
            txs: Vec::new(),
        }
    }

    /// Start a block on top of `parent`
    pub fn child<'a>(&'a self, parent: &Block) -> BlockDraft<'a> {
        BlockDraft {
            builder: self,
            parent: parent.clone(),
            timestamp: parent.timestamp + BLOCK_INTERVAL,
            advance: ChainId::CHILDREN.iter().map(|chain| (*chain, 1)).collect(),
            fork: 0,
            distance: BLOCK_DISTANCE,
            txs: Vec::new(),
            fees: 0,
            nrg_grant: None,
            coinbase_value: None,
            difficulty: None,
        }
    }

    /// Genesis followed by `length - 1` children, ascending by height
    pub fn chain(&self, length: usize) -> Vec<Block> {
        let mut blocks = vec![self.genesis()];
        while blocks.len() < length {
            let next = match blocks.last() {
                Some(parent) => self.child(parent).build(),
                None => break,
            };
            blocks.push(next);
        }
        blocks
    }
}

/// A block under construction
pub struct BlockDraft<'a> {
    builder: &'a ChainBuilder,
    parent: Block,
    timestamp: u64,
    advance: BTreeMap<ChainId, u64>,
    fork: u8,
    distance: u64,
    txs: Vec<Transaction>,
    fees: u64,
    nrg_grant: Option<u64>,
    coinbase_value: Option<u64>,
    difficulty: Option<UBig>,
}

impl BlockDraft<'_> {
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// New headers embedded for `chain`; zero re-reports the parent's last header
    pub fn advance(mut self, chain: ChainId, count: u64) -> Self {
        self.advance.insert(chain, count);
        self
    }

    /// Tag distinguishing sibling branches
    pub fn fork(mut self, fork: u8) -> Self {
        self.fork = fork;
        self
    }

    pub fn distance(mut self, distance: u64) -> Self {
        self.distance = distance;
        self
    }

    /// Add a non-coinbase transaction paying `fee`
    pub fn tx(mut self, tx: Transaction, fee: u64) -> Self {
        self.txs.push(tx);
        self.fees += fee;
        self
    }

    pub fn nrg_grant(mut self, grant: u64) -> Self {
        self.nrg_grant = Some(grant);
        self
    }

    pub fn coinbase_value(mut self, value: u64) -> Self {
        self.coinbase_value = Some(value);
        self
    }

    pub fn difficulty(mut self, difficulty: u64) -> Self {
        self.difficulty = Some(UBig::from(difficulty));
        self
    }

    pub fn build(self) -> Block {
        let parent = &self.parent;
        let height = parent.height + 1;
        let highest = highest_per_chain(parent);

        let mut child_headers = ChildHeaderMap::new();
        for (chain, count) in &self.advance {
            let Some(last) = highest.get(chain) else {
                continue;
            };
            let headers = if *count == 0 {
                vec![last.clone()]
            } else {
                let mut run = header_run(last, *count, self.fork);
                for header in &mut run {
                    header.timestamp = self.timestamp * 1_000;
                }
                run
            };
            child_headers.insert(*chain, headers);
        }

        let grant = self.nrg_grant.unwrap_or(self.builder.params.base_nrg_grant);
        let mut txs = vec![coinbase(
            height,
            self.fork,
            &self.builder.miner,
            self.coinbase_value.unwrap_or(grant + self.fees),
        )];
        txs.extend(self.txs);

        let height_bytes = height.to_be_bytes();
        let fork_tag = [self.fork];
        let timestamp_bytes = self.timestamp.to_be_bytes();
        let hash = blake2b_256([
            b"block".as_slice(),
            height_bytes.as_slice(),
            parent.hash.as_ref(),
            fork_tag.as_slice(),
            timestamp_bytes.as_slice(),
        ]);
        let merkle_root = blake2b_256(txs.iter().map(|tx| tx.hash.as_ref()));

        let mut block = Block {
            height,
            hash,
            previous_hash: parent.hash,
            timestamp: self.timestamp,
            miner: self.builder.miner,
            difficulty: UBig::ZERO,
            distance: UBig::from(self.distance),
            total_distance: &parent.total_distance + UBig::from(self.distance),
            chain_root: chain_root(&child_headers),
            merkle_root,
            nrg_grant: grant,
            child_headers,
            txs,
        };
        block.difficulty = match self.difficulty {
            Some(difficulty) => difficulty,
            None => expected_difficulty(&self.builder.params, parent, &block),
        };
        block
    }
}
