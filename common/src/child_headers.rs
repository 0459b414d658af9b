//! Chain-local views over the child headers embedded in a primary block

use crate::crypto::blake2b_256;
use crate::hash::Hash256;
use crate::types::{Block, ChainId, ChildHeader, ChildHeaderMap};
use std::collections::BTreeMap;

/// One header per child chain
pub type HeaderSet = BTreeMap<ChainId, ChildHeader>;

/// Placeholder header used for blocks that embed nothing (genesis)
fn sentinel(chain: ChainId) -> ChildHeader {
    ChildHeader {
        chain,
        height: 1,
        hash: Hash256::default(),
        previous_hash: Hash256::default(),
        timestamp: 0,
        merkle_root: Hash256::default(),
        confirmations_in_parent: 0,
    }
}

fn sentinel_set() -> HeaderSet {
    ChainId::CHILDREN.iter().map(|chain| (*chain, sentinel(*chain))).collect()
}

/// Pick one header per chain, preferring later positions on ties
fn select_per_chain(block: &Block, prefer: impl Fn(u64, u64) -> bool) -> HeaderSet {
    if block.has_no_child_headers() {
        return sentinel_set();
    }

    let mut set = HeaderSet::new();
    for (chain, headers) in &block.child_headers {
        let mut best: Option<&ChildHeader> = None;
        for header in headers {
            match best {
                Some(current) if !prefer(header.height, current.height) => {}
                _ => best = Some(header),
            }
        }
        if let Some(header) = best {
            set.insert(*chain, header.clone());
        }
    }
    set
}

/// Highest header for every chain the block reports
pub fn highest_per_chain(block: &Block) -> HeaderSet {
    select_per_chain(block, |candidate, current| candidate >= current)
}

/// Lowest header for every chain the block reports
pub fn lowest_per_chain(block: &Block) -> HeaderSet {
    select_per_chain(block, |candidate, current| candidate <= current)
}

/// Sum of the highest header heights across all chains
pub fn height_sum(block: &Block) -> u64 {
    highest_per_chain(block).values().map(|h| h.height).sum()
}

/// Most recent child header by timestamp
pub fn newest_child_header(block: &Block) -> Option<&ChildHeader> {
    block.child_headers.values().flatten().max_by_key(|h| h.timestamp)
}

/// Number of child headers in `next` above what `previous` already reported
pub fn new_block_count(previous: &Block, next: &Block) -> u64 {
    let previous_highest = highest_per_chain(previous);
    next.child_headers
        .iter()
        .map(|(chain, headers)| {
            let floor = previous_highest.get(chain).map(|h| h.height).unwrap_or(0);
            headers.iter().filter(|h| h.height > floor).count() as u64
        })
        .sum()
}

/// Commitment over every embedded header hash, in chain order
pub fn chain_root(headers: &ChildHeaderMap) -> Hash256 {
    let hashes = ChainId::CHILDREN
        .iter()
        .filter_map(|chain| headers.get(chain))
        .flatten()
        .map(|h| h.hash.as_ref());
    blake2b_256(hashes)
}

/// True when a header list is strictly increasing by height
pub fn is_strictly_ascending(headers: &[ChildHeader]) -> bool {
    headers.windows(2).all(|pair| pair[0].height < pair[1].height)
}

/// True when every consecutive pair links by hash
pub fn is_linked(headers: &[ChildHeader]) -> bool {
    headers.windows(2).all(|pair| pair[0].hash == pair[1].previous_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Address;
    use dashu_int::UBig;

    fn header(chain: ChainId, height: u64, tag: u8) -> ChildHeader {
        ChildHeader {
            chain,
            height,
            hash: Hash256::new([tag; 32]),
            previous_hash: Hash256::new([tag.wrapping_sub(1); 32]),
            timestamp: height * 1_000,
            merkle_root: Hash256::default(),
            confirmations_in_parent: 1,
        }
    }

    fn block(headers: Vec<ChildHeader>) -> Block {
        let mut child_headers = ChildHeaderMap::new();
        for h in headers {
            child_headers.entry(h.chain).or_default().push(h);
        }
        Block {
            height: 2,
            hash: Hash256::new([9; 32]),
            previous_hash: Hash256::new([8; 32]),
            timestamp: 100,
            miner: Address::default(),
            difficulty: UBig::ONE,
            distance: UBig::ONE,
            total_distance: UBig::ONE,
            chain_root: Hash256::default(),
            merkle_root: Hash256::default(),
            nrg_grant: 0,
            child_headers,
            txs: Vec::new(),
        }
    }

    #[test]
    fn empty_block_yields_sentinels() {
        let b = block(Vec::new());
        let highest = highest_per_chain(&b);
        assert_eq!(highest.len(), 5);
        assert!(highest.values().all(|h| h.height == 1));
        assert_eq!(height_sum(&b), 5);
        assert_eq!(lowest_per_chain(&b).len(), 5);
    }

    #[test]
    fn highest_and_lowest_pick_extremes() {
        let b = block(vec![
            header(ChainId::Btc, 10, 1),
            header(ChainId::Btc, 12, 2),
            header(ChainId::Eth, 7, 3),
        ]);
        let highest = highest_per_chain(&b);
        let lowest = lowest_per_chain(&b);
        assert_eq!(highest[&ChainId::Btc].height, 12);
        assert_eq!(lowest[&ChainId::Btc].height, 10);
        assert_eq!(highest[&ChainId::Eth].height, 7);
        assert!(!highest.contains_key(&ChainId::Neo));
        assert_eq!(height_sum(&b), 19);
    }

    #[test]
    fn ties_prefer_later_position() {
        let b = block(vec![header(ChainId::Btc, 10, 1), header(ChainId::Btc, 10, 2)]);
        assert_eq!(highest_per_chain(&b)[&ChainId::Btc].hash, Hash256::new([2; 32]));
        assert_eq!(lowest_per_chain(&b)[&ChainId::Btc].hash, Hash256::new([2; 32]));
    }

    #[test]
    fn counts_only_headers_above_previous() {
        let previous = block(vec![header(ChainId::Btc, 10, 1), header(ChainId::Eth, 5, 2)]);
        let next = block(vec![
            header(ChainId::Btc, 10, 1),
            header(ChainId::Btc, 11, 3),
            header(ChainId::Btc, 12, 4),
            header(ChainId::Eth, 5, 2),
            header(ChainId::Neo, 3, 5),
        ]);
        assert_eq!(new_block_count(&previous, &next), 3);
    }

    #[test]
    fn newest_header_by_timestamp() {
        let b = block(vec![header(ChainId::Btc, 10, 1), header(ChainId::Eth, 40, 2)]);
        assert_eq!(newest_child_header(&b).map(|h| h.height), Some(40));
        assert!(newest_child_header(&block(Vec::new())).is_none());
    }

    #[test]
    fn chain_root_depends_on_order_and_content() {
        let a = block(vec![header(ChainId::Btc, 1, 1), header(ChainId::Eth, 1, 2)]);
        let b = block(vec![header(ChainId::Btc, 1, 1), header(ChainId::Eth, 1, 3)]);
        assert_ne!(chain_root(&a.child_headers), chain_root(&b.child_headers));
        assert_eq!(chain_root(&a.child_headers), chain_root(&a.child_headers.clone()));
    }

    #[test]
    fn ascending_and_linked_lists() {
        let first = header(ChainId::Btc, 1, 1);
        let mut second = header(ChainId::Btc, 2, 2);
        second.previous_hash = first.hash;
        assert!(is_strictly_ascending(&[first.clone(), second.clone()]));
        assert!(is_linked(&[first.clone(), second.clone()]));
        assert!(!is_strictly_ascending(&[second.clone(), first.clone()]));
        assert!(!is_linked(&[second, first]));
    }
}
