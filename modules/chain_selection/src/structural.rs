//! Stateless block checks, run before anything touches storage

use crate::multiverse_error::StructuralError;
use bc_common::child_headers::{chain_root, is_strictly_ascending};
use bc_common::Block;

pub fn check_block(block: &Block) -> Result<(), StructuralError> {
    if block.height == 0 {
        return Err(StructuralError::ZeroHeight);
    }
    if block.hash.is_zero() {
        return Err(StructuralError::ZeroHash);
    }
    if block.height > 1 {
        if block.previous_hash.is_zero() {
            return Err(StructuralError::ZeroPreviousHash);
        }
        if block.difficulty == dashu_int::UBig::ZERO {
            return Err(StructuralError::ZeroDifficulty);
        }
    }
    if block.timestamp == 0 {
        return Err(StructuralError::ZeroTimestamp);
    }
    if block.total_distance < block.distance {
        return Err(StructuralError::TotalDistanceBelowDistance);
    }

    for (chain, headers) in &block.child_headers {
        if !chain.is_child() {
            return Err(StructuralError::NotAChildChain(*chain));
        }
        if let Some(header) = headers.iter().find(|h| h.chain != *chain) {
            return Err(StructuralError::MislabelledHeader {
                listed: *chain,
                found: header.chain,
            });
        }
        if !is_strictly_ascending(headers) {
            return Err(StructuralError::HeaderOrder(*chain));
        }
    }

    let expected = chain_root(&block.child_headers);
    if block.chain_root != expected {
        return Err(StructuralError::ChainRoot {
            expected,
            found: block.chain_root,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bc_common::{ChainId, Hash256};
    use bc_test_utils::{reseal, ChainBuilder};
    use dashu_int::UBig;
    use test_case::test_case;

    fn sealed() -> Block {
        let builder = ChainBuilder::default();
        let genesis = builder.genesis();
        builder.child(&genesis).advance(ChainId::Btc, 3).build()
    }

    #[test]
    fn built_blocks_pass() {
        let builder = ChainBuilder::default();
        for block in builder.chain(4) {
            assert_eq!(check_block(&block), Ok(()));
        }
        assert_eq!(check_block(&sealed()), Ok(()));
    }

    #[test_case(|b: &mut Block| b.height = 0 => Err(StructuralError::ZeroHeight) ; "zero height")]
    #[test_case(|b: &mut Block| b.hash = Hash256::default() => Err(StructuralError::ZeroHash) ; "zero hash")]
    #[test_case(|b: &mut Block| b.previous_hash = Hash256::default() => Err(StructuralError::ZeroPreviousHash) ; "orphan above genesis")]
    #[test_case(|b: &mut Block| b.timestamp = 0 => Err(StructuralError::ZeroTimestamp) ; "zero timestamp")]
    #[test_case(|b: &mut Block| b.difficulty = UBig::ZERO => Err(StructuralError::ZeroDifficulty) ; "zero difficulty")]
    #[test_case(|b: &mut Block| b.total_distance = UBig::ZERO => Err(StructuralError::TotalDistanceBelowDistance) ; "total below distance")]
    fn field_bounds(tamper: fn(&mut Block)) -> Result<(), StructuralError> {
        let mut block = sealed();
        tamper(&mut block);
        check_block(&block)
    }

    #[test]
    fn descending_headers_rejected() {
        let mut block = sealed();
        if let Some(headers) = block.child_headers.get_mut(&ChainId::Btc) {
            headers.reverse();
        }
        reseal(&mut block);
        assert_eq!(check_block(&block), Err(StructuralError::HeaderOrder(ChainId::Btc)));
    }

    #[test]
    fn mislabelled_header_rejected() {
        let mut block = sealed();
        if let Some(headers) = block.child_headers.get_mut(&ChainId::Eth) {
            headers[0].chain = ChainId::Neo;
        }
        reseal(&mut block);
        assert_eq!(
            check_block(&block),
            Err(StructuralError::MislabelledHeader {
                listed: ChainId::Eth,
                found: ChainId::Neo,
            })
        );
    }

    #[test]
    fn primary_headers_rejected() {
        let mut block = sealed();
        block.child_headers.insert(ChainId::Primary, Vec::new());
        assert_eq!(check_block(&block), Err(StructuralError::NotAChildChain(ChainId::Primary)));
    }

    #[test]
    fn chain_root_must_commit_to_headers() {
        let mut block = sealed();
        if let Some(headers) = block.child_headers.get_mut(&ChainId::Wav) {
            headers.pop();
        }
        let found = block.chain_root;
        assert!(matches!(
            check_block(&block),
            Err(StructuralError::ChainRoot { found: f, .. }) if f == found
        ));
    }
}
