//! Interfaces to the collaborators the consensus core relies on.
//! Note all methods take `&self` - implementations use interior locking so a
//! single handle can be shared between the multiverse, the coinbase gate and
//! other subsystems.

use crate::hash::Hash256;
use crate::types::{
    Block, ChainId, ChildHeader, PutOptions, ReorgSpan, ReorgWindow, SyncMarkers, SyncStatus,
    Transaction,
};
use anyhow::Result;
use async_trait::async_trait;

/// Key for a single primary block lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKey {
    /// Canonical latest block
    Latest,
    Hash(Hash256),
    Height(u64),
}

/// Persistent block, header and UTXO storage
#[async_trait]
pub trait Storage: Send + Sync {
    /// Lookup a primary block
    async fn get(&self, key: BlockKey) -> Result<Option<Block>>;

    /// Lookup several primary blocks, preserving order
    async fn get_bulk(&self, keys: &[BlockKey]) -> Result<Vec<Option<Block>>>;

    /// Store a primary block without moving any pointer
    async fn put_block(&self, block: &Block, options: PutOptions) -> Result<()>;

    /// Store a block and make it the latest for `chain`
    async fn put_latest_block(
        &self,
        block: &Block,
        chain: ChainId,
        options: PutOptions,
    ) -> Result<()>;

    async fn get_block_by_hash(&self, hash: &Hash256, chain: ChainId) -> Result<Option<Block>>;

    async fn get_block_by_height(&self, height: u64, chain: ChainId) -> Result<Option<Block>>;

    /// Walk `depth` parents back from `block`
    async fn get_block_at_depth_from(&self, block: &Block, depth: u64) -> Result<Option<Block>>;

    /// Persist the provisional blocks of a branch between `from` and `to`
    async fn put_reorg_blocks(
        &self,
        from: &Block,
        to: &Block,
        options: PutOptions,
    ) -> Result<Option<ReorgSpan>>;

    /// Roll back UTXO effects of every block at or above `height`
    async fn remove_utxos_from(&self, height: u64) -> Result<()>;

    /// Apply the spends and creates of `block`
    async fn update_utxos(&self, block: &Block) -> Result<bool>;

    async fn are_utxos_saved_for_block(&self, height: u64, hash: &Hash256) -> Result<bool>;

    async fn get_nrg_minted_so_far(&self) -> Result<u64>;

    /// Latest header recorded for a rover chain
    async fn get_latest_child_header(&self, chain: ChainId) -> Result<Option<ChildHeader>>;

    async fn put_latest_child_header(
        &self,
        header: &ChildHeader,
        options: PutOptions,
    ) -> Result<()>;

    /// Every known header of `chain` at `height`
    async fn get_child_headers_at_height(
        &self,
        chain: ChainId,
        height: u64,
    ) -> Result<Vec<ChildHeader>>;
}

/// Shared chain state: range requests, latest pointers, sync markers and the
/// simplex token
#[async_trait]
pub trait ChainState: Send + Sync {
    async fn open_block_range_request(
        &self,
        chain: ChainId,
        highest: u64,
        lowest: u64,
        highest_hash: Option<Hash256>,
        lowest_hash: Option<Hash256>,
        notify_rover: bool,
    ) -> Result<ReorgWindow>;

    async fn close_block_range_request(&self, chain: ChainId) -> Result<()>;

    async fn get_range_lowest_height(&self, chain: ChainId) -> Result<Option<u64>>;

    async fn get_range_highest_height(&self, chain: ChainId) -> Result<Option<u64>>;

    async fn get_latest_block_height(&self, chain: ChainId) -> Result<Option<u64>>;

    async fn get_latest_block_hash(&self, chain: ChainId) -> Result<Option<Hash256>>;

    async fn set_latest_block(&self, chain: ChainId, height: u64, hash: Hash256) -> Result<()>;

    /// Current simplex holder, if any
    async fn get_simplex(&self) -> Result<Option<String>>;

    /// Take the simplex token for `holder`; false if already held
    async fn try_set_simplex(&self, holder: &str) -> Result<bool>;

    async fn del_simplex(&self) -> Result<()>;

    async fn get_sync_markers(&self) -> Result<SyncMarkers>;

    async fn clear_initial_peer(&self) -> Result<()>;

    async fn set_initial_sync(&self, status: SyncStatus) -> Result<()>;

    async fn set_sync_edge(&self, height: u64) -> Result<()>;
}

/// Transaction pool bookkeeping used by the coinbase check
#[async_trait]
pub trait TxHandler: Send + Sync {
    /// Check the non-coinbase transactions of a block
    async fn validate_txs(&self, block: &Block) -> Result<bool>;

    /// Fee paid by a non-coinbase transaction
    async fn calculate_fee(&self, tx: &Transaction) -> Result<u64>;

    /// Emblem bonus the block's miner is entitled to
    async fn emblem_bonus(&self, block: &Block) -> Result<u64>;
}
