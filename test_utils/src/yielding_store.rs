//! Store wrapper that yields to the scheduler before every storage call,
//! forcing concurrent evaluations to interleave at each await point

use anyhow::Result;
use async_trait::async_trait;
use bc_common::memory_store::MemoryStore;
use bc_common::{
    Block, BlockKey, ChainId, ChainState, ChildHeader, Hash256, PutOptions, ReorgSpan,
    ReorgWindow, Storage, SyncMarkers, SyncStatus,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::yield_now;

pub struct YieldingStore {
    pub inner: Arc<MemoryStore>,
    utxo_updates: AtomicU64,
}

impl YieldingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            utxo_updates: AtomicU64::new(0),
        }
    }

    /// Number of `update_utxos` calls that reached the inner store
    pub fn utxo_updates(&self) -> u64 {
        self.utxo_updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for YieldingStore {
    async fn get(&self, key: BlockKey) -> Result<Option<Block>> {
        yield_now().await;
        self.inner.get(key).await
    }

    async fn get_bulk(&self, keys: &[BlockKey]) -> Result<Vec<Option<Block>>> {
        yield_now().await;
        self.inner.get_bulk(keys).await
    }

    async fn put_block(&self, block: &Block, options: PutOptions) -> Result<()> {
        yield_now().await;
        self.inner.put_block(block, options).await
    }

    async fn put_latest_block(
        &self,
        block: &Block,
        chain: ChainId,
        options: PutOptions,
    ) -> Result<()> {
        yield_now().await;
        self.inner.put_latest_block(block, chain, options).await
    }

    async fn get_block_by_hash(&self, hash: &Hash256, chain: ChainId) -> Result<Option<Block>> {
        yield_now().await;
        self.inner.get_block_by_hash(hash, chain).await
    }

    async fn get_block_by_height(&self, height: u64, chain: ChainId) -> Result<Option<Block>> {
        yield_now().await;
        self.inner.get_block_by_height(height, chain).await
    }

    async fn get_block_at_depth_from(&self, block: &Block, depth: u64) -> Result<Option<Block>> {
        yield_now().await;
        self.inner.get_block_at_depth_from(block, depth).await
    }

    async fn put_reorg_blocks(
        &self,
        from: &Block,
        to: &Block,
        options: PutOptions,
    ) -> Result<Option<ReorgSpan>> {
        yield_now().await;
        self.inner.put_reorg_blocks(from, to, options).await
    }

    async fn remove_utxos_from(&self, height: u64) -> Result<()> {
        yield_now().await;
        self.inner.remove_utxos_from(height).await
    }

    async fn update_utxos(&self, block: &Block) -> Result<bool> {
        yield_now().await;
        self.utxo_updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update_utxos(block).await
    }

    async fn are_utxos_saved_for_block(&self, height: u64, hash: &Hash256) -> Result<bool> {
        yield_now().await;
        self.inner.are_utxos_saved_for_block(height, hash).await
    }

    async fn get_nrg_minted_so_far(&self) -> Result<u64> {
        yield_now().await;
        self.inner.get_nrg_minted_so_far().await
    }

    async fn get_latest_child_header(&self, chain: ChainId) -> Result<Option<ChildHeader>> {
        yield_now().await;
        self.inner.get_latest_child_header(chain).await
    }

    async fn put_latest_child_header(
        &self,
        header: &ChildHeader,
        options: PutOptions,
    ) -> Result<()> {
        yield_now().await;
        self.inner.put_latest_child_header(header, options).await
    }

    async fn get_child_headers_at_height(
        &self,
        chain: ChainId,
        height: u64,
    ) -> Result<Vec<ChildHeader>> {
        yield_now().await;
        self.inner.get_child_headers_at_height(chain, height).await
    }
}

#[async_trait]
impl ChainState for YieldingStore {
    async fn open_block_range_request(
        &self,
        chain: ChainId,
        highest: u64,
        lowest: u64,
        highest_hash: Option<Hash256>,
        lowest_hash: Option<Hash256>,
        notify_rover: bool,
    ) -> Result<ReorgWindow> {
        self.inner
            .open_block_range_request(chain, highest, lowest, highest_hash, lowest_hash, notify_rover)
            .await
    }

    async fn close_block_range_request(&self, chain: ChainId) -> Result<()> {
        self.inner.close_block_range_request(chain).await
    }

    async fn get_range_lowest_height(&self, chain: ChainId) -> Result<Option<u64>> {
        self.inner.get_range_lowest_height(chain).await
    }

    async fn get_range_highest_height(&self, chain: ChainId) -> Result<Option<u64>> {
        self.inner.get_range_highest_height(chain).await
    }

    async fn get_latest_block_height(&self, chain: ChainId) -> Result<Option<u64>> {
        self.inner.get_latest_block_height(chain).await
    }

    async fn get_latest_block_hash(&self, chain: ChainId) -> Result<Option<Hash256>> {
        self.inner.get_latest_block_hash(chain).await
    }

    async fn set_latest_block(&self, chain: ChainId, height: u64, hash: Hash256) -> Result<()> {
        self.inner.set_latest_block(chain, height, hash).await
    }

    async fn get_simplex(&self) -> Result<Option<String>> {
        self.inner.get_simplex().await
    }

    async fn try_set_simplex(&self, holder: &str) -> Result<bool> {
        yield_now().await;
        self.inner.try_set_simplex(holder).await
    }

    async fn del_simplex(&self) -> Result<()> {
        self.inner.del_simplex().await
    }

    async fn get_sync_markers(&self) -> Result<SyncMarkers> {
        self.inner.get_sync_markers().await
    }

    async fn clear_initial_peer(&self) -> Result<()> {
        self.inner.clear_initial_peer().await
    }

    async fn set_initial_sync(&self, status: SyncStatus) -> Result<()> {
        self.inner.set_initial_sync(status).await
    }

    async fn set_sync_edge(&self, height: u64) -> Result<()> {
        self.inner.set_sync_edge(height).await
    }
}
