//! In-memory store implementing every collaborator interface, using standard
//! HashMaps behind tokio locks

use crate::hash::Hash256;
use crate::store::{BlockKey, ChainState, Storage, TxHandler};
use crate::types::{
    Block, ChainId, ChildHeader, OutPoint, PeerMarker, PutOptions, ReorgSpan, ReorgWindow,
    SyncMarkers, SyncStatus, Transaction, TxOutput,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

#[derive(Default)]
struct Blocks {
    by_hash: HashMap<Hash256, Block>,
    /// Insertion order per height, most recent last
    by_height: HashMap<u64, Vec<Hash256>>,
    latest: HashMap<ChainId, Hash256>,
    child_headers: HashMap<(ChainId, u64), Vec<ChildHeader>>,
    latest_child: HashMap<ChainId, ChildHeader>,
}

impl Blocks {
    fn insert(&mut self, block: &Block, options: PutOptions) {
        if options.save_headers {
            for header in block.child_headers.values().flatten() {
                let known = self.child_headers.entry((header.chain, header.height)).or_default();
                if !known.iter().any(|h| h.hash == header.hash) {
                    known.push(header.clone());
                }
            }
        }
        if self.by_hash.insert(block.hash, block.clone()).is_none() {
            self.by_height.entry(block.height).or_default().push(block.hash);
        }
    }

    fn latest(&self) -> Option<&Block> {
        self.latest.get(&ChainId::Primary).and_then(|hash| self.by_hash.get(hash))
    }

    /// Prefer the block on the canonical chain, else the most recently stored
    fn at_height(&self, height: u64) -> Option<&Block> {
        let mut current = self.latest();
        while let Some(block) = current {
            if block.height == height {
                return Some(block);
            }
            if block.height < height {
                break;
            }
            current = self.by_hash.get(&block.previous_hash);
        }
        self.by_height
            .get(&height)
            .and_then(|hashes| hashes.last())
            .and_then(|hash| self.by_hash.get(hash))
    }
}

/// Undo record for one block's UTXO effects
struct UtxoUndo {
    hash: Hash256,
    spent: Vec<(OutPoint, TxOutput)>,
    created: Vec<OutPoint>,
    minted: u64,
}

#[derive(Default)]
struct Utxos {
    unspent: HashMap<OutPoint, TxOutput>,
    journal: BTreeMap<u64, UtxoUndo>,
    minted: u64,
}

impl Utxos {
    fn revert(&mut self, undo: UtxoUndo) {
        for out_point in undo.created {
            self.unspent.remove(&out_point);
        }
        for (out_point, output) in undo.spent {
            self.unspent.insert(out_point, output);
        }
        self.minted = self.minted.saturating_sub(undo.minted);
    }
}

/// In-memory blocks, UTXOs and chain state
pub struct MemoryStore {
    blocks: RwLock<Blocks>,
    utxos: RwLock<Utxos>,
    ranges: DashMap<ChainId, ReorgWindow>,
    simplex: Mutex<Option<String>>,
    sync: Mutex<SyncMarkers>,
    writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Storing blocks and UTXOs in memory");

        Self {
            blocks: RwLock::new(Blocks::default()),
            utxos: RwLock::new(Utxos::default()),
            ranges: DashMap::new(),
            simplex: Mutex::new(None),
            sync: Mutex::new(SyncMarkers::default()),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of mutating storage calls served so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    /// Record the peer driving initial sync
    pub async fn set_initial_peer(&self, peer: PeerMarker) {
        self.sync.lock().await.initial_peer = Some(peer);
    }

    /// Number of unspent outputs
    pub async fn utxo_count(&self) -> usize {
        self.utxos.read().await.unspent.len()
    }

    pub async fn lookup_utxo(&self, out_point: &OutPoint) -> Option<TxOutput> {
        self.utxos.read().await.unspent.get(out_point).cloned()
    }

    /// Open range request for `chain`, if any
    pub fn range_request(&self, chain: ChainId) -> Option<ReorgWindow> {
        self.ranges.get(&chain).map(|w| w.clone())
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get(&self, key: BlockKey) -> Result<Option<Block>> {
        let blocks = self.blocks.read().await;
        Ok(match key {
            BlockKey::Latest => blocks.latest().cloned(),
            BlockKey::Hash(hash) => blocks.by_hash.get(&hash).cloned(),
            BlockKey::Height(height) => blocks.at_height(height).cloned(),
        })
    }

    async fn get_bulk(&self, keys: &[BlockKey]) -> Result<Vec<Option<Block>>> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            found.push(self.get(*key).await?);
        }
        Ok(found)
    }

    async fn put_block(&self, block: &Block, options: PutOptions) -> Result<()> {
        self.record_write();
        self.blocks.write().await.insert(block, options);
        Ok(())
    }

    async fn put_latest_block(
        &self,
        block: &Block,
        chain: ChainId,
        options: PutOptions,
    ) -> Result<()> {
        self.record_write();
        let mut blocks = self.blocks.write().await;
        blocks.insert(block, options);
        blocks.latest.insert(chain, block.hash);
        debug!(%chain, height = block.height, hash = %block.hash, "Latest block moved");
        Ok(())
    }

    async fn get_block_by_hash(&self, hash: &Hash256, chain: ChainId) -> Result<Option<Block>> {
        if chain.is_child() {
            return Ok(None);
        }
        Ok(self.blocks.read().await.by_hash.get(hash).cloned())
    }

    async fn get_block_by_height(&self, height: u64, chain: ChainId) -> Result<Option<Block>> {
        if chain.is_child() {
            return Ok(None);
        }
        Ok(self.blocks.read().await.at_height(height).cloned())
    }

    async fn get_block_at_depth_from(&self, block: &Block, depth: u64) -> Result<Option<Block>> {
        let blocks = self.blocks.read().await;
        let mut current = block;
        for _ in 0..depth {
            match blocks.by_hash.get(&current.previous_hash) {
                Some(parent) => current = parent,
                None => return Ok(None),
            }
        }
        Ok(Some(current.clone()))
    }

    async fn put_reorg_blocks(
        &self,
        from: &Block,
        to: &Block,
        options: PutOptions,
    ) -> Result<Option<ReorgSpan>> {
        self.record_write();
        let mut blocks = self.blocks.write().await;
        blocks.insert(from, options);
        blocks.insert(to, options);
        if from.height >= to.height {
            return Ok(None);
        }
        debug!(from = from.height, to = to.height, "Stored provisional reorg blocks");
        Ok(Some(ReorgSpan { from: from.height }))
    }

    async fn remove_utxos_from(&self, height: u64) -> Result<()> {
        self.record_write();
        let mut utxos = self.utxos.write().await;
        let heights: Vec<u64> = utxos.journal.range(height..).map(|(h, _)| *h).rev().collect();
        for h in heights {
            if let Some(undo) = utxos.journal.remove(&h) {
                utxos.revert(undo);
            }
        }
        Ok(())
    }

    async fn update_utxos(&self, block: &Block) -> Result<bool> {
        let mut utxos = self.utxos.write().await;
        match utxos.journal.get(&block.height) {
            Some(undo) if undo.hash == block.hash => return Ok(true),
            Some(_) => return Ok(false),
            None => {}
        }

        self.record_write();
        let mut undo = UtxoUndo {
            hash: block.hash,
            spent: Vec::new(),
            created: Vec::new(),
            minted: block.nrg_grant,
        };

        for tx in &block.txs {
            for input in &tx.inputs {
                match utxos.unspent.remove(&input.out_point) {
                    Some(output) => undo.spent.push((input.out_point, output)),
                    None => {
                        debug!(height = block.height, tx = %tx.hash, "Spend of unknown output");
                        utxos.revert(UtxoUndo { minted: 0, ..undo });
                        return Ok(false);
                    }
                }
            }
            for (index, output) in tx.outputs.iter().enumerate() {
                let out_point = OutPoint {
                    tx_hash: tx.hash,
                    index: index as u32,
                };
                utxos.unspent.insert(out_point, output.clone());
                undo.created.push(out_point);
            }
        }

        utxos.minted = utxos.minted.saturating_add(block.nrg_grant);
        utxos.journal.insert(block.height, undo);
        Ok(true)
    }

    async fn are_utxos_saved_for_block(&self, height: u64, hash: &Hash256) -> Result<bool> {
        Ok(self.utxos.read().await.journal.get(&height).is_some_and(|undo| undo.hash == *hash))
    }

    async fn get_nrg_minted_so_far(&self) -> Result<u64> {
        Ok(self.utxos.read().await.minted)
    }

    async fn get_latest_child_header(&self, chain: ChainId) -> Result<Option<ChildHeader>> {
        Ok(self.blocks.read().await.latest_child.get(&chain).cloned())
    }

    async fn put_latest_child_header(
        &self,
        header: &ChildHeader,
        options: PutOptions,
    ) -> Result<()> {
        self.record_write();
        let mut blocks = self.blocks.write().await;
        if options.save_headers {
            let known = blocks.child_headers.entry((header.chain, header.height)).or_default();
            if !known.iter().any(|h| h.hash == header.hash) {
                known.push(header.clone());
            }
        }
        blocks.latest_child.insert(header.chain, header.clone());
        Ok(())
    }

    async fn get_child_headers_at_height(
        &self,
        chain: ChainId,
        height: u64,
    ) -> Result<Vec<ChildHeader>> {
        Ok(self
            .blocks
            .read()
            .await
            .child_headers
            .get(&(chain, height))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ChainState for MemoryStore {
    async fn open_block_range_request(
        &self,
        chain: ChainId,
        highest: u64,
        lowest: u64,
        highest_hash: Option<Hash256>,
        lowest_hash: Option<Hash256>,
        notify_rover: bool,
    ) -> Result<ReorgWindow> {
        let window = ReorgWindow {
            chain,
            lowest_height: lowest.min(highest),
            highest_height: highest.max(lowest),
            lowest_hash,
            highest_hash,
            notify_rover,
        };
        info!(
            %chain,
            lowest = window.lowest_height,
            highest = window.highest_height,
            "Opened block range request"
        );
        self.ranges.insert(chain, window.clone());
        Ok(window)
    }

    async fn close_block_range_request(&self, chain: ChainId) -> Result<()> {
        self.ranges.remove(&chain);
        Ok(())
    }

    async fn get_range_lowest_height(&self, chain: ChainId) -> Result<Option<u64>> {
        Ok(self.ranges.get(&chain).map(|w| w.lowest_height))
    }

    async fn get_range_highest_height(&self, chain: ChainId) -> Result<Option<u64>> {
        Ok(self.ranges.get(&chain).map(|w| w.highest_height))
    }

    async fn get_latest_block_height(&self, chain: ChainId) -> Result<Option<u64>> {
        let blocks = self.blocks.read().await;
        Ok(match chain {
            ChainId::Primary => blocks.latest().map(|b| b.height),
            child => blocks.latest_child.get(&child).map(|h| h.height),
        })
    }

    async fn get_latest_block_hash(&self, chain: ChainId) -> Result<Option<Hash256>> {
        let blocks = self.blocks.read().await;
        Ok(match chain {
            ChainId::Primary => blocks.latest.get(&ChainId::Primary).copied(),
            child => blocks.latest_child.get(&child).map(|h| h.hash),
        })
    }

    async fn set_latest_block(&self, chain: ChainId, height: u64, hash: Hash256) -> Result<()> {
        let mut blocks = self.blocks.write().await;
        match chain {
            ChainId::Primary => {
                if !blocks.by_hash.contains_key(&hash) {
                    return Err(anyhow!("Block {hash} at height {height} is not stored"));
                }
                blocks.latest.insert(chain, hash);
            }
            child => {
                let header = blocks
                    .child_headers
                    .get(&(child, height))
                    .and_then(|known| known.iter().find(|h| h.hash == hash))
                    .cloned()
                    .ok_or_else(|| anyhow!("No {child} header {hash} at height {height}"))?;
                blocks.latest_child.insert(child, header);
            }
        }
        Ok(())
    }

    async fn get_simplex(&self) -> Result<Option<String>> {
        Ok(self.simplex.lock().await.clone())
    }

    async fn try_set_simplex(&self, holder: &str) -> Result<bool> {
        let mut simplex = self.simplex.lock().await;
        if simplex.is_some() {
            return Ok(false);
        }
        *simplex = Some(holder.to_string());
        Ok(true)
    }

    async fn del_simplex(&self) -> Result<()> {
        *self.simplex.lock().await = None;
        Ok(())
    }

    async fn get_sync_markers(&self) -> Result<SyncMarkers> {
        Ok(self.sync.lock().await.clone())
    }

    async fn clear_initial_peer(&self) -> Result<()> {
        self.sync.lock().await.initial_peer = None;
        Ok(())
    }

    async fn set_initial_sync(&self, status: SyncStatus) -> Result<()> {
        self.sync.lock().await.initial_sync = status;
        Ok(())
    }

    async fn set_sync_edge(&self, height: u64) -> Result<()> {
        self.sync.lock().await.sync_edge = Some(height);
        Ok(())
    }
}

#[async_trait]
impl TxHandler for MemoryStore {
    async fn validate_txs(&self, block: &Block) -> Result<bool> {
        let utxos = self.utxos.read().await;
        Ok(block
            .txs
            .iter()
            .flat_map(|tx| tx.inputs.iter())
            .all(|input| utxos.unspent.contains_key(&input.out_point)))
    }

    async fn calculate_fee(&self, tx: &Transaction) -> Result<u64> {
        let utxos = self.utxos.read().await;
        let mut consumed = 0u64;
        for input in &tx.inputs {
            let output = utxos.unspent.get(&input.out_point).ok_or_else(|| {
                anyhow!(
                    "Input {}:{} of {} is not unspent",
                    input.out_point.tx_hash,
                    input.out_point.index,
                    tx.hash
                )
            })?;
            consumed = consumed.saturating_add(output.value);
        }
        Ok(consumed.saturating_sub(tx.output_value()))
    }

    async fn emblem_bonus(&self, _block: &Block) -> Result<u64> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Address;
    use crate::types::{ChildHeaderMap, TxInput};
    use dashu_int::UBig;

    fn tx(tag: u8, spends: &[OutPoint], values: &[u64]) -> Transaction {
        Transaction {
            hash: Hash256::new([tag; 32]),
            inputs: spends
                .iter()
                .map(|out_point| TxInput {
                    out_point: *out_point,
                    unlock_script: Vec::new(),
                })
                .collect(),
            outputs: values
                .iter()
                .map(|value| TxOutput {
                    value: *value,
                    lock_script: Vec::new(),
                })
                .collect(),
        }
    }

    fn block(height: u64, tag: u8, previous: Hash256, txs: Vec<Transaction>) -> Block {
        Block {
            height,
            hash: Hash256::new([tag; 32]),
            previous_hash: previous,
            timestamp: height * 10,
            miner: Address::default(),
            difficulty: UBig::ONE,
            distance: UBig::ONE,
            total_distance: UBig::from(height),
            chain_root: Hash256::default(),
            merkle_root: Hash256::default(),
            nrg_grant: 100,
            child_headers: ChildHeaderMap::new(),
            txs,
        }
    }

    fn out(tag: u8, index: u32) -> OutPoint {
        OutPoint {
            tx_hash: Hash256::new([tag; 32]),
            index,
        }
    }

    #[tokio::test]
    async fn utxo_journal_rolls_back() {
        let store = MemoryStore::new();
        let genesis = block(1, 1, Hash256::default(), vec![tx(10, &[], &[100])]);
        let second = block(2, 2, genesis.hash, vec![tx(20, &[], &[100]), tx(21, &[out(10, 0)], &[60, 40])]);

        assert!(store.update_utxos(&genesis).await.unwrap());
        assert!(store.update_utxos(&second).await.unwrap());
        assert_eq!(store.utxo_count().await, 3);
        assert_eq!(store.get_nrg_minted_so_far().await.unwrap(), 200);
        assert!(store.are_utxos_saved_for_block(2, &second.hash).await.unwrap());

        store.remove_utxos_from(2).await.unwrap();
        assert_eq!(store.utxo_count().await, 1);
        assert!(store.lookup_utxo(&out(10, 0)).await.is_some());
        assert_eq!(store.get_nrg_minted_so_far().await.unwrap(), 100);
        assert!(!store.are_utxos_saved_for_block(2, &second.hash).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_spend_leaves_state_untouched() {
        let store = MemoryStore::new();
        let genesis = block(1, 1, Hash256::default(), vec![tx(10, &[], &[100])]);
        store.update_utxos(&genesis).await.unwrap();

        let bad = block(2, 2, genesis.hash, vec![tx(20, &[], &[5]), tx(21, &[out(99, 0)], &[1])]);
        assert!(!store.update_utxos(&bad).await.unwrap());
        assert_eq!(store.utxo_count().await, 1);
        assert_eq!(store.get_nrg_minted_so_far().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn update_is_idempotent_per_block() {
        let store = MemoryStore::new();
        let genesis = block(1, 1, Hash256::default(), vec![tx(10, &[], &[100])]);
        assert!(store.update_utxos(&genesis).await.unwrap());
        let writes = store.write_count();
        assert!(store.update_utxos(&genesis).await.unwrap());
        assert_eq!(store.write_count(), writes);

        let rival = block(1, 7, Hash256::default(), vec![tx(70, &[], &[100])]);
        assert!(!store.update_utxos(&rival).await.unwrap());
    }

    #[tokio::test]
    async fn height_lookup_prefers_canonical_chain() {
        let store = MemoryStore::new();
        let genesis = block(1, 1, Hash256::default(), Vec::new());
        let canonical = block(2, 2, genesis.hash, Vec::new());
        let fork = block(2, 3, genesis.hash, Vec::new());
        store.put_block(&genesis, PutOptions::default()).await.unwrap();
        store.put_latest_block(&canonical, ChainId::Primary, PutOptions::default()).await.unwrap();
        store.put_block(&fork, PutOptions::default()).await.unwrap();

        let at_two = store.get_block_by_height(2, ChainId::Primary).await.unwrap().unwrap();
        assert_eq!(at_two.hash, canonical.hash);
        let depth = store.get_block_at_depth_from(&canonical, 1).await.unwrap().unwrap();
        assert_eq!(depth.hash, genesis.hash);
        assert!(store.get_block_at_depth_from(&canonical, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn simplex_is_single_holder() {
        let store = MemoryStore::new();
        assert!(store.try_set_simplex("a").await.unwrap());
        assert!(!store.try_set_simplex("b").await.unwrap());
        assert_eq!(store.get_simplex().await.unwrap().as_deref(), Some("a"));
        store.del_simplex().await.unwrap();
        assert!(store.try_set_simplex("b").await.unwrap());
    }

    #[tokio::test]
    async fn range_requests_open_and_close() {
        let store = MemoryStore::new();
        let window = store
            .open_block_range_request(ChainId::Primary, 20, 12, None, None, true)
            .await
            .unwrap();
        assert_eq!((window.lowest_height, window.highest_height), (12, 20));
        assert_eq!(store.get_range_lowest_height(ChainId::Primary).await.unwrap(), Some(12));
        store.close_block_range_request(ChainId::Primary).await.unwrap();
        assert!(store.range_request(ChainId::Primary).is_none());
    }

    #[tokio::test]
    async fn fee_is_consumed_minus_produced() {
        let store = MemoryStore::new();
        store.update_utxos(&block(1, 1, Hash256::default(), vec![tx(10, &[], &[100])])).await.unwrap();
        let spend = tx(21, &[out(10, 0)], &[70]);
        assert_eq!(store.calculate_fee(&spend).await.unwrap(), 30);
        assert!(store.calculate_fee(&tx(22, &[out(99, 0)], &[1])).await.is_err());
    }
}
