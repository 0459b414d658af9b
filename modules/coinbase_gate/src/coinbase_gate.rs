//! Multiverse coinbase gate
//! Walks a block's ancestry back to the last block whose UTXO effects are
//! committed, then checks and applies every block forward from there under
//! the simplex token.

pub mod coinbase_error;
pub mod nrg;
pub mod simplex;

use anyhow::{bail, Result};
use bc_common::{
    Block, BlockKey, ChainId, ChainState, ConsensusParams, Hash256, Storage, TxHandler,
};
use coinbase_error::CoinbaseError;
use simplex::SimplexGuard;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives gate events; the owning module turns them into bus messages
pub trait CoinbaseObserver {
    /// UTXO application up to this block finished and the simplex was released
    fn simplex_cleared(&self, height: u64, hash: Hash256);
}

/// Why a block could not be decided yet. The caller resubmits later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deferral {
    /// Someone else is applying UTXOs
    SimplexHeld,

    /// An ancestor needed for the walk is not in storage
    MissingAncestor { height: u64, hash: Hash256 },
}

impl fmt::Display for Deferral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deferral::SimplexHeld => f.write_str("simplex held"),
            Deferral::MissingAncestor { height, hash } => {
                write!(f, "ancestor {hash} at height {height} not stored")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoinbaseOutcome {
    Valid,
    Deferred(Deferral),
    Invalid(CoinbaseError),
}

impl CoinbaseOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, CoinbaseOutcome::Valid)
    }
}

pub struct CoinbaseGate {
    storage: Arc<dyn Storage>,
    chain_state: Arc<dyn ChainState>,
    tx_handler: Arc<dyn TxHandler>,
    params: ConsensusParams,
    observer: Option<Box<dyn CoinbaseObserver + Send + Sync>>,
}

impl CoinbaseGate {
    pub fn new(
        storage: Arc<dyn Storage>,
        chain_state: Arc<dyn ChainState>,
        tx_handler: Arc<dyn TxHandler>,
        params: ConsensusParams,
    ) -> Self {
        Self {
            storage,
            chain_state,
            tx_handler,
            params,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn CoinbaseObserver + Send + Sync>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    /// True when `block` and every unapplied ancestor pass the economic checks.
    /// Deferrals and invalidity both read as false.
    pub async fn validate_coinbase(&self, block: &Block) -> Result<bool> {
        Ok(self.check(block).await?.is_valid())
    }

    /// Check and apply `block` and its unapplied ancestors
    pub async fn check(&self, block: &Block) -> Result<CoinbaseOutcome> {
        if self.storage.are_utxos_saved_for_block(block.height, &block.hash).await? {
            debug!(height = block.height, "UTXOs already applied");
            return Ok(CoinbaseOutcome::Valid);
        }

        let holder = format!("coinbase:{}:{}", block.height, block.hash);
        let Some(guard) = SimplexGuard::try_acquire(self.chain_state.clone(), holder).await? else {
            debug!(height = block.height, "Simplex held, deferring coinbase check");
            return Ok(CoinbaseOutcome::Deferred(Deferral::SimplexHeld));
        };

        let outcome = self.apply_locked(block).await;
        guard.release().await?;
        let outcome = outcome?;

        match &outcome {
            CoinbaseOutcome::Valid => {
                if let Some(observer) = &self.observer {
                    observer.simplex_cleared(block.height, block.hash);
                }
            }
            CoinbaseOutcome::Deferred(reason) => {
                debug!(height = block.height, "Coinbase check deferred: {reason}")
            }
            CoinbaseOutcome::Invalid(e) => warn!(height = block.height, "Coinbase check failed: {e}"),
        }
        Ok(outcome)
    }

    /// Everything done while the simplex is held
    async fn apply_locked(&self, block: &Block) -> Result<CoinbaseOutcome> {
        let pending = match self.unapplied_ancestry(block).await? {
            Ok(pending) => pending,
            Err(deferral) => return Ok(CoinbaseOutcome::Deferred(deferral)),
        };

        let Some(fork_height) = pending.first().map(|b| b.height) else {
            return Ok(CoinbaseOutcome::Valid);
        };

        // Effects of the canonical branch at or above the fork point go first,
        // and come back if the pending run fails
        let displaced = self.applied_canonical_from(fork_height).await?;
        self.storage.remove_utxos_from(fork_height).await?;

        for pending_block in &pending {
            if let Err(e) = self.apply_block(pending_block).await? {
                self.restore(fork_height, &displaced).await?;
                return Ok(CoinbaseOutcome::Invalid(e));
            }
        }

        info!(
            height = block.height,
            hash = %block.hash,
            applied = pending.len(),
            "UTXOs applied"
        );
        Ok(CoinbaseOutcome::Valid)
    }

    /// Applied blocks of the latest chain at or above `height`, oldest first
    async fn applied_canonical_from(&self, height: u64) -> Result<Vec<Block>> {
        let mut applied = Vec::new();
        let mut current = self.storage.get(BlockKey::Latest).await?;
        while let Some(block) = current {
            if block.height < height {
                break;
            }
            if self.storage.are_utxos_saved_for_block(block.height, &block.hash).await? {
                applied.push(block.clone());
            }
            if block.height == height {
                break;
            }
            current = self.storage.get_block_by_hash(&block.previous_hash, ChainId::Primary).await?;
        }
        applied.reverse();
        Ok(applied)
    }

    /// Drop whatever a failed run applied and re-apply the displaced blocks
    async fn restore(&self, fork_height: u64, displaced: &[Block]) -> Result<()> {
        self.storage.remove_utxos_from(fork_height).await?;
        for block in displaced {
            if !self.storage.update_utxos(block).await? {
                bail!(
                    "Could not restore UTXOs of block {} at height {}",
                    block.hash,
                    block.height
                );
            }
        }
        debug!(fork_height, restored = displaced.len(), "Canonical UTXOs restored");
        Ok(())
    }

    /// Blocks from the oldest unapplied ancestor up to `block`, oldest first
    async fn unapplied_ancestry(&self, block: &Block) -> Result<Result<Vec<Block>, Deferral>> {
        let mut walked = vec![block.clone()];
        loop {
            let Some(current) = walked.last() else {
                break;
            };
            if current.height <= 1 {
                break;
            }

            let parent_height = current.height - 1;
            let parent_hash = current.previous_hash;
            if self.storage.are_utxos_saved_for_block(parent_height, &parent_hash).await? {
                break;
            }

            match self.storage.get_block_by_hash(&parent_hash, ChainId::Primary).await? {
                Some(parent) => walked.push(parent),
                None => {
                    return Ok(Err(Deferral::MissingAncestor {
                        height: parent_height,
                        hash: parent_hash,
                    }))
                }
            }
        }

        walked.reverse();
        Ok(Ok(walked))
    }

    /// Economic checks for one block, then its UTXO update
    async fn apply_block(&self, block: &Block) -> Result<Result<(), CoinbaseError>> {
        let height = block.height;

        if height > 1 {
            let coinbases: Vec<_> = block.coinbase_txs().collect();
            let [coinbase] = coinbases.as_slice() else {
                return Ok(Err(CoinbaseError::CoinbaseCount {
                    height,
                    found: coinbases.len(),
                }));
            };

            if !self.tx_handler.validate_txs(block).await? {
                return Ok(Err(CoinbaseError::TxsRejected { height }));
            }

            let mut fees = 0u64;
            let mut size = 0usize;
            for tx in block.txs.iter().filter(|tx| !tx.is_coinbase()) {
                fees = fees.saturating_add(self.tx_handler.calculate_fee(tx).await?);
                size += tx.size();
            }

            let limit = self.params.max_txs_size();
            if size > limit {
                return Ok(Err(CoinbaseError::Oversized {
                    height,
                    size,
                    limit,
                }));
            }

            let emblem_bonus = self.tx_handler.emblem_bonus(block).await?;
            let minted = self.storage.get_nrg_minted_so_far().await?;
            let grant = nrg::nrg_grant(&self.params, emblem_bonus, minted);
            if block.nrg_grant != grant {
                return Ok(Err(CoinbaseError::GrantMismatch {
                    height,
                    expected: grant,
                    found: block.nrg_grant,
                }));
            }

            let Some(expected) = nrg::coinbase_value(grant, fees) else {
                return Ok(Err(CoinbaseError::ValueOverflow { height }));
            };
            let found = coinbase.output_value();
            if found != expected {
                return Ok(Err(CoinbaseError::CoinbaseValue {
                    height,
                    expected,
                    found,
                }));
            }
        }

        if !self.storage.update_utxos(block).await? {
            return Ok(Err(CoinbaseError::UtxoConflict { height }));
        }
        Ok(Ok(()))
    }
}
