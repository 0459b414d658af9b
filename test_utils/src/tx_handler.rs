use anyhow::Result;
use async_trait::async_trait;
use bc_common::{Block, Transaction, TxHandler};

/// Tx handler charging a flat fee per non-coinbase transaction
#[derive(Debug, Clone, Default)]
pub struct FixedFeeTxHandler {
    pub fee: u64,
    pub emblem_bonus: u64,
    pub reject_all: bool,
}

impl FixedFeeTxHandler {
    pub fn new(fee: u64) -> Self {
        Self {
            fee,
            ..Self::default()
        }
    }
}

#[async_trait]
impl TxHandler for FixedFeeTxHandler {
    async fn validate_txs(&self, _block: &Block) -> Result<bool> {
        Ok(!self.reject_all)
    }

    async fn calculate_fee(&self, tx: &Transaction) -> Result<u64> {
        Ok(if tx.is_coinbase() { 0 } else { self.fee })
    }

    async fn emblem_bonus(&self, _block: &Block) -> Result<u64> {
        Ok(self.emblem_bonus)
    }
}
