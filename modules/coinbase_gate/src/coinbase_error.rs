//! Reasons a block fails the economic checks.

/// Economic invalidity found while applying a block's UTXO effects.
/// Never retried: a block failing any of these is treated as malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoinbaseError {
    /// Blocks above genesis carry exactly one zero-input transaction
    #[error("block {height} has {found} coinbase transactions")]
    CoinbaseCount { height: u64, found: usize },

    #[error("block {height} grants {found} NRG, expected {expected}")]
    GrantMismatch { height: u64, expected: u64, found: u64 },

    /// Coinbase output must be exactly grant plus fees
    #[error("coinbase of block {height} pays {found}, expected {expected}")]
    CoinbaseValue { height: u64, expected: u64, found: u64 },

    /// Grant plus fees does not fit in the value type
    #[error("coinbase value of block {height} overflows")]
    ValueOverflow { height: u64 },

    #[error("transactions of block {height} take {size} bytes, limit {limit}")]
    Oversized { height: u64, size: usize, limit: usize },

    #[error("transactions of block {height} rejected by the tx handler")]
    TxsRejected { height: u64 },

    /// Spends of unknown outputs or a different block already applied at this height
    #[error("UTXO update for block {height} conflicts with stored state")]
    UtxoConflict { height: u64 },
}
