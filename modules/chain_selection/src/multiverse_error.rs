//! Error types for chain selection.

use bc_common::{ChainId, Hash256};

/// Stateless defects in a block. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructuralError {
    #[error("height must be at least 1")]
    ZeroHeight,

    #[error("block hash is zero")]
    ZeroHash,

    /// Only genesis may omit its parent
    #[error("previous hash is zero above genesis")]
    ZeroPreviousHash,

    #[error("timestamp is zero")]
    ZeroTimestamp,

    #[error("difficulty is zero above genesis")]
    ZeroDifficulty,

    #[error("total distance is below the block's own distance")]
    TotalDistanceBelowDistance,

    /// Primary chain headers cannot be embedded
    #[error("headers listed under {0}")]
    NotAChildChain(ChainId),

    #[error("{found} header listed under {listed}")]
    MislabelledHeader { listed: ChainId, found: ChainId },

    #[error("{0} headers are not strictly ascending")]
    HeaderOrder(ChainId),

    #[error("chain root {found} does not commit to the headers, expected {expected}")]
    ChainRoot { expected: Hash256, found: Hash256 },
}

/// Failures that stop an evaluation altogether
#[derive(Debug, thiserror::Error)]
pub enum MultiverseError {
    /// Nothing can be decided without the canonical latest block
    #[error("latest block pointer is unreadable")]
    NoLatestBlock,

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}
