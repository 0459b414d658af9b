// Test helpers shared by the multiverse modules

pub mod chain_builder;
pub mod tx_handler;
pub mod yielding_store;

pub use chain_builder::{
    child_header, coinbase, header_hash, header_run, reseal, test_params, BlockDraft,
    ChainBuilder, BLOCK_DISTANCE, BLOCK_INTERVAL, GENESIS_DIFFICULTY, GENESIS_TIMESTAMP,
};
pub use tx_handler::FixedFeeTxHandler;
pub use yielding_store::YieldingStore;
