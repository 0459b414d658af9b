// Multiverse common library - main library exports

pub mod child_headers;
pub mod crypto;
pub mod difficulty;
pub mod hash;
pub mod memory_store;
pub mod messages;
pub mod params;
pub mod store;
pub mod types;

// Flattened re-exports
pub use self::hash::*;
pub use self::params::ConsensusParams;
pub use self::store::{BlockKey, ChainState, Storage, TxHandler};
pub use self::types::*;
