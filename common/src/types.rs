//! Multiverse data model: chains, blocks, child headers, transactions and the
//! records the consensus core hands back to its callers.

use crate::hash::{Address, Hash256};
use dashu_int::UBig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifies the primary ledger or one of the child ledgers watched by a rover
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
    Primary,
    Btc,
    Eth,
    Lsk,
    Neo,
    Wav,
}

impl ChainId {
    /// Child chains in commitment order
    pub const CHILDREN: [ChainId; 5] =
        [ChainId::Btc, ChainId::Eth, ChainId::Lsk, ChainId::Neo, ChainId::Wav];

    pub fn is_child(&self) -> bool {
        !matches!(self, ChainId::Primary)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainId::Primary => "bc",
            ChainId::Btc => "btc",
            ChainId::Eth => "eth",
            ChainId::Lsk => "lsk",
            ChainId::Neo => "neo",
            ChainId::Wav => "wav",
        };
        f.write_str(name)
    }
}

/// One header reported by a child chain and embedded in a primary block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildHeader {
    pub chain: ChainId,
    pub height: u64,
    pub hash: Hash256,
    pub previous_hash: Hash256,
    /// Milliseconds
    pub timestamp: u64,
    pub merkle_root: Hash256,
    pub confirmations_in_parent: u32,
}

/// Per-chain ordered header lists. An absent chain is an empty list.
pub type ChildHeaderMap = BTreeMap<ChainId, Vec<ChildHeader>>;

/// Reference to a transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_hash: Hash256,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub out_point: OutPoint,
    pub unlock_script: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// NRG base units
    pub value: u64,
    pub lock_script: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: Hash256,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

/// Fixed per-transaction overhead in the size estimate (hash + counts)
const TX_OVERHEAD_BYTES: usize = 40;
/// Outpoint bytes per input
const TX_INPUT_BYTES: usize = 36;
/// Value bytes per output
const TX_OUTPUT_BYTES: usize = 8;

impl Transaction {
    /// The coinbase is the only transaction without inputs
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Sum of all output values
    pub fn output_value(&self) -> u64 {
        self.outputs.iter().fold(0u64, |acc, o| acc.saturating_add(o.value))
    }

    /// Estimated serialized size in bytes
    pub fn size(&self) -> usize {
        TX_OVERHEAD_BYTES
            + self.inputs.iter().map(|i| TX_INPUT_BYTES + i.unlock_script.len()).sum::<usize>()
            + self.outputs.iter().map(|o| TX_OUTPUT_BYTES + o.lock_script.len()).sum::<usize>()
    }
}

/// A sealed primary-chain block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: Hash256,
    pub previous_hash: Hash256,
    /// Seconds
    pub timestamp: u64,
    pub miner: Address,
    pub difficulty: UBig,
    pub distance: UBig,
    pub total_distance: UBig,
    /// Commitment to the embedded child header hashes
    pub chain_root: Hash256,
    pub merkle_root: Hash256,
    pub nrg_grant: u64,
    pub child_headers: ChildHeaderMap,
    pub txs: Vec<Transaction>,
}

impl Block {
    /// Headers embedded for `chain`, empty when the chain is absent
    pub fn headers(&self, chain: ChainId) -> &[ChildHeader] {
        self.child_headers.get(&chain).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True when no child chain reports any header (genesis)
    pub fn has_no_child_headers(&self) -> bool {
        self.child_headers.values().all(Vec::is_empty)
    }

    /// Transactions with zero inputs
    pub fn coinbase_txs(&self) -> impl Iterator<Item = &Transaction> {
        self.txs.iter().filter(|tx| tx.is_coinbase())
    }
}

/// Where a block handed to the multiverse came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockSource {
    /// Received from the named peer
    Peer(String),
    /// Sealed by the local miner
    Miner,
    /// Assembled from rover reports
    Rover(ChainId),
}

/// Deferred operation requested by a sequence validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOperation {
    ExtendMultiverse,
}

/// A deferred re-check of one child chain at a given primary height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub height: u64,
    pub operation: ScheduleOperation,
    pub reference_chain: ChainId,
    pub reference_hash: Hash256,
    pub target_chain: ChainId,
}

/// Outcome of validating a run of primary blocks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub schedules: Vec<ScheduleEntry>,
}

impl ValidationReport {
    pub fn valid() -> Self {
        Self {
            valid: true,
            schedules: Vec::new(),
        }
    }

    pub fn invalid() -> Self {
        Self::default()
    }
}

/// A height range that must be fetched before a branch switch can complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgWindow {
    pub chain: ChainId,
    pub lowest_height: u64,
    pub highest_height: u64,
    pub lowest_hash: Option<Hash256>,
    pub highest_hash: Option<Hash256>,
    pub notify_rover: bool,
}

/// Initial sync progress marker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Pending,
    Reorg,
    Complete,
}

/// The peer currently driving initial sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMarker {
    pub address: String,
    /// Milliseconds since the epoch after which the peer is considered gone
    pub expires_at: u64,
}

impl PeerMarker {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at <= now_ms
    }
}

/// Snapshot of the sync markers held in chain state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMarkers {
    pub initial_peer: Option<PeerMarker>,
    pub sync_edge: Option<u64>,
    pub initial_sync: SyncStatus,
}

/// Options for block writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutOptions {
    /// Also index the embedded child headers
    pub save_headers: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self { save_headers: true }
    }
}

/// Span of provisional reorg blocks written by storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgSpan {
    pub from: u64,
}
