//! Definition of message types carried on the bus

use crate::hash::Hash256;
use crate::types::{Block, BlockSource, ChildHeader, ReorgWindow, ScheduleEntry};

/// Block available for chain selection
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockAvailableMessage {
    /// The sealed block
    pub block: Block,

    /// Who handed it to us
    pub source: BlockSource,
}

/// Block accepted as the new canonical latest
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockAcceptedMessage {
    pub block: Block,

    /// True when the block replaced a sibling rather than extending the tip
    pub spliced: bool,
}

/// A range of blocks is needed before a branch switch can complete
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RangeRequestMessage {
    pub window: ReorgWindow,
    pub schedules: Vec<ScheduleEntry>,
}

/// Child chains that need re-validation later
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScheduleMessage {
    pub schedules: Vec<ScheduleEntry>,
}

/// New header reported by a rover
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RoverHeaderMessage {
    pub header: ChildHeader,

    /// Headers received but not yet embedded in any primary block
    pub pending: Vec<ChildHeader>,
}

/// A previously requested range has been fetched
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReorgBranchMessage {
    pub blocks: Vec<Block>,
}

/// UTXO application finished and the simplex token was released
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SimplexClearedMessage {
    pub height: u64,
    pub hash: Hash256,
}

// === Global message enum ===
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    // Multiverse messages
    BlockAvailable(BlockAvailableMessage),
    BlockAccepted(BlockAcceptedMessage),
    RangeRequest(RangeRequestMessage),
    Schedule(ScheduleMessage),
    RoverHeader(RoverHeaderMessage),
    ReorgBranch(ReorgBranchMessage),
    SimplexCleared(SimplexClearedMessage),
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

// Casts from specific messages
impl From<BlockAvailableMessage> for Message {
    fn from(msg: BlockAvailableMessage) -> Self {
        Message::BlockAvailable(msg)
    }
}

impl From<BlockAcceptedMessage> for Message {
    fn from(msg: BlockAcceptedMessage) -> Self {
        Message::BlockAccepted(msg)
    }
}

impl From<RangeRequestMessage> for Message {
    fn from(msg: RangeRequestMessage) -> Self {
        Message::RangeRequest(msg)
    }
}

impl From<ScheduleMessage> for Message {
    fn from(msg: ScheduleMessage) -> Self {
        Message::Schedule(msg)
    }
}

impl From<SimplexClearedMessage> for Message {
    fn from(msg: SimplexClearedMessage) -> Self {
        Message::SimplexCleared(msg)
    }
}

impl From<RoverHeaderMessage> for Message {
    fn from(msg: RoverHeaderMessage) -> Self {
        Message::RoverHeader(msg)
    }
}

impl From<ReorgBranchMessage> for Message {
    fn from(msg: ReorgBranchMessage) -> Self {
        Message::ReorgBranch(msg)
    }
}
