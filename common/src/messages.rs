//! Definition of Keel messages

use crate::{Block, BlockHash};

/// A block has arrived from upstream and awaits organization
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockAvailableMessage {
    /// Wire block
    pub block: Block,
}

/// A block was appended to the tip of the accepted chain
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockAcceptedMessage {
    /// Height of the new tip
    pub height: u64,

    /// Block hash
    pub hash: BlockHash,
}

/// The accepted chain switched to a heavier fork
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChainReorganizedMessage {
    /// Height of the last block shared by the old and new chains
    pub fork_height: u64,

    /// Blocks now in the accepted chain above the fork, oldest first
    pub arrivals: Vec<Block>,

    /// Blocks displaced from the accepted chain, oldest first
    pub replaced: Vec<Block>,
}

/// A block failed verification and was discarded
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockRejectedMessage {
    /// Block hash
    pub hash: BlockHash,
}

// === Global message enum ===
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    BlockAvailable(BlockAvailableMessage),     // Block arrived
    BlockAccepted(BlockAcceptedMessage),       // Tip extended
    ChainReorganized(ChainReorganizedMessage), // Tail replaced
    BlockRejected(BlockRejectedMessage),       // Verification failed
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

impl From<ChainReorganizedMessage> for Message {
    fn from(msg: ChainReorganizedMessage) -> Self {
        Message::ChainReorganized(msg)
    }
}

impl From<BlockRejectedMessage> for Message {
    fn from(msg: BlockRejectedMessage) -> Self {
        Message::BlockRejected(msg)
    }
}
