//! Definition of Bakehouse messages

use caryatid_module_clock::messages::ClockTickMessage;
use serde::{Deserialize, Serialize};

use crate::node::NodeBlock;
use crate::{BlockHash, BlockInfo, CycleIndex, Level, Statistics};

/// Rollback to an ancestor: everything above `level` is abandoned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackMessage {
    pub level: Level,
    pub hash: BlockHash,
}

/// New ledger head after a block was applied or reverted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHeadMessage {
    pub level: Level,
    pub hash: Option<BlockHash>,
    pub cycle: CycleIndex,
    pub statistics: Option<Statistics>,

    /// Set once ingestion stopped after a failure
    pub halted: bool,
}

/// Chain messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChainMessage {
    /// Block document from the node
    NodeBlock(Box<NodeBlock>),

    /// Chain reorganisation
    Rollback(RollbackMessage),

    /// Ledger head moved
    LedgerHead(LedgerHeadMessage),
}

// === Global message enum ===
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    // Caryatid standard messages
    Clock(ClockTickMessage), // Clock tick

    // Chain messages with common BlockInfo
    Chain((BlockInfo, ChainMessage)),
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

// Casts from specific messages
impl From<ClockTickMessage> for Message {
    fn from(msg: ClockTickMessage) -> Self {
        Message::Clock(msg)
    }
}
