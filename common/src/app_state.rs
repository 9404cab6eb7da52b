use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BlockHash, CycleIndex, Level, OperationId, ProtocolHash};

/// Singleton row describing the ledger head and id allocators
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    /// Level of the head block, 0 before anything was applied
    pub level: Level,
    pub hash: Option<BlockHash>,
    pub timestamp: Option<DateTime<Utc>>,
    pub cycle: CycleIndex,
    pub protocol_code: i32,
    pub next_protocol: Option<ProtocolHash>,

    /// Next ids to hand out
    pub next_account_id: i32,
    pub next_operation_id: OperationId,

    /// Highest level ever applied, used to bound reorg depth
    pub highest_applied: Level,
}

impl AppState {
    pub fn is_empty(&self) -> bool {
        self.hash.is_none()
    }
}
