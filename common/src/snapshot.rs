use serde::{Deserialize, Serialize};

use crate::{AccountId, Level, Mutez};

/// Stake of one baker as of a snapshot level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBalance {
    pub level: Level,
    pub account_id: AccountId,
    pub baker_id: AccountId,

    /// Baker's own liquid balance (excluding own stake and unstake requests)
    pub own_delegated_balance: Mutez,
    pub external_delegated_balance: Mutez,
    pub delegators_count: i32,
    pub own_staked_balance: Mutez,
    pub external_staked_balance: Mutez,
    pub stakers_count: i32,
}

impl SnapshotBalance {
    pub fn delegated(&self) -> Mutez {
        self.own_delegated_balance + self.external_delegated_balance
    }

    pub fn staked(&self) -> Mutez {
        self.own_staked_balance + self.external_staked_balance
    }
}
