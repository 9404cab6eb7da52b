//! Stored operations.
//!
//! Each row records every value its apply step used, so that revert can
//! subtract exactly those amounts instead of recomputing them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    AccountId, CycleIndex, Level, Mutez, OperationHash, OperationId, RewardSplit, SlashedAmounts,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Applied,
    Failed,
    Backtracked,
    Skipped,
}

impl OperationStatus {
    pub fn is_applied(self) -> bool {
        self == OperationStatus::Applied
    }
}

/// Fields of operations signed and paid for by a manager account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerFields {
    pub sender_id: AccountId,
    pub counter: i64,

    /// Set for internal operations: the account that signed the outer operation
    pub initiator_id: Option<AccountId>,
    pub nonce: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StakingAction {
    Stake,
    Unstake,
    Finalize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationKind {
    Bootstrap,
    ProtocolMigration,
    Subsidy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreezerCategory {
    Deposits,
    Rewards,
    Fees,
    Staked,
}

/// Double baking or double endorsing evidence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub accuser_id: AccountId,
    pub offender_id: AccountId,
    pub accused_level: Level,
    pub reward: Mutez,
    pub lost: SlashedAmounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationBody {
    Endorsement {
        delegate_id: AccountId,
        slots: i32,
        reward: Mutez,
        deposit: Mutez,
        /// Deactivation level the delegate had before endorsing, when it moved
        reset_deactivation: Option<Level>,
    },
    Preendorsement {
        delegate_id: AccountId,
        slots: i32,
    },
    NonceRevelation {
        /// Block producer receiving the reward
        baker_id: AccountId,
        /// Baker whose nonce is revealed
        sender_id: AccountId,
        revealed_level: Level,
        revealed_cycle: CycleIndex,
        nonce: String,
        reward: RewardSplit,
    },
    DoubleBaking(Evidence),
    DoubleEndorsing(Evidence),
    Activation {
        account_id: AccountId,
        balance: Mutez,
        allocated: bool,
    },
    Reveal,
    Transaction {
        target_id: Option<AccountId>,
        target_allocated: bool,
        amount: Mutez,
        entrypoint: Option<String>,
    },
    Origination {
        contract_id: Option<AccountId>,
        delegate_id: Option<AccountId>,
        balance: Mutez,
    },
    Delegation {
        prev_delegate_id: Option<AccountId>,
        prev_delegation_level: Option<Level>,
        prev_staked: bool,
        delegate_id: Option<AccountId>,
        amount: Mutez,
        /// The sender was promoted to baker by this operation
        registration: bool,
        /// Deactivation level the baker had before re-activating
        reactivated_from: Option<Level>,
    },
    Staking {
        baker_id: AccountId,
        action: StakingAction,
        amount: Mutez,
        /// Part of `amount` moved on an external staker's own stake counters;
        /// shared rewards make the baker-side amount larger
        mirrored: Mutez,
        /// The sender became a new staker (or stopped being one) through this operation
        staker_count_change: i32,
    },
    SmartRollupOriginate {
        rollup_id: Option<AccountId>,
    },
    SmartRollupPublish {
        rollup_id: Option<AccountId>,
        bond: Mutez,
    },
    SmartRollupRecoverBond {
        rollup_id: Option<AccountId>,
        staker_id: AccountId,
        bond: Mutez,
    },
    DalPublishCommitment {
        slot_index: i32,
    },
    Migration {
        account_id: AccountId,
        kind: MigrationKind,
        balance_change: Mutez,
        allocated: bool,
    },
    EndorsingReward {
        baker_id: AccountId,
        cycle: CycleIndex,
        /// Baker's future reward bucket when settled
        expected: Mutez,
        received: RewardSplit,
    },
    FreezerUpdate {
        baker_id: AccountId,
        category: FreezerCategory,
        cycle: Option<CycleIndex>,
        change: Mutez,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub level: Level,
    pub timestamp: DateTime<Utc>,
    pub hash: Option<OperationHash>,
    pub status: OperationStatus,
    pub manager: Option<ManagerFields>,

    pub fee: Mutez,
    pub gas_used: i64,
    pub storage_used: i32,
    pub storage_fee: Mutez,
    pub allocation_fee: Mutez,

    pub body: OperationBody,
}

impl Operation {
    /// Amount burned from the sender on top of the fee
    pub fn burned(&self) -> Mutez {
        self.storage_fee + self.allocation_fee
    }
}
