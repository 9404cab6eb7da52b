//! Per-(baker, cycle) rolling aggregates

use serde::{Deserialize, Serialize};

use crate::{AccountId, CycleIndex, Mutez};

/// A reward broken down by who ends up owning it
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSplit {
    /// Liquid part, credited to the baker's spendable balance
    pub delegated: Mutez,

    /// Part auto-staked on the baker's own stake
    pub staked_own: Mutez,

    /// Baker's edge taken from the stakers' share
    pub staked_edge: Mutez,

    /// Stakers' share, held at the baker as external stake
    pub staked_shared: Mutez,
}

impl RewardSplit {
    pub fn liquid(amount: Mutez) -> Self {
        Self {
            delegated: amount,
            ..Default::default()
        }
    }

    pub fn total(&self) -> Mutez {
        self.delegated + self.staked_own + self.staked_edge + self.staked_shared
    }

    /// Part that lands in the baker's own `balance`
    pub fn to_baker(&self) -> Mutez {
        self.delegated + self.staked_own + self.staked_edge
    }

    pub fn add(&mut self, other: &RewardSplit) {
        self.delegated += other.delegated;
        self.staked_own += other.staked_own;
        self.staked_edge += other.staked_edge;
        self.staked_shared += other.staked_shared;
    }

    pub fn sub(&mut self, other: &RewardSplit) {
        self.delegated -= other.delegated;
        self.staked_own -= other.staked_own;
        self.staked_edge -= other.staked_edge;
        self.staked_shared -= other.staked_shared;
    }
}

/// Amounts an offender lost to a slashing, by source
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashedAmounts {
    pub own_staked: Mutez,
    pub own_unstaked: Mutez,
    pub external_staked: Mutez,
    pub external_unstaked: Mutez,
    pub frozen_deposits: Mutez,
    pub frozen_rewards: Mutez,
    pub frozen_fees: Mutez,
}

impl SlashedAmounts {
    /// Part taken from the offender's own balance
    pub fn own(&self) -> Mutez {
        self.own_staked
            + self.own_unstaked
            + self.frozen_deposits
            + self.frozen_rewards
            + self.frozen_fees
    }

    pub fn external(&self) -> Mutez {
        self.external_staked + self.external_unstaked
    }

    pub fn total(&self) -> Mutez {
        self.own() + self.external()
    }

    pub fn add(&mut self, other: &SlashedAmounts) {
        self.own_staked += other.own_staked;
        self.own_unstaked += other.own_unstaked;
        self.external_staked += other.external_staked;
        self.external_unstaked += other.external_unstaked;
        self.frozen_deposits += other.frozen_deposits;
        self.frozen_rewards += other.frozen_rewards;
        self.frozen_fees += other.frozen_fees;
    }

    pub fn sub(&mut self, other: &SlashedAmounts) {
        self.own_staked -= other.own_staked;
        self.own_unstaked -= other.own_unstaked;
        self.external_staked -= other.external_staked;
        self.external_unstaked -= other.external_unstaked;
        self.frozen_deposits -= other.frozen_deposits;
        self.frozen_rewards -= other.frozen_rewards;
        self.frozen_fees -= other.frozen_fees;
    }
}

/// Expected and actual baking activity of one baker within one cycle.
/// Seeded at cycle rollover and then only adjusted incrementally.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BakerCycle {
    pub cycle: CycleIndex,
    pub baker_id: AccountId,

    // Stake as of the snapshot the cycle was seeded from
    pub own_delegated_balance: Mutez,
    pub external_delegated_balance: Mutez,
    pub delegators_count: i32,
    pub own_staked_balance: Mutez,
    pub external_staked_balance: Mutez,
    pub stakers_count: i32,
    pub baking_power: Mutez,
    pub total_baking_power: Mutez,

    pub future_blocks: i32,
    pub blocks: i32,
    pub missed_blocks: i32,
    pub extra_blocks: i32,
    pub future_block_rewards: Mutez,
    pub missed_block_rewards: Mutez,
    pub block_rewards: RewardSplit,
    pub block_fees: Mutez,

    /// Roll-era security deposits frozen during the cycle
    pub block_deposits: Mutez,
    pub endorsement_deposits: Mutez,

    pub future_endorsements: i32,
    pub endorsements: i32,
    pub missed_endorsements: i32,
    pub future_endorsement_rewards: Mutez,
    pub missed_endorsement_rewards: Mutez,
    pub endorsement_rewards: RewardSplit,

    pub nonce_revelation_rewards: RewardSplit,

    pub double_baking_rewards: Mutez,
    pub double_baking_losses: SlashedAmounts,
    pub double_endorsing_rewards: Mutez,
    pub double_endorsing_losses: SlashedAmounts,
}

impl BakerCycle {
    pub fn new(cycle: CycleIndex, baker_id: AccountId) -> Self {
        Self {
            cycle,
            baker_id,
            ..Default::default()
        }
    }
}
