//! Per-protocol constants, loaded once from configuration and never mutated

use serde::{Deserialize, Serialize};

use crate::{CycleIndex, Level, Mutez, ProtocolHash};

/// Consensus family a protocol belongs to.  Each family owns one accounting
/// strategy; later families are built from earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolVersion {
    /// Roll-based sampling, baking priorities, frozen deposits/rewards/fees
    Rolls,

    /// Rounds, alias sampler, endorsing rewards paid at cycle end
    Tenderbake,

    /// Tenderbake plus external staking and the four-way reward split
    Staking,
}

/// Numeric constants of a protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProtocolConstants {
    pub blocks_per_cycle: i32,
    pub preserved_cycles: i32,
    pub blocks_per_snapshot: i32,

    /// Minimal stake for a baker to be selected for rights
    pub minimal_stake: Mutez,

    /// Roll size, only used by roll-based sampling
    #[serde(default)]
    pub tokens_per_roll: Mutez,

    /// Consensus committee size per level
    pub endorsers_per_block: i32,

    /// Number of baking rounds (priorities) generated per level up front
    pub baking_rounds: i32,

    pub block_reward: Mutez,

    #[serde(default)]
    pub block_bonus_per_slot: Mutez,

    pub endorsement_reward_per_slot: Mutez,

    /// Endorsement slots needed before the bonus starts
    #[serde(default)]
    pub consensus_threshold: i32,

    #[serde(default)]
    pub block_deposit: Mutez,

    #[serde(default)]
    pub endorsement_deposit_per_slot: Mutez,

    pub revelation_reward: Mutez,

    pub byte_cost: Mutez,

    pub origination_size: i32,

    /// Edge given to bakers that never set their own, in billionths
    #[serde(default = "default_edge")]
    pub default_edge_of_baking_over_staking: i64,
}

fn default_edge() -> i64 {
    100_000_000
}

impl ProtocolConstants {
    /// Burn charged when a new implicit or originated account is allocated
    pub fn allocation_fee(&self) -> Mutez {
        self.origination_size as Mutez * self.byte_cost
    }

    pub fn snapshots_per_cycle(&self) -> i32 {
        (self.blocks_per_cycle / self.blocks_per_snapshot.max(1)).max(1)
    }
}

/// One configured protocol: its identity, where it starts and its constants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProtocolParams {
    pub hash: ProtocolHash,
    pub code: i32,
    pub version: ProtocolVersion,

    /// First level the protocol is active at
    pub first_level: Level,

    /// Cycle numbering anchor: `first_cycle` starts at `first_cycle_level`
    #[serde(default)]
    pub first_cycle: CycleIndex,
    #[serde(default = "default_first_cycle_level")]
    pub first_cycle_level: Level,

    pub constants: ProtocolConstants,
}

fn default_first_cycle_level() -> Level {
    1
}

impl ProtocolParams {
    pub fn cycle_of(&self, level: Level) -> CycleIndex {
        self.first_cycle + (level - self.first_cycle_level) / self.constants.blocks_per_cycle
    }

    pub fn first_level_of(&self, cycle: CycleIndex) -> Level {
        self.first_cycle_level + (cycle - self.first_cycle) * self.constants.blocks_per_cycle
    }

    pub fn last_level_of(&self, cycle: CycleIndex) -> Level {
        self.first_level_of(cycle) + self.constants.blocks_per_cycle - 1
    }

    pub fn is_cycle_start(&self, level: Level) -> bool {
        (level - self.first_cycle_level).rem_euclid(self.constants.blocks_per_cycle) == 0
    }

    pub fn is_cycle_end(&self, level: Level) -> bool {
        self.is_cycle_start(level + 1)
    }

    /// Stake snapshots are taken every `blocks_per_snapshot` levels within a cycle
    pub fn is_snapshot_level(&self, level: Level) -> bool {
        let position = (level - self.first_cycle_level).rem_euclid(self.constants.blocks_per_cycle);
        (position + 1) % self.constants.blocks_per_snapshot.max(1) == 0
    }

    /// Level of snapshot `index` within `cycle`
    pub fn snapshot_level(&self, cycle: CycleIndex, index: i32) -> Level {
        self.first_level_of(cycle) + (index + 1) * self.constants.blocks_per_snapshot - 1
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn test_constants() -> ProtocolConstants {
        ProtocolConstants {
            blocks_per_cycle: 8,
            preserved_cycles: 2,
            blocks_per_snapshot: 4,
            minimal_stake: 1_000,
            tokens_per_roll: 1_000,
            endorsers_per_block: 8,
            baking_rounds: 4,
            block_reward: 100,
            block_bonus_per_slot: 5,
            endorsement_reward_per_slot: 10,
            consensus_threshold: 6,
            block_deposit: 0,
            endorsement_deposit_per_slot: 0,
            revelation_reward: 7,
            byte_cost: 250,
            origination_size: 257,
            default_edge_of_baking_over_staking: 100_000_000,
        }
    }

    fn params() -> ProtocolParams {
        ProtocolParams {
            hash: ProtocolHash::from("PtTest"),
            code: 1,
            version: ProtocolVersion::Tenderbake,
            first_level: 1,
            first_cycle: 0,
            first_cycle_level: 1,
            constants: test_constants(),
        }
    }

    #[test]
    fn cycles_are_anchored_at_first_cycle_level() {
        let p = params();
        assert_eq!(p.cycle_of(1), 0);
        assert_eq!(p.cycle_of(8), 0);
        assert_eq!(p.cycle_of(9), 1);
        assert_eq!(p.first_level_of(2), 17);
        assert_eq!(p.last_level_of(2), 24);
        assert!(p.is_cycle_start(9));
        assert!(p.is_cycle_end(16));
        assert!(!p.is_cycle_end(15));
    }

    #[test]
    fn snapshots_fall_on_every_nth_level() {
        let p = params();
        assert!(p.is_snapshot_level(4));
        assert!(p.is_snapshot_level(8));
        assert!(!p.is_snapshot_level(5));
        assert_eq!(p.snapshot_level(1, 0), 12);
        assert_eq!(p.snapshot_level(1, 1), 16);
        assert_eq!(p.constants.snapshots_per_cycle(), 2);
    }

    #[test]
    fn constants_deserialize_from_kebab_case() {
        let json = r#"{
            "hash": "PtTest", "code": 3, "version": "staking", "first-level": 1,
            "constants": {
                "blocks-per-cycle": 8, "preserved-cycles": 2, "blocks-per-snapshot": 4,
                "minimal-stake": 1000, "endorsers-per-block": 8, "baking-rounds": 4,
                "block-reward": 100, "endorsement-reward-per-slot": 10,
                "revelation-reward": 7, "byte-cost": 250, "origination-size": 257
            }
        }"#;
        let p: ProtocolParams = serde_json::from_str(json).unwrap();
        assert_eq!(p.version, ProtocolVersion::Staking);
        assert_eq!(p.first_cycle_level, 1);
        assert_eq!(p.constants.default_edge_of_baking_over_staking, 100_000_000);
        assert_eq!(p.constants.allocation_fee(), 64_250);
    }
}
