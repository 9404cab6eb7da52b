//! Applied blocks

use bitmask_enum::bitmask;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{AccountId, BlockHash, CycleIndex, Level, Mutez, RewardSplit};

/// Boundary events a block triggers
#[bitmask(u32)]
pub enum BlockEvents {
    CycleBegin,
    CycleEnd,
    ProtocolBegin,
    ProtocolEnd,
    Deactivations,
    BalanceSnapshot,
}

/// Operation kinds present in a block
#[bitmask(u32)]
pub enum OperationKinds {
    Endorsements,
    Preendorsements,
    NonceRevelations,
    DoubleBaking,
    DoubleEndorsing,
    Activations,
    Reveals,
    Transactions,
    Originations,
    Delegations,
    Staking,
    SmartRollups,
    DalCommitments,
    Migrations,
    EndorsingRewards,
    FreezerUpdates,
}

macro_rules! impl_bits_serde {
    ($name:ident) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_u32(self.bits())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                u32::deserialize(deserializer).map(Self::from)
            }
        }
    };
}

impl_bits_serde!(BlockEvents);
impl_bits_serde!(OperationKinds);

/// A baker deactivated by a block, with the deactivation level it had before
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deactivation {
    pub baker_id: AccountId,
    pub prev_deactivation_level: Level,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub level: Level,
    pub hash: BlockHash,
    pub predecessor: BlockHash,
    pub protocol_code: i32,
    pub timestamp: DateTime<Utc>,
    pub cycle: CycleIndex,

    /// Round (or priority) the payload was produced at
    pub payload_round: i32,

    /// Baker of the payload, credited with the block reward and fees
    pub producer_id: AccountId,

    /// Baker that proposed the block, credited with the bonus
    pub proposer_id: AccountId,

    pub events: BlockEvents,
    pub operations: OperationKinds,

    /// Endorsement slots included in the block
    pub validations: i32,

    pub reward: RewardSplit,
    pub bonus: RewardSplit,
    pub fees: Mutez,

    /// Security deposit frozen for producing the block (roll era)
    pub deposit: Mutez,

    /// Deactivation levels the producer/proposer had before this block
    pub reset_producer_deactivation: Option<Level>,
    pub reset_proposer_deactivation: Option<Level>,

    pub deactivations: Vec<Deactivation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_survive_serialization() {
        let events = BlockEvents::CycleBegin | BlockEvents::BalanceSnapshot;
        let json = serde_json::to_string(&events).unwrap();
        let back: BlockEvents = serde_json::from_str(&json).unwrap();
        assert_eq!(back, events);
        assert!(back.contains(BlockEvents::CycleBegin));
        assert!(!back.contains(BlockEvents::CycleEnd));
    }

    #[test]
    fn empty_kinds_have_no_bits() {
        let kinds = OperationKinds::none();
        assert_eq!(kinds.bits(), 0);
        assert!((kinds | OperationKinds::Transactions).contains(OperationKinds::Transactions));
    }
}
