//! Block documents as supplied by the chain node.
//!
//! Amounts arrive as decimal strings; everything else mirrors the node's
//! JSON layout closely enough that a raw RPC dump deserializes directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use crate::{Address, BlockHash, CycleIndex, Level, Mutez, OperationHash, ProtocolHash};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeBlock {
    pub hash: BlockHash,
    pub protocol: ProtocolHash,
    pub header: NodeHeader,
    pub metadata: NodeMetadata,
    #[serde(default)]
    pub operations: Vec<NodeOperationGroup>,
}

impl NodeBlock {
    pub fn level(&self) -> Level {
        self.header.level
    }

    /// All operation contents in on-chain order, with their group hash
    pub fn contents(&self) -> impl Iterator<Item = (&OperationHash, &NodeContent)> {
        self.operations
            .iter()
            .flat_map(|group| group.contents.iter().map(move |c| (&group.hash, c)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHeader {
    pub level: Level,
    pub predecessor: BlockHash,
    pub timestamp: DateTime<Utc>,

    /// Tenderbake round of the payload
    #[serde(default)]
    pub payload_round: Option<i32>,

    /// Roll-era baking priority
    #[serde(default)]
    pub priority: Option<i32>,
}

impl NodeHeader {
    pub fn round(&self) -> Option<i32> {
        self.payload_round.or(self.priority)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelInfo {
    pub level: Level,
    pub cycle: CycleIndex,
    pub cycle_position: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub next_protocol: ProtocolHash,

    /// Payload producer
    pub baker: Address,

    /// Block proposer, when different from the payload producer
    #[serde(default)]
    pub proposer: Option<Address>,

    pub level_info: LevelInfo,

    #[serde(default)]
    pub voting_period_kind: Option<String>,

    #[serde(default)]
    pub deactivated: Vec<Address>,

    #[serde(default)]
    pub balance_updates: Vec<BalanceUpdate>,

    /// Present on the first block of a chain or protocol when accounts are injected
    #[serde(default)]
    pub migration: Option<MigrationInfo>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationInfo {
    #[serde(default)]
    pub bootstrap_accounts: Vec<BootstrapAccount>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapAccount {
    pub address: Address,
    #[serde_as(as = "DisplayFromStr")]
    pub balance: Mutez,

    /// Self-delegated accounts are registered as bakers
    #[serde(default)]
    pub delegate: Option<Address>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceKind {
    Contract,
    Freezer,
    Accumulator,
    Minted,
    Burned,
    Commitment,
    Staking,
}

/// Staker a frozen or staked balance belongs to
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staker {
    #[serde(default)]
    pub baker_own_stake: Option<Address>,
    #[serde(default)]
    pub baker_edge: Option<Address>,
    #[serde(default)]
    pub contract: Option<Address>,
    #[serde(default)]
    pub delegate: Option<Address>,
}

impl Staker {
    /// Baker holding the stake
    pub fn baker(&self) -> Option<&Address> {
        self.baker_own_stake
            .as_ref()
            .or(self.baker_edge.as_ref())
            .or(self.delegate.as_ref())
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub kind: BalanceKind,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub contract: Option<Address>,
    #[serde(default)]
    pub delegate: Option<Address>,
    #[serde(default)]
    pub staker: Option<Staker>,
    #[serde(default)]
    pub cycle: Option<CycleIndex>,
    #[serde_as(as = "DisplayFromStr")]
    pub change: Mutez,
    #[serde(default)]
    pub origin: Option<String>,
}

impl BalanceUpdate {
    pub fn is_category(&self, category: &str) -> bool {
        self.category.as_deref() == Some(category)
    }

    /// Baker this update belongs to, looking at every field the node may use
    pub fn baker(&self) -> Option<&Address> {
        self.delegate
            .as_ref()
            .or_else(|| self.staker.as_ref().and_then(Staker::baker))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOperationGroup {
    pub hash: OperationHash,
    pub contents: Vec<NodeContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeContent {
    #[serde(alias = "attestation", alias = "attestation_with_dal")]
    Endorsement(ConsensusContent),
    #[serde(alias = "preattestation")]
    Preendorsement(ConsensusContent),
    SeedNonceRevelation(NonceRevelationContent),
    DoubleBakingEvidence(DoubleBakingContent),
    #[serde(alias = "double_attestation_evidence")]
    DoubleEndorsementEvidence(DoubleEndorsementContent),
    ActivateAccount(ActivationContent),
    Reveal(RevealContent),
    Transaction(TransactionContent),
    Origination(OriginationContent),
    Delegation(DelegationContent),
    SmartRollupOriginate(RollupOriginateContent),
    SmartRollupPublish(RollupPublishContent),
    SmartRollupRecoverBond(RollupRecoverBondContent),
    DalPublishCommitment(DalPublishContent),
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusContent {
    pub level: Level,
    pub metadata: ConsensusMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusMetadata {
    pub delegate: Address,
    #[serde(
        default,
        alias = "endorsement_power",
        alias = "attestation_power",
        alias = "consensus_power"
    )]
    pub power: Option<i32>,

    /// Roll-era slot list
    #[serde(default)]
    pub slots: Vec<i32>,

    #[serde(default)]
    pub balance_updates: Vec<BalanceUpdate>,
}

impl ConsensusMetadata {
    pub fn slots(&self) -> i32 {
        self.power.unwrap_or(self.slots.len() as i32)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleMetadata {
    #[serde(default)]
    pub balance_updates: Vec<BalanceUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonceRevelationContent {
    pub level: Level,
    pub nonce: String,
    #[serde(default)]
    pub metadata: SimpleMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceMetadata {
    #[serde(default)]
    pub balance_updates: Vec<BalanceUpdate>,
    #[serde(default)]
    pub forbidden_delegate: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceHeader {
    pub level: Level,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubleBakingContent {
    pub bh1: EvidenceHeader,
    pub metadata: EvidenceMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceOperation {
    pub operations: EvidenceHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubleEndorsementContent {
    pub op1: EvidenceOperation,
    pub metadata: EvidenceMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationContent {
    pub pkh: Address,
    pub secret: String,
    #[serde(default)]
    pub metadata: SimpleMetadata,
}

/// Fields shared by every manager operation
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerHeader {
    pub source: Address,
    #[serde_as(as = "DisplayFromStr")]
    pub fee: Mutez,
    #[serde_as(as = "DisplayFromStr")]
    pub counter: i64,
    #[serde_as(as = "DisplayFromStr")]
    pub gas_limit: i64,
    #[serde_as(as = "DisplayFromStr")]
    pub storage_limit: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Applied,
    Failed,
    Backtracked,
    Skipped,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub status: ResultStatus,
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub consumed_milligas: Option<i64>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub paid_storage_size_diff: Option<i32>,
    #[serde(default)]
    pub allocated_destination_contract: bool,
    #[serde(default)]
    pub originated_contracts: Vec<Address>,
    /// Address of an originated smart rollup
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub balance_updates: Vec<BalanceUpdate>,
}

impl OperationResult {
    pub fn applied() -> Self {
        Self {
            status: ResultStatus::Applied,
            consumed_milligas: None,
            paid_storage_size_diff: None,
            allocated_destination_contract: false,
            originated_contracts: Vec::new(),
            address: None,
            balance_updates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerMetadata {
    #[serde(default)]
    pub balance_updates: Vec<BalanceUpdate>,
    pub operation_result: OperationResult,
    #[serde(default)]
    pub internal_operation_results: Vec<InternalResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub entrypoint: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevealContent {
    #[serde(flatten)]
    pub manager: ManagerHeader,
    pub public_key: String,
    pub metadata: ManagerMetadata,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionContent {
    #[serde(flatten)]
    pub manager: ManagerHeader,
    #[serde_as(as = "DisplayFromStr")]
    pub amount: Mutez,
    pub destination: Address,
    #[serde(default)]
    pub parameters: Option<Parameters>,
    pub metadata: ManagerMetadata,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginationContent {
    #[serde(flatten)]
    pub manager: ManagerHeader,
    #[serde_as(as = "DisplayFromStr")]
    pub balance: Mutez,
    #[serde(default)]
    pub delegate: Option<Address>,
    pub metadata: ManagerMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationContent {
    #[serde(flatten)]
    pub manager: ManagerHeader,
    #[serde(default)]
    pub delegate: Option<Address>,
    pub metadata: ManagerMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupOriginateContent {
    #[serde(flatten)]
    pub manager: ManagerHeader,
    pub pvm_kind: String,
    pub metadata: ManagerMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupPublishContent {
    #[serde(flatten)]
    pub manager: ManagerHeader,
    pub rollup: Address,
    pub metadata: ManagerMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupRecoverBondContent {
    #[serde(flatten)]
    pub manager: ManagerHeader,
    pub rollup: Address,
    pub staker: Address,
    pub metadata: ManagerMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DalPublishContent {
    #[serde(flatten)]
    pub manager: ManagerHeader,
    pub slot_header: DalSlotHeader,
    pub metadata: ManagerMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DalSlotHeader {
    pub slot_index: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InternalResult {
    Transaction(InternalTransaction),
    Origination(InternalOrigination),
    Delegation(InternalDelegation),
    #[serde(other)]
    Unsupported,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalTransaction {
    pub source: Address,
    pub nonce: i32,
    #[serde_as(as = "DisplayFromStr")]
    pub amount: Mutez,
    pub destination: Address,
    #[serde(default)]
    pub parameters: Option<Parameters>,
    pub result: OperationResult,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalOrigination {
    pub source: Address,
    pub nonce: i32,
    #[serde_as(as = "DisplayFromStr")]
    pub balance: Mutez,
    #[serde(default)]
    pub delegate: Option<Address>,
    pub result: OperationResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalDelegation {
    pub source: Address,
    pub nonce: i32,
    #[serde(default)]
    pub delegate: Option<Address>,
    pub result: OperationResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_JSON: &str = r#"{
        "hash": "BLtest1",
        "protocol": "PtTest",
        "header": {
            "level": 12,
            "predecessor": "BLtest0",
            "timestamp": "2024-03-01T10:00:00Z",
            "payload_round": 1
        },
        "metadata": {
            "next_protocol": "PtTest",
            "baker": "tz1baker",
            "proposer": "tz1proposer",
            "level_info": { "level": 12, "cycle": 1, "cycle_position": 3 },
            "deactivated": ["tz1gone"],
            "balance_updates": [
                { "kind": "minted", "category": "baking rewards", "change": "-100", "origin": "block" },
                { "kind": "contract", "contract": "tz1baker", "change": "100", "origin": "block" },
                { "kind": "freezer", "category": "deposits",
                  "staker": { "baker_own_stake": "tz1baker" }, "change": "25", "origin": "block" }
            ]
        },
        "operations": [
            { "hash": "opA", "contents": [
                { "kind": "attestation", "level": 11,
                  "metadata": { "delegate": "tz1baker", "attestation_power": 5 } },
                { "kind": "transaction", "source": "tz1alice", "fee": "1000", "counter": "17",
                  "gas_limit": "2000", "storage_limit": "0", "amount": "5000",
                  "destination": "KT1contract",
                  "parameters": { "entrypoint": "default", "value": { "prim": "Unit" } },
                  "metadata": {
                      "operation_result": { "status": "applied", "consumed_milligas": "1500123" },
                      "internal_operation_results": [
                          { "kind": "transaction", "source": "KT1contract", "nonce": 0,
                            "amount": "10", "destination": "tz1bob",
                            "result": { "status": "applied", "allocated_destination_contract": true } },
                          { "kind": "event", "source": "KT1contract", "nonce": 1 }
                      ]
                  } },
                { "kind": "ballot" }
            ] }
        ]
    }"#;

    #[test]
    fn node_block_parses() {
        let block: NodeBlock = serde_json::from_str(BLOCK_JSON).unwrap();
        assert_eq!(block.level(), 12);
        assert_eq!(block.header.round(), Some(1));
        assert_eq!(block.metadata.proposer, Some(Address::from("tz1proposer")));
        assert_eq!(block.metadata.deactivated.len(), 1);
        assert_eq!(block.metadata.balance_updates[0].change, -100);
        assert_eq!(
            block.metadata.balance_updates[2].baker(),
            Some(&Address::from("tz1baker"))
        );

        let contents: Vec<_> = block.contents().map(|(_, c)| c).collect();
        assert_eq!(contents.len(), 3);
        match contents[0] {
            NodeContent::Endorsement(e) => assert_eq!(e.metadata.slots(), 5),
            other => panic!("unexpected {other:?}"),
        }
        match contents[1] {
            NodeContent::Transaction(tx) => {
                assert_eq!(tx.manager.fee, 1000);
                assert_eq!(tx.manager.counter, 17);
                assert_eq!(tx.amount, 5000);
                assert_eq!(tx.metadata.operation_result.consumed_milligas, Some(1500123));
                assert_eq!(tx.metadata.internal_operation_results.len(), 2);
                assert!(matches!(
                    tx.metadata.internal_operation_results[1],
                    InternalResult::Unsupported
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(contents[2], &NodeContent::Unsupported);
    }

    #[test]
    fn roll_era_slots_are_counted() {
        let meta: ConsensusMetadata =
            serde_json::from_str(r#"{ "delegate": "tz1x", "slots": [1, 4, 9] }"#).unwrap();
        assert_eq!(meta.slots(), 3);
    }
}
