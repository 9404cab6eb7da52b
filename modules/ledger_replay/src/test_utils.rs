//! Fixtures shared by the unit tests of this crate

use std::sync::Arc;

use chrono::{DateTime, Utc};

use bakehouse_common::{
    node::{
        BalanceKind, BalanceUpdate, BootstrapAccount, ConsensusContent, ConsensusMetadata,
        DelegationContent, LevelInfo, ManagerHeader, ManagerMetadata, MigrationInfo, NodeBlock,
        NodeContent, NodeHeader, NodeMetadata, NodeOperationGroup, OperationResult,
        OriginationContent, Parameters, RevealContent, TransactionContent,
    },
    protocol_params::{ProtocolConstants, ProtocolParams, ProtocolVersion},
    Address, BlockHash, Level, Mutez, OperationHash, ProtocolHash, ReplayError, RightKind, Seed,
};
use bakehouse_module_ledger_store::{
    memory::{InMemoryLedgerStore, Tables},
    LedgerStore,
};

use crate::{
    pipeline::{BlockOutcome, Pipeline, PipelineSettings},
    protocols::ProtocolRegistry,
};

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

/// Protocol active from level 1, cycle 0 spanning 1..=8 and cycle 1 9..=16
pub fn test_params(version: ProtocolVersion) -> ProtocolParams {
    let code = match version {
        ProtocolVersion::Rolls => 1,
        ProtocolVersion::Tenderbake => 2,
        ProtocolVersion::Staking => 3,
    };
    ProtocolParams {
        hash: ProtocolHash::new(format!("Pt{version:?}")),
        code,
        version,
        first_level: 1,
        first_cycle: 0,
        first_cycle_level: 1,
        constants: test_constants(),
    }
}

pub const BAKERS: [&str; 3] = ["tz1alpha", "tz1beta", "tz1gamma"];
pub const DELEGATOR: &str = "tz1delta";

pub fn block_hash(level: Level, branch: &str) -> BlockHash {
    BlockHash::new(format!("BL{branch}{level:06}"))
}

pub fn timestamp(level: Level) -> DateTime<Utc> {
    // Six hours per level, so every fourth block starts a new day
    DateTime::from_timestamp(1_700_006_400 + level as i64 * 21_600, 0).unwrap()
}

/// Synthetic chain whose producers and endorsers are read back from the
/// rights the ledger itself generated, so every block is valid
pub struct ChainBuilder {
    pub params: ProtocolParams,
    pub branch: String,
}

impl ChainBuilder {
    pub fn new(params: ProtocolParams) -> Self {
        Self {
            params,
            branch: "main".to_string(),
        }
    }

    fn node(&self, level: Level, predecessor: BlockHash, baker: Address) -> NodeBlock {
        NodeBlock {
            hash: block_hash(level, &self.branch),
            protocol: self.params.hash.clone(),
            header: NodeHeader {
                level,
                predecessor,
                timestamp: timestamp(level),
                payload_round: Some(0),
                priority: None,
            },
            metadata: NodeMetadata {
                next_protocol: self.params.hash.clone(),
                baker,
                proposer: None,
                level_info: LevelInfo {
                    level,
                    cycle: self.params.cycle_of(level),
                    cycle_position: (level - self.params.first_cycle_level)
                        .rem_euclid(self.params.constants.blocks_per_cycle),
                },
                voting_period_kind: None,
                deactivated: Vec::new(),
                balance_updates: Vec::new(),
                migration: None,
            },
            operations: Vec::new(),
        }
    }

    /// First block: three bakers of one million and a delegator of the first
    pub fn genesis(&self) -> NodeBlock {
        let level = self.params.first_level;
        let mut accounts: Vec<BootstrapAccount> = BAKERS
            .iter()
            .map(|a| BootstrapAccount {
                address: Address::from(*a),
                balance: 1_000_000 as Mutez,
                delegate: Some(Address::from(*a)),
            })
            .collect();
        accounts.push(BootstrapAccount {
            address: Address::from(DELEGATOR),
            balance: 250_000,
            delegate: Some(Address::from(BAKERS[0])),
        });

        let mut node = self.node(level, BlockHash::from("BLgenesis"), Address::from(BAKERS[0]));
        node.header.payload_round = None;
        node.metadata.migration = Some(MigrationInfo {
            bootstrap_accounts: accounts,
        });
        node
    }

    /// Append one operation group to a block
    pub fn include(&self, node: &mut NodeBlock, contents: Vec<NodeContent>) {
        let hash = OperationHash::new(format!(
            "op{}{:06}g{}",
            self.branch,
            node.level(),
            node.operations.len()
        ));
        node.operations.push(NodeOperationGroup { hash, contents });
    }

    /// Block on top of `predecessor`, baked at round 0 and endorsed by the
    /// whole committee of the previous level
    pub fn next(&self, store: &dyn LedgerStore, level: Level, predecessor: BlockHash) -> NodeBlock {
        let rights = store.rights(level).unwrap();
        let producer = rights
            .iter()
            .find(|r| r.kind == RightKind::Baking && r.round == Some(0))
            .map(|r| store.account(r.baker_id).unwrap().unwrap().address)
            .unwrap();

        let mut node = self.node(level, predecessor, producer);
        let contents: Vec<NodeContent> = store
            .rights(level - 1)
            .unwrap()
            .into_iter()
            .filter(|r| r.kind == RightKind::Endorsing)
            .map(|r| {
                NodeContent::Endorsement(ConsensusContent {
                    level: level - 1,
                    metadata: ConsensusMetadata {
                        delegate: store.account(r.baker_id).unwrap().unwrap().address,
                        power: r.slots,
                        slots: Vec::new(),
                        balance_updates: Vec::new(),
                    },
                })
            })
            .collect();
        if !contents.is_empty() {
            node.operations.push(NodeOperationGroup {
                hash: OperationHash::new(format!("oo{}{level:06}", self.branch)),
                contents,
            });
        }
        node
    }
}

pub fn settings(max_reorg_depth: i32) -> PipelineSettings {
    PipelineSettings {
        max_reorg_depth,
        initial_seed: Seed([3; 32]),
        check_supply: true,
        cache_max_accounts: 1_000,
    }
}

/// Empty in-memory ledger with one protocol active from level 1
pub fn setup(
    version: ProtocolVersion,
    max_reorg_depth: i32,
) -> (Arc<InMemoryLedgerStore>, Pipeline, ChainBuilder) {
    let params = test_params(version);
    let store = Arc::new(InMemoryLedgerStore::new());
    let registry = ProtocolRegistry::new(std::slice::from_ref(&params));
    let pipeline = Pipeline::new(store.clone(), registry, settings(max_reorg_depth)).unwrap();
    (store, pipeline, ChainBuilder::new(params))
}

/// Apply plain blocks until the head reaches `to`
pub fn extend(pipeline: &mut Pipeline, chain: &ChainBuilder, to: Level) -> Vec<BlockOutcome> {
    let mut outcomes = Vec::new();
    while pipeline.head().level < to {
        let head = pipeline.head().clone();
        let node = match head.hash {
            None => chain.genesis(),
            Some(hash) => chain.next(pipeline.store().as_ref(), head.level + 1, hash),
        };
        outcomes.push(pipeline.apply_block(&node).unwrap());
    }
    outcomes
}

pub fn replay_error(e: &anyhow::Error) -> &ReplayError {
    e.downcast_ref::<ReplayError>().unwrap()
}

/// Every table is back to `before`, apart from the highest level ever applied
pub fn assert_reverted(store: &InMemoryLedgerStore, mut before: Tables, highest: Level) {
    if let Some(state) = before.app_state.as_mut() {
        state.highest_applied = state.highest_applied.max(highest);
    }
    assert_eq!(store.snapshot().unwrap(), before);
}

pub fn manager(source: &str, fee: Mutez, counter: i64) -> ManagerHeader {
    ManagerHeader {
        source: Address::from(source),
        fee,
        counter,
        gas_limit: 10_000,
        storage_limit: 1_000,
    }
}

fn manager_metadata(result: OperationResult) -> ManagerMetadata {
    ManagerMetadata {
        balance_updates: Vec::new(),
        operation_result: result,
        internal_operation_results: Vec::new(),
    }
}

pub fn reveal(source: &str, counter: i64) -> NodeContent {
    NodeContent::Reveal(RevealContent {
        manager: manager(source, 1_000, counter),
        public_key: format!("edpk{source}"),
        metadata: manager_metadata(OperationResult::applied()),
    })
}

pub fn transaction(
    source: &str,
    destination: &str,
    amount: Mutez,
    counter: i64,
    result: OperationResult,
) -> NodeContent {
    NodeContent::Transaction(TransactionContent {
        manager: manager(source, 1_000, counter),
        amount,
        destination: Address::from(destination),
        parameters: None,
        metadata: manager_metadata(result),
    })
}

/// Transaction to self calling one of the staking entrypoints
pub fn staking(source: &str, entrypoint: &str, amount: Mutez, counter: i64) -> NodeContent {
    NodeContent::Transaction(TransactionContent {
        manager: manager(source, 1_000, counter),
        amount,
        destination: Address::from(source),
        parameters: Some(Parameters {
            entrypoint: entrypoint.to_string(),
            value: serde_json::Value::Null,
        }),
        metadata: manager_metadata(OperationResult::applied()),
    })
}

pub fn origination(
    source: &str,
    balance: Mutez,
    delegate: Option<&str>,
    counter: i64,
    result: OperationResult,
) -> NodeContent {
    NodeContent::Origination(OriginationContent {
        manager: manager(source, 1_000, counter),
        balance,
        delegate: delegate.map(Address::from),
        metadata: manager_metadata(result),
    })
}

pub fn delegation(source: &str, delegate: Option<&str>, counter: i64) -> NodeContent {
    NodeContent::Delegation(DelegationContent {
        manager: manager(source, 1_000, counter),
        delegate: delegate.map(Address::from),
        metadata: manager_metadata(OperationResult::applied()),
    })
}

/// Balance update naming an account as contract or as delegate, by kind
pub fn update(kind: BalanceKind, category: Option<&str>, address: &str, change: Mutez) -> BalanceUpdate {
    let address = Address::from(address);
    let contract = kind == BalanceKind::Contract;
    BalanceUpdate {
        kind,
        category: category.map(str::to_string),
        contract: contract.then(|| address.clone()),
        delegate: (!contract).then_some(address),
        staker: None,
        cycle: None,
        change,
        origin: Some("block".to_string()),
    }
}
