//! Commit units: one concern of a block each, with an exact inverse
//!
//! `apply` computes effects from the node document and records every amount
//! it used on the stored rows (block, operations, baker cycles).  `revert`
//! reads those rows back and subtracts exactly what was added.

mod baker_cycle;
mod baking_rights;
mod block;
mod cycle;
mod deactivation;
mod endorsing_reward;
mod freezer;
mod migration;
pub mod operations;
mod snapshot_balance;
mod statistics;

pub use baker_cycle::BakerCycleCommit;
pub use baking_rights::{BakingRightsCommit, FutureRightsCommit};
pub use block::BlockCommit;
pub use cycle::CycleCommit;
pub use deactivation::DeactivationCommit;
pub use endorsing_reward::EndorsingRewardCommit;
pub use freezer::FreezerCommit;
pub use migration::MigrationCommit;
pub use operations::OperationsCommit;
pub use snapshot_balance::SnapshotBalanceCommit;
pub use statistics::StatisticsCommit;

use anyhow::Result;

use bakehouse_common::{
    math::update_value_with_delta,
    node::{BalanceKind, BalanceUpdate, NodeBlock},
    operations::{FreezerCategory, ManagerFields, Operation, OperationBody, OperationStatus},
    protocol_params::{ProtocolConstants, ProtocolParams},
    Account, AccountId, Block, BlockEvents, Cycle, CycleIndex, Level, Mutez, OperationHash,
    OperationKinds, ReplayError, RewardSplit, Seed, SnapshotBalance,
};

use crate::{
    context::LedgerContext,
    protocols::{Formulas, ProtocolHandler},
    rights_generator::GeneratedRights,
};

pub trait CommitUnit: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()>;

    fn revert(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()>;
}

/// Cycle materialised by the cycle commit, handed to the rights and
/// baker-cycle commits of the same block
#[derive(Debug, Clone)]
pub struct NewCycle {
    pub cycle: Cycle,

    /// Stake of every baker considered, selected or not
    pub stakes: Vec<SnapshotBalance>,

    /// Selected bakers and their power, in id order
    pub distribution: Vec<(AccountId, Mutez)>,
}

/// State threaded through the units of one block
pub struct BlockStep<'a> {
    pub handler: &'a ProtocolHandler,

    /// Document being applied; absent when reverting
    pub node: Option<&'a NodeBlock>,

    /// Block row: built up while applying, read back when reverting
    pub block: Block,

    /// Operations of the block in id order
    pub operations: Vec<Operation>,

    /// First block of the ledger
    pub genesis: bool,

    /// Seed the bootstrap cycles are chained from
    pub initial_seed: Seed,

    pub new_cycles: Vec<NewCycle>,
    pub future_rights: Vec<GeneratedRights>,
}

impl<'a> BlockStep<'a> {
    pub fn level(&self) -> Level {
        self.block.level
    }

    pub fn cycle(&self) -> CycleIndex {
        self.block.cycle
    }

    pub fn params(&self) -> &ProtocolParams {
        &self.handler.params
    }

    pub fn constants(&self) -> &ProtocolConstants {
        &self.handler.params.constants
    }

    pub fn formulas(&self) -> &Formulas {
        self.handler.formulas()
    }

    pub fn has_event(&self, event: BlockEvents) -> bool {
        self.block.events.contains(event)
    }

    pub fn node(&self) -> Result<&'a NodeBlock> {
        self.node
            .ok_or_else(|| ReplayError::invariant(self.level(), "No block document to apply").into())
    }

    /// Cycles created by this block, `preserved_cycles` ahead of the current one
    pub fn created_cycles(&self) -> Vec<CycleIndex> {
        let ahead = self.constants().preserved_cycles;
        if self.genesis {
            (self.cycle()..=self.cycle() + ahead).collect()
        } else if self.has_event(BlockEvents::CycleBegin) {
            vec![self.cycle() + ahead]
        } else {
            Vec::new()
        }
    }

    /// First level rights are generated for; the genesis block itself has none
    pub fn first_rights_level(&self) -> Level {
        if self.genesis {
            self.level() + 1
        } else {
            Level::MIN
        }
    }

    /// New operation row with the next id, flagged on the block
    pub fn record(
        &mut self,
        ctx: &mut LedgerContext<'_>,
        hash: Option<&OperationHash>,
        status: OperationStatus,
        manager: Option<ManagerFields>,
        body: OperationBody,
    ) -> Operation {
        let op = Operation {
            id: ctx.next_operation_id(),
            level: self.level(),
            timestamp: self.block.timestamp,
            hash: hash.cloned(),
            status,
            manager,
            fee: 0,
            gas_used: 0,
            storage_used: 0,
            storage_fee: 0,
            allocation_fee: 0,
            body,
        };
        self.block.operations |= kind_of(&op.body);
        op
    }

    /// Persist an operation built with [`BlockStep::record`]
    pub fn push(&mut self, ctx: &mut LedgerContext<'_>, op: Operation) {
        ctx.put_operation(op.clone());
        self.operations.push(op);
    }

    /// Stored operations matching `filter`, latest first
    pub fn operations_rev(&self, filter: impl Fn(&OperationBody) -> bool) -> Vec<Operation> {
        self.operations
            .iter()
            .rev()
            .filter(|op| filter(&op.body))
            .cloned()
            .collect()
    }
}

/// Snapshot row of a baker's live stake
pub fn snapshot_of(account: &Account, level: Level) -> Option<SnapshotBalance> {
    let baker = account.baker()?;
    Some(SnapshotBalance {
        level,
        account_id: account.id,
        baker_id: account.id,
        own_delegated_balance: account.balance - baker.own_staked - baker.own_unstaked,
        external_delegated_balance: baker.delegated_balance,
        delegators_count: baker.delegators_count,
        own_staked_balance: baker.own_staked,
        external_staked_balance: baker.external_staked,
        stakers_count: baker.stakers_count,
    })
}

pub fn kind_of(body: &OperationBody) -> OperationKinds {
    match body {
        OperationBody::Endorsement { .. } => OperationKinds::Endorsements,
        OperationBody::Preendorsement { .. } => OperationKinds::Preendorsements,
        OperationBody::NonceRevelation { .. } => OperationKinds::NonceRevelations,
        OperationBody::DoubleBaking(_) => OperationKinds::DoubleBaking,
        OperationBody::DoubleEndorsing(_) => OperationKinds::DoubleEndorsing,
        OperationBody::Activation { .. } => OperationKinds::Activations,
        OperationBody::Reveal => OperationKinds::Reveals,
        OperationBody::Transaction { .. } => OperationKinds::Transactions,
        OperationBody::Origination { .. } => OperationKinds::Originations,
        OperationBody::Delegation { .. } => OperationKinds::Delegations,
        OperationBody::Staking { .. } => OperationKinds::Staking,
        OperationBody::SmartRollupOriginate { .. }
        | OperationBody::SmartRollupPublish { .. }
        | OperationBody::SmartRollupRecoverBond { .. } => OperationKinds::SmartRollups,
        OperationBody::DalPublishCommitment { .. } => OperationKinds::DalCommitments,
        OperationBody::Migration { .. } => OperationKinds::Migrations,
        OperationBody::EndorsingReward { .. } => OperationKinds::EndorsingRewards,
        OperationBody::FreezerUpdate { .. } => OperationKinds::FreezerUpdates,
    }
}

/// Pay a reward split to a baker, or take it back with `sign` = -1.
/// Staked parts stay frozen: own and edge on the baker's own stake, the
/// stakers' share in the baker's external stake.
pub fn pay_reward(
    ctx: &mut LedgerContext<'_>,
    baker_id: AccountId,
    split: &RewardSplit,
    sign: Mutez,
) -> Result<()> {
    ctx.change_balance(baker_id, sign * split.to_baker())?;
    ctx.adjust_frozen(
        baker_id,
        FreezerCategory::Staked,
        sign * (split.staked_own + split.staked_edge),
    )?;
    if split.staked_shared != 0 {
        let baker = ctx.baker_mut(baker_id)?;
        update_value_with_delta(&mut baker.external_staked, sign * split.staked_shared)?;
        ctx.stats.frozen += sign * split.staked_shared;
    }
    ctx.stats.created += sign * split.total();
    Ok(())
}

/// [`pay_reward`] plus the roll-era freeze of the whole reward, in apply
/// order for `sign` = 1 and reverse order for `sign` = -1
pub fn credit_reward(
    ctx: &mut LedgerContext<'_>,
    formulas: &Formulas,
    baker_id: AccountId,
    split: &RewardSplit,
    sign: Mutez,
) -> Result<()> {
    if sign > 0 {
        pay_reward(ctx, baker_id, split, 1)?;
        if formulas.freezes_rewards {
            ctx.adjust_frozen(baker_id, FreezerCategory::Rewards, split.total())?;
        }
    } else {
        if formulas.freezes_rewards {
            ctx.adjust_frozen(baker_id, FreezerCategory::Rewards, -split.total())?;
        }
        pay_reward(ctx, baker_id, split, -1)?;
    }
    Ok(())
}

/// Push a baker's deactivation level out to `grace`, returning the old one if it moved
pub fn refresh_grace(
    ctx: &mut LedgerContext<'_>,
    baker_id: AccountId,
    grace: Level,
) -> Result<Option<Level>> {
    let baker = ctx.baker_mut(baker_id)?;
    if baker.deactivation_level == grace {
        return Ok(None);
    }
    let prev = baker.deactivation_level;
    baker.deactivation_level = grace;
    Ok(Some(prev))
}

pub fn restore_grace(
    ctx: &mut LedgerContext<'_>,
    baker_id: AccountId,
    prev: Option<Level>,
) -> Result<()> {
    if let Some(prev) = prev {
        ctx.baker_mut(baker_id)?.deactivation_level = prev;
    }
    Ok(())
}

/// Part of a baker's balance not locked in any bucket
pub fn spendable(account: &Account) -> Mutez {
    match account.baker() {
        Some(b) => {
            account.balance
                - b.own_staked
                - b.own_unstaked
                - b.frozen_deposits
                - b.frozen_rewards
                - b.frozen_fees
        }
        None => account.balance,
    }
}

/// Total minted under `categories`, if the node reported any such update
pub fn minted_total(updates: &[BalanceUpdate], categories: &[&str]) -> Option<Mutez> {
    let mut matched = updates
        .iter()
        .filter(|u| u.kind == BalanceKind::Minted && categories.iter().any(|c| u.is_category(c)))
        .peekable();
    matched.peek()?;
    Some(matched.map(|u| -u.change).sum())
}

/// Fail with a determinism mismatch when a node-reported total disagrees
pub fn cross_check(
    level: Level,
    what: &str,
    reported: Option<Mutez>,
    computed: Mutez,
) -> Result<()> {
    match reported {
        Some(reported) if reported != computed => Err(ReplayError::mismatch(
            level,
            format!("{what}: node reports {reported}, computed {computed}"),
        )
        .into()),
        _ => Ok(()),
    }
}
