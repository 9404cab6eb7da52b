//! Double baking and double endorsing evidence
//!
//! The node reports what the offender lost as negative freezer and staking
//! updates, and what the accuser got as a contract credit.  Everything lost
//! and not handed to the accuser is burned.

use anyhow::Result;

use bakehouse_common::{
    math::update_value_with_delta,
    node::{BalanceKind, BalanceUpdate, EvidenceMetadata},
    operations::{Evidence, FreezerCategory, Operation, OperationBody, OperationStatus},
    AccountId, Address, Level, Mutez, OperationHash, ReplayError, SlashedAmounts,
};

use super::bump;
use crate::{commits::BlockStep, context::LedgerContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misbehaviour {
    DoubleBaking,
    DoubleEndorsing,
}

impl Misbehaviour {
    fn of(body: &OperationBody) -> Option<(Self, &Evidence)> {
        match body {
            OperationBody::DoubleBaking(e) => Some((Self::DoubleBaking, e)),
            OperationBody::DoubleEndorsing(e) => Some((Self::DoubleEndorsing, e)),
            _ => None,
        }
    }

    fn body(self, evidence: Evidence) -> OperationBody {
        match self {
            Self::DoubleBaking => OperationBody::DoubleBaking(evidence),
            Self::DoubleEndorsing => OperationBody::DoubleEndorsing(evidence),
        }
    }
}

/// Baker the evidence is about: named by the node, or owner of the first loss
fn offender_address(metadata: &EvidenceMetadata) -> Option<&Address> {
    metadata.forbidden_delegate.as_ref().or_else(|| {
        metadata
            .balance_updates
            .iter()
            .find(|u| u.change < 0 && u.kind != BalanceKind::Contract)
            .and_then(BalanceUpdate::baker)
    })
}

fn slashed_amounts(
    updates: &[BalanceUpdate],
    offender: &Address,
    deposits_staked: bool,
) -> SlashedAmounts {
    let mut lost = SlashedAmounts::default();
    for update in updates {
        if update.change >= 0
            || !matches!(update.kind, BalanceKind::Freezer | BalanceKind::Staking)
            || update.baker() != Some(offender)
        {
            continue;
        }
        let external = update.staker.as_ref().is_some_and(|s| s.contract.is_some());
        let bucket = match (update.category.as_deref(), external) {
            (Some("deposits"), true) => &mut lost.external_staked,
            (Some("deposits"), false) if deposits_staked => &mut lost.own_staked,
            (Some("deposits"), false) => &mut lost.frozen_deposits,
            (Some("unstaked_deposits"), true) => &mut lost.external_unstaked,
            (Some("unstaked_deposits"), false) => &mut lost.own_unstaked,
            (Some("rewards"), _) => &mut lost.frozen_rewards,
            (Some("fees"), _) => &mut lost.frozen_fees,
            _ => continue,
        };
        *bucket -= update.change;
    }
    lost
}

/// Take the slashed amounts out of the offender's buckets, or put them back
/// with `sign` = -1
fn slash(
    ctx: &mut LedgerContext<'_>,
    offender: AccountId,
    lost: &SlashedAmounts,
    sign: Mutez,
) -> Result<()> {
    ctx.adjust_frozen(offender, FreezerCategory::Staked, -sign * lost.own_staked)?;
    ctx.adjust_frozen(offender, FreezerCategory::Deposits, -sign * lost.frozen_deposits)?;
    ctx.adjust_frozen(offender, FreezerCategory::Rewards, -sign * lost.frozen_rewards)?;
    ctx.adjust_frozen(offender, FreezerCategory::Fees, -sign * lost.frozen_fees)?;

    let baker = ctx.baker_mut(offender)?;
    update_value_with_delta(&mut baker.own_unstaked, -sign * lost.own_unstaked)?;
    update_value_with_delta(&mut baker.external_staked, -sign * lost.external_staked)?;
    update_value_with_delta(&mut baker.external_unstaked, -sign * lost.external_unstaked)?;
    ctx.stats.frozen -= sign * (lost.own_unstaked + lost.external());

    // Own losses were part of the offender's balance
    ctx.change_balance(offender, -sign * lost.own())
}

fn record_cycle(
    ctx: &mut LedgerContext<'_>,
    step: &BlockStep<'_>,
    kind: Misbehaviour,
    evidence: &Evidence,
    sign: Mutez,
) -> Result<()> {
    let cycle = step.cycle();
    if let Some(bc) = ctx.baker_cycle_mut(cycle, evidence.accuser_id)? {
        let rewards = match kind {
            Misbehaviour::DoubleBaking => &mut bc.double_baking_rewards,
            Misbehaviour::DoubleEndorsing => &mut bc.double_endorsing_rewards,
        };
        update_value_with_delta(rewards, sign * evidence.reward)?;
    }
    if let Some(bc) = ctx.baker_cycle_mut(cycle, evidence.offender_id)? {
        let losses = match kind {
            Misbehaviour::DoubleBaking => &mut bc.double_baking_losses,
            Misbehaviour::DoubleEndorsing => &mut bc.double_endorsing_losses,
        };
        if sign > 0 {
            losses.add(&evidence.lost);
        } else {
            losses.sub(&evidence.lost);
        }
    }
    Ok(())
}

fn count(ctx: &mut LedgerContext<'_>, kind: Misbehaviour, evidence: &Evidence, delta: i32) -> Result<()> {
    let field: super::CountField = match kind {
        Misbehaviour::DoubleBaking => |c| &mut c.double_baking,
        Misbehaviour::DoubleEndorsing => |c| &mut c.double_endorsing,
    };
    bump(ctx, evidence.accuser_id, field, delta)?;
    if evidence.offender_id != evidence.accuser_id {
        bump(ctx, evidence.offender_id, field, delta)?;
    }
    Ok(())
}

pub fn apply(
    ctx: &mut LedgerContext<'_>,
    step: &mut BlockStep<'_>,
    hash: &OperationHash,
    kind: Misbehaviour,
    accused_level: Level,
    metadata: &EvidenceMetadata,
) -> Result<()> {
    let level = step.level();
    let accuser_id = step.block.producer_id;
    let accuser = ctx.account(accuser_id)?.address.clone();
    let offender = offender_address(metadata)
        .ok_or_else(|| ReplayError::malformed(level, "Evidence without an offender"))?;
    let offender_id = ctx.required_account(offender)?;

    let deposits_staked = step.formulas().deposit_bucket == FreezerCategory::Staked;
    let lost = slashed_amounts(&metadata.balance_updates, offender, deposits_staked);
    let reward: Mutez = metadata
        .balance_updates
        .iter()
        .filter(|u| {
            u.kind == BalanceKind::Contract && u.change > 0 && u.contract.as_ref() == Some(&accuser)
        })
        .map(|u| u.change)
        .sum();

    slash(ctx, offender_id, &lost, 1)?;
    ctx.change_balance(accuser_id, reward)?;
    ctx.stats.burned += lost.total() - reward;

    let evidence = Evidence {
        accuser_id,
        offender_id,
        accused_level,
        reward,
        lost,
    };
    record_cycle(ctx, step, kind, &evidence, 1)?;
    count(ctx, kind, &evidence, 1)?;

    let op = step.record(ctx, Some(hash), OperationStatus::Applied, None, kind.body(evidence));
    step.push(ctx, op);
    Ok(())
}

pub fn revert(ctx: &mut LedgerContext<'_>, step: &BlockStep<'_>, op: &Operation) -> Result<()> {
    let Some((kind, evidence)) = Misbehaviour::of(&op.body) else {
        return Ok(());
    };
    count(ctx, kind, evidence, -1)?;
    record_cycle(ctx, step, kind, evidence, -1)?;
    ctx.stats.burned -= evidence.lost.total() - evidence.reward;
    ctx.change_balance(evidence.accuser_id, -evidence.reward)?;
    slash(ctx, evidence.offender_id, &evidence.lost, -1)
}
