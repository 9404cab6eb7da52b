use anyhow::Result;

use bakehouse_common::{
    math::update_value_with_delta,
    node::ConsensusContent,
    operations::{FreezerCategory, Operation, OperationBody, OperationStatus},
    OperationHash, ReplayError, RewardSplit,
};

use super::bump;
use crate::{
    commits::{
        credit_reward, cross_check, minted_total, refresh_grace, restore_grace, spendable,
        BlockStep,
    },
    context::LedgerContext,
};

const ENDORSING_REWARD_CATEGORIES: &[&str] = &["endorsing rewards"];

/// Endorsement of the previous block.  Roll-era endorsements are paid and
/// bonded on the spot; later protocols settle rewards at cycle end.
pub fn apply_endorsement(
    ctx: &mut LedgerContext<'_>,
    step: &mut BlockStep<'_>,
    hash: &OperationHash,
    content: &ConsensusContent,
) -> Result<()> {
    let level = step.level();
    if content.level != level - 1 {
        return Err(ReplayError::malformed(
            level,
            format!("Endorsement of level {} included in block {level}", content.level),
        )
        .into());
    }
    let delegate_id = ctx.required_account(&content.metadata.delegate)?;
    let slots = content.metadata.slots();
    let formulas = *step.formulas();

    let mut reward = 0;
    let mut deposit = 0;
    if formulas.endorsement_rewards_per_level {
        let constants = step.constants();
        reward = (formulas.endorsement_reward)(constants, slots);
        cross_check(
            level,
            "Endorsement reward",
            minted_total(&content.metadata.balance_updates, ENDORSING_REWARD_CATEGORIES),
            reward,
        )?;
        // Per-level rewards predate staking and are always liquid
        credit_reward(ctx, &formulas, delegate_id, &RewardSplit::liquid(reward), 1)?;

        let wanted = (formulas.endorsement_deposit)(constants, slots);
        deposit = wanted.min(spendable(ctx.account(delegate_id)?)).max(0);
        ctx.adjust_frozen(delegate_id, FreezerCategory::Deposits, deposit)?;

        if let Some(bc) = ctx.baker_cycle_mut(step.cycle(), delegate_id)? {
            bc.endorsement_rewards.add(&RewardSplit::liquid(reward));
            update_value_with_delta(&mut bc.endorsement_deposits, deposit)?;
        }
    }

    let grace = (formulas.deactivation_level)(step.params(), level);
    let reset_deactivation = refresh_grace(ctx, delegate_id, grace)?;
    bump(ctx, delegate_id, |c| &mut c.endorsements, 1)?;

    let op = step.record(
        ctx,
        Some(hash),
        OperationStatus::Applied,
        None,
        OperationBody::Endorsement {
            delegate_id,
            slots,
            reward,
            deposit,
            reset_deactivation,
        },
    );
    step.push(ctx, op);
    Ok(())
}

pub fn revert_endorsement(
    ctx: &mut LedgerContext<'_>,
    step: &BlockStep<'_>,
    op: &Operation,
) -> Result<()> {
    let OperationBody::Endorsement {
        delegate_id,
        reward,
        deposit,
        reset_deactivation,
        ..
    } = op.body
    else {
        return Ok(());
    };

    bump(ctx, delegate_id, |c| &mut c.endorsements, -1)?;
    restore_grace(ctx, delegate_id, reset_deactivation)?;

    if step.formulas().endorsement_rewards_per_level {
        if let Some(bc) = ctx.baker_cycle_mut(step.cycle(), delegate_id)? {
            bc.endorsement_rewards.sub(&RewardSplit::liquid(reward));
            update_value_with_delta(&mut bc.endorsement_deposits, -deposit)?;
        }
        ctx.adjust_frozen(delegate_id, FreezerCategory::Deposits, -deposit)?;
        credit_reward(ctx, step.formulas(), delegate_id, &RewardSplit::liquid(reward), -1)?;
    }
    Ok(())
}

pub fn apply_preendorsement(
    ctx: &mut LedgerContext<'_>,
    step: &mut BlockStep<'_>,
    hash: &OperationHash,
    content: &ConsensusContent,
) -> Result<()> {
    let delegate_id = ctx.required_account(&content.metadata.delegate)?;
    bump(ctx, delegate_id, |c| &mut c.preendorsements, 1)?;
    let op = step.record(
        ctx,
        Some(hash),
        OperationStatus::Applied,
        None,
        OperationBody::Preendorsement {
            delegate_id,
            slots: content.metadata.slots(),
        },
    );
    step.push(ctx, op);
    Ok(())
}

pub fn revert_preendorsement(ctx: &mut LedgerContext<'_>, op: &Operation) -> Result<()> {
    if let OperationBody::Preendorsement { delegate_id, .. } = op.body {
        bump(ctx, delegate_id, |c| &mut c.preendorsements, -1)?;
    }
    Ok(())
}
