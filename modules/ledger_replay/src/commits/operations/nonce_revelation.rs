use anyhow::Result;

use bakehouse_common::{
    node::NonceRevelationContent,
    operations::{Operation, OperationBody, OperationStatus},
    OperationHash, ReplayError,
};

use super::bump;
use crate::{
    commits::{credit_reward, cross_check, minted_total, BlockStep},
    context::LedgerContext,
};

const REVELATION_REWARD_CATEGORIES: &[&str] = &["nonce revelation rewards"];

/// Seed nonce revealed for an earlier block.  The reward goes to the
/// producer of the including block; the nonce itself feeds the seed of a
/// future cycle.
pub fn apply(
    ctx: &mut LedgerContext<'_>,
    step: &mut BlockStep<'_>,
    hash: &OperationHash,
    content: &NonceRevelationContent,
) -> Result<()> {
    let level = step.level();
    let revealed = ctx.store().block(content.level)?.ok_or_else(|| {
        ReplayError::malformed(level, format!("Nonce revealed for unknown level {}", content.level))
    })?;
    let baker_id = step.block.producer_id;
    let formulas = *step.formulas();
    let constants = step.constants().clone();

    let amount = constants.revelation_reward;
    cross_check(
        level,
        "Nonce revelation reward",
        minted_total(&content.metadata.balance_updates, REVELATION_REWARD_CATEGORIES),
        amount,
    )?;
    let reward = (formulas.reward_split)(ctx.account(baker_id)?, amount, &constants)?;
    credit_reward(ctx, &formulas, baker_id, &reward, 1)?;
    if let Some(bc) = ctx.baker_cycle_mut(step.cycle(), baker_id)? {
        bc.nonce_revelation_rewards.add(&reward);
    }
    bump(ctx, baker_id, |c| &mut c.nonce_revelations, 1)?;

    let op = step.record(
        ctx,
        Some(hash),
        OperationStatus::Applied,
        None,
        OperationBody::NonceRevelation {
            baker_id,
            sender_id: revealed.producer_id,
            revealed_level: content.level,
            revealed_cycle: revealed.cycle,
            nonce: content.nonce.clone(),
            reward,
        },
    );
    step.push(ctx, op);
    Ok(())
}

pub fn revert(ctx: &mut LedgerContext<'_>, step: &BlockStep<'_>, op: &Operation) -> Result<()> {
    let OperationBody::NonceRevelation {
        baker_id, reward, ..
    } = &op.body
    else {
        return Ok(());
    };
    bump(ctx, *baker_id, |c| &mut c.nonce_revelations, -1)?;
    if let Some(bc) = ctx.baker_cycle_mut(step.cycle(), *baker_id)? {
        bc.nonce_revelation_rewards.sub(reward);
    }
    credit_reward(ctx, step.formulas(), *baker_id, reward, -1)
}
