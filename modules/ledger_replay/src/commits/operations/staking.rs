//! Stake, unstake and finalize requests, sent as transactions to self
//!
//! A baker's own stake stays in its balance and moves between buckets.  An
//! external staker's funds leave its balance and are held by the baker; the
//! staker keeps counters of what it put in.

use anyhow::Result;

use bakehouse_common::{
    math::{update_count_with_delta, update_value_with_delta},
    node::{BalanceKind, OperationResult, Parameters},
    operations::{FreezerCategory, OperationBody, StakingAction},
    AccountId, Address, Mutez, ReplayError,
};

use crate::context::LedgerContext;

const STAKE: &str = "stake";
const UNSTAKE: &str = "unstake";
const FINALIZE_UNSTAKE: &str = "finalize_unstake";

const UNSTAKED_CATEGORY: &str = "unstaked_deposits";

/// Staking request carried by a transaction, if it is one
pub fn staking_action(
    source: &Address,
    destination: &Address,
    parameters: Option<&Parameters>,
) -> Option<StakingAction> {
    if source != destination {
        return None;
    }
    match parameters?.entrypoint.as_str() {
        STAKE => Some(StakingAction::Stake),
        UNSTAKE => Some(StakingAction::Unstake),
        FINALIZE_UNSTAKE => Some(StakingAction::Finalize),
        _ => None,
    }
}

/// Amount actually moved, from the node's updates where the request alone
/// is not enough
fn moved_amount(
    action: StakingAction,
    source: &Address,
    requested: Mutez,
    result: &OperationResult,
) -> Mutez {
    let reported: Vec<Mutez> = match action {
        StakingAction::Stake => Vec::new(),
        StakingAction::Unstake => result
            .balance_updates
            .iter()
            .filter(|u| {
                u.kind == BalanceKind::Freezer && u.is_category(UNSTAKED_CATEGORY) && u.change > 0
            })
            .map(|u| u.change)
            .collect(),
        StakingAction::Finalize => result
            .balance_updates
            .iter()
            .filter(|u| {
                u.kind == BalanceKind::Contract && u.contract.as_ref() == Some(source) && u.change > 0
            })
            .map(|u| u.change)
            .collect(),
    };
    if reported.is_empty() {
        return requested;
    }
    reported.iter().sum()
}

pub fn apply(
    ctx: &mut LedgerContext<'_>,
    sender_id: AccountId,
    action: StakingAction,
    requested: Mutez,
    result: &OperationResult,
    applied: bool,
) -> Result<OperationBody> {
    let level = ctx.level();
    let account = ctx.account(sender_id)?.clone();
    let own = account.is_baker();
    let baker_id = match (own, account.external_delegate()) {
        (true, _) => sender_id,
        (false, Some(baker_id)) => baker_id,
        (false, None) if !applied => sender_id,
        (false, None) => {
            return Err(ReplayError::malformed(
                level,
                format!("Account {sender_id} stakes without a delegate"),
            )
            .into())
        }
    };
    let mut body = OperationBody::Staking {
        baker_id,
        action,
        amount: requested,
        mirrored: 0,
        staker_count_change: 0,
    };
    if !applied {
        return Ok(body);
    }

    let amount = moved_amount(action, &account.address, requested, result);
    let mut mirrored = 0;
    let mut staker_count_change = 0;
    if own {
        own_stake(ctx, baker_id, action, amount)?;
    } else {
        let staked = account.staked_balance;
        let unstaked = account.unstaked_balance;
        mirrored = match action {
            StakingAction::Stake => amount,
            StakingAction::Unstake => amount.min(staked),
            StakingAction::Finalize => amount.min(unstaked),
        };
        staker_count_change = match action {
            StakingAction::Stake if staked == 0 && unstaked == 0 => 1,
            StakingAction::Finalize if staked == 0 && unstaked == mirrored => -1,
            _ => 0,
        };
        external_stake(ctx, sender_id, baker_id, action, amount, mirrored, staker_count_change, 1)?;
    }

    if let OperationBody::Staking {
        amount: a,
        mirrored: m,
        staker_count_change: s,
        ..
    } = &mut body
    {
        *a = amount;
        *m = mirrored;
        *s = staker_count_change;
    }
    Ok(body)
}

pub fn revert(ctx: &mut LedgerContext<'_>, sender_id: AccountId, body: &OperationBody) -> Result<()> {
    let OperationBody::Staking {
        baker_id,
        action,
        amount,
        mirrored,
        staker_count_change,
    } = *body
    else {
        return Ok(());
    };
    if baker_id == sender_id {
        own_stake(ctx, baker_id, action, -amount)
    } else {
        external_stake(ctx, sender_id, baker_id, action, amount, mirrored, staker_count_change, -1)
    }
}

/// Move a baker's own funds between its liquid, staked and unstaked parts;
/// a negative `amount` undoes the move
fn own_stake(
    ctx: &mut LedgerContext<'_>,
    baker_id: AccountId,
    action: StakingAction,
    amount: Mutez,
) -> Result<()> {
    match action {
        StakingAction::Stake => ctx.adjust_frozen(baker_id, FreezerCategory::Staked, amount),
        StakingAction::Unstake => {
            ctx.adjust_frozen(baker_id, FreezerCategory::Staked, -amount)?;
            update_value_with_delta(&mut ctx.baker_mut(baker_id)?.own_unstaked, amount)?;
            ctx.stats.frozen += amount;
            Ok(())
        }
        StakingAction::Finalize => {
            update_value_with_delta(&mut ctx.baker_mut(baker_id)?.own_unstaked, -amount)?;
            ctx.stats.frozen -= amount;
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn external_stake(
    ctx: &mut LedgerContext<'_>,
    staker_id: AccountId,
    baker_id: AccountId,
    action: StakingAction,
    amount: Mutez,
    mirrored: Mutez,
    staker_count_change: i32,
    sign: Mutez,
) -> Result<()> {
    let (liquid, staked, unstaked, staked_mirror, unstaked_mirror) = match action {
        StakingAction::Stake => (-amount, amount, 0, mirrored, 0),
        StakingAction::Unstake => (0, -amount, amount, -mirrored, amount),
        StakingAction::Finalize => (amount, 0, -amount, 0, -mirrored),
    };

    if sign > 0 {
        ctx.change_balance(staker_id, liquid)?;
    }
    let baker = ctx.baker_mut(baker_id)?;
    update_value_with_delta(&mut baker.external_staked, sign * staked)?;
    update_value_with_delta(&mut baker.external_unstaked, sign * unstaked)?;
    update_count_with_delta(&mut baker.stakers_count, sign as i32 * staker_count_change)?;
    ctx.stats.frozen += sign * (staked + unstaked);

    let staker = ctx.account_mut(staker_id)?;
    update_value_with_delta(&mut staker.staked_balance, sign * staked_mirror)?;
    update_value_with_delta(&mut staker.unstaked_balance, sign * unstaked_mirror)?;
    if sign < 0 {
        ctx.change_balance(staker_id, -liquid)?;
    }
    Ok(())
}
