use anyhow::Result;

use bakehouse_common::{
    node::{ActivationContent, BalanceKind},
    operations::{Operation, OperationBody, OperationStatus},
    OperationHash,
};

use super::bump;
use crate::{commits::BlockStep, context::LedgerContext};

/// Fundraiser account activation: the committed balance enters circulation
pub fn apply(
    ctx: &mut LedgerContext<'_>,
    step: &mut BlockStep<'_>,
    hash: &OperationHash,
    content: &ActivationContent,
) -> Result<()> {
    let (account_id, allocated) = ctx.account_or_allocate(&content.pkh, None)?;
    let balance = content
        .metadata
        .balance_updates
        .iter()
        .filter(|u| {
            u.kind == BalanceKind::Contract && u.contract.as_ref() == Some(&content.pkh) && u.change > 0
        })
        .map(|u| u.change)
        .sum();

    ctx.change_balance(account_id, balance)?;
    ctx.stats.created += balance;
    ctx.stats.activated += balance;
    bump(ctx, account_id, |c| &mut c.activations, 1)?;

    let op = step.record(
        ctx,
        Some(hash),
        OperationStatus::Applied,
        None,
        OperationBody::Activation {
            account_id,
            balance,
            allocated,
        },
    );
    step.push(ctx, op);
    Ok(())
}

pub fn revert(ctx: &mut LedgerContext<'_>, op: &Operation) -> Result<()> {
    let OperationBody::Activation {
        account_id,
        balance,
        allocated,
    } = op.body
    else {
        return Ok(());
    };
    bump(ctx, account_id, |c| &mut c.activations, -1)?;
    ctx.change_balance(account_id, -balance)?;
    ctx.stats.created -= balance;
    ctx.stats.activated -= balance;
    if allocated {
        ctx.remove_account(account_id)?;
    }
    Ok(())
}
