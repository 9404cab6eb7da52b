//! Delegation changes, including baker registration and reactivation

use anyhow::Result;

use bakehouse_common::{
    operations::OperationBody, AccountId, Address, BakerData, ReplayError,
};

use crate::{commits::BlockStep, context::LedgerContext};

pub fn apply(
    ctx: &mut LedgerContext<'_>,
    step: &BlockStep<'_>,
    sender_id: AccountId,
    delegate: Option<&Address>,
    applied: bool,
) -> Result<OperationBody> {
    let level = step.level();
    let account = ctx.account(sender_id)?.clone();
    let delegate_id = match delegate {
        Some(address) if applied => Some(ctx.required_account(address)?),
        Some(address) => ctx.account_by_address(address)?,
        None => None,
    };

    let mut registration = false;
    let mut reactivated_from = None;
    if applied {
        let grace = (step.formulas().deactivation_level)(step.params(), level);
        match delegate_id {
            Some(id) if id == sender_id && account.is_baker() => {
                let baker = ctx.baker_mut(sender_id)?;
                reactivated_from = Some(baker.deactivation_level);
                baker.deactivation_level = grace;
            }
            Some(id) if id == sender_id => {
                ctx.set_delegate(sender_id, None)?;
                ctx.promote_to_baker(
                    sender_id,
                    BakerData {
                        activation_level: level,
                        deactivation_level: grace,
                        edge_of_baking_over_staking: step
                            .constants()
                            .default_edge_of_baking_over_staking,
                        ..Default::default()
                    },
                )?;
                ctx.set_delegate(sender_id, Some(sender_id))?;
                registration = true;
            }
            _ if account.is_baker() => {
                return Err(ReplayError::malformed(
                    level,
                    format!("Baker {sender_id} cannot delegate elsewhere"),
                )
                .into())
            }
            Some(id) => {
                if !ctx.account(id)?.is_baker() {
                    return Err(ReplayError::malformed(
                        level,
                        format!("Account {sender_id} delegates to non-baker {id}"),
                    )
                    .into());
                }
                ctx.set_delegate(sender_id, Some(id))?;
            }
            None => ctx.set_delegate(sender_id, None)?,
        }
        let row = ctx.account_mut(sender_id)?;
        row.delegation_level = delegate_id.map(|_| level);
        row.staked = delegate_id.is_some();
    }

    Ok(OperationBody::Delegation {
        prev_delegate_id: account.delegate_id,
        prev_delegation_level: account.delegation_level,
        prev_staked: account.staked,
        delegate_id,
        amount: if applied { account.balance } else { 0 },
        registration,
        reactivated_from,
    })
}

pub fn revert(ctx: &mut LedgerContext<'_>, sender_id: AccountId, body: &OperationBody) -> Result<()> {
    let OperationBody::Delegation {
        prev_delegate_id,
        prev_delegation_level,
        prev_staked,
        registration,
        reactivated_from,
        ..
    } = *body
    else {
        return Ok(());
    };

    if registration {
        ctx.set_delegate(sender_id, None)?;
        ctx.demote_to_user(sender_id)?;
        ctx.set_delegate(sender_id, prev_delegate_id)?;
    } else if let Some(prev) = reactivated_from {
        ctx.baker_mut(sender_id)?.deactivation_level = prev;
    } else {
        ctx.set_delegate(sender_id, prev_delegate_id)?;
    }
    let row = ctx.account_mut(sender_id)?;
    row.delegation_level = prev_delegation_level;
    row.staked = prev_staked;
    Ok(())
}
