//! Manager operations: signed by an account that pays a fee for them
//!
//! Fee and counter are charged whatever the outcome.  Effects, storage and
//! allocation burns only apply to operations the node reports as applied.
//! Internal operations emitted by contracts are stored as their own rows,
//! with their burns charged to the account that signed the outer operation.

use anyhow::Result;

use bakehouse_common::{
    math::update_value_with_delta,
    node::{
        BalanceKind, InternalResult, ManagerHeader, ManagerMetadata, NodeContent,
        OperationResult, Parameters, ResultStatus,
    },
    operations::{FreezerCategory, ManagerFields, Operation, OperationBody, OperationStatus},
    AccountId, AccountKind, Address, ContractData, Mutez, OperationHash, ReplayError, RollupData,
};

use super::{count_manager, delegation, staking};
use crate::{commits::BlockStep, context::LedgerContext};

fn status_of(status: ResultStatus) -> OperationStatus {
    match status {
        ResultStatus::Applied => OperationStatus::Applied,
        ResultStatus::Failed => OperationStatus::Failed,
        ResultStatus::Backtracked => OperationStatus::Backtracked,
        ResultStatus::Skipped => OperationStatus::Skipped,
    }
}

fn envelope(content: &NodeContent) -> Option<(&ManagerHeader, &ManagerMetadata)> {
    match content {
        NodeContent::Reveal(c) => Some((&c.manager, &c.metadata)),
        NodeContent::Transaction(c) => Some((&c.manager, &c.metadata)),
        NodeContent::Origination(c) => Some((&c.manager, &c.metadata)),
        NodeContent::Delegation(c) => Some((&c.manager, &c.metadata)),
        NodeContent::SmartRollupOriginate(c) => Some((&c.manager, &c.metadata)),
        NodeContent::SmartRollupPublish(c) => Some((&c.manager, &c.metadata)),
        NodeContent::SmartRollupRecoverBond(c) => Some((&c.manager, &c.metadata)),
        NodeContent::DalPublishCommitment(c) => Some((&c.manager, &c.metadata)),
        _ => None,
    }
}

/// Transfer of tez, from an outer or internal transaction
struct Transfer<'n> {
    source: &'n Address,
    source_id: AccountId,
    amount: Mutez,
    destination: &'n Address,
    parameters: Option<&'n Parameters>,
}

pub fn apply(
    ctx: &mut LedgerContext<'_>,
    step: &mut BlockStep<'_>,
    hash: &OperationHash,
    content: &NodeContent,
) -> Result<()> {
    let Some((header, metadata)) = envelope(content) else {
        return Ok(());
    };
    let sender_id = ctx.required_account(&header.source)?;
    let result = &metadata.operation_result;
    let status = status_of(result.status);
    let applied = status.is_applied();

    pay_fee(ctx, step, sender_id, header.fee, 1)?;
    ctx.account_mut(sender_id)?.counter = header.counter;

    let body = match content {
        NodeContent::Reveal(_) => reveal(ctx, sender_id, applied)?,
        NodeContent::Transaction(c) => transfer(
            ctx,
            Transfer {
                source: &header.source,
                source_id: sender_id,
                amount: c.amount,
                destination: &c.destination,
                parameters: c.parameters.as_ref(),
            },
            result,
            applied,
        )?,
        NodeContent::Origination(c) => originate(
            ctx,
            step,
            sender_id,
            c.balance,
            c.delegate.as_ref(),
            result,
            applied,
        )?,
        NodeContent::Delegation(c) => {
            delegation::apply(ctx, step, sender_id, c.delegate.as_ref(), applied)?
        }
        NodeContent::SmartRollupOriginate(c) => {
            let rollup_id = match (&result.address, applied) {
                (Some(address), true) => Some(ctx.allocate_account(
                    address,
                    AccountKind::Rollup(RollupData {
                        creator_id: Some(sender_id),
                        pvm_kind: c.pvm_kind.clone(),
                    }),
                )?),
                (None, true) => {
                    return Err(ReplayError::malformed(
                        step.level(),
                        "Applied rollup origination without an address",
                    )
                    .into())
                }
                _ => None,
            };
            OperationBody::SmartRollupOriginate { rollup_id }
        }
        NodeContent::SmartRollupPublish(c) => {
            let rollup_id = ctx.account_by_address(&c.rollup)?;
            let bond = if applied {
                let bond = -contract_change(result, &header.source, |change| change < 0);
                lock_bond(ctx, sender_id, bond)?;
                bond
            } else {
                0
            };
            OperationBody::SmartRollupPublish { rollup_id, bond }
        }
        NodeContent::SmartRollupRecoverBond(c) => {
            let rollup_id = ctx.account_by_address(&c.rollup)?;
            let (staker_id, bond) = if applied {
                let staker_id = ctx.required_account(&c.staker)?;
                let bond = contract_change(result, &c.staker, |change| change > 0);
                lock_bond(ctx, staker_id, -bond)?;
                (staker_id, bond)
            } else {
                (ctx.account_by_address(&c.staker)?.unwrap_or(sender_id), 0)
            };
            OperationBody::SmartRollupRecoverBond {
                rollup_id,
                staker_id,
                bond,
            }
        }
        NodeContent::DalPublishCommitment(c) => OperationBody::DalPublishCommitment {
            slot_index: c.slot_header.slot_index,
        },
        _ => return Ok(()),
    };

    let manager = ManagerFields {
        sender_id,
        counter: header.counter,
        initiator_id: None,
        nonce: None,
    };
    let mut op = step.record(ctx, Some(hash), status, Some(manager), body);
    op.fee = header.fee;
    charge(ctx, step, &mut op, sender_id, result)?;
    count_manager(ctx, &op, 1)?;
    step.push(ctx, op);

    for internal in &metadata.internal_operation_results {
        apply_internal(ctx, step, hash, sender_id, header.counter, internal)?;
    }
    Ok(())
}

fn apply_internal(
    ctx: &mut LedgerContext<'_>,
    step: &mut BlockStep<'_>,
    hash: &OperationHash,
    initiator_id: AccountId,
    counter: i64,
    internal: &InternalResult,
) -> Result<()> {
    let (source, nonce, result) = match internal {
        InternalResult::Transaction(t) => (&t.source, t.nonce, &t.result),
        InternalResult::Origination(o) => (&o.source, o.nonce, &o.result),
        InternalResult::Delegation(d) => (&d.source, d.nonce, &d.result),
        InternalResult::Unsupported => return Ok(()),
    };
    let source_id = ctx.required_account(source)?;
    let status = status_of(result.status);
    let applied = status.is_applied();

    let body = match internal {
        InternalResult::Transaction(t) => transfer(
            ctx,
            Transfer {
                source,
                source_id,
                amount: t.amount,
                destination: &t.destination,
                parameters: t.parameters.as_ref(),
            },
            result,
            applied,
        )?,
        InternalResult::Origination(o) => originate(
            ctx,
            step,
            source_id,
            o.balance,
            o.delegate.as_ref(),
            result,
            applied,
        )?,
        InternalResult::Delegation(d) => {
            delegation::apply(ctx, step, source_id, d.delegate.as_ref(), applied)?
        }
        InternalResult::Unsupported => return Ok(()),
    };

    let manager = ManagerFields {
        sender_id: source_id,
        counter,
        initiator_id: Some(initiator_id),
        nonce: Some(nonce),
    };
    let mut op = step.record(ctx, Some(hash), status, Some(manager), body);
    charge(ctx, step, &mut op, initiator_id, result)?;
    count_manager(ctx, &op, 1)?;
    step.push(ctx, op);
    Ok(())
}

pub fn revert(ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>, op: &Operation) -> Result<()> {
    let Some(manager) = &op.manager else {
        return Err(ReplayError::invariant(
            step.level(),
            format!("Operation {} has no manager fields", op.id),
        )
        .into());
    };
    let sender_id = manager.sender_id;
    let payer = manager.initiator_id.unwrap_or(sender_id);

    count_manager(ctx, op, -1)?;
    if op.status.is_applied() {
        burn(ctx, payer, -op.burned())?;
        revert_body(ctx, sender_id, &op.body)?;
    }
    if manager.initiator_id.is_none() {
        ctx.account_mut(sender_id)?.counter = manager.counter - 1;
        pay_fee(ctx, step, sender_id, op.fee, -1)?;
    }
    Ok(())
}

fn revert_body(ctx: &mut LedgerContext<'_>, sender_id: AccountId, body: &OperationBody) -> Result<()> {
    match *body {
        OperationBody::Reveal => {
            if let AccountKind::User(user) = &mut ctx.account_mut(sender_id)?.kind {
                user.revealed = false;
            }
        }
        OperationBody::Transaction {
            target_id: Some(target_id),
            target_allocated,
            amount,
            ..
        } => {
            if ctx.account(target_id)?.address.is_null() {
                ctx.stats.banished -= amount;
            }
            ctx.change_balance(target_id, -amount)?;
            ctx.change_balance(sender_id, amount)?;
            if target_allocated {
                ctx.remove_account(target_id)?;
            }
        }
        OperationBody::Staking { .. } => staking::revert(ctx, sender_id, body)?,
        OperationBody::Origination {
            contract_id: Some(contract_id),
            delegate_id,
            balance,
        } => {
            if delegate_id.is_some() {
                ctx.set_delegate(contract_id, None)?;
            }
            ctx.change_balance(contract_id, -balance)?;
            ctx.change_balance(sender_id, balance)?;
            ctx.remove_account(contract_id)?;
        }
        OperationBody::Delegation { .. } => delegation::revert(ctx, sender_id, body)?,
        OperationBody::SmartRollupOriginate {
            rollup_id: Some(rollup_id),
        } => ctx.remove_account(rollup_id)?,
        OperationBody::SmartRollupPublish { bond, .. } => lock_bond(ctx, sender_id, -bond)?,
        OperationBody::SmartRollupRecoverBond {
            staker_id, bond, ..
        } => lock_bond(ctx, staker_id, bond)?,
        _ => {}
    }
    Ok(())
}

/// Fee moves from the sender to the block producer, frozen in the roll era
fn pay_fee(
    ctx: &mut LedgerContext<'_>,
    step: &mut BlockStep<'_>,
    sender_id: AccountId,
    fee: Mutez,
    sign: Mutez,
) -> Result<()> {
    if fee == 0 {
        return Ok(());
    }
    let producer_id = step.block.producer_id;
    let freezes = step.formulas().freezes_rewards;
    if sign > 0 {
        ctx.change_balance(sender_id, -fee)?;
        ctx.change_balance(producer_id, fee)?;
        if freezes {
            ctx.adjust_frozen(producer_id, FreezerCategory::Fees, fee)?;
        }
    } else {
        if freezes {
            ctx.adjust_frozen(producer_id, FreezerCategory::Fees, -fee)?;
        }
        ctx.change_balance(producer_id, -fee)?;
        ctx.change_balance(sender_id, fee)?;
    }
    update_value_with_delta(&mut step.block.fees, sign * fee)?;
    if let Some(bc) = ctx.baker_cycle_mut(step.cycle(), producer_id)? {
        update_value_with_delta(&mut bc.block_fees, sign * fee)?;
    }
    Ok(())
}

/// Gas, storage and allocation accounting of one operation row
fn charge(
    ctx: &mut LedgerContext<'_>,
    step: &BlockStep<'_>,
    op: &mut Operation,
    payer: AccountId,
    result: &OperationResult,
) -> Result<()> {
    op.gas_used = (step.formulas().gas_used)(result.consumed_milligas.unwrap_or(0));
    if !op.status.is_applied() {
        return Ok(());
    }
    let constants = step.constants();
    op.storage_used = result.paid_storage_size_diff.unwrap_or(0);
    op.storage_fee = op.storage_used as Mutez * constants.byte_cost;
    let allocations =
        result.allocated_destination_contract as Mutez + result.originated_contracts.len() as Mutez;
    op.allocation_fee = allocations * constants.allocation_fee();
    burn(ctx, payer, op.burned())
}

fn burn(ctx: &mut LedgerContext<'_>, payer: AccountId, amount: Mutez) -> Result<()> {
    ctx.change_balance(payer, -amount)?;
    ctx.stats.burned += amount;
    Ok(())
}

/// Move `bond` from an account's balance into its rollup bonds, or back
/// when negative
fn lock_bond(ctx: &mut LedgerContext<'_>, account_id: AccountId, bond: Mutez) -> Result<()> {
    if bond > 0 {
        ctx.change_balance(account_id, -bond)?;
    }
    update_value_with_delta(&mut ctx.account_mut(account_id)?.rollup_bonds, bond)?;
    if bond < 0 {
        ctx.change_balance(account_id, -bond)?;
    }
    ctx.stats.rollup_bonds += bond;
    Ok(())
}

/// Sum of the contract updates of `address` whose change passes `filter`
fn contract_change(result: &OperationResult, address: &Address, filter: fn(Mutez) -> bool) -> Mutez {
    result
        .balance_updates
        .iter()
        .filter(|u| {
            u.kind == BalanceKind::Contract && u.contract.as_ref() == Some(address) && filter(u.change)
        })
        .map(|u| u.change)
        .sum()
}

fn reveal(ctx: &mut LedgerContext<'_>, sender_id: AccountId, applied: bool) -> Result<OperationBody> {
    if applied {
        if let AccountKind::User(user) = &mut ctx.account_mut(sender_id)?.kind {
            user.revealed = true;
        }
    }
    Ok(OperationBody::Reveal)
}

fn transfer(
    ctx: &mut LedgerContext<'_>,
    t: Transfer<'_>,
    result: &OperationResult,
    applied: bool,
) -> Result<OperationBody> {
    if let Some(action) = staking::staking_action(t.source, t.destination, t.parameters) {
        return staking::apply(ctx, t.source_id, action, t.amount, result, applied);
    }
    let entrypoint = t.parameters.map(|p| p.entrypoint.clone());
    if !applied {
        return Ok(OperationBody::Transaction {
            target_id: ctx.account_by_address(t.destination)?,
            target_allocated: false,
            amount: t.amount,
            entrypoint,
        });
    }

    let (target_id, target_allocated) = ctx.account_or_allocate(t.destination, None)?;
    ctx.change_balance(t.source_id, -t.amount)?;
    ctx.change_balance(target_id, t.amount)?;
    // Anything sent to the null address is out of circulation for good
    if t.destination.is_null() {
        ctx.stats.banished += t.amount;
    }
    Ok(OperationBody::Transaction {
        target_id: Some(target_id),
        target_allocated,
        amount: t.amount,
        entrypoint,
    })
}

#[allow(clippy::too_many_arguments)]
fn originate(
    ctx: &mut LedgerContext<'_>,
    step: &BlockStep<'_>,
    source_id: AccountId,
    balance: Mutez,
    delegate: Option<&Address>,
    result: &OperationResult,
    applied: bool,
) -> Result<OperationBody> {
    let delegate_id = match delegate {
        Some(address) if applied => Some(ctx.required_account(address)?),
        Some(address) => ctx.account_by_address(address)?,
        None => None,
    };
    if !applied {
        return Ok(OperationBody::Origination {
            contract_id: None,
            delegate_id,
            balance,
        });
    }

    let level = step.level();
    let address = result
        .originated_contracts
        .first()
        .ok_or_else(|| ReplayError::malformed(level, "Applied origination without a contract"))?;
    let contract_id = ctx.allocate_account(
        address,
        AccountKind::Contract(ContractData {
            creator_id: Some(source_id),
        }),
    )?;
    ctx.change_balance(source_id, -balance)?;
    ctx.change_balance(contract_id, balance)?;
    if let Some(baker_id) = delegate_id {
        if !ctx.account(baker_id)?.is_baker() {
            return Err(ReplayError::malformed(
                level,
                format!("Contract delegated to non-baker {baker_id}"),
            )
            .into());
        }
        ctx.set_delegate(contract_id, Some(baker_id))?;
        let contract = ctx.account_mut(contract_id)?;
        contract.delegation_level = Some(level);
        contract.staked = true;
    }
    Ok(OperationBody::Origination {
        contract_id: Some(contract_id),
        delegate_id,
        balance,
    })
}
