//! Accounts and balances injected outside of operations: genesis bootstrap,
//! protocol migrations and per-block subsidies

use anyhow::Result;
use tracing::info;

use bakehouse_common::{
    math::update_count_with_delta,
    node::{BalanceKind, BootstrapAccount},
    operations::{MigrationKind, OperationBody, OperationStatus},
    AccountId, AccountKind, BakerData, Mutez, ReplayError,
};

use super::{BlockStep, CommitUnit};
use crate::context::LedgerContext;

const ORIGIN_MIGRATION: &str = "migration";
const ORIGIN_SUBSIDY: &str = "subsidy";

pub struct MigrationCommit;

impl MigrationCommit {
    fn credit(
        ctx: &mut LedgerContext<'_>,
        step: &mut BlockStep<'_>,
        account_id: AccountId,
        kind: MigrationKind,
        change: Mutez,
        allocated: bool,
    ) -> Result<()> {
        ctx.change_balance(account_id, change)?;
        ctx.stats.created += change;
        update_count_with_delta(&mut ctx.account_mut(account_id)?.counts.migrations, 1)?;
        let op = step.record(
            ctx,
            None,
            OperationStatus::Applied,
            None,
            OperationBody::Migration {
                account_id,
                kind,
                balance_change: change,
                allocated,
            },
        );
        step.push(ctx, op);
        Ok(())
    }

    fn bootstrap(
        ctx: &mut LedgerContext<'_>,
        step: &mut BlockStep<'_>,
        accounts: &[BootstrapAccount],
    ) -> Result<()> {
        let level = step.level();
        let grace = (step.formulas().deactivation_level)(step.params(), level);
        let edge = step.constants().default_edge_of_baking_over_staking;

        // Bakers first so delegators can point at them
        let (bakers, others): (Vec<_>, Vec<_>) = accounts
            .iter()
            .partition(|a| a.delegate.as_ref() == Some(&a.address));

        for account in &bakers {
            let id = ctx.allocate_account(
                &account.address,
                AccountKind::Baker(BakerData {
                    activation_level: level,
                    deactivation_level: grace,
                    edge_of_baking_over_staking: edge,
                    ..Default::default()
                }),
            )?;
            let row = ctx.account_mut(id)?;
            row.delegate_id = Some(id);
            row.delegation_level = Some(level);
            row.staked = true;
            Self::credit(ctx, step, id, MigrationKind::Bootstrap, account.balance, true)?;
        }

        for account in &others {
            let id = ctx.allocate_for_address(&account.address, None)?;
            if let Some(delegate) = &account.delegate {
                let baker_id = ctx.required_account(delegate)?;
                ctx.set_delegate(id, Some(baker_id))?;
                let row = ctx.account_mut(id)?;
                row.delegation_level = Some(level);
                row.staked = true;
            }
            Self::credit(ctx, step, id, MigrationKind::Bootstrap, account.balance, true)?;
        }

        info!(
            level,
            bakers = bakers.len(),
            accounts = accounts.len(),
            "Bootstrapped ledger"
        );
        Ok(())
    }
}

impl CommitUnit for MigrationCommit {
    fn name(&self) -> &'static str {
        "migration"
    }

    fn apply(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        let node = step.node()?;
        if step.genesis {
            let migration = node.metadata.migration.as_ref().ok_or_else(|| {
                ReplayError::malformed(step.level(), "First block carries no bootstrap accounts")
            })?;
            Self::bootstrap(ctx, step, &migration.bootstrap_accounts)?;
        }

        for update in &node.metadata.balance_updates {
            if update.kind != BalanceKind::Contract {
                continue;
            }
            let kind = match update.origin.as_deref() {
                Some(ORIGIN_MIGRATION) => MigrationKind::ProtocolMigration,
                Some(ORIGIN_SUBSIDY) => MigrationKind::Subsidy,
                _ => continue,
            };
            let Some(address) = &update.contract else {
                return Err(ReplayError::malformed(
                    step.level(),
                    "Migration balance update without a contract",
                )
                .into());
            };
            let (id, allocated) = ctx.account_or_allocate(address, None)?;
            Self::credit(ctx, step, id, kind, update.change, allocated)?;
        }
        Ok(())
    }

    fn revert(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        for op in step.operations_rev(|b| matches!(b, OperationBody::Migration { .. })) {
            let OperationBody::Migration {
                account_id,
                balance_change,
                allocated,
                ..
            } = op.body
            else {
                continue;
            };
            ctx.change_balance(account_id, -balance_change)?;
            update_count_with_delta(&mut ctx.account_mut(account_id)?.counts.migrations, -1)?;
            if allocated {
                if ctx.account(account_id)?.external_delegate().is_some() {
                    ctx.set_delegate(account_id, None)?;
                }
                ctx.remove_account(account_id)?;
            }
            ctx.delete_operation(&op)?;
        }
        Ok(())
    }
}
