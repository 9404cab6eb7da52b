//! Frozen balance movements outside of operations
//!
//! Roll-era protocols unfreeze the deposits, rewards and fees of the cycle
//! `preserved_cycles` back at the end of every cycle.  Later protocols
//! report deposit movements directly, as a contract debit followed by the
//! matching freezer credit (or the reverse when unfreezing).

use anyhow::Result;
use tracing::debug;

use bakehouse_common::{
    node::{BalanceKind, BalanceUpdate},
    operations::{FreezerCategory, OperationBody, OperationStatus},
    AccountId, BlockEvents, CycleIndex, Mutez,
};

use super::{cross_check, BlockStep, CommitUnit};
use crate::context::LedgerContext;

const DEPOSITS: &str = "deposits";
const FREEZER_BUCKETS: [(FreezerCategory, &str); 3] = [
    (FreezerCategory::Deposits, "deposits"),
    (FreezerCategory::Rewards, "rewards"),
    (FreezerCategory::Fees, "fees"),
];

pub struct FreezerCommit;

impl FreezerCommit {
    fn record(
        ctx: &mut LedgerContext<'_>,
        step: &mut BlockStep<'_>,
        baker_id: AccountId,
        category: FreezerCategory,
        cycle: Option<CycleIndex>,
        change: Mutez,
    ) -> Result<()> {
        ctx.adjust_frozen(baker_id, category, change)?;
        let op = step.record(
            ctx,
            None,
            OperationStatus::Applied,
            None,
            OperationBody::FreezerUpdate {
                baker_id,
                category,
                cycle,
                change,
            },
        );
        step.push(ctx, op);
        Ok(())
    }

    /// Release everything frozen during `cycle`, capped by what slashing left
    fn unfreeze_cycle(
        ctx: &mut LedgerContext<'_>,
        step: &mut BlockStep<'_>,
        cycle: CycleIndex,
    ) -> Result<()> {
        let level = step.level();
        let node = step.node()?;
        let mut released = [0 as Mutez; 3];

        for row in ctx.baker_cycles(cycle)? {
            let baker = ctx.account(row.baker_id)?.baker().cloned().unwrap_or_default();
            let owed = [
                (row.block_deposits + row.endorsement_deposits).min(baker.frozen_deposits),
                (row.block_rewards.total()
                    + row.endorsement_rewards.total()
                    + row.nonce_revelation_rewards.total())
                .min(baker.frozen_rewards),
                row.block_fees.min(baker.frozen_fees),
            ];
            for ((category, _), (amount, total)) in
                FREEZER_BUCKETS.iter().zip(owed.into_iter().zip(released.iter_mut()))
            {
                if amount > 0 {
                    Self::record(ctx, step, row.baker_id, *category, Some(cycle), -amount)?;
                    *total += amount;
                }
            }
        }

        for ((_, name), total) in FREEZER_BUCKETS.iter().zip(released) {
            let reported = reported_release(&node.metadata.balance_updates, name, cycle);
            cross_check(level, &format!("Unfrozen {name} of cycle {cycle}"), reported, total)?;
        }
        debug!(level, cycle, ?released, "Unfroze cycle");
        Ok(())
    }

    /// Deposit movements the node reports as adjacent contract/freezer pairs
    fn reported_deposits(ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        let node = step.node()?;
        let bucket = step.formulas().deposit_bucket;
        let updates = &node.metadata.balance_updates;
        let mut i = 0;
        while i + 1 < updates.len() {
            let (first, second) = (&updates[i], &updates[i + 1]);
            let credit = if is_deposit_pair(first, second) {
                second
            } else if is_deposit_pair(second, first) {
                first
            } else {
                i += 1;
                continue;
            };
            if let Some(address) = credit.baker() {
                let baker_id = ctx.required_account(address)?;
                Self::record(ctx, step, baker_id, bucket, None, credit.change)?;
            }
            i += 2;
        }
        Ok(())
    }
}

/// Total the node reports unfreezing from `category` for `cycle`, if any
fn reported_release(updates: &[BalanceUpdate], category: &str, cycle: CycleIndex) -> Option<Mutez> {
    let mut matched = updates
        .iter()
        .filter(|u| {
            u.kind == BalanceKind::Freezer
                && u.is_category(category)
                && u.cycle == Some(cycle)
                && u.change < 0
        })
        .peekable();
    matched.peek()?;
    Some(matched.map(|u| -u.change).sum())
}

fn is_deposit_pair(debit: &BalanceUpdate, credit: &BalanceUpdate) -> bool {
    debit.kind == BalanceKind::Contract
        && credit.kind == BalanceKind::Freezer
        && credit.is_category(DEPOSITS)
        && credit.staker.is_none()
        && credit.change != 0
        && debit.change == -credit.change
        && debit.contract.is_some()
        && debit.contract.as_ref() == credit.baker()
}

impl CommitUnit for FreezerCommit {
    fn name(&self) -> &'static str {
        "freezer"
    }

    fn apply(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        if step.genesis {
            return Ok(());
        }
        if step.formulas().freezes_rewards {
            if step.has_event(BlockEvents::CycleEnd) {
                let unfrozen = step.cycle() - step.constants().preserved_cycles;
                if ctx.cycle(unfrozen)?.is_some() {
                    Self::unfreeze_cycle(ctx, step, unfrozen)?;
                }
            }
            Ok(())
        } else {
            Self::reported_deposits(ctx, step)
        }
    }

    fn revert(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        for op in step.operations_rev(|b| matches!(b, OperationBody::FreezerUpdate { .. })) {
            if let OperationBody::FreezerUpdate {
                baker_id,
                category,
                change,
                ..
            } = op.body
            {
                ctx.adjust_frozen(baker_id, category, -change)?;
            }
            ctx.delete_operation(&op)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{assert_reverted, block_hash, extend, setup};
    use bakehouse_common::{protocol_params::ProtocolVersion, Address};
    use bakehouse_module_ledger_store::LedgerStore;

    fn update(kind: BalanceKind, category: Option<&str>, address: &str, change: Mutez) -> BalanceUpdate {
        BalanceUpdate {
            kind,
            category: category.map(str::to_string),
            contract: (kind == BalanceKind::Contract).then(|| Address::from(address)),
            delegate: (kind != BalanceKind::Contract).then(|| Address::from(address)),
            staker: None,
            cycle: Some(3),
            change,
            origin: Some("block".to_string()),
        }
    }

    #[test]
    fn deposit_pairs_must_mirror_each_other() {
        let debit = update(BalanceKind::Contract, None, "tz1baker", -500);
        let credit = update(BalanceKind::Freezer, Some("deposits"), "tz1baker", 500);
        assert!(is_deposit_pair(&debit, &credit));

        let other = update(BalanceKind::Freezer, Some("deposits"), "tz1other", 500);
        assert!(!is_deposit_pair(&debit, &other));

        let uneven = update(BalanceKind::Freezer, Some("deposits"), "tz1baker", 400);
        assert!(!is_deposit_pair(&debit, &uneven));

        // Unfreezing lists the freezer side first
        let release = update(BalanceKind::Freezer, Some("deposits"), "tz1baker", -500);
        let refund = update(BalanceKind::Contract, None, "tz1baker", 500);
        assert!(!is_deposit_pair(&release, &refund));
        assert!(is_deposit_pair(&refund, &release));
    }

    #[test]
    fn release_totals_only_count_the_given_cycle() {
        let mut old = update(BalanceKind::Freezer, Some("rewards"), "tz1a", -30);
        old.cycle = Some(2);
        let updates = vec![
            update(BalanceKind::Freezer, Some("rewards"), "tz1a", -100),
            update(BalanceKind::Freezer, Some("rewards"), "tz1b", -20),
            old,
            update(BalanceKind::Freezer, Some("fees"), "tz1a", -5),
        ];
        assert_eq!(reported_release(&updates, "rewards", 3), Some(120));
        assert_eq!(reported_release(&updates, "deposits", 3), None);
    }

    #[test]
    fn roll_era_cycle_end_releases_what_was_frozen_two_cycles_back() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Rolls, 100);
        extend(&mut pipeline, &chain, 23);
        let before = store.snapshot().unwrap();

        let owed: Vec<(AccountId, Mutez)> = store
            .baker_cycles(0)
            .unwrap()
            .iter()
            .map(|row| {
                let rewards = row.block_rewards.total()
                    + row.endorsement_rewards.total()
                    + row.nonce_revelation_rewards.total();
                (row.baker_id, rewards)
            })
            .filter(|(_, rewards)| *rewards > 0)
            .collect();
        assert!(!owed.is_empty());

        // Level 24 ends cycle 2, which unfreezes cycle 0
        extend(&mut pipeline, &chain, 24);
        let released: Vec<(AccountId, Mutez)> = store
            .operations(24)
            .unwrap()
            .into_iter()
            .filter_map(|op| match op.body {
                OperationBody::FreezerUpdate {
                    baker_id,
                    category: FreezerCategory::Rewards,
                    cycle: Some(0),
                    change,
                } => Some((baker_id, -change)),
                _ => None,
            })
            .collect();
        assert_eq!(released, owed);

        pipeline.revert_head(&block_hash(24, "main")).unwrap();
        assert_reverted(&store, before, 24);
    }
}
