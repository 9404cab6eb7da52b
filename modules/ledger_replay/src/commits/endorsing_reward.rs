//! Cycle-end settlement of endorsing rewards
//!
//! Each baker's expected reward for the cycle is either paid out or, when
//! the node burns it as lost, recorded as missed.  Partial losses do not
//! exist: the whole amount goes one way or the other.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::debug;

use bakehouse_common::{
    math::update_count_with_delta,
    node::BalanceKind,
    operations::{OperationBody, OperationStatus},
    Address, BlockEvents, Mutez, ReplayError, RewardSplit,
};

use super::{credit_reward, cross_check, minted_total, BlockStep, CommitUnit};
use crate::context::LedgerContext;

const LOST_CATEGORIES: &[&str] = &["lost endorsing rewards", "lost attesting rewards"];
const REWARD_CATEGORIES: &[&str] = &["endorsing rewards", "attesting rewards"];

pub struct EndorsingRewardCommit;

impl CommitUnit for EndorsingRewardCommit {
    fn name(&self) -> &'static str {
        "endorsing_reward"
    }

    fn apply(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        if step.genesis || !step.has_event(BlockEvents::CycleEnd) {
            return Ok(());
        }
        let level = step.level();
        let cycle = step.cycle();
        let node = step.node()?;

        let mut lost: BTreeMap<&Address, Mutez> = BTreeMap::new();
        for update in &node.metadata.balance_updates {
            if update.kind == BalanceKind::Burned
                && LOST_CATEGORIES.iter().any(|c| update.is_category(c))
            {
                if let Some(baker) = update.baker() {
                    *lost.entry(baker).or_default() += update.change;
                }
            }
        }

        let mut paid: Mutez = 0;
        for row in ctx.baker_cycles(cycle)? {
            let expected = row.future_endorsement_rewards;
            if expected == 0 {
                continue;
            }
            let baker_id = row.baker_id;
            let account = ctx.account(baker_id)?.clone();
            let forfeited = lost.remove(&account.address).unwrap_or_default();

            let received = if forfeited > 0 {
                if forfeited != expected {
                    return Err(ReplayError::invariant(
                        level,
                        format!(
                            "Baker {baker_id} lost {forfeited} endorsing rewards, expected {expected}"
                        ),
                    )
                    .into());
                }
                RewardSplit::default()
            } else {
                let split = (step.formulas().reward_split)(&account, expected, step.constants())?;
                credit_reward(ctx, step.formulas(), baker_id, &split, 1)?;
                paid += split.total();
                split
            };

            if let Some(bc) = ctx.baker_cycle_mut(cycle, baker_id)? {
                bc.future_endorsement_rewards = 0;
                if received.total() == 0 {
                    bc.missed_endorsement_rewards += expected;
                } else {
                    bc.endorsement_rewards.add(&received);
                }
            }
            update_count_with_delta(&mut ctx.account_mut(baker_id)?.counts.endorsing_rewards, 1)?;

            let op = step.record(
                ctx,
                None,
                OperationStatus::Applied,
                None,
                OperationBody::EndorsingReward {
                    baker_id,
                    cycle,
                    expected,
                    received,
                },
            );
            step.push(ctx, op);
        }

        if let Some((address, amount)) = lost.into_iter().next() {
            return Err(ReplayError::invariant(
                level,
                format!("{address} lost {amount} endorsing rewards it was never expected to earn"),
            )
            .into());
        }

        cross_check(
            level,
            "Endorsing rewards",
            minted_total(&node.metadata.balance_updates, REWARD_CATEGORIES),
            paid,
        )?;
        debug!(level, cycle, paid, "Settled endorsing rewards");
        Ok(())
    }

    fn revert(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        for op in step.operations_rev(|b| matches!(b, OperationBody::EndorsingReward { .. })) {
            let OperationBody::EndorsingReward {
                baker_id,
                cycle,
                expected,
                received,
            } = op.body
            else {
                continue;
            };
            update_count_with_delta(&mut ctx.account_mut(baker_id)?.counts.endorsing_rewards, -1)?;
            if let Some(bc) = ctx.baker_cycle_mut(cycle, baker_id)? {
                if received.total() == 0 {
                    bc.missed_endorsement_rewards -= expected;
                } else {
                    bc.endorsement_rewards.sub(&received);
                }
                bc.future_endorsement_rewards = expected;
            }
            if received.total() != 0 {
                credit_reward(ctx, step.formulas(), baker_id, &received, -1)?;
            }
            ctx.delete_operation(&op)?;
        }
        Ok(())
    }
}
