//! Seeds the per-baker aggregates of every newly created cycle

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::debug;

use bakehouse_common::{
    AccountId, BakerCycle, BakingRight, CycleIndex, RightKind, SnapshotBalance,
};

use super::{BlockStep, CommitUnit, NewCycle};
use crate::{context::LedgerContext, rights_generator::GeneratedRights};

pub struct BakerCycleCommit;

impl BakerCycleCommit {
    fn seeded(index: CycleIndex, stake: &SnapshotBalance, power: i64, total: i64) -> BakerCycle {
        BakerCycle {
            own_delegated_balance: stake.own_delegated_balance,
            external_delegated_balance: stake.external_delegated_balance,
            delegators_count: stake.delegators_count,
            own_staked_balance: stake.own_staked_balance,
            external_staked_balance: stake.external_staked_balance,
            stakers_count: stake.stakers_count,
            baking_power: power,
            total_baking_power: total,
            ..BakerCycle::new(index, stake.baker_id)
        }
    }

    /// Endorsing rights realised within the cycle: those of its own levels
    /// but the last, plus those of the level just before it
    fn shifted_endorsing(
        ctx: &mut LedgerContext<'_>,
        step: &BlockStep<'_>,
        new_cycle: &NewCycle,
        rights: &GeneratedRights,
    ) -> Result<Vec<BakingRight>> {
        let cycle = &new_cycle.cycle;
        let boundary = cycle.first_level - 1;

        let previous = step
            .future_rights
            .iter()
            .find(|r| r.cycle == cycle.index - 1)
            .map(|r| r.endorsing_at(boundary).cloned().collect::<Vec<_>>());
        let mut shifted = match previous {
            Some(rows) => rows,
            None => ctx
                .rights_at(boundary)?
                .iter()
                .filter(|r| r.kind == RightKind::Endorsing)
                .cloned()
                .collect(),
        };
        shifted.extend(
            rights
                .endorsing
                .iter()
                .filter(|r| r.level < cycle.last_level)
                .cloned(),
        );
        Ok(shifted)
    }
}

impl CommitUnit for BakerCycleCommit {
    fn name(&self) -> &'static str {
        "baker_cycle"
    }

    fn apply(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        let constants = step.constants();
        let formulas = step.formulas();
        let expected_block = (formulas.block_reward)(constants, 0);

        for new_cycle in &step.new_cycles {
            let index = new_cycle.cycle.index;
            let Some(rights) = step.future_rights.iter().find(|r| r.cycle == index) else {
                continue;
            };

            let mut rows: BTreeMap<AccountId, BakerCycle> = BTreeMap::new();
            let selected: BTreeMap<AccountId, i64> =
                new_cycle.distribution.iter().copied().collect();
            for stake in &new_cycle.stakes {
                if let Some(power) = selected.get(&stake.baker_id) {
                    rows.insert(
                        stake.baker_id,
                        Self::seeded(index, stake, *power, new_cycle.cycle.selected_stake),
                    );
                }
            }

            for right in rights.baking.iter().filter(|r| r.round == Some(0)) {
                let row = rows
                    .entry(right.baker_id)
                    .or_insert_with(|| BakerCycle::new(index, right.baker_id));
                row.future_blocks += 1;
                row.future_block_rewards += expected_block;
            }

            for right in Self::shifted_endorsing(ctx, step, new_cycle, rights)? {
                let slots = right.slots.unwrap_or_default();
                // Bakers only holding shifted rights get a zero-stake row
                let row = rows
                    .entry(right.baker_id)
                    .or_insert_with(|| BakerCycle::new(index, right.baker_id));
                row.future_endorsements += slots;
                row.future_endorsement_rewards += (formulas.endorsement_reward)(constants, slots);
            }

            debug!(cycle = index, bakers = rows.len(), "Seeded baker cycles");
            for row in rows.into_values() {
                ctx.put_baker_cycle(row);
            }
        }
        Ok(())
    }

    fn revert(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        for index in step.created_cycles() {
            ctx.delete_baker_cycles(index)?;
        }
        Ok(())
    }
}

