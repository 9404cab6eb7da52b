//! Cycle rollover: materialises the cycle `preserved_cycles` ahead, with its
//! seed, snapshot and selected stake

use anyhow::Result;
use tracing::info;

use bakehouse_common::{
    operations::OperationBody, AccountId, Cycle, CycleIndex, Level, Mutez, ReplayError, Seed,
    SnapshotBalance,
};

use super::{snapshot_of, BlockStep, CommitUnit, NewCycle};
use crate::{
    context::LedgerContext,
    sampler::{random_int, TAG_SNAPSHOT},
};

pub struct CycleCommit;

impl CycleCommit {
    fn materialise(
        step: &BlockStep<'_>,
        index: CycleIndex,
        seed: Seed,
        snapshot: Option<(i32, Level)>,
        stakes: Vec<SnapshotBalance>,
    ) -> NewCycle {
        let constants = step.constants();
        let power = step.formulas().baking_power;

        let mut total_staking: Mutez = 0;
        let mut selected_stake: Mutez = 0;
        let mut distribution: Vec<(AccountId, Mutez)> = Vec::new();
        for stake in &stakes {
            let p = power(stake);
            total_staking += p;
            if p >= constants.minimal_stake {
                selected_stake += p;
                distribution.push((stake.baker_id, p));
            }
        }
        distribution.sort_by_key(|(id, _)| *id);

        let cycle = Cycle {
            index,
            first_level: step.params().first_level_of(index),
            last_level: step.params().last_level_of(index),
            snapshot_index: snapshot.map(|(i, _)| i),
            snapshot_level: snapshot.map(|(_, l)| l),
            total_staking,
            total_bakers: stakes.len() as i32,
            selected_stake,
            selected_bakers: distribution.len() as i32,
            seed,
        };
        NewCycle {
            cycle,
            stakes,
            distribution,
        }
    }

    /// Bootstrap cycles, drawn from the live stake of the bootstrap bakers
    fn bootstrap(ctx: &mut LedgerContext<'_>, step: &BlockStep<'_>) -> Result<Vec<NewCycle>> {
        let level = step.level();
        let mut stakes = Vec::new();
        for id in ctx.baker_ids()? {
            let account = ctx.account(id)?;
            if account.staked {
                stakes.extend(snapshot_of(account, level));
            }
        }

        let mut seed = step.initial_seed;
        let mut cycles = Vec::new();
        for index in step.created_cycles() {
            seed = seed.derive(std::iter::empty());
            cycles.push(Self::materialise(step, index, seed, None, stakes.clone()));
        }
        Ok(cycles)
    }

    fn rollover(ctx: &mut LedgerContext<'_>, step: &BlockStep<'_>, index: CycleIndex) -> Result<NewCycle> {
        let level = step.level();
        let params = step.params();
        let previous = ctx.required_cycle(index - 1)?;

        // Nonces revealed during the cycle that just ended, in inclusion order
        let finished = step.cycle() - 1;
        let revelations = ctx
            .store()
            .nonce_revelations(params.first_level_of(finished), params.last_level_of(finished))?;
        let mut nonces = Vec::with_capacity(revelations.len());
        for op in &revelations {
            if let OperationBody::NonceRevelation { nonce, .. } = &op.body {
                let bytes = hex::decode(nonce).map_err(|e| {
                    ReplayError::invariant(level, format!("Stored nonce {nonce} is not hex: {e}"))
                })?;
                nonces.push(bytes);
            }
        }
        let seed = previous.seed.derive(nonces.iter().map(Vec::as_slice));

        let snapshots = step.constants().snapshots_per_cycle();
        let snapshot_index = random_int(&seed, TAG_SNAPSHOT, index, 0, snapshots as i64) as i32;
        let snapshot_level = params.snapshot_level(finished, snapshot_index);
        let stakes = ctx.store().snapshots(snapshot_level)?;

        Ok(Self::materialise(
            step,
            index,
            seed,
            Some((snapshot_index, snapshot_level)),
            stakes,
        ))
    }
}

impl CommitUnit for CycleCommit {
    fn name(&self) -> &'static str {
        "cycle"
    }

    fn apply(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        let created = step.created_cycles();
        let new_cycles = match created.as_slice() {
            [] => return Ok(()),
            _ if step.genesis => Self::bootstrap(ctx, step)?,
            [index] => vec![Self::rollover(ctx, step, *index)?],
            _ => {
                return Err(ReplayError::invariant(
                    step.level(),
                    "Only the first block creates several cycles",
                )
                .into())
            }
        };

        for new_cycle in &new_cycles {
            let cycle = &new_cycle.cycle;
            info!(
                cycle = cycle.index,
                snapshot_level = ?cycle.snapshot_level,
                selected_bakers = cycle.selected_bakers,
                selected_stake = cycle.selected_stake,
                "Created cycle"
            );
            ctx.put_cycle(cycle.clone());
        }
        step.new_cycles = new_cycles;
        Ok(())
    }

    fn revert(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        for index in step.created_cycles() {
            ctx.delete_cycle(index);
        }
        Ok(())
    }
}
