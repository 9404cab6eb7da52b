//! Rights bookkeeping: settling the rights of the block being applied, and
//! generating the rights of cycles created by it

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::debug;

use bakehouse_common::{
    math::update_count_with_delta, operations::OperationBody, AccountId, BakerCycle,
    BakingRight, Cycle, CycleIndex, Level, Mutez, ReplayError, RightKind, RightStatus,
};
use bakehouse_module_ledger_store::bulk::encode_rows;

use super::{BlockStep, CommitUnit};
use crate::{
    context::LedgerContext,
    rights_generator::RightsGenerator,
    sampler::Sampler,
};

/// Sampler of a cycle rebuilt from its stored baker-cycle rows
fn cycle_sampler(
    ctx: &mut LedgerContext<'_>,
    step: &BlockStep<'_>,
    index: CycleIndex,
) -> Result<(Cycle, Sampler)> {
    let cycle = ctx.required_cycle(index)?;
    let distribution: Vec<(AccountId, Mutez)> = ctx
        .baker_cycles(index)?
        .into_iter()
        .filter(|bc| bc.baking_power > 0)
        .map(|bc| (bc.baker_id, bc.baking_power))
        .collect();
    let sampler = (step.formulas().sampler)(&distribution, step.constants())?;
    Ok((cycle, sampler))
}

/// Counters a settled right moves on its baker-cycle row; `sign` = -1 undoes them
fn settle(
    bc: &mut BakerCycle,
    step: &BlockStep<'_>,
    right: &BakingRight,
    status: RightStatus,
    sign: i32,
) -> Result<()> {
    let constants = step.constants();
    let formulas = step.formulas();
    let wide = sign as Mutez;
    match right.kind {
        RightKind::Baking => {
            let round = right.round.unwrap_or_default();
            if round == 0 {
                update_count_with_delta(&mut bc.future_blocks, -sign)?;
                bc.future_block_rewards -= wide * (formulas.block_reward)(constants, 0);
            }
            match status {
                RightStatus::Realized if round == 0 => {
                    update_count_with_delta(&mut bc.blocks, sign)?
                }
                RightStatus::Realized => update_count_with_delta(&mut bc.extra_blocks, sign)?,
                RightStatus::Missed => {
                    update_count_with_delta(&mut bc.missed_blocks, sign)?;
                    bc.missed_block_rewards += wide * (formulas.block_reward)(constants, round);
                }
                _ => {}
            }
        }
        RightKind::Endorsing => {
            let slots = right.slots.unwrap_or_default();
            update_count_with_delta(&mut bc.future_endorsements, -sign * slots)?;
            let reward = (formulas.endorsement_reward)(constants, slots);
            // Later protocols settle endorsement rewards once per cycle
            let per_level = formulas.endorsement_rewards_per_level;
            if per_level {
                bc.future_endorsement_rewards -= wide * reward;
            }
            match status {
                RightStatus::Realized => update_count_with_delta(&mut bc.endorsements, sign * slots)?,
                RightStatus::Missed => {
                    update_count_with_delta(&mut bc.missed_endorsements, sign * slots)?;
                    if per_level {
                        bc.missed_endorsement_rewards += wide * reward;
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn settle_on_cycle(
    ctx: &mut LedgerContext<'_>,
    step: &BlockStep<'_>,
    right: &BakingRight,
    status: RightStatus,
    sign: i32,
) -> Result<()> {
    match ctx.baker_cycle_mut(step.cycle(), right.baker_id)? {
        Some(bc) => settle(bc, step, right, status, sign),
        None => Err(ReplayError::invariant(
            step.level(),
            format!("No cycle {} row for baker {}", step.cycle(), right.baker_id),
        )
        .into()),
    }
}

/// Missed when the baker was still active, uncovered otherwise
fn unrealized(ctx: &mut LedgerContext<'_>, baker_id: AccountId) -> Result<RightStatus> {
    Ok(if ctx.account(baker_id)?.staked {
        RightStatus::Missed
    } else {
        RightStatus::Uncovered
    })
}

/// Settles the baking rights of the applied level and the endorsing rights
/// of its predecessor against what the block shows
pub struct BakingRightsCommit;

impl BakingRightsCommit {
    fn apply_baking(ctx: &mut LedgerContext<'_>, step: &BlockStep<'_>) -> Result<()> {
        let level = step.level();
        let round = step.block.payload_round;
        let producer = step.block.producer_id;

        let mut rights = ctx.rights_at(level)?.to_vec();
        let holds_right = |rights: &[BakingRight]| {
            rights
                .iter()
                .any(|r| r.kind == RightKind::Baking && r.baker_id == producer)
        };
        if !holds_right(&rights) && round >= step.constants().baking_rounds {
            let (cycle, sampler) = cycle_sampler(ctx, step, step.cycle())?;
            let generator = RightsGenerator::new(step.constants(), step.formulas().baking_mode);
            let extra = generator.extend_level(&cycle, &sampler, level, &rights, round)?;
            debug!(level, round, extra = extra.len(), "Extended baking rights");
            let at = rights
                .iter()
                .position(|r| r.kind != RightKind::Baking)
                .unwrap_or(rights.len());
            rights.splice(at..at, extra);
        }
        match rights
            .iter()
            .find(|r| r.kind == RightKind::Baking && r.baker_id == producer)
        {
            Some(right) if right.round.unwrap_or_default() <= round => {}
            Some(right) => {
                return Err(ReplayError::mismatch(
                    level,
                    format!(
                        "Baker {producer} produced round {round} but its first round is {:?}",
                        right.round
                    ),
                )
                .into())
            }
            None => {
                return Err(ReplayError::mismatch(
                    level,
                    format!("Baker {producer} produced round {round} without a baking right"),
                )
                .into())
            }
        }

        let mut settled = Vec::with_capacity(rights.len());
        for mut right in rights {
            if right.kind == RightKind::Baking {
                let right_round = right.round.unwrap_or_default();
                if right.baker_id == producer {
                    right.status = RightStatus::Realized;
                } else if right_round < round {
                    right.status = unrealized(ctx, right.baker_id)?;
                } else {
                    // Rounds after the realised one never happened
                    continue;
                }
                settle_on_cycle(ctx, step, &right, right.status, 1)?;
            }
            settled.push(right);
        }
        *ctx.rights_at_mut(level)? = settled;
        Ok(())
    }

    fn apply_endorsing(ctx: &mut LedgerContext<'_>, step: &BlockStep<'_>) -> Result<()> {
        let level = step.level();
        let endorsed = level - 1;
        let mut endorsers: BTreeMap<AccountId, i32> = BTreeMap::new();
        for op in &step.operations {
            if let OperationBody::Endorsement {
                delegate_id, slots, ..
            } = op.body
            {
                *endorsers.entry(delegate_id).or_default() += slots;
            }
        }

        let mut rights = ctx.rights_at(endorsed)?.to_vec();
        if !rights.iter().any(|r| r.kind == RightKind::Endorsing) {
            // The activation block has no rights to endorse
            debug!(level, "No endorsing rights for predecessor");
            return Ok(());
        }
        for right in rights.iter_mut().filter(|r| r.kind == RightKind::Endorsing) {
            right.status = match endorsers.remove(&right.baker_id) {
                Some(slots) if Some(slots) == right.slots => RightStatus::Realized,
                Some(slots) => {
                    return Err(ReplayError::mismatch(
                        level,
                        format!(
                            "Baker {} endorsed {endorsed} with {slots} slots, expected {:?}",
                            right.baker_id, right.slots
                        ),
                    )
                    .into())
                }
                None => unrealized(ctx, right.baker_id)?,
            };
            settle_on_cycle(ctx, step, right, right.status, 1)?;
        }
        if let Some((baker_id, _)) = endorsers.into_iter().next() {
            return Err(ReplayError::mismatch(
                level,
                format!("Baker {baker_id} endorsed {endorsed} without an endorsing right"),
            )
            .into());
        }
        *ctx.rights_at_mut(endorsed)? = rights;
        Ok(())
    }

    fn revert_baking(ctx: &mut LedgerContext<'_>, step: &BlockStep<'_>) -> Result<()> {
        let level = step.level();
        let rights = ctx.rights_at(level)?.to_vec();
        for right in rights.iter().filter(|r| r.kind == RightKind::Baking) {
            settle_on_cycle(ctx, step, right, right.status, -1)?;
        }

        // Rounds dropped when applying are regenerated from the cycle's stored draw
        let (cycle, sampler) = cycle_sampler(ctx, step, step.cycle())?;
        let generator = RightsGenerator::new(step.constants(), step.formulas().baking_mode);
        let (baking, _) = generator.level_rights(&cycle, &sampler, level)?;
        let mut restored = baking;
        restored.extend(rights.into_iter().filter(|r| r.kind != RightKind::Baking));
        *ctx.rights_at_mut(level)? = restored;
        Ok(())
    }

    fn revert_endorsing(ctx: &mut LedgerContext<'_>, step: &BlockStep<'_>) -> Result<()> {
        let endorsed = step.level() - 1;
        let mut rights = ctx.rights_at(endorsed)?.to_vec();
        if !rights.iter().any(|r| r.kind == RightKind::Endorsing) {
            return Ok(());
        }
        for right in rights.iter_mut().filter(|r| r.kind == RightKind::Endorsing) {
            settle_on_cycle(ctx, step, right, right.status, -1)?;
            right.status = RightStatus::Future;
        }
        *ctx.rights_at_mut(endorsed)? = rights;
        Ok(())
    }
}

impl CommitUnit for BakingRightsCommit {
    fn name(&self) -> &'static str {
        "baking_rights"
    }

    fn apply(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        if step.genesis {
            return Ok(());
        }
        Self::apply_baking(ctx, step)?;
        Self::apply_endorsing(ctx, step)
    }

    fn revert(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        if step.genesis {
            return Ok(());
        }
        Self::revert_endorsing(ctx, step)?;
        Self::revert_baking(ctx, step)
    }
}

/// Draws the rights of every cycle the block created and hands them to the
/// bulk path
pub struct FutureRightsCommit;

impl CommitUnit for FutureRightsCommit {
    fn name(&self) -> &'static str {
        "future_rights"
    }

    fn apply(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        let generator = RightsGenerator::new(step.constants(), step.formulas().baking_mode);
        let from_level = step.first_rights_level();
        let mut generated = Vec::with_capacity(step.new_cycles.len());
        for new_cycle in &step.new_cycles {
            let sampler = (step.formulas().sampler)(&new_cycle.distribution, step.constants())?;
            let rights = generator.generate(&new_cycle.cycle, &sampler, from_level)?;
            let rows: Vec<BakingRight> = rights.rows().cloned().collect();
            ctx.queue_bulk(encode_rows(&rows)?);
            debug!(cycle = rights.cycle, rows = rows.len(), "Generated rights");
            generated.push(rights);
        }
        step.future_rights = generated;
        Ok(())
    }

    fn revert(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        for index in step.created_cycles() {
            let cycle = ctx.required_cycle(index)?;
            let from: Level = cycle.first_level.max(step.first_rights_level());
            ctx.delete_rights(from, cycle.last_level);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{assert_reverted, block_hash, extend, setup, test_params};
    use bakehouse_common::protocol_params::ProtocolVersion;
    use bakehouse_module_ledger_store::LedgerStore;

    fn baking(store: &dyn LedgerStore, level: Level) -> Vec<BakingRight> {
        store
            .rights(level)
            .unwrap()
            .into_iter()
            .filter(|r| r.kind == RightKind::Baking)
            .collect()
    }

    #[test]
    fn late_round_outside_the_draw_extends_the_level() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 1);
        let bakers: Vec<AccountId> = store.bakers().unwrap().iter().map(|b| b.id).collect();

        // A baker left out of rounds 0..4 but holding one of the later slots,
        // so some round past the generated range falls to it
        let (level, outsider) = (2..=16)
            .find_map(|level| {
                let rights = store.rights(level).unwrap();
                bakers
                    .iter()
                    .copied()
                    .find(|id| {
                        rights.iter().any(|r| r.kind == RightKind::Endorsing && r.baker_id == *id)
                            && !rights.iter().any(|r| r.kind == RightKind::Baking && r.baker_id == *id)
                    })
                    .map(|id| (level, id))
            })
            .unwrap();
        let generated = baking(store.as_ref(), level);
        assert!(generated
            .iter()
            .all(|r| r.round.is_some_and(|round| round < 4)));

        extend(&mut pipeline, &chain, level - 1);
        let before = store.snapshot().unwrap();
        let mut node = chain.next(store.as_ref(), level, block_hash(level - 1, "main"));
        node.metadata.baker = store.account(outsider).unwrap().unwrap().address;
        node.header.payload_round = Some(40);
        pipeline.apply_block(&node).unwrap();

        let settled = baking(store.as_ref(), level);
        let realized: Vec<&BakingRight> = settled
            .iter()
            .filter(|r| r.status == RightStatus::Realized)
            .collect();
        assert_eq!(realized.len(), 1);
        assert_eq!(realized[0].baker_id, outsider);
        assert!(realized[0].round.is_some_and(|round| (4..=40).contains(&round)));
        assert_eq!(settled.len(), generated.len() + 1);
        assert!(settled
            .iter()
            .filter(|r| r.baker_id != outsider)
            .all(|r| r.status == RightStatus::Missed));

        let cycle = test_params(ProtocolVersion::Tenderbake).cycle_of(level);
        let row = store.baker_cycle(cycle, outsider).unwrap().unwrap();
        assert_eq!(row.extra_blocks, 1);
        assert_eq!(row.blocks, 0);

        // Revert redraws the level as generated, extension gone
        pipeline.revert_head(&block_hash(level, "main")).unwrap();
        assert_reverted(&store, before, level);
        assert_eq!(baking(store.as_ref(), level), generated);
    }

    #[test]
    fn producer_before_its_round_is_a_mismatch() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 1);

        let level = (2..=16)
            .find(|level| {
                baking(store.as_ref(), *level)
                    .iter()
                    .any(|r| r.round.is_some_and(|round| round > 0))
            })
            .unwrap();
        extend(&mut pipeline, &chain, level - 1);
        let late = baking(store.as_ref(), level)
            .into_iter()
            .find(|r| r.round.is_some_and(|round| round > 0))
            .unwrap();

        let mut node = chain.next(store.as_ref(), level, block_hash(level - 1, "main"));
        node.metadata.baker = store.account(late.baker_id).unwrap().unwrap().address;
        node.header.payload_round = Some(0);
        let e = pipeline.apply_block(&node).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<ReplayError>(),
            Some(ReplayError::DeterminismMismatch { .. })
        ));
        assert_eq!(pipeline.head().level, level - 1);
    }
}
