//! Baking and endorsing rights of a future cycle

use std::collections::{BTreeMap, BTreeSet};

use bakehouse_common::{
    protocol_params::ProtocolConstants, AccountId, BakingRight, Cycle, CycleIndex, Level,
    ReplayError, RightKind, RightStatus,
};
use rayon::prelude::*;

use crate::sampler::{Sampler, TAG_BAKING, TAG_ENDORSING};

/// How the baker of a round is picked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BakingMode {
    /// Independent draw per priority (roll era)
    Priorities,

    /// Round `r` goes to the owner of committee slot `r mod committee`
    Rounds,
}

/// Output of one cycle's generation, baking rows ordered by (level, round)
/// and endorsing rows by (level, baker)
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GeneratedRights {
    pub cycle: CycleIndex,
    pub baking: Vec<BakingRight>,
    pub endorsing: Vec<BakingRight>,
}

impl GeneratedRights {
    pub fn len(&self) -> usize {
        self.baking.len() + self.endorsing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rows(&self) -> impl Iterator<Item = &BakingRight> {
        self.baking.iter().chain(self.endorsing.iter())
    }

    pub fn endorsing_at(&self, level: Level) -> impl Iterator<Item = &BakingRight> {
        self.endorsing.iter().filter(move |r| r.level == level)
    }
}

pub struct RightsGenerator<'a> {
    constants: &'a ProtocolConstants,
    mode: BakingMode,
}

impl<'a> RightsGenerator<'a> {
    pub fn new(constants: &'a ProtocolConstants, mode: BakingMode) -> Self {
        Self { constants, mode }
    }

    /// Rights for every level of `cycle` from `from_level` on
    pub fn generate(
        &self,
        cycle: &Cycle,
        sampler: &Sampler,
        from_level: Level,
    ) -> Result<GeneratedRights, ReplayError> {
        let first = cycle.first_level.max(from_level);
        let levels: Vec<Level> = (first..=cycle.last_level).collect();
        let per_level = levels
            .into_par_iter()
            .map(|level| self.level_rights(cycle, sampler, level))
            .collect::<Result<Vec<_>, ReplayError>>()?;

        let mut rights = GeneratedRights {
            cycle: cycle.index,
            ..Default::default()
        };
        for (baking, endorsing) in per_level {
            rights.baking.extend(baking);
            rights.endorsing.extend(endorsing);
        }
        Ok(rights)
    }

    /// Baking rights of rounds `0..baking_rounds` and the endorsing committee of one level
    pub fn level_rights(
        &self,
        cycle: &Cycle,
        sampler: &Sampler,
        level: Level,
    ) -> Result<(Vec<BakingRight>, Vec<BakingRight>), ReplayError> {
        let owners = self.slot_owners(cycle, sampler, level)?;

        let mut slots: BTreeMap<AccountId, i32> = BTreeMap::new();
        for owner in &owners {
            *slots.entry(*owner).or_default() += 1;
        }
        let endorsing = slots
            .into_iter()
            .map(|(baker_id, count)| BakingRight {
                cycle: cycle.index,
                level,
                baker_id,
                kind: RightKind::Endorsing,
                round: None,
                slots: Some(count),
                status: RightStatus::Future,
            })
            .collect();

        let mut seen = BTreeSet::new();
        let baking = self.baking_rounds(
            cycle,
            sampler,
            level,
            &owners,
            0..self.constants.baking_rounds,
            &mut seen,
        )?;
        Ok((baking, endorsing))
    }

    /// Baking rights for rounds past the generated range, up to and
    /// including `up_to_round`, for bakers that hold no right yet
    pub fn extend_level(
        &self,
        cycle: &Cycle,
        sampler: &Sampler,
        level: Level,
        existing: &[BakingRight],
        up_to_round: i32,
    ) -> Result<Vec<BakingRight>, ReplayError> {
        let owners = match self.mode {
            BakingMode::Rounds => self.slot_owners(cycle, sampler, level)?,
            BakingMode::Priorities => Vec::new(),
        };
        let mut seen: BTreeSet<AccountId> = existing
            .iter()
            .filter(|r| r.kind == RightKind::Baking)
            .map(|r| r.baker_id)
            .collect();
        self.baking_rounds(
            cycle,
            sampler,
            level,
            &owners,
            self.constants.baking_rounds..up_to_round + 1,
            &mut seen,
        )
    }

    fn slot_owners(
        &self,
        cycle: &Cycle,
        sampler: &Sampler,
        level: Level,
    ) -> Result<Vec<AccountId>, ReplayError> {
        (0..self.constants.endorsers_per_block)
            .map(|slot| sampler.draw(&cycle.seed, level, slot, TAG_ENDORSING))
            .collect()
    }

    fn baking_rounds(
        &self,
        cycle: &Cycle,
        sampler: &Sampler,
        level: Level,
        slot_owners: &[AccountId],
        rounds: std::ops::Range<i32>,
        seen: &mut BTreeSet<AccountId>,
    ) -> Result<Vec<BakingRight>, ReplayError> {
        let mut rights = Vec::new();
        for round in rounds {
            let baker_id = match self.mode {
                BakingMode::Priorities => sampler.draw(&cycle.seed, level, round, TAG_BAKING)?,
                BakingMode::Rounds => {
                    let slot = round.rem_euclid(slot_owners.len().max(1) as i32) as usize;
                    *slot_owners.get(slot).ok_or_else(|| {
                        ReplayError::mismatch(level, format!("round {round} has no slot owner"))
                    })?
                }
            };
            if seen.insert(baker_id) {
                rights.push(BakingRight {
                    cycle: cycle.index,
                    level,
                    baker_id,
                    kind: RightKind::Baking,
                    round: Some(round),
                    slots: None,
                    status: RightStatus::Future,
                });
            }
        }
        Ok(rights)
    }
}
