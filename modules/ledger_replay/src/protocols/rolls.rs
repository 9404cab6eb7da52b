//! Roll era: the base every later family overrides

use anyhow::Result;

use bakehouse_common::{
    operations::FreezerCategory,
    protocol_params::{ProtocolConstants, ProtocolParams},
    Account, AccountId, Level, Mutez, RewardSplit, SnapshotBalance,
};

use super::Formulas;
use crate::{
    rights_generator::BakingMode,
    sampler::{Sampler, SamplerError},
};

pub fn formulas() -> Formulas {
    Formulas {
        baking_mode: BakingMode::Priorities,
        sampler: roll_sampler,
        baking_power: staking_balance,
        block_reward,
        block_bonus: no_bonus,
        endorsement_reward,
        endorsement_rewards_per_level: true,
        freezes_rewards: true,
        block_deposit,
        endorsement_deposit,
        deposit_bucket: FreezerCategory::Deposits,
        reward_split: liquid_split,
        gas_used: gas_floor,
        deactivation_level,
    }
}

fn roll_sampler(
    distribution: &[(AccountId, Mutez)],
    constants: &ProtocolConstants,
) -> Result<Sampler, SamplerError> {
    Sampler::rolls(distribution, constants.tokens_per_roll)
}

fn staking_balance(snapshot: &SnapshotBalance) -> Mutez {
    snapshot.delegated() + snapshot.staked()
}

/// Reward shrinks with the priority the block was baked at
fn block_reward(constants: &ProtocolConstants, round: i32) -> Mutez {
    constants.block_reward / (1 + round.max(0) as Mutez)
}

fn no_bonus(_: &ProtocolConstants, _: i32) -> Mutez {
    0
}

fn endorsement_reward(constants: &ProtocolConstants, slots: i32) -> Mutez {
    constants.endorsement_reward_per_slot * slots as Mutez
}

fn block_deposit(constants: &ProtocolConstants) -> Mutez {
    constants.block_deposit
}

fn endorsement_deposit(constants: &ProtocolConstants, slots: i32) -> Mutez {
    constants.endorsement_deposit_per_slot * slots as Mutez
}

fn liquid_split(_: &Account, amount: Mutez, _: &ProtocolConstants) -> Result<RewardSplit> {
    Ok(RewardSplit::liquid(amount))
}

fn gas_floor(milligas: i64) -> i64 {
    milligas / 1000
}

/// Bakers stay active for `preserved_cycles` full cycles after acting
fn deactivation_level(params: &ProtocolParams, level: Level) -> Level {
    let cycle = params.cycle_of(level);
    params.first_level_of(cycle + params.constants.preserved_cycles + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_params;
    use bakehouse_common::protocol_params::ProtocolVersion;

    #[test]
    fn rewards_drop_with_priority() {
        let params = test_params(ProtocolVersion::Rolls);
        let f = formulas();
        assert_eq!((f.block_reward)(&params.constants, 0), params.constants.block_reward);
        assert_eq!((f.block_reward)(&params.constants, 1), params.constants.block_reward / 2);
        assert_eq!((f.block_bonus)(&params.constants, 8), 0);
    }

    #[test]
    fn grace_period_ends_after_preserved_cycles() {
        let params = test_params(ProtocolVersion::Rolls);
        // cycle 1 spans 9..=16, preserved_cycles = 2
        assert_eq!((formulas().deactivation_level)(&params, 10), params.first_level_of(4));
    }
}
