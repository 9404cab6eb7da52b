//! Tenderbake: rounds, alias sampling, endorsing rewards settled at cycle end

use bakehouse_common::{protocol_params::ProtocolConstants, AccountId, Mutez};

use super::PartialFormulas;
use crate::{
    rights_generator::BakingMode,
    sampler::{Sampler, SamplerError},
};

pub fn overrides() -> PartialFormulas {
    PartialFormulas {
        baking_mode: Some(BakingMode::Rounds),
        sampler: Some(alias_sampler),
        block_reward: Some(fixed_reward),
        block_bonus: Some(bonus),
        endorsement_rewards_per_level: Some(false),
        freezes_rewards: Some(false),
        block_deposit: Some(no_deposit),
        endorsement_deposit: Some(no_slot_deposit),
        gas_used: Some(gas_ceil),
        ..Default::default()
    }
}

fn alias_sampler(
    distribution: &[(AccountId, Mutez)],
    _: &ProtocolConstants,
) -> Result<Sampler, SamplerError> {
    Sampler::alias(distribution)
}

fn fixed_reward(constants: &ProtocolConstants, _round: i32) -> Mutez {
    constants.block_reward
}

/// Paid per endorsement slot included above the consensus threshold
fn bonus(constants: &ProtocolConstants, validations: i32) -> Mutez {
    let extra = validations - constants.consensus_threshold;
    if extra > 0 {
        constants.block_bonus_per_slot * extra as Mutez
    } else {
        0
    }
}

fn no_deposit(_: &ProtocolConstants) -> Mutez {
    0
}

fn no_slot_deposit(_: &ProtocolConstants, _: i32) -> Mutez {
    0
}

/// Milligas rounded up to whole gas units
fn gas_ceil(milligas: i64) -> i64 {
    (milligas + 999) / 1000
}
