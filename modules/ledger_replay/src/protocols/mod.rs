//! Protocol dispatch
//!
//! Each consensus family is a [`Strategy`]: a [`Formulas`] record plus the
//! ordered commit units run for its blocks.  Later families are built from
//! earlier ones by overriding individual formulas through
//! [`PartialFormulas`], never by inheriting whole units.

mod rolls;
mod staking;
mod tenderbake;

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use tracing::info;

use bakehouse_common::{
    operations::FreezerCategory,
    protocol_params::{ProtocolConstants, ProtocolParams, ProtocolVersion},
    Account, AccountId, Level, Mutez, ProtocolHash, ReplayError, RewardSplit, SnapshotBalance,
};

use crate::{
    commits::{
        BakerCycleCommit, BakingRightsCommit, BlockCommit, CommitUnit, CycleCommit,
        DeactivationCommit, EndorsingRewardCommit, FreezerCommit, FutureRightsCommit,
        MigrationCommit, OperationsCommit, SnapshotBalanceCommit, StatisticsCommit,
    },
    rights_generator::BakingMode,
    sampler::{Sampler, SamplerError},
};

type SamplerFn = fn(&[(AccountId, Mutez)], &ProtocolConstants) -> Result<Sampler, SamplerError>;
type PowerFn = fn(&SnapshotBalance) -> Mutez;
type RoundRewardFn = fn(&ProtocolConstants, i32) -> Mutez;
type SlotsRewardFn = fn(&ProtocolConstants, i32) -> Mutez;
type SplitFn = fn(&Account, Mutez, &ProtocolConstants) -> Result<RewardSplit>;
type GasFn = fn(i64) -> i64;
type GraceFn = fn(&ProtocolParams, Level) -> Level;

/// Every accounting rule that differs between protocol families
#[derive(Clone, Copy)]
pub struct Formulas {
    pub baking_mode: BakingMode,
    pub sampler: SamplerFn,

    /// Weight of a baker in the sampler, from its snapshot
    pub baking_power: PowerFn,

    /// Reward of the payload producer baking at `round`
    pub block_reward: RoundRewardFn,

    /// Bonus of the proposer for `validations` included endorsement slots
    pub block_bonus: SlotsRewardFn,

    /// Reward expected for endorsing with `slots` slots
    pub endorsement_reward: SlotsRewardFn,

    /// Endorsement rewards are paid with each endorsement rather than at cycle end
    pub endorsement_rewards_per_level: bool,

    /// Rewards and fees are frozen and released `preserved_cycles` later
    pub freezes_rewards: bool,

    pub block_deposit: fn(&ProtocolConstants) -> Mutez,
    pub endorsement_deposit: SlotsRewardFn,

    /// Bucket node-reported deposit movements land in
    pub deposit_bucket: FreezerCategory,

    pub reward_split: SplitFn,
    pub gas_used: GasFn,

    /// Level at which a baker acting at `level` would be deactivated
    pub deactivation_level: GraceFn,
}

/// Overrides applied on top of a base [`Formulas`]
#[derive(Default, Clone, Copy)]
pub struct PartialFormulas {
    pub baking_mode: Option<BakingMode>,
    pub sampler: Option<SamplerFn>,
    pub baking_power: Option<PowerFn>,
    pub block_reward: Option<RoundRewardFn>,
    pub block_bonus: Option<SlotsRewardFn>,
    pub endorsement_reward: Option<SlotsRewardFn>,
    pub endorsement_rewards_per_level: Option<bool>,
    pub freezes_rewards: Option<bool>,
    pub block_deposit: Option<fn(&ProtocolConstants) -> Mutez>,
    pub endorsement_deposit: Option<SlotsRewardFn>,
    pub deposit_bucket: Option<FreezerCategory>,
    pub reward_split: Option<SplitFn>,
    pub gas_used: Option<GasFn>,
    pub deactivation_level: Option<GraceFn>,
}

impl PartialFormulas {
    pub fn over(self, base: Formulas) -> Formulas {
        Formulas {
            baking_mode: self.baking_mode.unwrap_or(base.baking_mode),
            sampler: self.sampler.unwrap_or(base.sampler),
            baking_power: self.baking_power.unwrap_or(base.baking_power),
            block_reward: self.block_reward.unwrap_or(base.block_reward),
            block_bonus: self.block_bonus.unwrap_or(base.block_bonus),
            endorsement_reward: self.endorsement_reward.unwrap_or(base.endorsement_reward),
            endorsement_rewards_per_level: self
                .endorsement_rewards_per_level
                .unwrap_or(base.endorsement_rewards_per_level),
            freezes_rewards: self.freezes_rewards.unwrap_or(base.freezes_rewards),
            block_deposit: self.block_deposit.unwrap_or(base.block_deposit),
            endorsement_deposit: self.endorsement_deposit.unwrap_or(base.endorsement_deposit),
            deposit_bucket: self.deposit_bucket.unwrap_or(base.deposit_bucket),
            reward_split: self.reward_split.unwrap_or(base.reward_split),
            gas_used: self.gas_used.unwrap_or(base.gas_used),
            deactivation_level: self.deactivation_level.unwrap_or(base.deactivation_level),
        }
    }
}

/// Formulas and commit units of one protocol family
pub struct Strategy {
    pub version: ProtocolVersion,
    pub formulas: Formulas,

    /// Units in apply order; revert runs them backwards
    pub units: Vec<Box<dyn CommitUnit>>,
}

impl Strategy {
    pub fn for_version(version: ProtocolVersion) -> Self {
        let rolls = rolls::formulas();
        let tenderbake = tenderbake::overrides().over(rolls);
        let formulas = match version {
            ProtocolVersion::Rolls => rolls,
            ProtocolVersion::Tenderbake => tenderbake,
            ProtocolVersion::Staking => staking::overrides().over(tenderbake),
        };

        let mut units: Vec<Box<dyn CommitUnit>> = vec![
            Box::new(MigrationCommit),
            Box::new(BlockCommit),
            Box::new(OperationsCommit),
            Box::new(BakingRightsCommit),
            Box::new(CycleCommit),
            Box::new(FutureRightsCommit),
            Box::new(BakerCycleCommit),
        ];
        if !formulas.endorsement_rewards_per_level {
            units.push(Box::new(EndorsingRewardCommit));
        }
        units.push(Box::new(FreezerCommit));
        units.push(Box::new(DeactivationCommit));
        units.push(Box::new(SnapshotBalanceCommit));
        units.push(Box::new(StatisticsCommit));

        Self {
            version,
            formulas,
            units,
        }
    }
}

/// A configured protocol together with its family's strategy
pub struct ProtocolHandler {
    pub params: ProtocolParams,
    pub strategy: Arc<Strategy>,
}

impl ProtocolHandler {
    pub fn version(&self) -> ProtocolVersion {
        self.strategy.version
    }

    pub fn constants(&self) -> &ProtocolConstants {
        &self.params.constants
    }

    pub fn formulas(&self) -> &Formulas {
        &self.strategy.formulas
    }
}

/// Protocol table, looked up by hash when applying and by code when reverting
pub struct ProtocolRegistry {
    by_hash: HashMap<ProtocolHash, Arc<ProtocolHandler>>,
    by_code: HashMap<i32, Arc<ProtocolHandler>>,
}

impl ProtocolRegistry {
    pub fn new(protocols: &[ProtocolParams]) -> Self {
        let mut strategies: HashMap<ProtocolVersion, Arc<Strategy>> = HashMap::new();
        let mut by_hash = HashMap::new();
        let mut by_code = HashMap::new();
        for params in protocols {
            let strategy = strategies
                .entry(params.version)
                .or_insert_with(|| Arc::new(Strategy::for_version(params.version)))
                .clone();
            let handler = Arc::new(ProtocolHandler {
                params: params.clone(),
                strategy,
            });
            info!(
                hash = %params.hash,
                code = params.code,
                version = ?params.version,
                "Registered protocol"
            );
            by_hash.insert(params.hash.clone(), handler.clone());
            by_code.insert(params.code, handler);
        }
        Self { by_hash, by_code }
    }

    pub fn resolve(&self, hash: &ProtocolHash) -> Result<Arc<ProtocolHandler>, ReplayError> {
        self.by_hash
            .get(hash)
            .cloned()
            .ok_or_else(|| ReplayError::UnknownProtocol(hash.clone()))
    }

    pub fn by_code(&self, code: i32) -> Result<Arc<ProtocolHandler>, ReplayError> {
        self.by_code
            .get(&code)
            .cloned()
            .ok_or_else(|| ReplayError::UnknownProtocol(ProtocolHash::new(format!("#{code}"))))
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_params;

    #[test]
    fn later_families_override_only_what_they_change() {
        let rolls = Strategy::for_version(ProtocolVersion::Rolls);
        let tenderbake = Strategy::for_version(ProtocolVersion::Tenderbake);
        let staking = Strategy::for_version(ProtocolVersion::Staking);

        assert_eq!(rolls.formulas.baking_mode, BakingMode::Priorities);
        assert_eq!(tenderbake.formulas.baking_mode, BakingMode::Rounds);
        assert_eq!(staking.formulas.baking_mode, BakingMode::Rounds);

        // Gas rounding changed with Tenderbake and stayed since
        assert_eq!((rolls.formulas.gas_used)(1_500), 1);
        assert_eq!((tenderbake.formulas.gas_used)(1_500), 2);
        assert_eq!((staking.formulas.gas_used)(1_001), 2);

        assert_eq!(rolls.formulas.deposit_bucket, FreezerCategory::Deposits);
        assert_eq!(staking.formulas.deposit_bucket, FreezerCategory::Staked);

        // Roll era pays endorsements per level and has no cycle-end reward unit
        assert_eq!(rolls.units.len() + 1, tenderbake.units.len());
        assert_eq!(tenderbake.units.len(), staking.units.len());
    }

    #[test]
    fn registry_resolves_by_hash_and_code() {
        let params = test_params(ProtocolVersion::Tenderbake);
        let registry = ProtocolRegistry::new(std::slice::from_ref(&params));
        assert_eq!(registry.resolve(&params.hash).unwrap().params.code, params.code);
        assert_eq!(
            registry.by_code(params.code).unwrap().version(),
            ProtocolVersion::Tenderbake
        );
        assert_eq!(
            registry.resolve(&ProtocolHash::from("PtNope")).err(),
            Some(ReplayError::UnknownProtocol(ProtocolHash::from("PtNope")))
        );
    }
}
