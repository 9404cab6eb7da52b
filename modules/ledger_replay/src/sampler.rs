//! Deterministic stake-weighted sampling
//!
//! Every draw is seeded from `blake2b-256(seed ‖ tag ‖ level ‖ index)` and
//! reduced to a bounded integer by rejection sampling, rehashing the state
//! for each attempt.  Two samplers exist: the roll-based one used by the
//! roll era and the alias table used from Tenderbake on.

use bakehouse_common::{AccountId, Level, Mutez, ReplayError, Seed};
use blake2::{digest::consts::U32, Blake2b, Digest};
use thiserror::Error;

type Blake2b256 = Blake2b<U32>;

pub const TAG_BAKING: &[u8] = b"level baking";
pub const TAG_ENDORSING: &[u8] = b"level endorsing";
pub const TAG_SNAPSHOT: &[u8] = b"stake snapshot";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SamplerError {
    #[error("Stake distribution is empty")]
    EmptyDistribution,

    #[error("Baker {0} has a non-positive weight")]
    NonPositiveWeight(AccountId),

    #[error("Total stake does not fit the sampler")]
    Overflow,
}

struct DrawState([u8; 32]);

impl DrawState {
    fn new(seed: &Seed, tag: &[u8], level: Level, index: i32) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(seed.0);
        hasher.update(tag);
        hasher.update(level.to_be_bytes());
        hasher.update(index.to_be_bytes());
        Self(hasher.finalize().into())
    }

    fn rehash(&mut self) {
        self.0 = Blake2b256::digest(self.0).into();
    }

    /// Uniform integer in `0..bound`; `bound` must be positive
    fn next_int(&mut self, bound: i64) -> i64 {
        let limit = i64::MAX - i64::MAX % bound;
        loop {
            let mut head = [0u8; 8];
            head.copy_from_slice(&self.0[..8]);
            let value = i64::from_be_bytes(head) & i64::MAX;
            self.rehash();
            if value < limit {
                return value % bound;
            }
        }
    }
}

/// Draw a uniform integer in `0..bound` outside of any stake distribution
pub fn random_int(seed: &Seed, tag: &[u8], level: Level, index: i32, bound: i64) -> i64 {
    if bound <= 1 {
        return 0;
    }
    DrawState::new(seed, tag, level, index).next_int(bound)
}

#[derive(Debug, Clone)]
pub enum Sampler {
    /// Cumulative roll counts, searched by a uniform roll index
    Rolls {
        bakers: Vec<AccountId>,
        cumulative: Vec<i64>,
        total: i64,
    },

    /// Integer Vose alias table over stake weights
    Alias {
        bakers: Vec<AccountId>,
        threshold: Vec<i128>,
        alias: Vec<usize>,
        total: i64,
    },
}

fn sorted(distribution: &[(AccountId, Mutez)]) -> Vec<(AccountId, Mutez)> {
    let mut entries = distribution.to_vec();
    entries.sort_by_key(|(id, _)| *id);
    entries
}

impl Sampler {
    /// Sampler over whole rolls; stake below one roll is ignored
    pub fn rolls(
        distribution: &[(AccountId, Mutez)],
        tokens_per_roll: Mutez,
    ) -> Result<Self, SamplerError> {
        if tokens_per_roll <= 0 {
            return Err(SamplerError::Overflow);
        }
        let mut bakers = Vec::new();
        let mut cumulative = Vec::new();
        let mut total: i64 = 0;
        for (id, stake) in sorted(distribution) {
            let rolls = stake / tokens_per_roll;
            if rolls <= 0 {
                continue;
            }
            total = total.checked_add(rolls).ok_or(SamplerError::Overflow)?;
            bakers.push(id);
            cumulative.push(total);
        }
        if bakers.is_empty() {
            return Err(SamplerError::EmptyDistribution);
        }
        Ok(Sampler::Rolls {
            bakers,
            cumulative,
            total,
        })
    }

    pub fn alias(distribution: &[(AccountId, Mutez)]) -> Result<Self, SamplerError> {
        let entries = sorted(distribution);
        if entries.is_empty() {
            return Err(SamplerError::EmptyDistribution);
        }
        if let Some((id, _)) = entries.iter().find(|(_, w)| *w <= 0) {
            return Err(SamplerError::NonPositiveWeight(*id));
        }
        let total = entries
            .iter()
            .try_fold(0i64, |acc, (_, w)| acc.checked_add(*w))
            .ok_or(SamplerError::Overflow)?;

        let n = entries.len();
        let total_wide = total as i128;
        let mut scaled: Vec<i128> = entries.iter().map(|(_, w)| *w as i128 * n as i128).collect();
        let mut threshold = vec![total_wide; n];
        let mut alias: Vec<usize> = (0..n).collect();

        let mut small: Vec<usize> = Vec::new();
        let mut large: Vec<usize> = Vec::new();
        for (i, p) in scaled.iter().enumerate() {
            if *p < total_wide {
                small.push(i);
            } else {
                large.push(i);
            }
        }
        while let (Some(s), Some(l)) = (small.pop(), large.pop()) {
            threshold[s] = scaled[s];
            alias[s] = l;
            scaled[l] = scaled[l] + scaled[s] - total_wide;
            if scaled[l] < total_wide {
                small.push(l);
            } else {
                large.push(l);
            }
        }

        Ok(Sampler::Alias {
            bakers: entries.into_iter().map(|(id, _)| id).collect(),
            threshold,
            alias,
            total,
        })
    }

    pub fn bakers(&self) -> &[AccountId] {
        match self {
            Sampler::Rolls { bakers, .. } | Sampler::Alias { bakers, .. } => bakers,
        }
    }

    /// Owner of draw `index` at `level`
    pub fn draw(
        &self,
        seed: &Seed,
        level: Level,
        index: i32,
        tag: &[u8],
    ) -> Result<AccountId, ReplayError> {
        let mut state = DrawState::new(seed, tag, level, index);
        let picked = match self {
            Sampler::Rolls {
                bakers,
                cumulative,
                total,
            } => {
                let roll = state.next_int(*total);
                let position = cumulative.partition_point(|c| *c <= roll);
                bakers.get(position)
            }
            Sampler::Alias {
                bakers,
                threshold,
                alias,
                total,
            } => {
                let i = state.next_int(bakers.len() as i64) as usize;
                let coin = state.next_int(*total) as i128;
                match threshold.get(i) {
                    Some(t) if coin < *t => bakers.get(i),
                    Some(_) => alias.get(i).and_then(|a| bakers.get(*a)),
                    None => None,
                }
            }
        };
        picked.copied().ok_or_else(|| {
            ReplayError::mismatch(level, format!("draw {index} matches no stakeholder"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> Seed {
        Seed([42; 32])
    }

    #[test]
    fn draws_are_reproducible() {
        let distribution = [(AccountId(3), 500), (AccountId(1), 1_500), (AccountId(2), 1_000)];
        let a = Sampler::alias(&distribution).unwrap();
        let b = Sampler::alias(&distribution.iter().rev().cloned().collect::<Vec<_>>()).unwrap();
        for index in 0..64 {
            assert_eq!(
                a.draw(&seed(), 100, index, TAG_ENDORSING).unwrap(),
                b.draw(&seed(), 100, index, TAG_ENDORSING).unwrap()
            );
        }
    }

    #[test]
    fn draws_depend_on_seed_and_tag() {
        let distribution: Vec<_> = (1..=16).map(|i| (AccountId(i), 1_000)).collect();
        let sampler = Sampler::alias(&distribution).unwrap();
        let draws = |seed: &Seed, tag: &[u8]| -> Vec<AccountId> {
            (0..32).map(|i| sampler.draw(seed, 7, i, tag).unwrap()).collect()
        };
        assert_ne!(draws(&seed(), TAG_ENDORSING), draws(&Seed([43; 32]), TAG_ENDORSING));
        assert_ne!(draws(&seed(), TAG_ENDORSING), draws(&seed(), TAG_BAKING));
    }

    #[test]
    fn alias_draws_follow_weights() {
        let sampler = Sampler::alias(&[(AccountId(1), 3_000), (AccountId(2), 1_000)]).unwrap();
        let heavy = (0..4_000)
            .filter(|i| sampler.draw(&seed(), 1, *i, TAG_ENDORSING).unwrap() == AccountId(1))
            .count();
        assert!((2_700..=3_300).contains(&heavy), "got {heavy}");
    }

    #[test]
    fn rolls_ignore_stake_below_one_roll() {
        let sampler =
            Sampler::rolls(&[(AccountId(1), 999), (AccountId(2), 5_500)], 1_000).unwrap();
        assert_eq!(sampler.bakers(), &[AccountId(2)]);
        for index in 0..16 {
            assert_eq!(sampler.draw(&seed(), 3, index, TAG_BAKING).unwrap(), AccountId(2));
        }
    }

    #[test]
    fn empty_distributions_are_rejected() {
        assert_eq!(
            Sampler::alias(&[]).unwrap_err(),
            SamplerError::EmptyDistribution
        );
        assert_eq!(
            Sampler::rolls(&[(AccountId(1), 10)], 1_000).unwrap_err(),
            SamplerError::EmptyDistribution
        );
        assert_eq!(
            Sampler::alias(&[(AccountId(4), 0)]).unwrap_err(),
            SamplerError::NonPositiveWeight(AccountId(4))
        );
    }

    #[test]
    fn random_int_stays_in_bounds() {
        for index in 0..100 {
            let v = random_int(&seed(), TAG_SNAPSHOT, 5, index, 16);
            assert!((0..16).contains(&v));
        }
        assert_eq!(random_int(&seed(), TAG_SNAPSHOT, 5, 0, 1), 0);
    }
}
