//! Cycles and their seeds

use blake2::{digest::consts::U32, Blake2b, Digest};
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use std::fmt;

use crate::{CycleIndex, Level, Mutez};

type Blake2b256 = Blake2b<U32>;

/// 32-byte random seed of a cycle
#[serde_as]
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Seed(#[serde_as(as = "Hex")] pub [u8; 32]);

impl Seed {
    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(s)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| anyhow::anyhow!("Seed must be 32 bytes, got {}", v.len()))?;
        Ok(Self(array))
    }

    /// Seed of the next cycle: hash of this seed followed by the revealed nonces
    pub fn derive<'a>(&self, nonces: impl IntoIterator<Item = &'a [u8]>) -> Seed {
        let mut hasher = Blake2b256::new();
        hasher.update(self.0);
        for nonce in nonces {
            hasher.update(nonce);
        }
        Seed(hasher.finalize().into())
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seed({})", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    pub index: CycleIndex,
    pub first_level: Level,
    pub last_level: Level,

    /// Snapshot chosen for this cycle's stake, absent for bootstrap cycles
    pub snapshot_index: Option<i32>,
    pub snapshot_level: Option<Level>,

    pub total_staking: Mutez,
    pub total_bakers: i32,
    pub selected_stake: Mutez,
    pub selected_bakers: i32,

    pub seed: Seed,
}

impl Cycle {
    pub fn contains(&self, level: Level) -> bool {
        level >= self.first_level && level <= self.last_level
    }
}
