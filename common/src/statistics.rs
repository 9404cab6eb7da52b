//! Running supply statistics, one row per level

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{CycleIndex, Level, Mutez};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub level: Level,

    /// Set on the last level of a cycle
    pub cycle: Option<CycleIndex>,

    /// Set on the first level of each UTC day
    pub date: Option<NaiveDate>,

    pub total_created: Mutez,
    pub total_burned: Mutez,
    pub total_banished: Mutez,
    pub total_frozen: Mutez,
    pub total_activated: Mutez,
    pub total_rollup_bonds: Mutez,
}

impl Statistics {
    /// Supply the ledger should hold
    pub fn circulating(&self) -> Mutez {
        self.total_created - self.total_burned - self.total_banished
    }

    /// Row for `level` given this (previous) row and the block's deltas
    pub fn next(&self, level: Level, delta: &StatisticsDelta) -> Statistics {
        Statistics {
            level,
            cycle: None,
            date: None,
            total_created: self.total_created + delta.created,
            total_burned: self.total_burned + delta.burned,
            total_banished: self.total_banished + delta.banished,
            total_frozen: self.total_frozen + delta.frozen,
            total_activated: self.total_activated + delta.activated,
            total_rollup_bonds: self.total_rollup_bonds + delta.rollup_bonds,
        }
    }
}

/// Externally visible supply changes produced by one block
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsDelta {
    pub created: Mutez,
    pub burned: Mutez,
    pub banished: Mutez,
    pub frozen: Mutez,
    pub activated: Mutez,
    pub rollup_bonds: Mutez,
}
