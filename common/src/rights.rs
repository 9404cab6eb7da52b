//! Baking and endorsing rights

use serde::{Deserialize, Serialize};

use crate::{AccountId, CycleIndex, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RightKind {
    Baking,
    Endorsing,
}

impl RightKind {
    pub fn code(self) -> i16 {
        match self {
            RightKind::Baking => 0,
            RightKind::Endorsing => 1,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(RightKind::Baking),
            1 => Some(RightKind::Endorsing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RightStatus {
    Future,
    Realized,
    Missed,
    Uncovered,
}

impl RightStatus {
    pub fn code(self) -> i16 {
        match self {
            RightStatus::Future => 0,
            RightStatus::Realized => 1,
            RightStatus::Missed => 2,
            RightStatus::Uncovered => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(RightStatus::Future),
            1 => Some(RightStatus::Realized),
            2 => Some(RightStatus::Missed),
            3 => Some(RightStatus::Uncovered),
            _ => None,
        }
    }
}

/// Row identity of a right
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RightKey {
    pub level: Level,
    pub kind: RightKind,
    pub baker_id: AccountId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BakingRight {
    pub cycle: CycleIndex,
    pub level: Level,
    pub baker_id: AccountId,
    pub kind: RightKind,

    /// First round the baker may bake at (baking rights only)
    pub round: Option<i32>,

    /// Committee slots held (endorsing rights only)
    pub slots: Option<i32>,

    pub status: RightStatus,
}

impl BakingRight {
    pub fn key(&self) -> RightKey {
        RightKey {
            level: self.level,
            kind: self.kind,
            baker_id: self.baker_id,
        }
    }
}
