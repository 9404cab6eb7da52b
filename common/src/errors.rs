//! Replay error taxonomy

use thiserror::Error;

use crate::{BlockHash, Level, ProtocolHash};

/// Conditions that stop ingestion of a block.
///
/// Every variant is fatal for the block being processed. The driver never
/// advances the head past a block that produced one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    /// Sampler, rights or reward state diverged from what the chain realised
    #[error("Determinism mismatch at level {level}: {reason}")]
    DeterminismMismatch { level: Level, reason: String },

    /// Arithmetic or lookup invariant broken inside a commit unit
    #[error("Invariant violated at level {level}: {reason}")]
    InvariantViolation { level: Level, reason: String },

    /// A field the protocol mandates is missing from the node document
    #[error("Malformed block {level}: {reason}")]
    MalformedBlock { level: Level, reason: String },

    /// Revert requested for a block other than the current head
    #[error("Block {hash} at level {level} is not the current head {head_hash} ({head_level})")]
    NotHead {
        level: Level,
        hash: BlockHash,
        head_level: Level,
        head_hash: BlockHash,
    },

    /// Block does not extend the current head
    #[error("Block {level} does not extend head {head_level}")]
    NotNext { level: Level, head_level: Level },

    /// Protocol hash missing from the configured protocol table
    #[error("Unknown protocol {0}")]
    UnknownProtocol(ProtocolHash),

    /// Revert would cross data that has already been garbage collected
    #[error("Cannot revert level {level}: deeper than {depth} blocks below {highest}")]
    ReorgTooDeep {
        level: Level,
        highest: Level,
        depth: i32,
    },

    /// Ingestion already stopped after an earlier failure
    #[error("Ingestion halted after level {0}")]
    Halted(Level),
}

impl ReplayError {
    pub fn mismatch(level: Level, reason: impl Into<String>) -> Self {
        Self::DeterminismMismatch {
            level,
            reason: reason.into(),
        }
    }

    pub fn invariant(level: Level, reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            level,
            reason: reason.into(),
        }
    }

    pub fn malformed(level: Level, reason: impl Into<String>) -> Self {
        Self::MalformedBlock {
            level,
            reason: reason.into(),
        }
    }
}
