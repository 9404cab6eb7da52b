// Bakehouse common library - main library exports

pub mod account;
pub mod app_state;
pub mod baker_cycle;
pub mod block;
pub mod cycle;
pub mod errors;
pub mod math;
pub mod messages;
pub mod node;
pub mod operations;
pub mod protocol_params;
pub mod rights;
pub mod snapshot;
pub mod statistics;
pub mod types;

// Flattened re-exports
pub use self::account::*;
pub use self::app_state::AppState;
pub use self::baker_cycle::{BakerCycle, RewardSplit, SlashedAmounts};
pub use self::block::{Block, BlockEvents, OperationKinds};
pub use self::cycle::{Cycle, Seed};
pub use self::errors::ReplayError;
pub use self::rights::{BakingRight, RightKey, RightKind, RightStatus};
pub use self::snapshot::SnapshotBalance;
pub use self::statistics::{Statistics, StatisticsDelta};
pub use self::types::*;
