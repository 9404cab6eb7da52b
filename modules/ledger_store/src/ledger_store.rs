//! Bakehouse ledger persistence
//!
//! Two write paths: a [`ChangeSet`] of row upserts and deletes committed
//! atomically once per applied or reverted block, and a binary bulk-load
//! path for high-volume rows (future rights, snapshot balances).

pub mod bulk;
mod changes;
pub mod fjall;
pub mod memory;

pub use changes::{ChangeSet, RowChange};

use anyhow::Result;
use bakehouse_common::{
    operations::Operation, Account, AccountId, Address, AppState, BakerCycle, BakingRight, Block,
    Cycle, CycleIndex, Level, SnapshotBalance, Statistics,
};

use crate::bulk::BulkPayload;

pub trait LedgerStore: Send + Sync {
    fn app_state(&self) -> Result<Option<AppState>>;

    fn account(&self, id: AccountId) -> Result<Option<Account>>;
    fn account_id(&self, address: &Address) -> Result<Option<AccountId>>;
    fn accounts(&self) -> Result<Vec<Account>>;
    fn bakers(&self) -> Result<Vec<Account>>;

    fn block(&self, level: Level) -> Result<Option<Block>>;

    fn cycle(&self, index: CycleIndex) -> Result<Option<Cycle>>;
    fn baker_cycle(&self, cycle: CycleIndex, baker_id: AccountId) -> Result<Option<BakerCycle>>;
    fn baker_cycles(&self, cycle: CycleIndex) -> Result<Vec<BakerCycle>>;

    /// Rights of one level, ordered by kind then baker
    fn rights(&self, level: Level) -> Result<Vec<BakingRight>>;

    /// Rights of an inclusive level range, ordered by level
    fn rights_range(&self, from: Level, to: Level) -> Result<Vec<BakingRight>>;

    fn snapshots(&self, level: Level) -> Result<Vec<SnapshotBalance>>;

    /// Operations of one level in id order
    fn operations(&self, level: Level) -> Result<Vec<Operation>>;

    /// Nonce revelation operations included in an inclusive level range
    fn nonce_revelations(&self, from: Level, to: Level) -> Result<Vec<Operation>>;

    fn statistics(&self, level: Level) -> Result<Option<Statistics>>;

    /// Apply every change atomically
    fn commit(&self, changes: ChangeSet) -> Result<()>;

    /// Make the rows of a finished bulk payload visible, returning how many were loaded
    fn bulk_load(&self, payload: &BulkPayload) -> Result<usize>;
}
