use bakehouse_common::{
    operations::Operation, Account, AccountId, Address, AppState, BakerCycle, BakingRight, Block,
    Cycle, CycleIndex, Level, OperationId, RightKey, SnapshotBalance, Statistics,
};

/// One row-level write intent
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    PutAccount(Account),
    DeleteAccount { id: AccountId, address: Address },
    PutBlock(Block),
    DeleteBlock(Level),
    PutCycle(Cycle),
    DeleteCycle(CycleIndex),
    PutBakerCycle(BakerCycle),
    DeleteBakerCycle { cycle: CycleIndex, baker_id: AccountId },
    DeleteBakerCycles(CycleIndex),
    PutRight(BakingRight),
    DeleteRight(RightKey),
    /// Delete every right in an inclusive level range
    DeleteRights { from: Level, to: Level },
    PutSnapshot(SnapshotBalance),
    /// Delete every snapshot in an inclusive level range
    DeleteSnapshots { from: Level, to: Level },
    PutOperation(Operation),
    DeleteOperation { level: Level, id: OperationId },
    PutStatistics(Statistics),
    DeleteStatistics(Level),
    PutAppState(AppState),
}

/// Ordered write intents of one block, committed in a single transaction
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChangeSet {
    pub changes: Vec<RowChange>,
}

impl ChangeSet {
    pub fn push(&mut self, change: RowChange) {
        self.changes.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }
}
