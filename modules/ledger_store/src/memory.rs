//! In-memory ledger store, used by tests and short replays

use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
};

use anyhow::{anyhow, Result};
use bakehouse_common::{
    operations::{Operation, OperationBody},
    Account, AccountId, Address, AppState, BakerCycle, BakingRight, Block, Cycle, CycleIndex,
    Level, OperationId, RightKey, SnapshotBalance, Statistics,
};

use crate::{
    bulk::{decode_rows, BulkPayload, BulkTable},
    ChangeSet, LedgerStore, RowChange,
};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Tables {
    pub app_state: Option<AppState>,
    pub accounts: BTreeMap<AccountId, Account>,
    pub account_ids: HashMap<Address, AccountId>,
    pub blocks: BTreeMap<Level, Block>,
    pub cycles: BTreeMap<CycleIndex, Cycle>,
    pub baker_cycles: BTreeMap<(CycleIndex, AccountId), BakerCycle>,
    pub rights: BTreeMap<RightKey, BakingRight>,
    pub snapshots: BTreeMap<(Level, AccountId), SnapshotBalance>,
    pub operations: BTreeMap<(Level, OperationId), Operation>,
    pub statistics: BTreeMap<Level, Statistics>,
}

impl Tables {
    fn apply(&mut self, change: RowChange) {
        match change {
            RowChange::PutAccount(account) => {
                self.account_ids.insert(account.address.clone(), account.id);
                self.accounts.insert(account.id, account);
            }
            RowChange::DeleteAccount { id, address } => {
                self.accounts.remove(&id);
                self.account_ids.remove(&address);
            }
            RowChange::PutBlock(block) => {
                self.blocks.insert(block.level, block);
            }
            RowChange::DeleteBlock(level) => {
                self.blocks.remove(&level);
            }
            RowChange::PutCycle(cycle) => {
                self.cycles.insert(cycle.index, cycle);
            }
            RowChange::DeleteCycle(index) => {
                self.cycles.remove(&index);
            }
            RowChange::PutBakerCycle(bc) => {
                self.baker_cycles.insert((bc.cycle, bc.baker_id), bc);
            }
            RowChange::DeleteBakerCycle { cycle, baker_id } => {
                self.baker_cycles.remove(&(cycle, baker_id));
            }
            RowChange::DeleteBakerCycles(cycle) => {
                self.baker_cycles.retain(|(c, _), _| *c != cycle);
            }
            RowChange::PutRight(right) => {
                self.rights.insert(right.key(), right);
            }
            RowChange::DeleteRight(key) => {
                self.rights.remove(&key);
            }
            RowChange::DeleteRights { from, to } => {
                self.rights.retain(|key, _| key.level < from || key.level > to);
            }
            RowChange::PutSnapshot(snapshot) => {
                self.snapshots.insert((snapshot.level, snapshot.account_id), snapshot);
            }
            RowChange::DeleteSnapshots { from, to } => {
                self.snapshots.retain(|(level, _), _| *level < from || *level > to);
            }
            RowChange::PutOperation(op) => {
                self.operations.insert((op.level, op.id), op);
            }
            RowChange::DeleteOperation { level, id } => {
                self.operations.remove(&(level, id));
            }
            RowChange::PutStatistics(stats) => {
                self.statistics.insert(stats.level, stats);
            }
            RowChange::DeleteStatistics(level) => {
                self.statistics.remove(&level);
            }
            RowChange::PutAppState(state) => self.app_state = Some(state),
        }
    }
}

#[derive(Default)]
pub struct InMemoryLedgerStore {
    tables: RwLock<Tables>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every table, for before/after comparisons
    pub fn snapshot(&self) -> Result<Tables> {
        Ok(self.read()?.clone())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| anyhow!("Ledger tables lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| anyhow!("Ledger tables lock poisoned"))
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn app_state(&self) -> Result<Option<AppState>> {
        Ok(self.read()?.app_state.clone())
    }

    fn account(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.read()?.accounts.get(&id).cloned())
    }

    fn account_id(&self, address: &Address) -> Result<Option<AccountId>> {
        Ok(self.read()?.account_ids.get(address).copied())
    }

    fn accounts(&self) -> Result<Vec<Account>> {
        Ok(self.read()?.accounts.values().cloned().collect())
    }

    fn bakers(&self) -> Result<Vec<Account>> {
        Ok(self.read()?.accounts.values().filter(|a| a.is_baker()).cloned().collect())
    }

    fn block(&self, level: Level) -> Result<Option<Block>> {
        Ok(self.read()?.blocks.get(&level).cloned())
    }

    fn cycle(&self, index: CycleIndex) -> Result<Option<Cycle>> {
        Ok(self.read()?.cycles.get(&index).cloned())
    }

    fn baker_cycle(&self, cycle: CycleIndex, baker_id: AccountId) -> Result<Option<BakerCycle>> {
        Ok(self.read()?.baker_cycles.get(&(cycle, baker_id)).cloned())
    }

    fn baker_cycles(&self, cycle: CycleIndex) -> Result<Vec<BakerCycle>> {
        let tables = self.read()?;
        Ok(tables
            .baker_cycles
            .range((cycle, AccountId(i32::MIN))..=(cycle, AccountId(i32::MAX)))
            .map(|(_, bc)| bc.clone())
            .collect())
    }

    fn rights(&self, level: Level) -> Result<Vec<BakingRight>> {
        self.rights_range(level, level)
    }

    fn rights_range(&self, from: Level, to: Level) -> Result<Vec<BakingRight>> {
        let tables = self.read()?;
        Ok(tables
            .rights
            .values()
            .filter(|r| r.level >= from && r.level <= to)
            .cloned()
            .collect())
    }

    fn snapshots(&self, level: Level) -> Result<Vec<SnapshotBalance>> {
        let tables = self.read()?;
        Ok(tables
            .snapshots
            .range((level, AccountId(i32::MIN))..=(level, AccountId(i32::MAX)))
            .map(|(_, s)| s.clone())
            .collect())
    }

    fn operations(&self, level: Level) -> Result<Vec<Operation>> {
        let tables = self.read()?;
        Ok(tables
            .operations
            .range((level, OperationId::MIN)..=(level, OperationId::MAX))
            .map(|(_, op)| op.clone())
            .collect())
    }

    fn nonce_revelations(&self, from: Level, to: Level) -> Result<Vec<Operation>> {
        let tables = self.read()?;
        Ok(tables
            .operations
            .range((from, OperationId::MIN)..=(to, OperationId::MAX))
            .map(|(_, op)| op)
            .filter(|op| matches!(op.body, OperationBody::NonceRevelation { .. }))
            .cloned()
            .collect())
    }

    fn statistics(&self, level: Level) -> Result<Option<Statistics>> {
        Ok(self.read()?.statistics.get(&level).cloned())
    }

    fn commit(&self, changes: ChangeSet) -> Result<()> {
        let mut tables = self.write()?;
        for change in changes.changes {
            tables.apply(change);
        }
        Ok(())
    }

    fn bulk_load(&self, payload: &BulkPayload) -> Result<usize> {
        match payload.table {
            BulkTable::BakingRights => {
                let rows: Vec<BakingRight> = decode_rows(payload)?;
                let count = rows.len();
                let mut tables = self.write()?;
                for right in rows {
                    tables.rights.insert(right.key(), right);
                }
                Ok(count)
            }
            BulkTable::SnapshotBalances => {
                let rows: Vec<SnapshotBalance> = decode_rows(payload)?;
                let count = rows.len();
                let mut tables = self.write()?;
                for snapshot in rows {
                    tables.snapshots.insert((snapshot.level, snapshot.account_id), snapshot);
                }
                Ok(count)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::encode_rows;
    use bakehouse_common::{RightKind, RightStatus};

    #[test]
    fn range_deletes_only_touch_their_levels() {
        let store = InMemoryLedgerStore::new();
        let snapshots: Vec<_> = [4, 8, 12]
            .into_iter()
            .map(|level| SnapshotBalance {
                level,
                account_id: AccountId(1),
                baker_id: AccountId(1),
                own_delegated_balance: 10,
                external_delegated_balance: 0,
                delegators_count: 0,
                own_staked_balance: 0,
                external_staked_balance: 0,
                stakers_count: 0,
            })
            .collect();
        store.bulk_load(&encode_rows(&snapshots).unwrap()).unwrap();

        let mut changes = ChangeSet::default();
        changes.push(RowChange::DeleteSnapshots { from: 1, to: 8 });
        store.commit(changes).unwrap();

        assert!(store.snapshots(4).unwrap().is_empty());
        assert!(store.snapshots(8).unwrap().is_empty());
        assert_eq!(store.snapshots(12).unwrap().len(), 1);
    }

    #[test]
    fn rights_of_one_level_are_ordered_by_kind() {
        let store = InMemoryLedgerStore::new();
        let mut changes = ChangeSet::default();
        for (kind, baker) in [(RightKind::Endorsing, 1), (RightKind::Baking, 2)] {
            changes.push(RowChange::PutRight(BakingRight {
                cycle: 0,
                level: 3,
                baker_id: AccountId(baker),
                kind,
                round: None,
                slots: None,
                status: RightStatus::Future,
            }));
        }
        store.commit(changes).unwrap();
        let rights = store.rights(3).unwrap();
        assert_eq!(rights[0].kind, RightKind::Baking);
        assert_eq!(rights[1].kind, RightKind::Endorsing);
    }
}
