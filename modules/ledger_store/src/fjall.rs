use std::{
    collections::BTreeMap,
    fs,
    ops::Bound,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{bail, Result};
use bakehouse_common::{
    operations::{Operation, OperationBody},
    Account, AccountId, Address, AppState, BakerCycle, BakingRight, Block, Cycle, CycleIndex,
    Level, RightKey, SnapshotBalance, Statistics,
};
use config::Config;
use fjall::{Database, Keyspace, PersistMode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, info};

use crate::{
    bulk::{decode_rows, BulkPayload, BulkTable},
    ChangeSet, LedgerStore, RowChange,
};

const DEFAULT_DATABASE_PATH: &str = "fjall-ledger";
const DEFAULT_CLEAR_ON_START: bool = false;
const DEFAULT_FLUSH_EVERY: i64 = 1000;

const ACCOUNTS_KEYSPACE: &str = "accounts";
const ACCOUNT_IDS_KEYSPACE: &str = "account-ids";
const BAKER_IDS_KEYSPACE: &str = "baker-ids";
const BLOCKS_KEYSPACE: &str = "blocks";
const CYCLES_KEYSPACE: &str = "cycles";
const BAKER_CYCLES_KEYSPACE: &str = "baker-cycles";
const RIGHTS_KEYSPACE: &str = "rights";
const SNAPSHOTS_KEYSPACE: &str = "snapshots";
const OPERATIONS_KEYSPACE: &str = "operations";
const NONCE_REVELATIONS_KEYSPACE: &str = "nonce-revelations";
const STATISTICS_KEYSPACE: &str = "statistics";
const APP_STATE_KEYSPACE: &str = "app-state";

const APP_STATE_KEY: &[u8] = b"head";

/// Decode every value yielded by a keyspace scan
macro_rules! scan_values {
    ($iter:expr) => {{
        let mut values = Vec::new();
        for entry in $iter {
            let (_, bytes) = entry.into_inner()?;
            values.push(bincode::deserialize(&bytes)?);
        }
        Ok(values)
    }};
}

/// Keyspaces written by a change set, in a fixed order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Space {
    Accounts,
    AccountIds,
    BakerIds,
    Blocks,
    Cycles,
    BakerCycles,
    Rights,
    Snapshots,
    Operations,
    NonceRevelations,
    Statistics,
    AppState,
}

pub struct FjallLedgerStore {
    database: Database,
    accounts: Keyspace,
    account_ids: Keyspace,
    baker_ids: Keyspace,
    blocks: Keyspace,
    cycles: Keyspace,
    baker_cycles: Keyspace,
    rights: Keyspace,
    snapshots: Keyspace,
    operations: Keyspace,
    nonce_revelations: Keyspace,
    statistics: Keyspace,
    app_state: Keyspace,
    flush_every: u64,
    commits: AtomicU64,
}

impl FjallLedgerStore {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let path = config
            .get_string("database-path")
            .unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string());
        let clear = config.get_bool("clear-on-start").unwrap_or(DEFAULT_CLEAR_ON_START);
        let flush_every = config.get_int("flush-every").unwrap_or(DEFAULT_FLUSH_EVERY).max(1);
        let path = PathBuf::from(path);
        if clear && path.exists() {
            info!("Clearing ledger store at {}", path.display());
            fs::remove_dir_all(&path)?;
        }

        let database = Database::builder(&path).manual_journal_persist(true).open()?;
        let open = |name: &str| database.keyspace(name, fjall::KeyspaceCreateOptions::default);

        Ok(Self {
            accounts: open(ACCOUNTS_KEYSPACE)?,
            account_ids: open(ACCOUNT_IDS_KEYSPACE)?,
            baker_ids: open(BAKER_IDS_KEYSPACE)?,
            blocks: open(BLOCKS_KEYSPACE)?,
            cycles: open(CYCLES_KEYSPACE)?,
            baker_cycles: open(BAKER_CYCLES_KEYSPACE)?,
            rights: open(RIGHTS_KEYSPACE)?,
            snapshots: open(SNAPSHOTS_KEYSPACE)?,
            operations: open(OPERATIONS_KEYSPACE)?,
            nonce_revelations: open(NONCE_REVELATIONS_KEYSPACE)?,
            statistics: open(STATISTICS_KEYSPACE)?,
            app_state: open(APP_STATE_KEYSPACE)?,
            database,
            flush_every: flush_every as u64,
            commits: AtomicU64::new(0),
        })
    }

    fn keyspace(&self, space: Space) -> &Keyspace {
        match space {
            Space::Accounts => &self.accounts,
            Space::AccountIds => &self.account_ids,
            Space::BakerIds => &self.baker_ids,
            Space::Blocks => &self.blocks,
            Space::Cycles => &self.cycles,
            Space::BakerCycles => &self.baker_cycles,
            Space::Rights => &self.rights,
            Space::Snapshots => &self.snapshots,
            Space::Operations => &self.operations,
            Space::NonceRevelations => &self.nonce_revelations,
            Space::Statistics => &self.statistics,
            Space::AppState => &self.app_state,
        }
    }

    fn get<T: DeserializeOwned>(keyspace: &Keyspace, key: impl AsRef<[u8]>) -> Result<Option<T>> {
        let Some(bytes) = keyspace.get(key)? else {
            return Ok(None);
        };
        Ok(Some(bincode::deserialize(&bytes)?))
    }

    fn maybe_persist(&self) -> Result<()> {
        let commits = self.commits.fetch_add(1, Ordering::Relaxed) + 1;
        if commits.is_multiple_of(self.flush_every) {
            self.database.persist(PersistMode::Buffer)?;
        }
        Ok(())
    }
}

fn level_key(level: Level) -> [u8; 4] {
    level.to_be_bytes()
}

fn baker_cycle_key(cycle: CycleIndex, baker_id: AccountId) -> [u8; 8] {
    let mut key = [0; 8];
    key[..4].copy_from_slice(&cycle.to_be_bytes());
    key[4..].copy_from_slice(&baker_id.0.to_be_bytes());
    key
}

fn right_key(key: &RightKey) -> [u8; 9] {
    let mut bytes = [0; 9];
    bytes[..4].copy_from_slice(&key.level.to_be_bytes());
    bytes[4] = key.kind.code() as u8;
    bytes[5..].copy_from_slice(&key.baker_id.0.to_be_bytes());
    bytes
}

fn snapshot_key(level: Level, account_id: AccountId) -> [u8; 8] {
    let mut key = [0; 8];
    key[..4].copy_from_slice(&level.to_be_bytes());
    key[4..].copy_from_slice(&account_id.0.to_be_bytes());
    key
}

fn operation_key(level: Level, id: i64) -> [u8; 12] {
    let mut key = [0; 12];
    key[..4].copy_from_slice(&level.to_be_bytes());
    key[4..].copy_from_slice(&id.to_be_bytes());
    key
}

/// Keys of every row whose level prefix lies in `from..=to`
fn level_range(from: Level, to: Level) -> (Bound<[u8; 4]>, Bound<[u8; 4]>) {
    let upper = match to.checked_add(1) {
        Some(next) => Bound::Excluded(level_key(next)),
        None => Bound::Unbounded,
    };
    (Bound::Included(level_key(from)), upper)
}

/// Pending writes of one change set.  Range deletes must see rows put
/// earlier in the same set, so writes are staged here and handed to a
/// single batch at the end.
#[derive(Default)]
struct Staged {
    writes: BTreeMap<(Space, Vec<u8>), Option<Vec<u8>>>,
}

impl Staged {
    fn put<T: Serialize>(&mut self, space: Space, key: &[u8], value: &T) -> Result<()> {
        self.writes.insert((space, key.to_vec()), Some(bincode::serialize(value)?));
        Ok(())
    }

    fn put_raw(&mut self, space: Space, key: &[u8], value: &[u8]) {
        self.writes.insert((space, key.to_vec()), Some(value.to_vec()));
    }

    fn remove(&mut self, space: Space, key: &[u8]) {
        self.writes.insert((space, key.to_vec()), None);
    }

    fn staged_in_range(
        &self,
        space: Space,
        range: &(Bound<[u8; 4]>, Bound<[u8; 4]>),
    ) -> Vec<Vec<u8>> {
        self.writes
            .iter()
            .filter(|((s, key), value)| {
                *s == space && value.is_some() && in_range(key, range)
            })
            .map(|((_, key), _)| key.clone())
            .collect()
    }
}

fn in_range(key: &[u8], range: &(Bound<[u8; 4]>, Bound<[u8; 4]>)) -> bool {
    let lower = match &range.0 {
        Bound::Included(b) => key >= b.as_slice(),
        Bound::Excluded(b) => key > b.as_slice(),
        Bound::Unbounded => true,
    };
    let upper = match &range.1 {
        Bound::Included(b) => key <= b.as_slice(),
        Bound::Excluded(b) => key < b.as_slice(),
        Bound::Unbounded => true,
    };
    lower && upper
}

impl FjallLedgerStore {
    fn stage_range_delete(&self, staged: &mut Staged, space: Space, from: Level, to: Level) -> Result<()> {
        let range = level_range(from, to);
        let mut keys = staged.staged_in_range(space, &range);
        for entry in self.keyspace(space).range(range) {
            let (key, _) = entry.into_inner()?;
            keys.push(key.to_vec());
        }
        for key in keys {
            staged.remove(space, &key);
        }
        Ok(())
    }

    fn stage(&self, staged: &mut Staged, change: RowChange) -> Result<()> {
        match change {
            RowChange::PutAccount(account) => {
                let key = account.id.0.to_be_bytes();
                staged.put(Space::Accounts, &key, &account)?;
                staged.put_raw(Space::AccountIds, account.address.as_str().as_bytes(), &key);
                if account.is_baker() {
                    staged.put_raw(Space::BakerIds, &key, &[]);
                } else {
                    staged.remove(Space::BakerIds, &key);
                }
            }
            RowChange::DeleteAccount { id, address } => {
                let key = id.0.to_be_bytes();
                staged.remove(Space::Accounts, &key);
                staged.remove(Space::AccountIds, address.as_str().as_bytes());
                staged.remove(Space::BakerIds, &key);
            }
            RowChange::PutBlock(block) => {
                staged.put(Space::Blocks, &level_key(block.level), &block)?
            }
            RowChange::DeleteBlock(level) => staged.remove(Space::Blocks, &level_key(level)),
            RowChange::PutCycle(cycle) => {
                staged.put(Space::Cycles, &cycle.index.to_be_bytes(), &cycle)?
            }
            RowChange::DeleteCycle(index) => staged.remove(Space::Cycles, &index.to_be_bytes()),
            RowChange::PutBakerCycle(bc) => {
                staged.put(Space::BakerCycles, &baker_cycle_key(bc.cycle, bc.baker_id), &bc)?
            }
            RowChange::DeleteBakerCycle { cycle, baker_id } => {
                staged.remove(Space::BakerCycles, &baker_cycle_key(cycle, baker_id))
            }
            RowChange::DeleteBakerCycles(cycle) => {
                self.stage_range_delete(staged, Space::BakerCycles, cycle, cycle)?
            }
            RowChange::PutRight(right) => {
                staged.put(Space::Rights, &right_key(&right.key()), &right)?
            }
            RowChange::DeleteRight(key) => staged.remove(Space::Rights, &right_key(&key)),
            RowChange::DeleteRights { from, to } => {
                self.stage_range_delete(staged, Space::Rights, from, to)?
            }
            RowChange::PutSnapshot(snapshot) => staged.put(
                Space::Snapshots,
                &snapshot_key(snapshot.level, snapshot.account_id),
                &snapshot,
            )?,
            RowChange::DeleteSnapshots { from, to } => {
                self.stage_range_delete(staged, Space::Snapshots, from, to)?
            }
            RowChange::PutOperation(op) => {
                let key = operation_key(op.level, op.id);
                if matches!(op.body, OperationBody::NonceRevelation { .. }) {
                    staged.put_raw(Space::NonceRevelations, &key, &[]);
                }
                staged.put(Space::Operations, &key, &op)?;
            }
            RowChange::DeleteOperation { level, id } => {
                let key = operation_key(level, id);
                staged.remove(Space::Operations, &key);
                staged.remove(Space::NonceRevelations, &key);
            }
            RowChange::PutStatistics(stats) => {
                staged.put(Space::Statistics, &level_key(stats.level), &stats)?
            }
            RowChange::DeleteStatistics(level) => {
                staged.remove(Space::Statistics, &level_key(level))
            }
            RowChange::PutAppState(state) => staged.put(Space::AppState, APP_STATE_KEY, &state)?,
        }
        Ok(())
    }
}

impl LedgerStore for FjallLedgerStore {
    fn app_state(&self) -> Result<Option<AppState>> {
        Self::get(&self.app_state, APP_STATE_KEY)
    }

    fn account(&self, id: AccountId) -> Result<Option<Account>> {
        Self::get(&self.accounts, id.0.to_be_bytes())
    }

    fn account_id(&self, address: &Address) -> Result<Option<AccountId>> {
        let Some(bytes) = self.account_ids.get(address.as_str().as_bytes())? else {
            return Ok(None);
        };
        let Ok(array) = <[u8; 4]>::try_from(bytes.as_ref()) else {
            bail!("Corrupt account id index entry for {address}");
        };
        Ok(Some(AccountId(i32::from_be_bytes(array))))
    }

    fn accounts(&self) -> Result<Vec<Account>> {
        scan_values!(self.accounts.iter())
    }

    fn bakers(&self) -> Result<Vec<Account>> {
        let mut bakers = Vec::new();
        for entry in self.baker_ids.iter() {
            let (key, _) = entry.into_inner()?;
            let Some(account) = Self::get::<Account>(&self.accounts, &key)? else {
                bail!("Baker index references a missing account");
            };
            bakers.push(account);
        }
        Ok(bakers)
    }

    fn block(&self, level: Level) -> Result<Option<Block>> {
        Self::get(&self.blocks, level_key(level))
    }

    fn cycle(&self, index: CycleIndex) -> Result<Option<Cycle>> {
        Self::get(&self.cycles, index.to_be_bytes())
    }

    fn baker_cycle(&self, cycle: CycleIndex, baker_id: AccountId) -> Result<Option<BakerCycle>> {
        Self::get(&self.baker_cycles, baker_cycle_key(cycle, baker_id))
    }

    fn baker_cycles(&self, cycle: CycleIndex) -> Result<Vec<BakerCycle>> {
        scan_values!(self.baker_cycles.prefix(cycle.to_be_bytes()))
    }

    fn rights(&self, level: Level) -> Result<Vec<BakingRight>> {
        scan_values!(self.rights.prefix(level_key(level)))
    }

    fn rights_range(&self, from: Level, to: Level) -> Result<Vec<BakingRight>> {
        scan_values!(self.rights.range(level_range(from, to)))
    }

    fn snapshots(&self, level: Level) -> Result<Vec<SnapshotBalance>> {
        scan_values!(self.snapshots.prefix(level_key(level)))
    }

    fn operations(&self, level: Level) -> Result<Vec<Operation>> {
        scan_values!(self.operations.prefix(level_key(level)))
    }

    fn nonce_revelations(&self, from: Level, to: Level) -> Result<Vec<Operation>> {
        let mut ops = Vec::new();
        for entry in self.nonce_revelations.range(level_range(from, to)) {
            let (key, _) = entry.into_inner()?;
            let Some(op) = Self::get::<Operation>(&self.operations, &key)? else {
                bail!("Nonce revelation index references a missing operation");
            };
            ops.push(op);
        }
        Ok(ops)
    }

    fn statistics(&self, level: Level) -> Result<Option<Statistics>> {
        Self::get(&self.statistics, level_key(level))
    }

    fn commit(&self, changes: ChangeSet) -> Result<()> {
        let count = changes.len();
        let mut staged = Staged::default();
        for change in changes.changes {
            self.stage(&mut staged, change)?;
        }

        let mut batch = self.database.batch();
        for ((space, key), value) in staged.writes {
            match value {
                Some(value) => batch.insert(self.keyspace(space), key, value),
                None => batch.remove(self.keyspace(space), key),
            }
        }
        batch.commit()?;
        debug!(changes = count, "Committed change set");
        self.maybe_persist()
    }

    fn bulk_load(&self, payload: &BulkPayload) -> Result<usize> {
        let mut batch = self.database.batch();
        let loaded = match payload.table {
            BulkTable::BakingRights => {
                let rows: Vec<BakingRight> = decode_rows(payload)?;
                for right in &rows {
                    batch.insert(&self.rights, right_key(&right.key()), bincode::serialize(right)?);
                }
                rows.len()
            }
            BulkTable::SnapshotBalances => {
                let rows: Vec<SnapshotBalance> = decode_rows(payload)?;
                for snapshot in &rows {
                    batch.insert(
                        &self.snapshots,
                        snapshot_key(snapshot.level, snapshot.account_id),
                        bincode::serialize(snapshot)?,
                    );
                }
                rows.len()
            }
        };
        batch.commit()?;
        debug!(table = payload.table.name(), rows = loaded, "Bulk loaded");
        Ok(loaded)
    }
}

impl Drop for FjallLedgerStore {
    fn drop(&mut self) {
        if let Err(e) = self.database.persist(PersistMode::SyncAll) {
            error!("Failed to persist ledger store on shutdown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::encode_rows;
    use bakehouse_common::{AccountKind, BakerData, RightKind, RightStatus};
    use tempfile::TempDir;

    struct TestState {
        #[expect(unused)]
        dir: TempDir,
        store: FjallLedgerStore,
    }

    fn config_for(dir: &TempDir, clear: bool) -> Arc<Config> {
        let dir_name = dir.path().to_str().expect("dir_name cannot be stored as string");
        Arc::new(
            Config::builder()
                .set_default("database-path", dir_name)
                .unwrap()
                .set_default("clear-on-start", clear)
                .unwrap()
                .build()
                .unwrap(),
        )
    }

    fn init_state() -> TestState {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallLedgerStore::new(config_for(&dir, true)).unwrap();
        TestState { dir, store }
    }

    fn right(level: Level, kind: RightKind, baker: i32) -> BakingRight {
        BakingRight {
            cycle: 0,
            level,
            baker_id: AccountId(baker),
            kind,
            round: (kind == RightKind::Baking).then_some(baker),
            slots: (kind == RightKind::Endorsing).then_some(2),
            status: RightStatus::Future,
        }
    }

    fn baker_account(id: i32) -> Account {
        let mut account = Account::new(
            AccountId(id),
            Address::new(format!("tz1baker{id}")),
            1,
            AccountKind::Baker(BakerData::default()),
        );
        account.balance = 5_000;
        account
    }

    #[test]
    fn accounts_are_indexed_by_address_and_kind() {
        let state = init_state();
        let baker = baker_account(1);
        let user = Account::new_user(AccountId(2), Address::from("tz1user"), 3);

        let mut changes = ChangeSet::default();
        changes.push(RowChange::PutAccount(baker.clone()));
        changes.push(RowChange::PutAccount(user.clone()));
        state.store.commit(changes).unwrap();

        assert_eq!(state.store.account(AccountId(1)).unwrap(), Some(baker.clone()));
        assert_eq!(state.store.account_id(&user.address).unwrap(), Some(AccountId(2)));
        assert_eq!(state.store.bakers().unwrap(), vec![baker]);
        assert_eq!(state.store.accounts().unwrap().len(), 2);

        let mut changes = ChangeSet::default();
        changes.push(RowChange::DeleteAccount {
            id: user.id,
            address: user.address.clone(),
        });
        state.store.commit(changes).unwrap();
        assert_eq!(state.store.account_id(&user.address).unwrap(), None);
        assert_eq!(state.store.accounts().unwrap().len(), 1);
    }

    #[test]
    fn range_delete_sees_rows_put_in_the_same_set() {
        let state = init_state();
        let mut changes = ChangeSet::default();
        changes.push(RowChange::PutRight(right(10, RightKind::Baking, 1)));
        changes.push(RowChange::PutRight(right(11, RightKind::Endorsing, 1)));
        state.store.commit(changes).unwrap();

        let mut changes = ChangeSet::default();
        changes.push(RowChange::PutRight(right(12, RightKind::Baking, 2)));
        changes.push(RowChange::DeleteRights { from: 11, to: 12 });
        changes.push(RowChange::PutRight(right(13, RightKind::Baking, 3)));
        state.store.commit(changes).unwrap();

        let rights = state.store.rights_range(0, 100).unwrap();
        assert_eq!(rights.iter().map(|r| r.level).collect::<Vec<_>>(), vec![10, 13]);
    }

    #[test]
    fn rights_of_a_level_list_baking_first() {
        let state = init_state();
        let mut changes = ChangeSet::default();
        changes.push(RowChange::PutRight(right(5, RightKind::Endorsing, 1)));
        changes.push(RowChange::PutRight(right(5, RightKind::Baking, 2)));
        changes.push(RowChange::PutRight(right(6, RightKind::Baking, 1)));
        state.store.commit(changes).unwrap();

        let rights = state.store.rights(5).unwrap();
        assert_eq!(rights.len(), 2);
        assert_eq!(rights[0].kind, RightKind::Baking);
        assert_eq!(rights[1].kind, RightKind::Endorsing);
    }

    #[test]
    fn bulk_load_makes_rows_visible() {
        let state = init_state();
        let rights: Vec<_> = (0..4)
            .flat_map(|b| [right(20, RightKind::Baking, b), right(20, RightKind::Endorsing, b)])
            .collect();
        let payload = encode_rows(&rights).unwrap();
        assert_eq!(state.store.bulk_load(&payload).unwrap(), 8);
        assert_eq!(state.store.rights(20).unwrap().len(), 8);
        assert!(state
            .store
            .rights(20)
            .unwrap()
            .iter()
            .all(|r| r.status == RightStatus::Future));
    }

    #[test]
    fn rows_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FjallLedgerStore::new(config_for(&dir, true)).unwrap();
            let mut changes = ChangeSet::default();
            changes.push(RowChange::PutAppState(AppState {
                level: 42,
                next_account_id: 7,
                ..Default::default()
            }));
            changes.push(RowChange::PutStatistics(Statistics {
                level: 42,
                total_created: 99,
                ..Default::default()
            }));
            store.commit(changes).unwrap();
        }

        let store = FjallLedgerStore::new(config_for(&dir, false)).unwrap();
        assert_eq!(store.app_state().unwrap().map(|s| s.level), Some(42));
        assert_eq!(store.statistics(42).unwrap().map(|s| s.total_created), Some(99));
    }

    #[test]
    fn missing_rows_are_none() {
        let state = init_state();
        assert_eq!(state.store.app_state().unwrap(), None);
        assert_eq!(state.store.block(1).unwrap(), None);
        assert!(state.store.baker_cycles(0).unwrap().is_empty());
        assert!(state.store.nonce_revelations(0, 10).unwrap().is_empty());
    }
}
