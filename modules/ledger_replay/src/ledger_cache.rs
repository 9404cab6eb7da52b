//! Long-lived entity cache, shared by every unit of work of a replay session
//!
//! Tables hold `Option` values so a looked-up-but-absent row and a row
//! deleted within the session are remembered as well.  All maps are
//! persistent, so a checkpoint is a cheap clone which the driver restores
//! if a block fails half way.

use anyhow::Result;
use imbl::{HashMap, OrdMap, OrdSet};

use bakehouse_common::{
    Account, AccountId, Address, AppState, BakerCycle, Cycle, CycleIndex, Statistics,
};
use bakehouse_module_ledger_store::LedgerStore;

/// Rows keyed by `K`; `Some(None)` means known to be absent
#[derive(Debug, Clone)]
pub struct Table<K: Ord + Clone, V: Clone> {
    rows: OrdMap<K, Option<V>>,
}

impl<K: Ord + Clone, V: Clone> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            rows: OrdMap::new(),
        }
    }
}

impl<K: Ord + Clone, V: Clone> Table<K, V> {
    pub fn lookup(&self, key: &K) -> Option<Option<&V>> {
        self.rows.get(key).map(Option::as_ref)
    }

    /// Cached row, loading it with `load` on first access
    pub fn get_or_load(
        &mut self,
        key: &K,
        load: impl FnOnce() -> Result<Option<V>>,
    ) -> Result<Option<&V>> {
        if !self.rows.contains_key(key) {
            let loaded = load()?;
            self.rows.insert(key.clone(), loaded);
        }
        Ok(self.rows.get(key).and_then(Option::as_ref))
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.rows.get_mut(key).and_then(Option::as_mut)
    }

    pub fn put(&mut self, key: K, value: V) {
        self.rows.insert(key, Some(value));
    }

    pub fn remove(&mut self, key: K) {
        self.rows.insert(key, None);
    }

    /// Insert a loaded row unless the key is already tracked
    pub fn seed(&mut self, key: K, value: V) {
        if !self.rows.contains_key(&key) {
            self.rows.insert(key, Some(value));
        }
    }

    pub fn range<'a>(
        &'a self,
        range: impl std::ops::RangeBounds<K> + 'a,
    ) -> impl Iterator<Item = (&'a K, &'a V)> + 'a {
        self.rows
            .range(range)
            .filter_map(|(k, v)| v.as_ref().map(|v| (k, v)))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LedgerCache {
    pub accounts: Table<AccountId, Account>,
    pub addresses: HashMap<Address, Option<AccountId>>,
    pub cycles: Table<CycleIndex, Cycle>,
    pub baker_cycles: Table<(CycleIndex, AccountId), BakerCycle>,

    /// Cycles whose baker-cycle rows have all been pulled in
    pub loaded_baker_cycles: OrdSet<CycleIndex>,

    /// Ids of every baker, loaded once
    pub bakers: Option<OrdSet<AccountId>>,

    pub app_state: AppState,
    pub head_statistics: Option<Statistics>,
}

impl LedgerCache {
    /// Cache primed with the persisted head
    pub fn load(store: &dyn LedgerStore) -> Result<Self> {
        let app_state = store.app_state()?.unwrap_or_default();
        let head_statistics = if app_state.is_empty() {
            None
        } else {
            store.statistics(app_state.level)?
        };
        Ok(Self {
            app_state,
            head_statistics,
            ..Default::default()
        })
    }

    /// Checkpoint restored when a unit of work fails
    pub fn checkpoint(&self) -> LedgerCache {
        self.clone()
    }

    /// Drop cached rows once the account table grows past `max_accounts`.
    /// Only called between blocks, when the cache mirrors the store.
    pub fn trim(&mut self, max_accounts: usize) {
        if self.accounts.len() > max_accounts {
            self.accounts = Table::default();
            self.addresses = HashMap::new();
            self.baker_cycles = Table::default();
            self.loaded_baker_cycles = OrdSet::new();
            self.cycles = Table::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_rows_are_remembered() {
        let mut table: Table<i32, String> = Table::default();
        let mut loads = 0;
        assert!(table
            .get_or_load(&1, || {
                loads += 1;
                Ok(None)
            })
            .unwrap()
            .is_none());
        assert!(table.get_or_load(&1, || panic!("loaded twice")).unwrap().is_none());
        assert_eq!(loads, 1);
        assert_eq!(table.lookup(&1), Some(None));
        assert_eq!(table.lookup(&2), None);
    }

    #[test]
    fn checkpoint_is_isolated_from_later_writes() {
        let mut cache = LedgerCache::default();
        cache.cycles.put(
            3,
            Cycle {
                index: 3,
                first_level: 25,
                last_level: 32,
                snapshot_index: None,
                snapshot_level: None,
                total_staking: 1,
                total_bakers: 1,
                selected_stake: 1,
                selected_bakers: 1,
                seed: Default::default(),
            },
        );
        let checkpoint = cache.checkpoint();
        cache.cycles.remove(3);
        cache.app_state.level = 99;

        assert!(checkpoint.cycles.lookup(&3).unwrap().is_some());
        assert_eq!(checkpoint.app_state.level, 0);
        assert_eq!(cache.cycles.lookup(&3), Some(None));
    }

    #[test]
    fn seeding_never_overwrites_tracked_rows() {
        let mut table: Table<i32, i32> = Table::default();
        table.remove(5);
        table.seed(5, 50);
        table.seed(6, 60);
        assert_eq!(table.lookup(&5), Some(None));
        assert_eq!(table.range(..).collect::<Vec<_>>(), vec![(&6, &60)]);
    }
}
