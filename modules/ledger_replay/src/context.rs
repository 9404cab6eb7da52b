//! Unit of work over the ledger for one block's apply or revert
//!
//! Commit units only ever touch the ledger through a [`LedgerContext`]: reads
//! go through the shared [`LedgerCache`], writes mutate the cache and mark
//! rows dirty.  [`LedgerContext::finish`] turns everything into one
//! [`ChangeSet`] plus the bulk payloads queued on the way.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Result};
use tracing::debug;

use bakehouse_common::{
    math::{update_count_with_delta, update_value_with_delta},
    operations::{FreezerCategory, Operation},
    Account, AccountId, AccountKind, Address, AddressKind, AppState, BakerCycle, BakerData,
    BakingRight, Block, ContractData, Cycle, CycleIndex, Level, Mutez, OperationId, ReplayError,
    RollupData, Statistics, StatisticsDelta, UserData,
};
use bakehouse_module_ledger_store::{bulk::BulkPayload, ChangeSet, LedgerStore, RowChange};

use crate::ledger_cache::LedgerCache;

/// Everything a unit of work wants written
#[derive(Debug, Default)]
pub struct PendingWrites {
    pub changes: ChangeSet,
    pub bulk: Vec<BulkPayload>,
}

pub struct LedgerContext<'a> {
    store: &'a dyn LedgerStore,
    cache: &'a mut LedgerCache,
    level: Level,

    dirty_accounts: BTreeSet<AccountId>,
    removed_accounts: BTreeMap<AccountId, Address>,
    dirty_cycles: BTreeSet<CycleIndex>,
    dirty_baker_cycles: BTreeSet<(CycleIndex, AccountId)>,

    rights: BTreeMap<Level, Vec<BakingRight>>,
    dirty_rights: BTreeSet<Level>,
    deleted_rights: Vec<(Level, Level)>,

    intents: ChangeSet,
    bulk: Vec<BulkPayload>,

    /// Supply deltas accumulated while applying
    pub stats: StatisticsDelta,
}

impl<'a> LedgerContext<'a> {
    pub fn new(store: &'a dyn LedgerStore, cache: &'a mut LedgerCache, level: Level) -> Self {
        Self {
            store,
            cache,
            level,
            dirty_accounts: BTreeSet::new(),
            removed_accounts: BTreeMap::new(),
            dirty_cycles: BTreeSet::new(),
            dirty_baker_cycles: BTreeSet::new(),
            rights: BTreeMap::new(),
            dirty_rights: BTreeSet::new(),
            deleted_rights: Vec::new(),
            intents: ChangeSet::default(),
            bulk: Vec::new(),
            stats: StatisticsDelta::default(),
        }
    }

    /// Level of the block in flight
    pub fn level(&self) -> Level {
        self.level
    }

    pub fn store(&self) -> &dyn LedgerStore {
        self.store
    }

    fn invariant(&self, reason: impl Into<String>) -> anyhow::Error {
        ReplayError::invariant(self.level, reason).into()
    }

    // -- App state ----------------------------------------------------------

    pub fn app_state(&self) -> &AppState {
        &self.cache.app_state
    }

    pub fn app_state_mut(&mut self) -> &mut AppState {
        &mut self.cache.app_state
    }

    pub fn head_statistics(&self) -> Option<&Statistics> {
        self.cache.head_statistics.as_ref()
    }

    pub fn set_head_statistics(&mut self, stats: Option<Statistics>) {
        self.cache.head_statistics = stats;
    }

    // -- Accounts -----------------------------------------------------------

    pub fn find_account(&mut self, id: AccountId) -> Result<Option<&Account>> {
        let store = self.store;
        self.cache.accounts.get_or_load(&id, || store.account(id))
    }

    pub fn account(&mut self, id: AccountId) -> Result<&Account> {
        let level = self.level;
        self.find_account(id)?
            .ok_or_else(|| ReplayError::invariant(level, format!("Unknown account {id}")).into())
    }

    /// Mutable account, marked for writing
    pub fn account_mut(&mut self, id: AccountId) -> Result<&mut Account> {
        self.account(id)?;
        self.dirty_accounts.insert(id);
        let level = self.level;
        self.cache
            .accounts
            .get_mut(&id)
            .ok_or_else(|| ReplayError::invariant(level, format!("Unknown account {id}")).into())
    }

    pub fn baker_mut(&mut self, id: AccountId) -> Result<&mut BakerData> {
        let level = self.level;
        self.account_mut(id)?
            .baker_mut()
            .ok_or_else(|| ReplayError::invariant(level, format!("Account {id} is not a baker")).into())
    }

    pub fn account_by_address(&mut self, address: &Address) -> Result<Option<AccountId>> {
        if let Some(id) = self.cache.addresses.get(address) {
            return Ok(*id);
        }
        let id = self.store.account_id(address)?;
        self.cache.addresses.insert(address.clone(), id);
        Ok(id)
    }

    /// Id of an account the block document says must already exist
    pub fn required_account(&mut self, address: &Address) -> Result<AccountId> {
        let level = self.level;
        self.account_by_address(address)?.ok_or_else(|| {
            ReplayError::malformed(level, format!("Unknown account {address}")).into()
        })
    }

    pub fn allocate_account(&mut self, address: &Address, kind: AccountKind) -> Result<AccountId> {
        if self.account_by_address(address)?.is_some() {
            return Err(self.invariant(format!("Account {address} already exists")));
        }
        let id = AccountId(self.cache.app_state.next_account_id);
        self.cache.app_state.next_account_id += 1;

        let is_baker = matches!(kind, AccountKind::Baker(_));
        let account = Account::new(id, address.clone(), self.level, kind);
        self.cache.accounts.put(id, account);
        self.cache.addresses.insert(address.clone(), Some(id));
        if is_baker {
            self.bakers_mut()?.insert(id);
        }
        self.dirty_accounts.insert(id);
        debug!(%address, %id, "Allocated account");
        Ok(id)
    }

    /// Allocate an account whose kind follows from its address prefix
    pub fn allocate_for_address(
        &mut self,
        address: &Address,
        creator_id: Option<AccountId>,
    ) -> Result<AccountId> {
        let kind = match address.kind() {
            AddressKind::Implicit => AccountKind::User(UserData::default()),
            AddressKind::Contract => AccountKind::Contract(ContractData { creator_id }),
            AddressKind::Rollup => AccountKind::Rollup(RollupData {
                creator_id,
                pvm_kind: String::new(),
            }),
            AddressKind::Unknown => {
                return Err(ReplayError::malformed(
                    self.level,
                    format!("Cannot allocate account for address {address}"),
                )
                .into())
            }
        };
        self.allocate_account(address, kind)
    }

    /// Existing account, or a newly allocated one
    pub fn account_or_allocate(
        &mut self,
        address: &Address,
        creator_id: Option<AccountId>,
    ) -> Result<(AccountId, bool)> {
        match self.account_by_address(address)? {
            Some(id) => Ok((id, false)),
            None => Ok((self.allocate_for_address(address, creator_id)?, true)),
        }
    }

    /// Undo the latest allocation.  Ids are handed out sequentially, so only
    /// the most recent account can go, and only once it is empty again.
    pub fn remove_account(&mut self, id: AccountId) -> Result<()> {
        if id.0 != self.cache.app_state.next_account_id - 1 {
            return Err(self.invariant(format!("Account {id} is not the latest allocated")));
        }
        let account = self.account(id)?.clone();
        if account.balance != 0 || account.held_outside_balance() != 0 {
            return Err(self.invariant(format!("Account {id} still holds funds")));
        }
        if account.external_delegate().is_some() {
            return Err(self.invariant(format!("Account {id} still delegates")));
        }
        if account.is_baker() {
            self.bakers_mut()?.remove(&id);
        }
        self.cache.accounts.remove(id);
        self.cache.addresses.insert(account.address.clone(), None);
        self.cache.app_state.next_account_id -= 1;
        self.dirty_accounts.insert(id);
        self.removed_accounts.insert(id, account.address);
        Ok(())
    }

    /// Move `delta` into or out of an account's balance, mirrored on its
    /// delegate's delegated balance
    pub fn change_balance(&mut self, id: AccountId, delta: Mutez) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let account = self.account_mut(id)?;
        update_value_with_delta(&mut account.balance, delta)?;
        if let Some(delegate) = account.external_delegate() {
            let baker = self.baker_mut(delegate)?;
            update_value_with_delta(&mut baker.delegated_balance, delta)?;
        }
        Ok(())
    }

    /// Move `delta` between a baker's spendable balance and one of its
    /// frozen buckets; the balance itself does not change
    pub fn adjust_frozen(
        &mut self,
        baker_id: AccountId,
        category: FreezerCategory,
        delta: Mutez,
    ) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let baker = self.baker_mut(baker_id)?;
        let bucket = match category {
            FreezerCategory::Deposits => &mut baker.frozen_deposits,
            FreezerCategory::Rewards => &mut baker.frozen_rewards,
            FreezerCategory::Fees => &mut baker.frozen_fees,
            FreezerCategory::Staked => &mut baker.own_staked,
        };
        update_value_with_delta(bucket, delta)?;
        self.stats.frozen += delta;
        Ok(())
    }

    /// Point an account at a new delegate, moving its balance between the
    /// delegated balances of the old and new delegate
    pub fn set_delegate(&mut self, id: AccountId, delegate: Option<AccountId>) -> Result<()> {
        let account = self.account(id)?;
        let balance = account.balance;
        if let Some(old) = account.external_delegate() {
            let baker = self.baker_mut(old)?;
            update_value_with_delta(&mut baker.delegated_balance, -balance)?;
            update_count_with_delta(&mut baker.delegators_count, -1)?;
        }
        self.account_mut(id)?.delegate_id = delegate;
        if let Some(new) = delegate.filter(|d| *d != id) {
            let baker = self.baker_mut(new)?;
            update_value_with_delta(&mut baker.delegated_balance, balance)?;
            update_count_with_delta(&mut baker.delegators_count, 1)?;
        }
        Ok(())
    }

    /// Turn a user into a baker.
    ///
    /// Other entities only refer to accounts by id, so the rewrite is local:
    /// the account kind changes and the id joins the baker set.  Delegation
    /// fields are left to the caller.
    pub fn promote_to_baker(&mut self, id: AccountId, data: BakerData) -> Result<()> {
        let level = self.level;
        let account = self.account_mut(id)?;
        match &account.kind {
            AccountKind::User(user) if user.revealed => {}
            AccountKind::User(_) => {
                return Err(ReplayError::invariant(
                    level,
                    format!("Account {id} registers as baker before revealing"),
                )
                .into())
            }
            _ => {
                return Err(
                    ReplayError::invariant(level, format!("Account {id} is not a user")).into(),
                )
            }
        }
        account.kind = AccountKind::Baker(data);
        self.bakers_mut()?.insert(id);
        Ok(())
    }

    /// Undo a registration.  Delegators and stakers are the only entities
    /// that point at a baker through their own rows, so both must be gone.
    pub fn demote_to_user(&mut self, id: AccountId) -> Result<BakerData> {
        let level = self.level;
        let account = self.account_mut(id)?;
        let Some(baker) = account.baker() else {
            return Err(ReplayError::invariant(level, format!("Account {id} is not a baker")).into());
        };
        if baker.delegators_count != 0 || baker.delegated_balance != 0 {
            return Err(ReplayError::invariant(
                level,
                format!("Baker {id} still has delegators"),
            )
            .into());
        }
        if baker.stakers_count != 0
            || baker.external_staked != 0
            || baker.external_unstaked != 0
            || baker.own_staked != 0
            || baker.own_unstaked != 0
        {
            return Err(ReplayError::invariant(level, format!("Baker {id} still holds stake")).into());
        }
        let kind = std::mem::replace(
            &mut account.kind,
            AccountKind::User(UserData { revealed: true }),
        );
        self.bakers_mut()?.remove(&id);
        match kind {
            AccountKind::Baker(data) => Ok(data),
            _ => Err(anyhow!("Account {id} changed kind while demoting")),
        }
    }

    fn bakers_mut(&mut self) -> Result<&mut imbl::OrdSet<AccountId>> {
        if self.cache.bakers.is_none() {
            let ids = self.store.bakers()?.into_iter().map(|b| b.id).collect();
            self.cache.bakers = Some(ids);
        }
        self.cache
            .bakers
            .as_mut()
            .ok_or_else(|| anyhow!("Baker set not loaded"))
    }

    /// Every baker id, in id order
    pub fn baker_ids(&mut self) -> Result<Vec<AccountId>> {
        Ok(self.bakers_mut()?.iter().copied().collect())
    }

    // -- Cycles -------------------------------------------------------------

    pub fn cycle(&mut self, index: CycleIndex) -> Result<Option<&Cycle>> {
        let store = self.store;
        self.cache.cycles.get_or_load(&index, || store.cycle(index))
    }

    pub fn required_cycle(&mut self, index: CycleIndex) -> Result<Cycle> {
        let level = self.level;
        self.cycle(index)?
            .cloned()
            .ok_or_else(|| ReplayError::invariant(level, format!("Unknown cycle {index}")).into())
    }

    pub fn put_cycle(&mut self, cycle: Cycle) {
        self.dirty_cycles.insert(cycle.index);
        self.cache.cycles.put(cycle.index, cycle);
    }

    pub fn delete_cycle(&mut self, index: CycleIndex) {
        self.dirty_cycles.insert(index);
        self.cache.cycles.remove(index);
    }

    pub fn baker_cycle(
        &mut self,
        cycle: CycleIndex,
        baker_id: AccountId,
    ) -> Result<Option<&BakerCycle>> {
        let store = self.store;
        self.cache
            .baker_cycles
            .get_or_load(&(cycle, baker_id), || store.baker_cycle(cycle, baker_id))
    }

    /// Mutable baker-cycle row, marked for writing; absent rows stay absent
    pub fn baker_cycle_mut(
        &mut self,
        cycle: CycleIndex,
        baker_id: AccountId,
    ) -> Result<Option<&mut BakerCycle>> {
        if self.baker_cycle(cycle, baker_id)?.is_none() {
            return Ok(None);
        }
        self.dirty_baker_cycles.insert((cycle, baker_id));
        Ok(self.cache.baker_cycles.get_mut(&(cycle, baker_id)))
    }

    pub fn put_baker_cycle(&mut self, row: BakerCycle) {
        let key = (row.cycle, row.baker_id);
        self.dirty_baker_cycles.insert(key);
        self.cache.baker_cycles.put(key, row);
    }

    /// Every baker-cycle row of `cycle`, in baker order
    pub fn baker_cycles(&mut self, cycle: CycleIndex) -> Result<Vec<BakerCycle>> {
        if !self.cache.loaded_baker_cycles.contains(&cycle) {
            for row in self.store.baker_cycles(cycle)? {
                self.cache.baker_cycles.seed((cycle, row.baker_id), row);
            }
            self.cache.loaded_baker_cycles.insert(cycle);
        }
        Ok(self
            .cache
            .baker_cycles
            .range((cycle, AccountId(i32::MIN))..=(cycle, AccountId(i32::MAX)))
            .map(|(_, row)| row.clone())
            .collect())
    }

    pub fn delete_baker_cycles(&mut self, cycle: CycleIndex) -> Result<()> {
        for row in self.baker_cycles(cycle)? {
            let key = (cycle, row.baker_id);
            self.cache.baker_cycles.remove(key);
            self.dirty_baker_cycles.remove(&key);
        }
        self.intents.push(RowChange::DeleteBakerCycles(cycle));
        Ok(())
    }

    // -- Rights -------------------------------------------------------------

    fn ensure_rights(&mut self, level: Level) -> Result<()> {
        if !self.rights.contains_key(&level) {
            let deleted = self.deleted_rights.iter().any(|(from, to)| level >= *from && level <= *to);
            let rows = if deleted {
                Vec::new()
            } else {
                self.store.rights(level)?
            };
            self.rights.insert(level, rows);
        }
        Ok(())
    }

    /// Rights of one level, baking first
    pub fn rights_at(&mut self, level: Level) -> Result<&[BakingRight]> {
        self.ensure_rights(level)?;
        Ok(self.rights.get(&level).map(Vec::as_slice).unwrap_or_default())
    }

    /// Mutable rights of one level; the whole level is rewritten on finish
    pub fn rights_at_mut(&mut self, level: Level) -> Result<&mut Vec<BakingRight>> {
        self.ensure_rights(level)?;
        self.dirty_rights.insert(level);
        self.rights
            .get_mut(&level)
            .ok_or_else(|| anyhow!("Rights of level {level} not loaded"))
    }

    pub fn delete_rights(&mut self, from: Level, to: Level) {
        self.rights.retain(|level, _| *level < from || *level > to);
        self.dirty_rights.retain(|level| *level < from || *level > to);
        self.deleted_rights.push((from, to));
        self.intents.push(RowChange::DeleteRights { from, to });
    }

    // -- Rows without a cache -----------------------------------------------

    pub fn next_operation_id(&mut self) -> OperationId {
        let id = self.cache.app_state.next_operation_id;
        self.cache.app_state.next_operation_id += 1;
        id
    }

    /// Give back the latest operation id
    pub fn release_operation_id(&mut self, id: OperationId) -> Result<()> {
        if id != self.cache.app_state.next_operation_id - 1 {
            return Err(self.invariant(format!("Operation {id} is not the latest allocated")));
        }
        self.cache.app_state.next_operation_id -= 1;
        Ok(())
    }

    pub fn put_operation(&mut self, op: Operation) {
        self.intents.push(RowChange::PutOperation(op));
    }

    /// Delete an operation row and give its id back
    pub fn delete_operation(&mut self, op: &Operation) -> Result<()> {
        self.release_operation_id(op.id)?;
        self.intents.push(RowChange::DeleteOperation {
            level: op.level,
            id: op.id,
        });
        Ok(())
    }

    pub fn put_block(&mut self, block: Block) {
        self.intents.push(RowChange::PutBlock(block));
    }

    pub fn delete_block(&mut self, level: Level) {
        self.intents.push(RowChange::DeleteBlock(level));
    }

    pub fn delete_snapshots(&mut self, from: Level, to: Level) {
        self.intents.push(RowChange::DeleteSnapshots { from, to });
    }

    pub fn put_statistics(&mut self, stats: Statistics) {
        self.intents.push(RowChange::PutStatistics(stats));
    }

    pub fn delete_statistics(&mut self, level: Level) {
        self.intents.push(RowChange::DeleteStatistics(level));
    }

    pub fn queue_bulk(&mut self, payload: BulkPayload) {
        self.bulk.push(payload);
    }

    /// Direct row intents first, then every dirty cached row, then the head
    pub fn finish(self) -> PendingWrites {
        let mut changes = self.intents;

        for id in &self.dirty_accounts {
            match self.cache.accounts.lookup(id) {
                Some(Some(account)) => changes.push(RowChange::PutAccount(account.clone())),
                _ => {
                    if let Some(address) = self.removed_accounts.get(id) {
                        changes.push(RowChange::DeleteAccount {
                            id: *id,
                            address: address.clone(),
                        });
                    }
                }
            }
        }
        for index in &self.dirty_cycles {
            match self.cache.cycles.lookup(index) {
                Some(Some(cycle)) => changes.push(RowChange::PutCycle(cycle.clone())),
                _ => changes.push(RowChange::DeleteCycle(*index)),
            }
        }
        for key in &self.dirty_baker_cycles {
            match self.cache.baker_cycles.lookup(key) {
                Some(Some(row)) => changes.push(RowChange::PutBakerCycle(row.clone())),
                _ => changes.push(RowChange::DeleteBakerCycle {
                    cycle: key.0,
                    baker_id: key.1,
                }),
            }
        }
        for level in &self.dirty_rights {
            changes.push(RowChange::DeleteRights {
                from: *level,
                to: *level,
            });
            if let Some(rows) = self.rights.get(level) {
                for right in rows {
                    changes.push(RowChange::PutRight(right.clone()));
                }
            }
        }
        changes.push(RowChange::PutAppState(self.cache.app_state.clone()));

        PendingWrites {
            changes,
            bulk: self.bulk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bakehouse_module_ledger_store::memory::InMemoryLedgerStore;

    fn user(ctx: &mut LedgerContext, address: &str, balance: Mutez) -> AccountId {
        let id = ctx.allocate_for_address(&Address::from(address), None).unwrap();
        ctx.change_balance(id, balance).unwrap();
        id
    }

    #[test]
    fn balance_changes_reach_the_delegate() {
        let store = InMemoryLedgerStore::new();
        let mut cache = LedgerCache::default();
        let mut ctx = LedgerContext::new(&store, &mut cache, 5);

        let baker = ctx
            .allocate_account(&Address::from("tz1baker"), AccountKind::Baker(BakerData::default()))
            .unwrap();
        let alice = user(&mut ctx, "tz1alice", 300);

        ctx.set_delegate(alice, Some(baker)).unwrap();
        ctx.change_balance(alice, 200).unwrap();
        ctx.change_balance(alice, -50).unwrap();
        let data = ctx.account(baker).unwrap().baker().unwrap().clone();
        assert_eq!(data.delegated_balance, 450);
        assert_eq!(data.delegators_count, 1);

        ctx.set_delegate(alice, None).unwrap();
        let data = ctx.account(baker).unwrap().baker().unwrap().clone();
        assert_eq!(data.delegated_balance, 0);
        assert_eq!(data.delegators_count, 0);
        assert!(ctx.change_balance(alice, -451).is_err());
    }

    #[test]
    fn promotion_requires_reveal_and_demotion_requires_no_delegators() {
        let store = InMemoryLedgerStore::new();
        let mut cache = LedgerCache::default();
        let mut ctx = LedgerContext::new(&store, &mut cache, 5);

        let bob = user(&mut ctx, "tz1bob", 1_000);
        assert!(ctx.promote_to_baker(bob, BakerData::default()).is_err());

        if let AccountKind::User(data) = &mut ctx.account_mut(bob).unwrap().kind {
            data.revealed = true;
        }
        ctx.promote_to_baker(bob, BakerData::default()).unwrap();
        ctx.set_delegate(bob, Some(bob)).unwrap();
        assert_eq!(ctx.baker_ids().unwrap(), vec![bob]);

        let carol = user(&mut ctx, "tz1carol", 70);
        ctx.set_delegate(carol, Some(bob)).unwrap();
        assert!(ctx.demote_to_user(bob).is_err());

        ctx.set_delegate(carol, None).unwrap();
        ctx.demote_to_user(bob).unwrap();
        let account = ctx.account(bob).unwrap();
        assert!(account.revealed());
        assert!(!account.is_baker());
        assert!(ctx.baker_ids().unwrap().is_empty());
    }

    #[test]
    fn only_the_latest_empty_account_can_be_removed() {
        let store = InMemoryLedgerStore::new();
        let mut cache = LedgerCache::default();
        let mut ctx = LedgerContext::new(&store, &mut cache, 5);

        let first = user(&mut ctx, "tz1first", 0);
        let second = user(&mut ctx, "tz1second", 10);
        assert!(ctx.remove_account(first).is_err());
        assert!(ctx.remove_account(second).is_err());

        ctx.change_balance(second, -10).unwrap();
        ctx.remove_account(second).unwrap();
        assert_eq!(ctx.account_by_address(&Address::from("tz1second")).unwrap(), None);
        assert_eq!(ctx.app_state().next_account_id, 1);

        let writes = ctx.finish();
        assert!(writes.changes.changes.iter().any(|c| matches!(
            c,
            RowChange::DeleteAccount { id, .. } if *id == second
        )));
    }

    #[test]
    fn finish_rewrites_dirty_right_levels() {
        let store = InMemoryLedgerStore::new();
        let mut cache = LedgerCache::default();
        let mut ctx = LedgerContext::new(&store, &mut cache, 5);

        ctx.rights_at_mut(4).unwrap().push(BakingRight {
            cycle: 0,
            level: 4,
            baker_id: AccountId(0),
            kind: bakehouse_common::RightKind::Baking,
            round: Some(0),
            slots: None,
            status: bakehouse_common::RightStatus::Realized,
        });
        let changes = ctx.finish().changes.changes;
        assert_eq!(changes[0], RowChange::DeleteRights { from: 4, to: 4 });
        assert!(matches!(changes[1], RowChange::PutRight(_)));
        assert!(matches!(changes.last(), Some(RowChange::PutAppState(_))));
    }
}
