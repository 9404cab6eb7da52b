//! Block pipeline driver
//!
//! One block is one unit of work: every commit unit of the block's protocol
//! runs against a fresh [`LedgerContext`], and the resulting bulk payloads
//! and row changes are written before the head moves.  A failure anywhere
//! before the write restores the cache checkpoint, so the head never shows
//! a partially applied block.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context as _, Result};
use tracing::{debug, info, warn};

use bakehouse_common::{
    node::NodeBlock, Account, AccountId, AppState, Block, BlockEvents, BlockHash, CycleIndex,
    Level, Mutez, OperationKinds, ReplayError, RewardSplit, Seed, Statistics,
};
use bakehouse_module_ledger_store::{ChangeSet, LedgerStore, RowChange};

use crate::{
    commits::BlockStep,
    context::LedgerContext,
    ledger_cache::LedgerCache,
    protocols::{ProtocolHandler, ProtocolRegistry},
};

/// Driver settings, fixed for the lifetime of a pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Deepest revert allowed below the highest level ever applied
    pub max_reorg_depth: i32,

    pub initial_seed: Seed,

    /// Recompute the conservation law after every block
    pub check_supply: bool,

    /// Cached accounts kept between blocks
    pub cache_max_accounts: usize,
}

/// Summary of one applied block
#[derive(Debug, Clone, PartialEq)]
pub struct BlockOutcome {
    pub level: Level,
    pub hash: BlockHash,
    pub cycle: CycleIndex,
    pub protocol_code: i32,
    pub events: BlockEvents,
    pub operations: usize,
    pub statistics: Option<Statistics>,
}

pub struct Pipeline {
    store: Arc<dyn LedgerStore>,
    registry: ProtocolRegistry,
    settings: PipelineSettings,
    cache: LedgerCache,
}

impl Pipeline {
    /// Pipeline resuming from whatever head the store holds
    pub fn new(
        store: Arc<dyn LedgerStore>,
        registry: ProtocolRegistry,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let cache = LedgerCache::load(store.as_ref())?;
        if !cache.app_state.is_empty() {
            info!(level = cache.app_state.level, "Resuming from stored head");
        }
        Ok(Self {
            store,
            registry,
            settings,
            cache,
        })
    }

    pub fn head(&self) -> &AppState {
        &self.cache.app_state
    }

    pub fn head_statistics(&self) -> Option<&Statistics> {
        self.cache.head_statistics.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Apply the block extending the current head
    pub fn apply_block(&mut self, node: &NodeBlock) -> Result<BlockOutcome> {
        let checkpoint = self.cache.checkpoint();
        let outcome = match self.try_apply(node) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.cache = checkpoint;
                return Err(e);
            }
        };

        self.purge_final_snapshots(outcome.protocol_code)?;
        self.cache.trim(self.settings.cache_max_accounts);
        Ok(outcome)
    }

    fn try_apply(&mut self, node: &NodeBlock) -> Result<BlockOutcome> {
        let level = node.level();
        let head = self.cache.app_state.clone();
        let genesis = head.is_empty();
        if !genesis
            && (level != head.level + 1 || head.hash.as_ref() != Some(&node.header.predecessor))
        {
            return Err(ReplayError::NotNext {
                level,
                head_level: head.level,
            }
            .into());
        }

        let handler = self.registry.resolve(&node.protocol)?;
        let block = Self::new_block(&handler, &head, node, genesis)?;
        let cycle = block.cycle;
        if block.events.contains(BlockEvents::ProtocolBegin) {
            info!(level, protocol = %node.protocol, version = ?handler.version(), "Protocol begins");
        }

        let store = self.store.clone();
        let mut ctx = LedgerContext::new(store.as_ref(), &mut self.cache, level);
        let mut step = BlockStep {
            handler: &handler,
            node: Some(node),
            block,
            operations: Vec::new(),
            genesis,
            initial_seed: self.settings.initial_seed,
            new_cycles: Vec::new(),
            future_rights: Vec::new(),
        };
        for unit in &handler.strategy.units {
            unit.apply(&mut ctx, &mut step)
                .with_context(|| format!("Applying {} at level {level}", unit.name()))?;
        }

        let operations = step.operations.len();
        let block = step.block;
        let events = block.events;
        ctx.put_block(block);
        {
            let state = ctx.app_state_mut();
            state.level = level;
            state.hash = Some(node.hash.clone());
            state.timestamp = Some(node.header.timestamp);
            state.cycle = cycle;
            state.protocol_code = handler.params.code;
            state.next_protocol = Some(node.metadata.next_protocol.clone());
            state.highest_applied = state.highest_applied.max(level);
        }
        let statistics = ctx.head_statistics().cloned();
        let writes = ctx.finish();
        if self.settings.check_supply {
            self.check_supply(level, statistics.as_ref(), &writes.changes)?;
        }

        let mut loaded = 0;
        for payload in &writes.bulk {
            loaded += self.store.bulk_load(payload)?;
        }
        let changes = writes.changes.len();
        self.store.commit(writes.changes)?;

        if events.contains(BlockEvents::CycleBegin) {
            info!(level, cycle, "Cycle begins");
        }
        debug!(level, operations, changes, bulk_rows = loaded, "Applied block");
        Ok(BlockOutcome {
            level,
            hash: node.hash.clone(),
            cycle,
            protocol_code: handler.params.code,
            events,
            operations,
            statistics,
        })
    }

    /// Block row as known before any unit ran
    fn new_block(
        handler: &ProtocolHandler,
        head: &AppState,
        node: &NodeBlock,
        genesis: bool,
    ) -> Result<Block> {
        let level = node.level();
        let params = &handler.params;
        if level < params.first_level {
            return Err(ReplayError::malformed(
                level,
                format!("Protocol {} starts at level {}", params.hash, params.first_level),
            )
            .into());
        }

        let cycle = params.cycle_of(level);
        if node.metadata.level_info.cycle != cycle {
            return Err(ReplayError::mismatch(
                level,
                format!("Node places level in cycle {}, computed {cycle}", node.metadata.level_info.cycle),
            )
            .into());
        }

        let payload_round = match node.header.round() {
            Some(round) => round,
            None if genesis => 0,
            None => return Err(ReplayError::malformed(level, "Header carries no round").into()),
        };

        let mut events = BlockEvents::none();
        if params.is_cycle_start(level) {
            events |= BlockEvents::CycleBegin;
        }
        if params.is_cycle_end(level) {
            events |= BlockEvents::CycleEnd;
        }
        if params.is_snapshot_level(level) {
            events |= BlockEvents::BalanceSnapshot;
        }
        if genesis || head.protocol_code != params.code {
            events |= BlockEvents::ProtocolBegin;
        }
        if node.metadata.next_protocol != node.protocol {
            events |= BlockEvents::ProtocolEnd;
        }

        Ok(Block {
            level,
            hash: node.hash.clone(),
            predecessor: node.header.predecessor.clone(),
            protocol_code: params.code,
            timestamp: node.header.timestamp,
            cycle,
            payload_round,
            producer_id: AccountId::default(),
            proposer_id: AccountId::default(),
            events,
            operations: OperationKinds::none(),
            validations: 0,
            reward: RewardSplit::default(),
            bonus: RewardSplit::default(),
            fees: 0,
            deposit: 0,
            reset_producer_deactivation: None,
            reset_proposer_deactivation: None,
            deactivations: Vec::new(),
        })
    }

    /// Revert the current head, which must be `hash`
    pub fn revert_head(&mut self, hash: &BlockHash) -> Result<()> {
        let head = self.cache.app_state.clone();
        let Some(head_hash) = head.hash.clone().filter(|h| h == hash) else {
            return Err(ReplayError::NotHead {
                level: head.level,
                hash: hash.clone(),
                head_level: head.level,
                head_hash: head.hash.unwrap_or_default(),
            }
            .into());
        };
        let depth = self.settings.max_reorg_depth;
        if head.level <= head.highest_applied - depth {
            return Err(ReplayError::ReorgTooDeep {
                level: head.level,
                highest: head.highest_applied,
                depth,
            }
            .into());
        }

        let checkpoint = self.cache.checkpoint();
        if let Err(e) = self.try_revert(&head) {
            self.cache = checkpoint;
            return Err(e);
        }
        info!(level = head.level, hash = %head_hash, "Reverted block");
        Ok(())
    }

    fn try_revert(&mut self, head: &AppState) -> Result<()> {
        let level = head.level;
        let block = self
            .store
            .block(level)?
            .ok_or_else(|| ReplayError::invariant(level, "Head block row is missing"))?;
        let handler = self.registry.by_code(block.protocol_code)?;
        let previous = self.store.block(level - 1)?;
        let operations = self.store.operations(level)?;

        let store = self.store.clone();
        let mut ctx = LedgerContext::new(store.as_ref(), &mut self.cache, level);
        let mut step = BlockStep {
            handler: &handler,
            node: None,
            block,
            operations,
            genesis: previous.is_none(),
            initial_seed: self.settings.initial_seed,
            new_cycles: Vec::new(),
            future_rights: Vec::new(),
        };
        for unit in handler.strategy.units.iter().rev() {
            unit.revert(&mut ctx, &mut step)
                .with_context(|| format!("Reverting {} at level {level}", unit.name()))?;
        }

        ctx.delete_block(level);
        {
            let state = ctx.app_state_mut();
            match &previous {
                Some(prev) => {
                    state.level = prev.level;
                    state.hash = Some(prev.hash.clone());
                    state.timestamp = Some(prev.timestamp);
                    state.cycle = prev.cycle;
                    state.protocol_code = prev.protocol_code;
                    state.next_protocol = Some(handler.params.hash.clone());
                }
                None => {
                    state.level = 0;
                    state.hash = None;
                    state.timestamp = None;
                    state.cycle = 0;
                    state.protocol_code = 0;
                    state.next_protocol = None;
                }
            }
        }
        let writes = ctx.finish();
        self.store.commit(writes.changes)
    }

    /// Revert heads until the ledger stands on (`level`, `hash`)
    pub fn rollback_to(&mut self, level: Level, hash: &BlockHash) -> Result<usize> {
        let mut reverted = 0;
        while self.cache.app_state.level > level {
            let Some(head) = self.cache.app_state.hash.clone() else {
                break;
            };
            self.revert_head(&head)?;
            reverted += 1;
        }
        let head = &self.cache.app_state;
        if head.level != level || head.hash.as_ref() != Some(hash) {
            return Err(ReplayError::NotHead {
                level,
                hash: hash.clone(),
                head_level: head.level,
                head_hash: head.hash.clone().unwrap_or_default(),
            }
            .into());
        }
        if reverted > 0 {
            info!(level, reverted, "Rolled back");
        }
        Ok(reverted)
    }

    /// Snapshots of a cycle are only read by the rollover at the start of
    /// the next one; drop them once that rollover can no longer be reverted
    fn purge_final_snapshots(&mut self, protocol_code: i32) -> Result<()> {
        let handler = self.registry.by_code(protocol_code)?;
        let params = &handler.params;
        let final_level = self.cache.app_state.highest_applied - self.settings.max_reorg_depth;
        if final_level < params.first_cycle_level || !params.is_cycle_start(final_level) {
            return Ok(());
        }
        let cycle = params.cycle_of(final_level) - 1;
        let mut changes = ChangeSet::default();
        changes.push(RowChange::DeleteSnapshots {
            from: params.first_level_of(cycle),
            to: params.last_level_of(cycle),
        });
        debug!(cycle, "Purging final snapshots");
        self.store.commit(changes)
    }

    /// Conservation law over the stored ledger as it stands once `changes` land
    fn check_supply(
        &self,
        level: Level,
        statistics: Option<&Statistics>,
        changes: &ChangeSet,
    ) -> Result<()> {
        let Some(statistics) = statistics else {
            return Ok(());
        };
        let mut accounts: BTreeMap<AccountId, Account> =
            self.store.accounts()?.into_iter().map(|a| (a.id, a)).collect();
        for change in &changes.changes {
            match change {
                RowChange::PutAccount(account) => {
                    accounts.insert(account.id, account.clone());
                }
                RowChange::DeleteAccount { id, .. } => {
                    accounts.remove(id);
                }
                _ => {}
            }
        }
        let accounts: Vec<Account> = accounts.into_values().collect();
        let held = ledger_supply(&accounts);
        let expected = statistics.circulating();
        if held != expected {
            warn!(level, held, expected, "Supply check failed");
            return Err(ReplayError::invariant(
                level,
                format!("Ledger would hold {held}, statistics expect {expected}"),
            )
            .into());
        }
        Ok(())
    }
}

/// Everything accounts hold, bonds and external stake included; the null
/// address only receives what is banished
pub fn ledger_supply(accounts: &[Account]) -> Mutez {
    accounts
        .iter()
        .filter(|a| !a.address.is_null())
        .map(|a| a.balance + a.held_outside_balance())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        block_hash, extend, replay_error, settings, setup, test_params, ChainBuilder, BAKERS,
        DELEGATOR,
    };
    use bakehouse_common::{
        node::{BalanceKind, BalanceUpdate},
        protocol_params::ProtocolVersion,
        AccountKind, Address, BakerData, BakingRight, RightKind, RightStatus, NULL_ADDRESS,
    };
    use bakehouse_module_ledger_store::{fjall::FjallLedgerStore, memory::InMemoryLedgerStore};

    #[test]
    fn boundary_events_follow_the_cycle_layout() {
        let (_, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        let outcomes = extend(&mut pipeline, &chain, 9);

        assert_eq!(
            outcomes[0].events,
            BlockEvents::CycleBegin | BlockEvents::ProtocolBegin
        );
        assert_eq!(outcomes[3].events, BlockEvents::BalanceSnapshot);
        assert_eq!(
            outcomes[7].events,
            BlockEvents::CycleEnd | BlockEvents::BalanceSnapshot
        );
        assert_eq!(outcomes[8].events, BlockEvents::CycleBegin);
        assert_eq!(outcomes[8].cycle, 1);
        assert_eq!(pipeline.head().cycle, 1);
    }

    #[test]
    fn apply_then_revert_restores_every_table() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 14);
        let before = store.snapshot().unwrap();

        // Crosses a cycle end and the rollover of the next cycle
        extend(&mut pipeline, &chain, 18);
        assert_eq!(pipeline.rollback_to(14, &block_hash(14, "main")).unwrap(), 4);

        let mut expected = before;
        if let Some(state) = expected.app_state.as_mut() {
            state.highest_applied = 18;
        }
        assert_eq!(store.snapshot().unwrap(), expected);
    }

    #[test]
    fn supply_is_conserved_for_every_family() {
        for version in [
            ProtocolVersion::Rolls,
            ProtocolVersion::Tenderbake,
            ProtocolVersion::Staking,
        ] {
            let (store, mut pipeline, chain) = setup(version, 100);
            extend(&mut pipeline, &chain, 20);
            let circulating = pipeline.head_statistics().unwrap().circulating();
            assert_eq!(ledger_supply(&store.accounts().unwrap()), circulating, "{version:?}");
            assert!(circulating > 3_250_000, "{version:?}");
        }
    }

    #[test]
    fn cycle_end_pays_the_expected_endorsing_rewards() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 15);

        // Level 8 is endorsed in cycle 1, level 16 in cycle 2
        let rows = store.baker_cycles(1).unwrap();
        let expected: Vec<Mutez> = rows.iter().map(|r| r.future_endorsement_rewards).collect();
        assert_eq!(expected.iter().sum::<Mutez>(), 8 * 8 * 10);

        extend(&mut pipeline, &chain, 16);
        let rows = store.baker_cycles(1).unwrap();
        for (row, expected) in rows.iter().zip(expected) {
            assert_eq!(row.future_endorsement_rewards, 0);
            assert_eq!(row.endorsement_rewards.total(), expected);
            assert_eq!(row.future_endorsements, 0);
        }
        assert_eq!(rows.iter().map(|r| r.endorsements).sum::<i32>(), 8 * 8);
    }

    #[test]
    fn lost_endorsing_rewards_are_missed_not_paid() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 15);

        let rows = store.baker_cycles(1).unwrap();
        let loser = rows
            .iter()
            .max_by_key(|r| r.future_endorsement_rewards)
            .cloned()
            .unwrap();
        let expected = loser.future_endorsement_rewards;
        assert!(expected > 0);
        let address = store.account(loser.baker_id).unwrap().unwrap().address;
        let balance = store.account(loser.baker_id).unwrap().unwrap().balance;

        let mut node = chain.next(store.as_ref(), 16, block_hash(15, "main"));
        node.metadata.balance_updates.push(BalanceUpdate {
            kind: BalanceKind::Burned,
            category: Some("lost endorsing rewards".to_string()),
            contract: None,
            delegate: Some(address),
            staker: None,
            cycle: Some(1),
            change: expected,
            origin: None,
        });
        pipeline.apply_block(&node).unwrap();

        let row = store.baker_cycle(1, loser.baker_id).unwrap().unwrap();
        assert_eq!(row.future_endorsement_rewards, 0);
        assert_eq!(row.missed_endorsement_rewards, expected);
        assert_eq!(row.endorsement_rewards, RewardSplit::default());
        let others: Mutez = store
            .baker_cycles(1)
            .unwrap()
            .iter()
            .map(|r| r.endorsement_rewards.total())
            .sum();
        assert_eq!(others, 8 * 8 * 10 - expected);

        // Both outcomes go back to the expected amount
        pipeline.revert_head(&block_hash(16, "main")).unwrap();
        let row = store.baker_cycle(1, loser.baker_id).unwrap().unwrap();
        assert_eq!(row.future_endorsement_rewards, expected);
        assert_eq!(row.missed_endorsement_rewards, 0);
        assert_eq!(store.account(loser.baker_id).unwrap().unwrap().balance, balance);
    }

    #[test]
    fn partial_loss_of_endorsing_rewards_is_fatal() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 15);
        let row = store
            .baker_cycles(1)
            .unwrap()
            .into_iter()
            .max_by_key(|r| r.future_endorsement_rewards)
            .unwrap();
        let address = store.account(row.baker_id).unwrap().unwrap().address;

        let mut node = chain.next(store.as_ref(), 16, block_hash(15, "main"));
        node.metadata.balance_updates.push(BalanceUpdate {
            kind: BalanceKind::Burned,
            category: Some("lost attesting rewards".to_string()),
            contract: None,
            delegate: Some(address),
            staker: None,
            cycle: Some(1),
            change: row.future_endorsement_rewards - 1,
            origin: None,
        });
        let e = pipeline.apply_block(&node).unwrap_err();
        assert!(matches!(
            replay_error(&e),
            ReplayError::InvariantViolation { level: 16, .. }
        ));
        assert_eq!(pipeline.head().level, 15);
    }

    #[test]
    fn lost_rewards_without_an_expectation_are_fatal() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 15);
        let before = store.snapshot().unwrap();

        // The delegator never bakes, so nothing was expected from it
        let mut node = chain.next(store.as_ref(), 16, block_hash(15, "main"));
        node.metadata.balance_updates.push(BalanceUpdate {
            kind: BalanceKind::Burned,
            category: Some("lost endorsing rewards".to_string()),
            contract: None,
            delegate: Some(Address::from(DELEGATOR)),
            staker: None,
            cycle: Some(1),
            change: 10,
            origin: None,
        });
        let e = pipeline.apply_block(&node).unwrap_err();
        assert!(matches!(
            replay_error(&e),
            ReplayError::InvariantViolation { level: 16, .. }
        ));
        assert_eq!(store.snapshot().unwrap(), before);
    }

    #[test]
    fn last_level_endorsements_count_towards_the_next_cycle() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 1);

        let slots_of = |from: Level, to: Level, baker: AccountId| -> i32 {
            (from..=to)
                .flat_map(|level| store.rights(level).unwrap())
                .filter(|r| r.kind == RightKind::Endorsing && r.baker_id == baker)
                .map(|r| r.slots.unwrap_or_default())
                .sum()
        };

        // Cycle 1 spans 9..=16 but is endorsed from 8 to 15
        let rows = store.baker_cycles(1).unwrap();
        assert!(!rows.is_empty());
        for row in &rows {
            assert_eq!(row.future_endorsements, slots_of(8, 15, row.baker_id));
        }
        let total: i32 = rows.iter().map(|r| r.future_endorsements).sum();
        assert_eq!(total, 8 * 8);

        // Level 8 belongs to cycle 0 yet none of its slots count there
        let level_8: i32 = store
            .rights(8)
            .unwrap()
            .iter()
            .filter(|r| r.kind == RightKind::Endorsing)
            .map(|r| r.slots.unwrap_or_default())
            .sum();
        assert_eq!(level_8, 8);
        assert!(store.rights(8).unwrap().iter().all(|r| r.cycle == 0));
        let cycle_0: i32 = store
            .baker_cycles(0)
            .unwrap()
            .iter()
            .map(|r| r.future_endorsements)
            .sum();
        // The genesis level carries no rights, so cycle 0 is endorsed from 2 to 7
        assert!(store.rights(1).unwrap().is_empty());
        assert_eq!(cycle_0, 6 * 8);

        // What cycle 1 holds beyond its own levels is exactly level 8
        let own: i32 = rows.iter().map(|r| slots_of(9, 15, r.baker_id)).sum();
        assert_eq!(total - own, level_8);
        for right in store.rights(8).unwrap().iter().filter(|r| r.kind == RightKind::Endorsing) {
            let row = rows.iter().find(|r| r.baker_id == right.baker_id).unwrap();
            assert!(row.future_endorsements >= right.slots.unwrap_or_default());
        }
    }

    #[test]
    fn one_baking_right_is_realized_per_level() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 1);

        // Bake one block at a later round so earlier rounds get missed
        let mut late = None;
        for level in 2..=12 {
            let later_round = store
                .rights(level)
                .unwrap()
                .into_iter()
                .find(|r| r.kind == RightKind::Baking && r.round.is_some_and(|round| round > 0));
            match later_round {
                Some(right) if late.is_none() => {
                    let mut node = chain.next(store.as_ref(), level, block_hash(level - 1, "main"));
                    node.metadata.baker = store.account(right.baker_id).unwrap().unwrap().address;
                    node.header.payload_round = right.round;
                    pipeline.apply_block(&node).unwrap();
                    late = Some(level);
                }
                _ => {
                    extend(&mut pipeline, &chain, level);
                }
            }
        }
        let late = late.unwrap();

        for level in 2..=12 {
            let block = store.block(level).unwrap().unwrap();
            let baking: Vec<BakingRight> = store
                .rights(level)
                .unwrap()
                .into_iter()
                .filter(|r| r.kind == RightKind::Baking)
                .collect();
            let realized: Vec<&BakingRight> = baking
                .iter()
                .filter(|r| r.status == RightStatus::Realized)
                .collect();
            assert_eq!(realized.len(), 1, "level {level}");
            assert_eq!(realized[0].baker_id, block.producer_id, "level {level}");
            assert!(baking
                .iter()
                .filter(|r| r.status != RightStatus::Realized)
                .all(|r| matches!(r.status, RightStatus::Missed | RightStatus::Uncovered)));
        }

        let missed = store
            .rights(late)
            .unwrap()
            .iter()
            .filter(|r| r.kind == RightKind::Baking && r.status == RightStatus::Missed)
            .count();
        assert!(missed >= 1);
    }

    #[test]
    fn blocks_must_extend_the_head() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 3);

        let skipped = chain.next(store.as_ref(), 5, block_hash(3, "main"));
        let e = pipeline.apply_block(&skipped).unwrap_err();
        assert_eq!(
            replay_error(&e),
            &ReplayError::NotNext {
                level: 5,
                head_level: 3
            }
        );

        let orphan = chain.next(store.as_ref(), 4, block_hash(3, "fork"));
        assert!(pipeline.apply_block(&orphan).is_err());
        assert_eq!(pipeline.head().level, 3);
    }

    #[test]
    fn failed_block_leaves_ledger_untouched() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 5);
        let before = store.snapshot().unwrap();

        let mut node = chain.next(store.as_ref(), 6, block_hash(5, "main"));
        let impostor = BAKERS
            .iter()
            .map(|a| Address::from(*a))
            .find(|a| *a != node.metadata.baker)
            .unwrap();
        node.metadata.baker = impostor;
        let e = pipeline.apply_block(&node).unwrap_err();
        assert!(matches!(
            replay_error(&e),
            ReplayError::DeterminismMismatch { level: 6, .. }
        ));
        assert_eq!(pipeline.head().level, 5);
        assert_eq!(store.snapshot().unwrap(), before);

        // The cache was restored too: the honest block still balances
        extend(&mut pipeline, &chain, 6);
        assert_eq!(pipeline.head().hash, Some(block_hash(6, "main")));
    }

    #[test]
    fn supply_mismatch_keeps_the_block_out_of_the_store() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 5);

        // A stray mutez the statistics know nothing about
        let id = store.account_id(&Address::from(DELEGATOR)).unwrap().unwrap();
        let mut delegator = store.account(id).unwrap().unwrap();
        delegator.balance += 1;
        let mut changes = ChangeSet::default();
        changes.push(RowChange::PutAccount(delegator));
        store.commit(changes).unwrap();
        let before = store.snapshot().unwrap();

        let node = chain.next(store.as_ref(), 6, block_hash(5, "main"));
        let e = pipeline.apply_block(&node).unwrap_err();
        assert!(matches!(
            replay_error(&e),
            ReplayError::InvariantViolation { level: 6, .. }
        ));
        assert_eq!(pipeline.head().level, 5);
        assert_eq!(store.snapshot().unwrap(), before);
        assert!(store.block(6).unwrap().is_none());
    }

    #[test]
    fn reverts_need_the_head_and_stay_within_depth() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 2);
        extend(&mut pipeline, &chain, 6);
        let before = store.snapshot().unwrap();

        let e = pipeline.revert_head(&block_hash(5, "main")).unwrap_err();
        assert!(matches!(replay_error(&e), ReplayError::NotHead { level: 6, .. }));
        assert_eq!(pipeline.head().level, 6);
        assert_eq!(store.snapshot().unwrap(), before);

        pipeline.revert_head(&block_hash(6, "main")).unwrap();
        pipeline.revert_head(&block_hash(5, "main")).unwrap();
        let before = store.snapshot().unwrap();
        let e = pipeline.revert_head(&block_hash(4, "main")).unwrap_err();
        assert_eq!(
            replay_error(&e),
            &ReplayError::ReorgTooDeep {
                level: 4,
                highest: 6,
                depth: 2
            }
        );
        assert_eq!(pipeline.head().level, 4);
        assert_eq!(store.snapshot().unwrap(), before);

        // The cache was not touched either: the head still extends
        extend(&mut pipeline, &chain, 7);
        assert_eq!(pipeline.head().hash, Some(block_hash(7, "main")));
    }

    #[test]
    fn rollback_then_follow_another_branch() {
        let (store, mut pipeline, mut chain) = setup(ProtocolVersion::Staking, 100);
        extend(&mut pipeline, &chain, 10);

        assert_eq!(pipeline.rollback_to(8, &block_hash(8, "main")).unwrap(), 2);

        // Reverts down to the level, then finds a different block there
        let e = pipeline.rollback_to(7, &block_hash(7, "fork")).unwrap_err();
        assert!(matches!(replay_error(&e), ReplayError::NotHead { level: 7, .. }));
        assert_eq!(pipeline.rollback_to(7, &block_hash(7, "main")).unwrap(), 0);

        chain.branch = "fork".to_string();
        extend(&mut pipeline, &chain, 12);
        assert_eq!(pipeline.head().hash, Some(block_hash(12, "fork")));
        assert!(store.block(8).unwrap().is_some_and(|b| b.hash == block_hash(8, "fork")));
    }

    #[test]
    fn reverting_the_first_block_empties_the_ledger() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 1);
        assert_eq!(store.snapshot().unwrap().cycles.len(), 3);

        pipeline.revert_head(&block_hash(1, "main")).unwrap();
        let tables = store.snapshot().unwrap();
        assert!(tables.accounts.is_empty());
        assert!(tables.account_ids.is_empty());
        assert!(tables.cycles.is_empty());
        assert!(tables.baker_cycles.is_empty());
        assert!(tables.rights.is_empty());
        assert!(tables.operations.is_empty());
        assert!(tables.statistics.is_empty());
        assert_eq!(
            tables.app_state,
            Some(AppState {
                highest_applied: 1,
                ..Default::default()
            })
        );
        assert!(pipeline.head().is_empty());
    }

    #[test]
    fn snapshots_are_purged_once_their_rollover_is_final() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 3);
        extend(&mut pipeline, &chain, 19);
        assert!(!store.snapshots(12).unwrap().is_empty());

        // Level 17 drew cycle 4 from the snapshots of cycle 1
        extend(&mut pipeline, &chain, 20);
        assert!(store.snapshots(8).unwrap().is_empty());
        assert!(store.snapshots(12).unwrap().is_empty());
        assert!(store.snapshots(16).unwrap().is_empty());
        assert_eq!(store.snapshots(20).unwrap().len(), BAKERS.len());
        assert!(store.cycle(4).unwrap().is_some_and(|c| c.snapshot_level.is_some()));
    }

    #[test]
    fn supply_ignores_the_null_address() {
        let mut burn = Account::new_user(AccountId(1), Address::from(NULL_ADDRESS), 1);
        burn.balance = 500;
        let mut baker = Account::new(
            AccountId(2),
            Address::from("tz1baker"),
            1,
            AccountKind::Baker(BakerData {
                external_staked: 40,
                ..Default::default()
            }),
        );
        baker.balance = 1_000;
        baker.rollup_bonds = 7;
        assert_eq!(ledger_supply(&[burn, baker]), 1_047);
    }

    #[test]
    fn replay_resumes_from_a_reopened_store() {
        let dir = tempfile::tempdir().unwrap();
        let params = test_params(ProtocolVersion::Tenderbake);
        let chain = ChainBuilder::new(params.clone());
        let open = |clear: bool| {
            let config = config::Config::builder()
                .set_default("database-path", dir.path().to_str().unwrap())
                .unwrap()
                .set_default("clear-on-start", clear)
                .unwrap()
                .build()
                .unwrap();
            let store: Arc<dyn LedgerStore> =
                Arc::new(FjallLedgerStore::new(Arc::new(config)).unwrap());
            let registry = ProtocolRegistry::new(std::slice::from_ref(&params));
            Pipeline::new(store, registry, settings(100)).unwrap()
        };

        let statistics = {
            let mut pipeline = open(true);
            extend(&mut pipeline, &chain, 10);
            pipeline.head_statistics().cloned()
        };

        // Rights of cycle 1 were bulk loaded before the restart
        let mut pipeline = open(false);
        assert_eq!(pipeline.head().level, 10);
        assert_eq!(pipeline.head_statistics().cloned(), statistics);
        extend(&mut pipeline, &chain, 18);
        assert_eq!(pipeline.head().hash, Some(block_hash(18, "main")));
        assert_eq!(pipeline.head().cycle, 2);
    }
}
