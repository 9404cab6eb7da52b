//! Running supply totals, one row per level

use anyhow::Result;

use bakehouse_common::{BlockEvents, Statistics};

use super::{BlockStep, CommitUnit};
use crate::context::LedgerContext;

pub struct StatisticsCommit;

impl CommitUnit for StatisticsCommit {
    fn name(&self) -> &'static str {
        "statistics"
    }

    fn apply(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        let previous = ctx.head_statistics().cloned().unwrap_or_default();
        let mut row = previous.next(step.level(), &ctx.stats);

        if step.has_event(BlockEvents::CycleEnd) {
            row.cycle = Some(step.cycle());
        }
        let day = step.block.timestamp.date_naive();
        let new_day = match ctx.app_state().timestamp {
            Some(head) => head.date_naive() != day,
            None => true,
        };
        if step.genesis || new_day {
            row.date = Some(day);
        }

        ctx.put_statistics(row.clone());
        ctx.set_head_statistics(Some(row));
        Ok(())
    }

    fn revert(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        let level = step.level();
        ctx.delete_statistics(level);
        let previous: Option<Statistics> = if step.genesis {
            None
        } else {
            ctx.store().statistics(level - 1)?
        };
        ctx.set_head_statistics(previous);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::{assert_reverted, block_hash, extend, setup, timestamp};
    use bakehouse_common::{protocol_params::ProtocolVersion, Level};
    use bakehouse_module_ledger_store::LedgerStore;

    #[test]
    fn first_block_of_each_day_and_last_of_each_cycle_are_marked() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 9);

        // Six hours per level: levels 4 and 8 open a day
        let rows: Vec<_> = (1..=9).map(|l| store.statistics(l).unwrap().unwrap()).collect();
        let days: Vec<Level> = rows.iter().filter(|r| r.date.is_some()).map(|r| r.level).collect();
        assert_eq!(days, vec![1, 4, 8]);
        assert_eq!(rows[3].date, Some(timestamp(4).date_naive()));
        let ends: Vec<Level> = rows.iter().filter(|r| r.cycle.is_some()).map(|r| r.level).collect();
        assert_eq!(ends, vec![8]);
        assert_eq!(rows[7].cycle, Some(0));

        // Level 10 shares the day of level 8 unless it comes a day late
        let before = store.snapshot().unwrap();
        let mut node = chain.next(store.as_ref(), 10, block_hash(9, "main"));
        node.header.timestamp = timestamp(10) + chrono::Duration::days(1);
        pipeline.apply_block(&node).unwrap();
        assert_eq!(
            store.statistics(10).unwrap().unwrap().date,
            Some(node.header.timestamp.date_naive())
        );

        pipeline.revert_head(&block_hash(10, "main")).unwrap();
        assert_reverted(&store, before, 10);
        assert_eq!(pipeline.head_statistics(), store.statistics(9).unwrap().as_ref());

        extend(&mut pipeline, &chain, 10);
        assert_eq!(store.statistics(10).unwrap().unwrap().date, None);
    }
}
