//! Stake snapshots of every active baker, taken on snapshot levels

use anyhow::Result;
use tracing::debug;

use bakehouse_common::{BlockEvents, SnapshotBalance};
use bakehouse_module_ledger_store::bulk::encode_rows;

use super::{snapshot_of, BlockStep, CommitUnit};
use crate::context::LedgerContext;

pub struct SnapshotBalanceCommit;

impl CommitUnit for SnapshotBalanceCommit {
    fn name(&self) -> &'static str {
        "snapshot_balance"
    }

    fn apply(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        if !step.has_event(BlockEvents::BalanceSnapshot) {
            return Ok(());
        }
        let level = step.level();
        let mut rows: Vec<SnapshotBalance> = Vec::new();
        for id in ctx.baker_ids()? {
            let account = ctx.account(id)?;
            if account.staked {
                rows.extend(snapshot_of(account, level));
            }
        }
        debug!(level, bakers = rows.len(), "Took stake snapshot");
        ctx.queue_bulk(encode_rows(&rows)?);
        Ok(())
    }

    fn revert(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        if step.has_event(BlockEvents::BalanceSnapshot) {
            ctx.delete_snapshots(step.level(), step.level());
        }
        Ok(())
    }
}
