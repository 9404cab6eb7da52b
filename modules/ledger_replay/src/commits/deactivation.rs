//! Cycle-end deactivation of bakers that stopped participating

use anyhow::Result;
use tracing::info;

use bakehouse_common::{block::Deactivation, BlockEvents, ReplayError};

use super::{BlockStep, CommitUnit};
use crate::context::LedgerContext;

pub struct DeactivationCommit;

impl CommitUnit for DeactivationCommit {
    fn name(&self) -> &'static str {
        "deactivation"
    }

    fn apply(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        if step.genesis || !step.has_event(BlockEvents::CycleEnd) {
            return Ok(());
        }
        let level = step.level();
        let node = step.node()?;

        let mut deactivated = Vec::new();
        let mut addresses = Vec::new();
        for baker_id in ctx.baker_ids()? {
            let account = ctx.account(baker_id)?;
            let Some(baker) = account.baker() else {
                continue;
            };
            if account.staked && baker.deactivation_level <= level + 1 {
                deactivated.push(Deactivation {
                    baker_id,
                    prev_deactivation_level: baker.deactivation_level,
                });
                addresses.push(account.address.clone());
            }
        }

        let mut reported = node.metadata.deactivated.clone();
        reported.sort();
        addresses.sort();
        if reported != addresses {
            return Err(ReplayError::mismatch(
                level,
                format!("Node deactivated {reported:?}, computed {addresses:?}"),
            )
            .into());
        }

        for d in &deactivated {
            ctx.account_mut(d.baker_id)?.staked = false;
        }
        if !deactivated.is_empty() {
            info!(level, count = deactivated.len(), "Deactivated bakers");
            step.block.events |= BlockEvents::Deactivations;
        }
        step.block.deactivations = deactivated;
        Ok(())
    }

    fn revert(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        for d in step.block.deactivations.iter().rev() {
            ctx.account_mut(d.baker_id)?.staked = true;
            ctx.baker_mut(d.baker_id)?.deactivation_level = d.prev_deactivation_level;
        }
        Ok(())
    }
}
