use anyhow::Result;

use bakehouse_common::{
    math::{update_count_with_delta, update_value_with_delta},
    node::NodeContent,
    operations::FreezerCategory,
};

use super::{
    credit_reward, cross_check, minted_total, refresh_grace, restore_grace, spendable, BlockStep,
    CommitUnit,
};
use crate::context::LedgerContext;

const REWARD_CATEGORIES: &[&str] = &["baking rewards"];
const BONUS_CATEGORIES: &[&str] = &["baking bonuses"];

/// Producer and proposer bookkeeping: rewards, bonus, deposit and grace period
pub struct BlockCommit;

impl BlockCommit {
    fn count_block(ctx: &mut LedgerContext<'_>, step: &BlockStep<'_>, delta: i32) -> Result<()> {
        let producer = step.block.producer_id;
        let proposer = step.block.proposer_id;
        update_count_with_delta(&mut ctx.account_mut(producer)?.counts.blocks, delta)?;
        if proposer != producer {
            update_count_with_delta(&mut ctx.account_mut(proposer)?.counts.blocks, delta)?;
        }
        Ok(())
    }
}

impl CommitUnit for BlockCommit {
    fn name(&self) -> &'static str {
        "block"
    }

    fn apply(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        let node = step.node()?;
        let producer = ctx.required_account(&node.metadata.baker)?;
        let proposer = match &node.metadata.proposer {
            Some(address) => ctx.required_account(address)?,
            None => producer,
        };
        step.block.producer_id = producer;
        step.block.proposer_id = proposer;
        step.block.validations = node
            .contents()
            .filter_map(|(_, content)| match content {
                NodeContent::Endorsement(e) => Some(e.metadata.slots()),
                _ => None,
            })
            .sum();
        Self::count_block(ctx, step, 1)?;

        // The activation block carries no rewards
        if step.genesis {
            return Ok(());
        }

        let level = step.level();
        let formulas = *step.formulas();
        let constants = step.constants().clone();

        let reward_total = (formulas.block_reward)(&constants, step.block.payload_round);
        let bonus_total = (formulas.block_bonus)(&constants, step.block.validations);
        let updates = &node.metadata.balance_updates;
        cross_check(level, "Baking reward", minted_total(updates, REWARD_CATEGORIES), reward_total)?;
        cross_check(level, "Baking bonus", minted_total(updates, BONUS_CATEGORIES), bonus_total)?;

        let reward = (formulas.reward_split)(ctx.account(producer)?, reward_total, &constants)?;
        credit_reward(ctx, step.formulas(), producer, &reward, 1)?;
        let bonus = (formulas.reward_split)(ctx.account(proposer)?, bonus_total, &constants)?;
        credit_reward(ctx, step.formulas(), proposer, &bonus, 1)?;

        let wanted = (formulas.block_deposit)(&constants);
        let deposit = wanted.min(spendable(ctx.account(producer)?)).max(0);
        ctx.adjust_frozen(producer, FreezerCategory::Deposits, deposit)?;

        let cycle = step.cycle();
        if let Some(bc) = ctx.baker_cycle_mut(cycle, producer)? {
            bc.block_rewards.add(&reward);
            update_value_with_delta(&mut bc.block_deposits, deposit)?;
        }
        if let Some(bc) = ctx.baker_cycle_mut(cycle, proposer)? {
            bc.block_rewards.add(&bonus);
        }

        let grace = (formulas.deactivation_level)(step.params(), level);
        step.block.reset_producer_deactivation = refresh_grace(ctx, producer, grace)?;
        if proposer != producer {
            step.block.reset_proposer_deactivation = refresh_grace(ctx, proposer, grace)?;
        }

        step.block.reward = reward;
        step.block.bonus = bonus;
        step.block.deposit = deposit;
        Ok(())
    }

    fn revert(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        if !step.genesis {
            let producer = step.block.producer_id;
            let proposer = step.block.proposer_id;
            let reward = step.block.reward;
            let bonus = step.block.bonus;
            let deposit = step.block.deposit;

            if proposer != producer {
                restore_grace(ctx, proposer, step.block.reset_proposer_deactivation)?;
            }
            restore_grace(ctx, producer, step.block.reset_producer_deactivation)?;

            let cycle = step.cycle();
            if let Some(bc) = ctx.baker_cycle_mut(cycle, proposer)? {
                bc.block_rewards.sub(&bonus);
            }
            if let Some(bc) = ctx.baker_cycle_mut(cycle, producer)? {
                bc.block_rewards.sub(&reward);
                update_value_with_delta(&mut bc.block_deposits, -deposit)?;
            }

            ctx.adjust_frozen(producer, FreezerCategory::Deposits, -deposit)?;
            credit_reward(ctx, step.formulas(), proposer, &bonus, -1)?;
            credit_reward(ctx, step.formulas(), producer, &reward, -1)?;
        }
        Self::count_block(ctx, step, -1)
    }
}
