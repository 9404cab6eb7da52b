//! Operations included in a block, applied in on-chain order

mod activation;
mod consensus;
mod delegation;
mod evidence;
mod manager;
mod nonce_revelation;
mod staking;

use anyhow::Result;

use bakehouse_common::{
    math::update_count_with_delta,
    node::NodeContent,
    operations::{Operation, OperationBody},
    AccountId, OperationCounts,
};

use super::{BlockStep, CommitUnit};
use crate::context::LedgerContext;

type CountField = fn(&mut OperationCounts) -> &mut i32;

pub struct OperationsCommit;

impl CommitUnit for OperationsCommit {
    fn name(&self) -> &'static str {
        "operations"
    }

    fn apply(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        let node = step.node()?;
        for (hash, content) in node.contents() {
            match content {
                NodeContent::Endorsement(c) => consensus::apply_endorsement(ctx, step, hash, c)?,
                NodeContent::Preendorsement(c) => {
                    consensus::apply_preendorsement(ctx, step, hash, c)?
                }
                NodeContent::SeedNonceRevelation(c) => nonce_revelation::apply(ctx, step, hash, c)?,
                NodeContent::DoubleBakingEvidence(c) => evidence::apply(
                    ctx,
                    step,
                    hash,
                    evidence::Misbehaviour::DoubleBaking,
                    c.bh1.level,
                    &c.metadata,
                )?,
                NodeContent::DoubleEndorsementEvidence(c) => evidence::apply(
                    ctx,
                    step,
                    hash,
                    evidence::Misbehaviour::DoubleEndorsing,
                    c.op1.operations.level,
                    &c.metadata,
                )?,
                NodeContent::ActivateAccount(c) => activation::apply(ctx, step, hash, c)?,
                NodeContent::Unsupported => {}
                other => manager::apply(ctx, step, hash, other)?,
            }
        }
        Ok(())
    }

    fn revert(&self, ctx: &mut LedgerContext<'_>, step: &mut BlockStep<'_>) -> Result<()> {
        for op in step.operations_rev(is_block_operation) {
            match &op.body {
                OperationBody::Endorsement { .. } => consensus::revert_endorsement(ctx, step, &op)?,
                OperationBody::Preendorsement { .. } => consensus::revert_preendorsement(ctx, &op)?,
                OperationBody::NonceRevelation { .. } => nonce_revelation::revert(ctx, step, &op)?,
                OperationBody::DoubleBaking(_) | OperationBody::DoubleEndorsing(_) => {
                    evidence::revert(ctx, step, &op)?
                }
                OperationBody::Activation { .. } => activation::revert(ctx, &op)?,
                _ => manager::revert(ctx, step, &op)?,
            }
            ctx.delete_operation(&op)?;
        }
        Ok(())
    }
}

/// Rows written by this unit rather than by the migration, reward or freezer units
fn is_block_operation(body: &OperationBody) -> bool {
    !matches!(
        body,
        OperationBody::Migration { .. }
            | OperationBody::EndorsingReward { .. }
            | OperationBody::FreezerUpdate { .. }
    )
}

fn bump(ctx: &mut LedgerContext<'_>, id: AccountId, field: CountField, delta: i32) -> Result<()> {
    update_count_with_delta(field(&mut ctx.account_mut(id)?.counts), delta)
}

/// Per-account counter of a manager operation body
fn count_field(body: &OperationBody) -> Option<CountField> {
    let field: CountField = match body {
        OperationBody::Transaction { .. } => |c| &mut c.transactions,
        OperationBody::Origination { .. } => |c| &mut c.originations,
        OperationBody::Delegation { .. } => |c| &mut c.delegations,
        OperationBody::Reveal => |c| &mut c.reveals,
        OperationBody::Staking { .. } => |c| &mut c.staking_ops,
        OperationBody::SmartRollupOriginate { .. }
        | OperationBody::SmartRollupPublish { .. }
        | OperationBody::SmartRollupRecoverBond { .. } => |c| &mut c.rollup_ops,
        OperationBody::DalPublishCommitment { .. } => |c| &mut c.dal_ops,
        _ => return None,
    };
    Some(field)
}

/// Count a manager operation on its sender, and on the target of an applied transfer
fn count_manager(ctx: &mut LedgerContext<'_>, op: &Operation, delta: i32) -> Result<()> {
    let (Some(manager), Some(field)) = (&op.manager, count_field(&op.body)) else {
        return Ok(());
    };
    bump(ctx, manager.sender_id, field, delta)?;
    if let OperationBody::Transaction {
        target_id: Some(target),
        ..
    } = op.body
    {
        if op.status.is_applied() && target != manager.sender_id {
            bump(ctx, target, field, delta)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        assert_reverted, block_hash, delegation, extend, origination, reveal, setup, staking,
        transaction, update, BAKERS, DELEGATOR,
    };
    use bakehouse_common::{
        node::{
            ActivationContent, BalanceKind, DoubleBakingContent, EvidenceHeader,
            EvidenceMetadata, OperationResult, ResultStatus, SimpleMetadata,
        },
        operations::StakingAction,
        protocol_params::ProtocolVersion,
        Account, AccountKind, Address, ContractData, Mutez, ReplayError,
    };
    use bakehouse_module_ledger_store::LedgerStore;

    const FRESH: &str = "tz1fresh";
    const CONTRACT: &str = "KT1fresh";
    const FUNDRAISER: &str = "tz1fundraiser";

    fn account(store: &dyn LedgerStore, address: &str) -> Account {
        let id = store.account_id(&Address::from(address)).unwrap().unwrap();
        store.account(id).unwrap().unwrap()
    }

    #[test]
    fn manager_operations_charge_the_sender_and_revert_cleanly() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 5);
        let before = store.snapshot().unwrap();
        let burned = pipeline.head_statistics().unwrap().total_burned;

        let allocated = OperationResult {
            consumed_milligas: Some(1_500_123),
            allocated_destination_contract: true,
            ..OperationResult::applied()
        };
        let originated = OperationResult {
            paid_storage_size_diff: Some(100),
            originated_contracts: vec![Address::from(CONTRACT)],
            ..OperationResult::applied()
        };
        let mut node = chain.next(store.as_ref(), 6, block_hash(5, "main"));
        chain.include(
            &mut node,
            vec![
                reveal(DELEGATOR, 1),
                transaction(DELEGATOR, FRESH, 10_000, 2, allocated),
                origination(DELEGATOR, 20_000, Some(BAKERS[1]), 3, originated),
            ],
        );
        pipeline.apply_block(&node).unwrap();

        // Two allocations and 100 bytes of storage, at 250 per byte
        let allocation: Mutez = 257 * 250;
        let storage: Mutez = 100 * 250;
        let sender = account(store.as_ref(), DELEGATOR);
        assert!(sender.revealed());
        assert_eq!(sender.counter, 3);
        assert_eq!(sender.counts.reveals, 1);
        assert_eq!(sender.counts.transactions, 1);
        assert_eq!(sender.counts.originations, 1);
        assert_eq!(
            sender.balance,
            250_000 - 3 * 1_000 - 10_000 - 20_000 - 2 * allocation - storage
        );
        assert_eq!(
            pipeline.head_statistics().unwrap().total_burned - burned,
            2 * allocation + storage
        );

        let fresh = account(store.as_ref(), FRESH);
        assert_eq!(fresh.balance, 10_000);
        assert_eq!(fresh.first_level, 6);
        assert_eq!(fresh.counts.transactions, 1);

        let contract = account(store.as_ref(), CONTRACT);
        let beta = account(store.as_ref(), BAKERS[1]);
        assert_eq!(contract.balance, 20_000);
        assert_eq!(contract.delegate_id, Some(beta.id));
        assert!(matches!(
            contract.kind,
            AccountKind::Contract(ContractData { creator_id: Some(id) }) if id == sender.id
        ));
        assert!(beta.baker().unwrap().delegated_balance >= 20_000);

        let operations = store.operations(6).unwrap();
        let transfer = operations
            .iter()
            .find(|op| matches!(op.body, OperationBody::Transaction { .. }))
            .unwrap();
        assert_eq!(transfer.gas_used, 1_501);
        assert_eq!(transfer.allocation_fee, allocation);
        assert_eq!(transfer.fee, 1_000);

        pipeline.revert_head(&block_hash(6, "main")).unwrap();
        assert_reverted(&store, before, 6);
        assert!(store.account_id(&Address::from(CONTRACT)).unwrap().is_none());
    }

    #[test]
    fn failed_transfer_only_costs_the_fee() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 5);
        let before = store.snapshot().unwrap();

        let failed = OperationResult {
            status: ResultStatus::Failed,
            allocated_destination_contract: true,
            ..OperationResult::applied()
        };
        let mut node = chain.next(store.as_ref(), 6, block_hash(5, "main"));
        chain.include(&mut node, vec![transaction(DELEGATOR, FRESH, 10_000, 1, failed)]);
        pipeline.apply_block(&node).unwrap();

        assert_eq!(account(store.as_ref(), DELEGATOR).balance, 250_000 - 1_000);
        assert!(store.account_id(&Address::from(FRESH)).unwrap().is_none());

        pipeline.revert_head(&block_hash(6, "main")).unwrap();
        assert_reverted(&store, before, 6);
    }

    #[test]
    fn registration_promotes_and_revert_demotes() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 5);
        let before = store.snapshot().unwrap();

        let mut node = chain.next(store.as_ref(), 6, block_hash(5, "main"));
        chain.include(
            &mut node,
            vec![reveal(DELEGATOR, 1), delegation(DELEGATOR, Some(DELEGATOR), 2)],
        );
        pipeline.apply_block(&node).unwrap();

        let baker = account(store.as_ref(), DELEGATOR);
        assert!(baker.is_baker());
        assert_eq!(baker.delegate_id, Some(baker.id));
        assert_eq!(baker.delegation_level, Some(6));
        assert_eq!(baker.baker().unwrap().activation_level, 6);
        assert!(store.bakers().unwrap().iter().any(|b| b.id == baker.id));

        // The delegator was the first baker's only one
        let alpha = account(store.as_ref(), BAKERS[0]);
        assert_eq!(alpha.baker().unwrap().delegators_count, 0);
        assert_eq!(alpha.baker().unwrap().delegated_balance, 0);

        pipeline.revert_head(&block_hash(6, "main")).unwrap();
        assert_reverted(&store, before, 6);
        let user = account(store.as_ref(), DELEGATOR);
        assert!(!user.is_baker());
        assert!(!user.revealed());
    }

    #[test]
    fn redelegation_moves_the_balance_between_bakers() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 5);
        let before = store.snapshot().unwrap();
        let beta_before = account(store.as_ref(), BAKERS[1]).baker().cloned().unwrap();

        let mut node = chain.next(store.as_ref(), 6, block_hash(5, "main"));
        chain.include(&mut node, vec![delegation(DELEGATOR, Some(BAKERS[1]), 1)]);
        pipeline.apply_block(&node).unwrap();

        let beta = account(store.as_ref(), BAKERS[1]);
        let delegator = account(store.as_ref(), DELEGATOR);
        assert_eq!(delegator.delegate_id, Some(beta.id));
        assert_eq!(delegator.delegation_level, Some(6));
        let data = beta.baker().unwrap();
        assert_eq!(data.delegators_count, beta_before.delegators_count + 1);
        assert_eq!(
            data.delegated_balance,
            beta_before.delegated_balance + 250_000 - 1_000
        );
        let alpha = account(store.as_ref(), BAKERS[0]);
        assert_eq!(alpha.baker().unwrap().delegators_count, 0);

        // Bakers cannot delegate away
        let mut node = chain.next(store.as_ref(), 7, block_hash(6, "main"));
        chain.include(&mut node, vec![delegation(BAKERS[0], Some(BAKERS[1]), 1)]);
        let e = pipeline.apply_block(&node).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<ReplayError>(),
            Some(ReplayError::MalformedBlock { level: 7, .. })
        ));

        pipeline.revert_head(&block_hash(6, "main")).unwrap();
        assert_reverted(&store, before, 6);
    }

    #[test]
    fn own_and_external_stake_revert_to_liquid() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Staking, 100);
        extend(&mut pipeline, &chain, 5);
        let before = store.snapshot().unwrap();
        let frozen = pipeline.head_statistics().unwrap().total_frozen;

        let mut node = chain.next(store.as_ref(), 6, block_hash(5, "main"));
        chain.include(
            &mut node,
            vec![
                staking(BAKERS[0], "stake", 100_000, 1),
                staking(DELEGATOR, "stake", 50_000, 1),
            ],
        );
        pipeline.apply_block(&node).unwrap();

        let alpha = account(store.as_ref(), BAKERS[0]);
        let data = alpha.baker().unwrap();
        assert_eq!(data.own_staked, 100_000);
        assert_eq!(data.external_staked, 50_000);
        assert_eq!(data.stakers_count, 1);

        // External stake leaves the staker's balance and is mirrored on it
        let staker = account(store.as_ref(), DELEGATOR);
        assert_eq!(staker.balance, 250_000 - 1_000 - 50_000);
        assert_eq!(staker.staked_balance, 50_000);
        assert_eq!(staker.counts.staking_ops, 1);
        assert_eq!(
            pipeline.head_statistics().unwrap().total_frozen - frozen,
            150_000
        );

        let bodies: Vec<OperationBody> = store
            .operations(6)
            .unwrap()
            .into_iter()
            .map(|op| op.body)
            .filter(|body| matches!(body, OperationBody::Staking { .. }))
            .collect();
        assert_eq!(
            bodies[1],
            OperationBody::Staking {
                baker_id: alpha.id,
                action: StakingAction::Stake,
                amount: 50_000,
                mirrored: 50_000,
                staker_count_change: 1,
            }
        );

        pipeline.revert_head(&block_hash(6, "main")).unwrap();
        assert_reverted(&store, before, 6);
    }

    #[test]
    fn double_baking_slashes_frozen_rewards() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Rolls, 100);
        extend(&mut pipeline, &chain, 5);
        let before = store.snapshot().unwrap();
        let burned = pipeline.head_statistics().unwrap().total_burned;

        let mut node = chain.next(store.as_ref(), 6, block_hash(5, "main"));
        let accuser = node.metadata.baker.clone();
        let offender = store
            .bakers()
            .unwrap()
            .into_iter()
            .filter(|b| b.address != accuser)
            .max_by_key(|b| b.baker().map(|d| d.frozen_rewards).unwrap_or_default())
            .unwrap();
        let lost = offender.baker().unwrap().frozen_rewards / 2;
        assert!(lost > 0);
        let reward = lost / 2;
        chain.include(
            &mut node,
            vec![NodeContent::DoubleBakingEvidence(DoubleBakingContent {
                bh1: EvidenceHeader { level: 4 },
                metadata: EvidenceMetadata {
                    balance_updates: vec![
                        update(BalanceKind::Freezer, Some("rewards"), offender.address.as_str(), -lost),
                        update(BalanceKind::Contract, None, accuser.as_str(), reward),
                    ],
                    forbidden_delegate: None,
                },
            })],
        );
        pipeline.apply_block(&node).unwrap();

        let accuser_id = store.account_id(&accuser).unwrap().unwrap();
        let offended = store.baker_cycle(0, offender.id).unwrap().unwrap();
        assert_eq!(offended.double_baking_losses.frozen_rewards, lost);
        assert_eq!(offended.double_baking_losses.total(), lost);
        let accused = store.baker_cycle(0, accuser_id).unwrap().unwrap();
        assert_eq!(accused.double_baking_rewards, reward);
        assert_eq!(
            pipeline.head_statistics().unwrap().total_burned - burned,
            lost - reward
        );
        assert_eq!(store.account(offender.id).unwrap().unwrap().counts.double_baking, 1);

        pipeline.revert_head(&block_hash(6, "main")).unwrap();
        assert_reverted(&store, before, 6);
    }

    #[test]
    fn activation_brings_a_commitment_into_circulation() {
        let (store, mut pipeline, chain) = setup(ProtocolVersion::Tenderbake, 100);
        extend(&mut pipeline, &chain, 5);
        let before = store.snapshot().unwrap();
        let activated = pipeline.head_statistics().unwrap().total_activated;

        let mut node = chain.next(store.as_ref(), 6, block_hash(5, "main"));
        chain.include(
            &mut node,
            vec![NodeContent::ActivateAccount(ActivationContent {
                pkh: Address::from(FUNDRAISER),
                secret: "0f".repeat(20),
                metadata: SimpleMetadata {
                    balance_updates: vec![update(BalanceKind::Contract, None, FUNDRAISER, 40_000)],
                },
            })],
        );
        pipeline.apply_block(&node).unwrap();

        let fundraiser = account(store.as_ref(), FUNDRAISER);
        assert_eq!(fundraiser.balance, 40_000);
        assert_eq!(fundraiser.counts.activations, 1);
        assert_eq!(
            pipeline.head_statistics().unwrap().total_activated - activated,
            40_000
        );

        pipeline.revert_head(&block_hash(6, "main")).unwrap();
        assert_reverted(&store, before, 6);
        assert!(store.account_id(&Address::from(FUNDRAISER)).unwrap().is_none());
    }
}
