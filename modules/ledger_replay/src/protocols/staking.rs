//! Adaptive issuance era: external staking and the four-way reward split

use anyhow::Result;

use bakehouse_common::{
    math::mul_div, operations::FreezerCategory, protocol_params::ProtocolConstants, Account,
    Mutez, RewardSplit, SnapshotBalance,
};

use super::PartialFormulas;

/// Delegated tez weigh a third of staked tez in baking power
const DELEGATED_WEIGHT_DIVISOR: Mutez = 3;

const EDGE_DENOMINATOR: i64 = 1_000_000_000;

pub fn overrides() -> PartialFormulas {
    PartialFormulas {
        baking_power: Some(baking_power),
        deposit_bucket: Some(FreezerCategory::Staked),
        reward_split: Some(four_way_split),
        ..Default::default()
    }
}

fn baking_power(snapshot: &SnapshotBalance) -> Mutez {
    snapshot.staked() + snapshot.delegated() / DELEGATED_WEIGHT_DIVISOR
}

/// Split `amount` between the delegated part (liquid), the baker's own
/// stake, the baker's edge and the external stakers, by current power
fn four_way_split(
    baker: &Account,
    amount: Mutez,
    constants: &ProtocolConstants,
) -> Result<RewardSplit> {
    let Some(data) = baker.baker() else {
        return Ok(RewardSplit::liquid(amount));
    };
    let own_staked = data.own_staked;
    let external_staked = data.external_staked;
    let staked = own_staked + external_staked;
    let liquid = baker.balance - data.own_staked - data.own_unstaked + data.delegated_balance;
    let delegated_power = liquid.max(0) / DELEGATED_WEIGHT_DIVISOR;
    let power = staked + delegated_power;
    if power <= 0 {
        return Ok(RewardSplit::liquid(amount));
    }

    let delegated = mul_div(amount, delegated_power, power)?;
    let staked_total = amount - delegated;
    let staked_own = if staked > 0 {
        mul_div(staked_total, own_staked, staked)?
    } else {
        0
    };
    let shared = staked_total - staked_own;
    let edge = if data.edge_of_baking_over_staking > 0 {
        data.edge_of_baking_over_staking
    } else {
        constants.default_edge_of_baking_over_staking
    };
    let staked_edge = mul_div(shared, edge, EDGE_DENOMINATOR)?;

    Ok(RewardSplit {
        delegated,
        staked_own,
        staked_edge,
        staked_shared: shared - staked_edge,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_constants;
    use bakehouse_common::{AccountId, AccountKind, Address, BakerData};

    fn baker(own_staked: Mutez, external_staked: Mutez, liquid: Mutez) -> Account {
        let mut account = Account::new(
            AccountId(1),
            Address::from("tz1baker"),
            1,
            AccountKind::Baker(BakerData {
                own_staked,
                external_staked,
                edge_of_baking_over_staking: 100_000_000,
                ..Default::default()
            }),
        );
        account.balance = own_staked + liquid;
        account
    }

    #[test]
    fn split_always_sums_to_amount() {
        let constants = test_constants();
        for (own, external, liquid, amount) in
            [(1_000, 3_000, 3_000, 1_000), (7, 13, 0, 999), (0, 0, 500, 77), (5_000, 0, 0, 1)]
        {
            let split = four_way_split(&baker(own, external, liquid), amount, &constants).unwrap();
            assert_eq!(split.total(), amount, "{own} {external} {liquid}");
        }
    }

    #[test]
    fn stakers_share_pays_the_edge() {
        let constants = test_constants();
        // power = 1000 + 3000 + 3000 / 3 = 5000
        let split = four_way_split(&baker(1_000, 3_000, 3_000), 1_000, &constants).unwrap();
        assert_eq!(split.delegated, 200);
        assert_eq!(split.staked_own, 200);
        assert_eq!(split.staked_edge, 60);
        assert_eq!(split.staked_shared, 540);
    }

    #[test]
    fn unstaked_baker_gets_everything_liquid() {
        let constants = test_constants();
        let split = four_way_split(&baker(0, 0, 10_000), 300, &constants).unwrap();
        assert_eq!(split, RewardSplit::liquid(300));
    }
}
