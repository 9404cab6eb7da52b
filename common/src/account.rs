//! Ledger accounts
//!
//! An account is one of four kinds.  Users and bakers are implicit accounts,
//! contracts and rollups are originated.  A user becomes a baker when it
//! registers as a delegate and goes back to being a user only if that
//! registration is reverted.

use serde::{Deserialize, Serialize};

use crate::{AccountId, Address, Level, Mutez};

/// Per-operation-kind counters, kept for consistency checks
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCounts {
    pub transactions: i32,
    pub delegations: i32,
    pub originations: i32,
    pub reveals: i32,
    pub activations: i32,
    pub staking_ops: i32,
    pub rollup_ops: i32,
    pub dal_ops: i32,
    pub endorsements: i32,
    pub preendorsements: i32,
    pub blocks: i32,
    pub nonce_revelations: i32,
    pub double_baking: i32,
    pub double_endorsing: i32,
    pub migrations: i32,
    pub endorsing_rewards: i32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    pub revealed: bool,
}

/// Delegate-specific state
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BakerData {
    pub activation_level: Level,

    /// First level at which the baker is considered inactive unless it acts again
    pub deactivation_level: Level,

    /// Sum of the balances of accounts delegating to this baker (excluding itself)
    pub delegated_balance: Mutez,
    pub delegators_count: i32,

    /// Own stake and unstake requests, both part of `balance`
    pub own_staked: Mutez,
    pub own_unstaked: Mutez,

    /// Stake and unstake requests of external stakers, not part of `balance`
    pub external_staked: Mutez,
    pub external_unstaked: Mutez,
    pub stakers_count: i32,

    /// Roll-era freezer buckets, all part of `balance`
    pub frozen_deposits: Mutez,
    pub frozen_rewards: Mutez,
    pub frozen_fees: Mutez,

    /// Share of staker rewards kept by the baker, in billionths
    pub edge_of_baking_over_staking: i64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractData {
    pub creator_id: Option<AccountId>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupData {
    pub creator_id: Option<AccountId>,
    pub pvm_kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountKind {
    User(UserData),
    Baker(BakerData),
    Contract(ContractData),
    Rollup(RollupData),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub address: Address,
    pub first_level: Level,
    pub balance: Mutez,

    /// Replay-protection counter of the last applied manager operation
    pub counter: i64,

    pub delegate_id: Option<AccountId>,
    pub delegation_level: Option<Level>,

    /// Active flag: true for delegating accounts and active bakers
    pub staked: bool,

    /// Funds locked as smart rollup commitment bonds
    pub rollup_bonds: Mutez,

    /// Stake and unstake requests this account holds at its delegate as an
    /// external staker; mirrored in the baker's external buckets
    pub staked_balance: Mutez,
    pub unstaked_balance: Mutez,

    pub counts: OperationCounts,
    pub kind: AccountKind,
}

impl Account {
    pub fn new_user(id: AccountId, address: Address, first_level: Level) -> Self {
        Self::new(id, address, first_level, AccountKind::User(UserData::default()))
    }

    pub fn new(id: AccountId, address: Address, first_level: Level, kind: AccountKind) -> Self {
        Self {
            id,
            address,
            first_level,
            balance: 0,
            counter: 0,
            delegate_id: None,
            delegation_level: None,
            staked: false,
            rollup_bonds: 0,
            staked_balance: 0,
            unstaked_balance: 0,
            counts: OperationCounts::default(),
            kind,
        }
    }

    pub fn is_baker(&self) -> bool {
        matches!(self.kind, AccountKind::Baker(_))
    }

    pub fn baker(&self) -> Option<&BakerData> {
        match &self.kind {
            AccountKind::Baker(data) => Some(data),
            _ => None,
        }
    }

    pub fn baker_mut(&mut self) -> Option<&mut BakerData> {
        match &mut self.kind {
            AccountKind::Baker(data) => Some(data),
            _ => None,
        }
    }

    /// Bakers are always revealed; originated accounts have nothing to reveal
    pub fn revealed(&self) -> bool {
        match &self.kind {
            AccountKind::User(user) => user.revealed,
            _ => true,
        }
    }

    /// Delegate this account's balance counts towards, if it is not its own
    pub fn external_delegate(&self) -> Option<AccountId> {
        self.delegate_id.filter(|d| *d != self.id)
    }

    /// Own + delegated + external stake.  Zero for non-bakers.
    pub fn staking_balance(&self) -> Mutez {
        match &self.kind {
            AccountKind::Baker(baker) => {
                self.balance - baker.own_unstaked + baker.delegated_balance + baker.external_staked
            }
            _ => 0,
        }
    }

    /// Amount held by this account outside of `balance` that still belongs
    /// to the ledger (bonds and external stake held at the baker)
    pub fn held_outside_balance(&self) -> Mutez {
        let external = match &self.kind {
            AccountKind::Baker(baker) => baker.external_staked + baker.external_unstaked,
            _ => 0,
        };
        self.rollup_bonds + external
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baker() -> Account {
        let mut account = Account::new(
            AccountId(1),
            Address::from("tz1baker"),
            1,
            AccountKind::Baker(BakerData {
                delegated_balance: 500,
                own_unstaked: 50,
                external_staked: 200,
                external_unstaked: 30,
                ..Default::default()
            }),
        );
        account.balance = 1_000;
        account.rollup_bonds = 10;
        account
    }

    #[test]
    fn staking_balance_counts_own_delegated_and_external() {
        assert_eq!(baker().staking_balance(), 1_000 - 50 + 500 + 200);
        assert_eq!(baker().held_outside_balance(), 10 + 200 + 30);
    }

    #[test]
    fn users_have_no_staking_balance() {
        let mut user = Account::new_user(AccountId(2), Address::from("tz1user"), 3);
        user.balance = 10;
        user.delegate_id = Some(AccountId(1));
        assert_eq!(user.staking_balance(), 0);
        assert_eq!(user.external_delegate(), Some(AccountId(1)));
        assert!(!user.revealed());
    }

    #[test]
    fn self_delegation_is_not_external() {
        let mut b = baker();
        b.delegate_id = Some(b.id);
        assert_eq!(b.external_delegate(), None);
        assert!(b.revealed());
    }
}
