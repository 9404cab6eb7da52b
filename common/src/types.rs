//! Core identifiers and scalar types shared by every Bakehouse crate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Amount in mutez (1 tez = 1,000,000 mutez)
pub type Mutez = i64;

/// Block height
pub type Level = i32;

/// Cycle index
pub type CycleIndex = i32;

/// Row id of a stored operation
pub type OperationId = i64;

/// Internal account id, allocated sequentially as accounts first appear
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct AccountId(pub i32);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

macro_rules! declare_string_type {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Debug, Default, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

declare_string_type!(Address, "Base58 account address (tz1/tz2/tz3/tz4, KT1 or sr1)");
declare_string_type!(BlockHash, "Base58 block hash");
declare_string_type!(OperationHash, "Base58 operation group hash");
declare_string_type!(ProtocolHash, "Base58 protocol hash");

/// What an address prefix says about the account behind it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Implicit,
    Contract,
    Rollup,
    Unknown,
}

/// Burn address: funds sent there leave circulation
pub const NULL_ADDRESS: &str = "tz1burnburnburnburnburnburnburjAYjjX";

impl Address {
    pub fn is_null(&self) -> bool {
        self.0 == NULL_ADDRESS
    }

    pub fn kind(&self) -> AddressKind {
        match self.0.get(..3) {
            Some("tz1" | "tz2" | "tz3" | "tz4") => AddressKind::Implicit,
            Some("KT1") => AddressKind::Contract,
            Some("sr1") => AddressKind::Rollup,
            _ => AddressKind::Unknown,
        }
    }

    pub fn is_implicit(&self) -> bool {
        self.kind() == AddressKind::Implicit
    }
}

/// Block info, shared across multiple messages
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Block level
    pub level: Level,

    /// Block hash
    pub hash: BlockHash,

    /// Cycle the block belongs to
    pub cycle: CycleIndex,

    /// Block timestamp
    pub timestamp: DateTime<Utc>,
}
