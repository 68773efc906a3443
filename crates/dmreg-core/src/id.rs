//! Strongly-typed identifiers used across the registry.
//!
//! Downstream crates should *not* pass raw integers around for node or query ids.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! new_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(v: u64) -> Self {
                Self(v)
            }
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

new_id!(NodeId);
new_id!(QueryId);

impl NodeId {
    /// Slot index inside the owning schema arena.
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl QueryId {
    /// Id 0 marks a query that has not been registered yet.
    pub const UNASSIGNED: QueryId = QueryId(0);

    /// Build an id from a namespace tag (upper 32 bits) and a registry-wide
    /// sequence number (lower 32 bits).
    pub const fn compose(namespace_tag: u32, sequence: u32) -> Self {
        Self(((namespace_tag as u64) << 32) | sequence as u64)
    }

    pub const fn namespace_tag(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn sequence(self) -> u32 {
        self.0 as u32
    }

    pub const fn is_assigned(self) -> bool {
        self.0 != 0
    }
}
