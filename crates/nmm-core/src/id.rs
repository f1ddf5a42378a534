//! Strongly-typed identifiers for objects that cross the native boundary.
//!
//! Handles are plain integers on the wire. Downstream crates must not pass raw
//! `u64`s (or pointers) around in their place.

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

new_id!(AllocatorId);
new_id!(ManagerHandle);
new_id!(TaskId);

impl AllocatorId {
    /// Id reserved for the process-wide default allocator.
    pub const GLOBAL: AllocatorId = AllocatorId::new(0);
}
