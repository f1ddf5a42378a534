//! Convenient re-exports for downstream crates.

pub use crate::budget::HostMemoryBudget;
pub use crate::config::MemoryConfig;
pub use crate::error::{Error, Result};
pub use crate::id::{AllocatorId, ManagerHandle, TaskId};
