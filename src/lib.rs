#![forbid(unsafe_code)]
//! nmm: task-scoped native memory reservation manager.
//!
//! Facade over the workspace crates; see `nmm-mem` for the reservation logic
//! and `nmm-core` for handles, configuration, and the host budget interface.

pub use nmm_core;
pub use nmm_mem;

pub use nmm_core::config::MemoryConfig;
pub use nmm_mem::{AllocatorRegistry, Error, Result, TaskContext};
