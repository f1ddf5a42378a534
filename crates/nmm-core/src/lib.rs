#![forbid(unsafe_code)]
//! nmm-core: handles, configuration, and host-budget interfaces.
//!
//! Concrete reservation logic lives in `nmm-mem`. This crate only carries the
//! vocabulary shared by everything that talks to the reservation manager, so a
//! host integration can depend on it without pulling the accounting code.

pub mod budget;
pub mod config;
pub mod error;
pub mod id;
pub mod prelude;

pub use error::{Error, Result};
