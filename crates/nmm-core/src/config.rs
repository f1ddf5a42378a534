//! Reservation manager configuration that hosts can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default upstream reservation granularity (8 MiB).
pub const DEFAULT_RESERVATION_BLOCK_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Backend identifier handed to the native side when a manager is created.
    pub backend_name: String,

    /// Granularity of reservations forwarded to the host budget. A 1-byte
    /// native allocation still reserves a full block upstream.
    pub reservation_block_size: u64,

    /// Capacity of the in-process host pool used when the host does not
    /// supply its own budget.
    pub host_pool_bytes: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend_name: "native".to_string(),
            reservation_block_size: DEFAULT_RESERVATION_BLOCK_SIZE,
            host_pool_bytes: 512 * 1024 * 1024, // 512 MiB default
        }
    }
}

impl MemoryConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `NMM_BACKEND`: backend name
    /// - `NMM_RESERVATION_BLOCK_SIZE`: reservation block size in bytes
    /// - `NMM_HOST_POOL_BYTES`: in-process host pool capacity in bytes
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("NMM_BACKEND") {
            if !s.trim().is_empty() {
                cfg.backend_name = s.trim().to_string();
            }
        }

        if let Ok(s) = std::env::var("NMM_RESERVATION_BLOCK_SIZE") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.reservation_block_size = v;
            }
        }

        if let Ok(s) = std::env::var("NMM_HOST_POOL_BYTES") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.host_pool_bytes = v;
            }
        }

        cfg
    }

    /// Builder-style override for the reservation block size.
    pub fn with_block_size(mut self, bytes: u64) -> Self {
        self.reservation_block_size = bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.reservation_block_size == 0 {
            return Err(Error::Config(
                "reservation_block_size must be greater than zero".into(),
            ));
        }
        if self.backend_name.is_empty() {
            return Err(Error::Config("backend_name must not be empty".into()));
        }
        Ok(())
    }
}

/// Round `bytes` up to the next multiple of `block_size`.
///
/// Returns `None` on overflow. `block_size` must be non-zero.
pub fn round_up_to_block(bytes: u64, block_size: u64) -> Option<u64> {
    debug_assert!(block_size > 0);
    let rem = bytes % block_size;
    if rem == 0 {
        Some(bytes)
    } else {
        bytes.checked_add(block_size - rem)
    }
}
