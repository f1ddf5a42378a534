//! Memory consumer: a task's host budget plus its spiller, as one unit.
//!
//! The consumer is where host admission happens. A refused (or partially
//! granted) request triggers exactly one spill for the shortfall and exactly
//! one retry before the request fails with `OutOfMemory`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nmm_core::budget::HostMemoryBudget;

use crate::error::{Error, Result};
use crate::spiller::Spiller;

pub struct MemoryConsumer {
    name: String,
    budget: Arc<dyn HostMemoryBudget>,
    spiller: Arc<dyn Spiller>,
    /// Bytes currently held from the host budget.
    used: AtomicU64,
    spilled: AtomicU64,
}

impl MemoryConsumer {
    pub fn new(
        name: impl Into<String>,
        budget: Arc<dyn HostMemoryBudget>,
        spiller: Arc<dyn Spiller>,
    ) -> Self {
        Self {
            name: name.into(),
            budget,
            spiller,
            used: AtomicU64::new(0),
            spilled: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire exactly `bytes` from the host budget, spilling once if needed.
    ///
    /// On failure every partially granted byte is handed back before the error
    /// is returned, so a failed call leaves the budget untouched.
    pub fn acquire(&self, bytes: u64) -> Result<u64> {
        if bytes == 0 {
            return Ok(0);
        }

        let mut granted = self.budget.acquire(bytes, &self.name);
        let mut spilled = 0;
        if granted < bytes {
            let shortfall = bytes - granted;
            spilled = self.spill(shortfall);
            tracing::debug!(
                consumer = %self.name,
                requested = bytes,
                shortfall,
                spilled,
                "host budget short, spilled before retry"
            );
            granted += self.budget.acquire(shortfall, &self.name);
        }

        if granted < bytes {
            self.budget.release(granted, &self.name);
            return Err(Error::OutOfMemory {
                consumer: self.name.clone(),
                requested: bytes,
                granted,
                spilled,
            });
        }

        self.used.fetch_add(bytes, Ordering::AcqRel);
        Ok(bytes)
    }

    /// Return `bytes` to the host budget.
    pub fn free(&self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            let next = cur.checked_sub(bytes).ok_or_else(|| Error::ArithmeticUnderflow {
                name: self.name.clone(),
                requested: bytes,
                used: cur,
            })?;
            match self
                .used
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        self.budget.release(bytes, &self.name);
        Ok(())
    }

    /// Ask the spiller to free up to `size` bytes; returns what it reports.
    pub fn spill(&self, size: u64) -> u64 {
        if size == 0 {
            return 0;
        }
        let freed = self.spiller.spill(size);
        self.spilled.fetch_add(freed, Ordering::Relaxed);
        freed
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Total bytes the spiller has reported freeing over this consumer's life.
    pub fn spilled_bytes(&self) -> u64 {
        self.spilled.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MemoryConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConsumer")
            .field("name", &self.name)
            .field("used", &self.used_bytes())
            .field("spilled", &self.spilled_bytes())
            .finish()
    }
}
