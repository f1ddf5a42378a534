//! In-process host memory pool.
//!
//! Stands in for the host engine's shared execution memory when nmm runs
//! without one (tests, embedded use). Admission is lock-free and may grant
//! part of a request, like the host's own task memory manager does.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nmm_core::budget::HostMemoryBudget;

/// Shared inner state for the pool.
struct PoolInner {
    capacity: u64,
    used: AtomicU64,
}

impl PoolInner {
    fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: AtomicU64::new(0),
        }
    }

    /// Grant up to `bytes`, bounded by what is still free.
    fn try_acquire_up_to(&self, bytes: u64) -> u64 {
        loop {
            let cur = self.used.load(Ordering::Relaxed);
            let available = self.capacity.saturating_sub(cur);
            let granted = bytes.min(available);
            if granted == 0 {
                return 0;
            }
            if self
                .used
                .compare_exchange(cur, cur + granted, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return granted;
            }
        }
    }

    fn release(&self, bytes: u64) {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_sub(bytes);
            match self
                .used
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }
}

/// Concrete [`HostMemoryBudget`] backed by a fixed capacity.
#[derive(Clone)]
pub struct SharedMemoryPool {
    inner: Arc<PoolInner>,
}

impl SharedMemoryPool {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            inner: Arc::new(PoolInner::new(capacity_bytes)),
        }
    }

    /// A pool that never refuses.
    pub fn unbounded() -> Self {
        Self::new(u64::MAX)
    }

    pub fn available_bytes(&self) -> u64 {
        self.inner
            .capacity
            .saturating_sub(self.inner.used.load(Ordering::Relaxed))
    }
}

impl HostMemoryBudget for SharedMemoryPool {
    fn acquire(&self, bytes: u64, consumer: &str) -> u64 {
        if bytes == 0 {
            return 0;
        }
        let granted = self.inner.try_acquire_up_to(bytes);
        tracing::trace!(consumer, requested = bytes, granted, "host pool acquire");
        granted
    }

    fn release(&self, bytes: u64, consumer: &str) {
        if bytes == 0 {
            return;
        }
        self.inner.release(bytes);
        tracing::trace!(consumer, bytes, "host pool release");
    }

    fn capacity_bytes(&self) -> u64 {
        self.inner.capacity
    }

    fn used_bytes(&self) -> u64 {
        self.inner.used.load(Ordering::Relaxed)
    }
}
