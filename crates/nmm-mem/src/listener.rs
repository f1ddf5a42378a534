//! Reservation listeners: the bookkeeping seam between a native manager and
//! the host budget.

use std::sync::{Arc, Mutex, PoisonError};

use crate::consumer::MemoryConsumer;
use crate::error::Result;
use crate::tracking::TaskMemoryMetrics;

/// Receives reservation traffic from a native memory manager.
///
/// `reserve` calls are serialized by implementations. `unreserve` must stay
/// callable while a `reserve` is in flight: a spiller invoked by that reserve
/// frees memory through it.
pub trait ReservationListener: Send + Sync {
    /// Claim `bytes`; returns the bytes granted.
    fn reserve(&self, bytes: u64) -> Result<u64>;

    /// Withdraw `bytes`; fails with `ArithmeticUnderflow` on over-release.
    fn unreserve(&self, bytes: u64) -> Result<u64>;

    fn used_bytes(&self) -> u64;

    /// Forward a request to give back up to `size` bytes. Pure bookkeeping
    /// listeners have nothing to give back.
    fn shrink(&self, _size: u64) -> u64 {
        0
    }
}

/// Listener backed by a [`MemoryConsumer`], reporting into the task's shared
/// metrics.
pub struct ManagedReservationListener {
    consumer: Arc<MemoryConsumer>,
    metrics: Arc<TaskMemoryMetrics>,
    reserve_lock: Mutex<()>,
}

impl ManagedReservationListener {
    pub fn new(consumer: Arc<MemoryConsumer>, metrics: Arc<TaskMemoryMetrics>) -> Self {
        Self {
            consumer,
            metrics,
            reserve_lock: Mutex::new(()),
        }
    }

    pub fn consumer(&self) -> &Arc<MemoryConsumer> {
        &self.consumer
    }
}

impl ReservationListener for ManagedReservationListener {
    fn reserve(&self, bytes: u64) -> Result<u64> {
        let _serialized = self
            .reserve_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let granted = self.consumer.acquire(bytes)?;
        self.metrics.inc(granted);
        Ok(granted)
    }

    fn unreserve(&self, bytes: u64) -> Result<u64> {
        self.consumer.free(bytes)?;
        self.metrics.dec(bytes)?;
        Ok(bytes)
    }

    fn used_bytes(&self) -> u64 {
        self.consumer.used_bytes()
    }

    fn shrink(&self, size: u64) -> u64 {
        self.consumer.spill(size)
    }
}
