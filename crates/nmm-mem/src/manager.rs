//! Reservation manager: the per-task authority over native memory claims.
//!
//! A manager owns the running `used_bytes` counter for one task (or one
//! allocator instance), rounds every reservation up to the configured block
//! size before it reaches the listener, and tracks its own lifecycle:
//!
//! ```text
//! Uninitialized --activate--> Active --release--> Released
//! ```
//!
//! `reserve` and `shrink` serialize on a per-manager lock. `unreserve` and all
//! reads use atomics only, so spillers can free through this manager while a
//! reservation that triggered them is still in flight.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use nmm_core::config::round_up_to_block;
use nmm_core::id::AllocatorId;

use crate::error::{Error, Result};
use crate::listener::ReservationListener;
use crate::snapshot::UsageSnapshot;
use crate::tracking::PeakTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagerState {
    Uninitialized = 0,
    Active = 1,
    Released = 2,
}

impl ManagerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ManagerState::Uninitialized,
            1 => ManagerState::Active,
            _ => ManagerState::Released,
        }
    }
}

/// Bytes still reserved when a manager was released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakReport {
    pub resource: String,
    pub leaked_bytes: u64,
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} reservation still holds {} ({} bytes) at release, which may leak memory",
            self.resource,
            bytes_to_string(self.leaked_bytes),
            self.leaked_bytes
        )
    }
}

pub struct ReservationManager {
    name: String,
    backend: String,
    allocator: AllocatorId,
    block_size: u64,
    listener: Arc<dyn ReservationListener>,
    state: AtomicU8,
    used: AtomicU64,
    peak: PeakTracker,
    reservations: AtomicU64,
    shrinks: AtomicU64,
    reserve_lock: Mutex<()>,
}

impl ReservationManager {
    /// Construct an `Uninitialized` manager.
    pub fn new(
        name: impl Into<String>,
        backend: impl Into<String>,
        allocator: AllocatorId,
        block_size: u64,
        listener: Arc<dyn ReservationListener>,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(nmm_core::Error::Config(
                "reservation block size must be greater than zero".into(),
            )
            .into());
        }
        Ok(Self {
            name: name.into(),
            backend: backend.into(),
            allocator,
            block_size,
            listener,
            state: AtomicU8::new(ManagerState::Uninitialized as u8),
            used: AtomicU64::new(0),
            peak: PeakTracker::new(),
            reservations: AtomicU64::new(0),
            shrinks: AtomicU64::new(0),
            reserve_lock: Mutex::new(()),
        })
    }

    /// Construct and activate in one step.
    pub fn create(
        name: impl Into<String>,
        backend: impl Into<String>,
        allocator: AllocatorId,
        block_size: u64,
        listener: Arc<dyn ReservationListener>,
    ) -> Result<Self> {
        let manager = Self::new(name, backend, allocator, block_size, listener)?;
        manager.activate()?;
        Ok(manager)
    }

    /// The only transition into `Active`.
    pub fn activate(&self) -> Result<()> {
        self.state
            .compare_exchange(
                ManagerState::Uninitialized as u8,
                ManagerState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| {
                tracing::trace!(manager = %self.name, backend = %self.backend, allocator = %self.allocator, "memory manager active");
            })
            .map_err(|cur| {
                Error::IllegalState(format!(
                    "cannot activate memory manager '{}' in state {:?}",
                    self.name,
                    ManagerState::from_u8(cur)
                ))
            })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn allocator(&self) -> AllocatorId {
        self.allocator
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn peak_bytes(&self) -> u64 {
        self.peak.peak()
    }

    fn ensure_active(&self, op: &str) -> Result<()> {
        match self.state() {
            ManagerState::Active => Ok(()),
            state => Err(Error::IllegalState(format!(
                "{op} on memory manager '{}' in state {state:?}",
                self.name
            ))),
        }
    }

    /// Reserve `bytes`, rounded up to the next multiple of the block size.
    ///
    /// Returns the rounded amount actually recorded.
    pub fn reserve(&self, bytes: u64) -> Result<u64> {
        self.ensure_active("reserve")?;
        if bytes == 0 {
            return Ok(0);
        }
        let rounded =
            round_up_to_block(bytes, self.block_size).ok_or_else(|| Error::OutOfMemory {
                consumer: self.name.clone(),
                requested: bytes,
                granted: 0,
                spilled: 0,
            })?;

        let _serialized = self
            .reserve_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let granted = self.listener.reserve(rounded)?;
        let now = self.used.fetch_add(granted, Ordering::AcqRel) + granted;
        self.peak.record_used(now);
        self.reservations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(manager = %self.name, requested = bytes, granted, used = now, "reserved");
        Ok(granted)
    }

    /// Release exactly `bytes`. Over-release is a bookkeeping bug and fails.
    pub fn unreserve(&self, bytes: u64) -> Result<u64> {
        self.ensure_active("unreserve")?;
        if bytes == 0 {
            return Ok(0);
        }
        let mut cur = self.used.load(Ordering::Acquire);
        loop {
            let next = cur.checked_sub(bytes).ok_or_else(|| Error::ArithmeticUnderflow {
                name: self.name.clone(),
                requested: bytes,
                used: cur,
            })?;
            match self
                .used
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }

        if let Err(e) = self.listener.unreserve(bytes) {
            // The listener did not take the bytes back; keep them on our books.
            self.used.fetch_add(bytes, Ordering::AcqRel);
            return Err(e);
        }
        Ok(bytes)
    }

    /// Give back up to `bytes` under external pressure.
    ///
    /// The returned amount is measured from this manager's own counter, so it
    /// never exceeds what was held when the call started.
    pub fn shrink(&self, bytes: u64) -> Result<u64> {
        self.ensure_active("shrink")?;
        let _serialized = self
            .reserve_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let before = self.used_bytes();
        let target = bytes.min(before);
        if target == 0 {
            return Ok(0);
        }
        self.shrinks.fetch_add(1, Ordering::Relaxed);
        let reported = self.listener.shrink(target);
        let freed = before.saturating_sub(self.used_bytes());
        tracing::debug!(manager = %self.name, requested = bytes, target, reported, freed, "shrink");
        Ok(freed)
    }

    /// Read-only snapshot; never blocks the owning task.
    pub fn snapshot(&self) -> UsageSnapshot {
        let used = self.used_bytes();
        UsageSnapshot {
            name: self.name.clone(),
            used_bytes: used,
            // A reserve may have bumped `used` without recording its peak yet.
            peak_bytes: self.peak_bytes().max(used),
            block_size: self.block_size,
            reservations: self.reservations.load(Ordering::Relaxed),
            shrinks: self.shrinks.load(Ordering::Relaxed),
            children: Vec::new(),
        }
    }

    /// Serialized [`UsageSnapshot`].
    pub fn collect_memory_usage(&self) -> Result<Vec<u8>> {
        self.ensure_active("collect_memory_usage")?;
        self.snapshot().to_bytes()
    }

    /// Terminal, idempotent teardown.
    ///
    /// The first call moves the manager to `Released` and, if bytes are still
    /// reserved, logs one leak warning and returns the report. Later calls do
    /// nothing and return `None`.
    pub fn release(&self) -> Option<LeakReport> {
        let prev = self
            .state
            .swap(ManagerState::Released as u8, Ordering::AcqRel);
        if ManagerState::from_u8(prev) == ManagerState::Released {
            return None;
        }

        let leaked = self.used_bytes();
        tracing::trace!(manager = %self.name, leaked, "memory manager released");
        if leaked == 0 {
            return None;
        }
        let report = LeakReport {
            resource: format!("{}_mem", self.name),
            leaked_bytes: leaked,
        };
        tracing::warn!(resource = %report.resource, leaked_bytes = leaked, "{report}");
        Some(report)
    }
}

impl fmt::Debug for ReservationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservationManager")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("used", &self.used_bytes())
            .field("block_size", &self.block_size)
            .finish()
    }
}

/// Human-readable byte count, e.g. `4.0 KiB`.
pub fn bytes_to_string(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::MemoryConsumer;
    use crate::listener::ManagedReservationListener;
    use crate::pool::SharedMemoryPool;
    use crate::spiller::NoopSpiller;
    use crate::tracking::TaskMemoryMetrics;

    fn manager(block: u64) -> ReservationManager {
        let consumer = Arc::new(MemoryConsumer::new(
            "unit",
            Arc::new(SharedMemoryPool::unbounded()),
            Arc::new(NoopSpiller),
        ));
        let listener = Arc::new(ManagedReservationListener::new(
            consumer,
            Arc::new(TaskMemoryMetrics::new()),
        ));
        ReservationManager::create("unit", "native", AllocatorId::GLOBAL, block, listener).unwrap()
    }

    #[test]
    fn state_machine_is_one_way() {
        let m = manager(1024);
        assert_eq!(m.state(), ManagerState::Active);
        assert!(matches!(m.activate(), Err(Error::IllegalState(_))));
        assert!(m.release().is_none());
        assert_eq!(m.state(), ManagerState::Released);
        assert!(matches!(m.activate(), Err(Error::IllegalState(_))));
        assert!(matches!(m.reserve(1), Err(Error::IllegalState(_))));
        assert!(matches!(m.shrink(1), Err(Error::IllegalState(_))));
        assert!(matches!(
            m.collect_memory_usage(),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn uninitialized_manager_rejects_reservations() {
        let consumer = Arc::new(MemoryConsumer::new(
            "unit",
            Arc::new(SharedMemoryPool::unbounded()),
            Arc::new(NoopSpiller),
        ));
        let listener = Arc::new(ManagedReservationListener::new(
            consumer,
            Arc::new(TaskMemoryMetrics::new()),
        ));
        let m = ReservationManager::new("unit", "native", AllocatorId::GLOBAL, 64, listener)
            .unwrap();
        assert_eq!(m.state(), ManagerState::Uninitialized);
        assert!(matches!(m.reserve(1), Err(Error::IllegalState(_))));
    }

    #[test]
    fn zero_block_size_is_a_config_error() {
        let listener = Arc::new(ManagedReservationListener::new(
            Arc::new(MemoryConsumer::new(
                "unit",
                Arc::new(SharedMemoryPool::unbounded()),
                Arc::new(NoopSpiller),
            )),
            Arc::new(TaskMemoryMetrics::new()),
        ));
        let err = ReservationManager::new("unit", "native", AllocatorId::GLOBAL, 0, listener)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn peak_survives_unreserve() {
        let m = manager(100);
        m.reserve(250).unwrap();
        m.unreserve(300).unwrap();
        assert_eq!(m.used_bytes(), 0);
        assert_eq!(m.peak_bytes(), 300);
        let snap = m.snapshot();
        assert_eq!(snap.peak_bytes, 300);
        assert_eq!(snap.reservations, 1);
    }

    #[test]
    fn formats_byte_counts() {
        assert_eq!(bytes_to_string(512), "512 B");
        assert_eq!(bytes_to_string(4096), "4.0 KiB");
        assert_eq!(bytes_to_string(3 * 1024 * 1024), "3.0 MiB");
    }
}
