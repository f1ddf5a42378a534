//! The native boundary: one handle-keyed call surface for every manager.
//!
//! Everything the host does to a native memory manager goes through
//! [`MemoryManagerBoundary`], addressed by an opaque [`ManagerHandle`]. Swap
//! the in-process implementation for a mock (or a real FFI shim) without
//! touching callers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use nmm_core::id::{AllocatorId, ManagerHandle};

use crate::error::{Error, Result};
use crate::listener::ReservationListener;
use crate::manager::{LeakReport, ReservationManager};

/// Synchronous calls across the native boundary.
///
/// Handles are unique while live and may be reused only after `release`.
pub trait MemoryManagerBoundary: Send + Sync {
    fn create(
        &self,
        backend: &str,
        name: &str,
        allocator: AllocatorId,
        reservation_block_size: u64,
        listener: Arc<dyn ReservationListener>,
    ) -> Result<ManagerHandle>;

    fn reserve(&self, handle: ManagerHandle, bytes: u64) -> Result<u64>;

    fn unreserve(&self, handle: ManagerHandle, bytes: u64) -> Result<u64>;

    fn shrink(&self, handle: ManagerHandle, bytes: u64) -> Result<u64>;

    /// Serialized [`crate::snapshot::UsageSnapshot`].
    fn collect_memory_usage(&self, handle: ManagerHandle) -> Result<Vec<u8>>;

    /// Tear down the manager behind `handle`. Unknown handles are a no-op.
    fn release(&self, handle: ManagerHandle) -> Result<Option<LeakReport>>;

    /// Handles of every manager that has not been released.
    fn live_handles(&self) -> Vec<ManagerHandle>;
}

#[derive(Default)]
struct HandleTable {
    managers: HashMap<ManagerHandle, Arc<ReservationManager>>,
    next: u64,
    free: Vec<u64>,
}

impl HandleTable {
    fn allocate(&mut self) -> ManagerHandle {
        if let Some(id) = self.free.pop() {
            return ManagerHandle::new(id);
        }
        self.next += 1;
        ManagerHandle::new(self.next)
    }
}

/// Boundary whose "native side" lives in this process.
#[derive(Default)]
pub struct InProcessBoundary {
    table: Mutex<HandleTable>,
}

impl InProcessBoundary {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, handle: ManagerHandle) -> Result<Arc<ReservationManager>> {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .managers
            .get(&handle)
            .cloned()
            .ok_or(Error::UnknownHandle(handle))
    }

    /// Direct access to the manager behind a live handle.
    pub fn manager(&self, handle: ManagerHandle) -> Option<Arc<ReservationManager>> {
        self.lookup(handle).ok()
    }
}

impl MemoryManagerBoundary for InProcessBoundary {
    fn create(
        &self,
        backend: &str,
        name: &str,
        allocator: AllocatorId,
        reservation_block_size: u64,
        listener: Arc<dyn ReservationListener>,
    ) -> Result<ManagerHandle> {
        let manager = Arc::new(ReservationManager::create(
            name,
            backend,
            allocator,
            reservation_block_size,
            listener,
        )?);
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = table.allocate();
        table.managers.insert(handle, manager);
        tracing::trace!(%handle, name, backend, "created native memory manager");
        Ok(handle)
    }

    fn reserve(&self, handle: ManagerHandle, bytes: u64) -> Result<u64> {
        self.lookup(handle)?.reserve(bytes)
    }

    fn unreserve(&self, handle: ManagerHandle, bytes: u64) -> Result<u64> {
        self.lookup(handle)?.unreserve(bytes)
    }

    fn shrink(&self, handle: ManagerHandle, bytes: u64) -> Result<u64> {
        self.lookup(handle)?.shrink(bytes)
    }

    fn collect_memory_usage(&self, handle: ManagerHandle) -> Result<Vec<u8>> {
        self.lookup(handle)?.collect_memory_usage()
    }

    fn release(&self, handle: ManagerHandle) -> Result<Option<LeakReport>> {
        let manager = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            match table.managers.remove(&handle) {
                Some(m) => {
                    table.free.push(handle.get());
                    m
                }
                None => return Ok(None),
            }
        };
        Ok(manager.release())
    }

    fn live_handles(&self) -> Vec<ManagerHandle> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let mut handles: Vec<_> = table.managers.keys().copied().collect();
        handles.sort();
        handles
    }
}
