//! Host-side handle to a native memory manager.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nmm_core::config::MemoryConfig;
use nmm_core::id::{AllocatorId, ManagerHandle};

use crate::boundary::MemoryManagerBoundary;
use crate::error::{Error, Result};
use crate::listener::ReservationListener;
use crate::manager::LeakReport;
use crate::snapshot::UsageSnapshot;
use crate::task::TaskResource;

/// Owns one handle across the boundary and releases it exactly once.
pub struct NativeMemoryManager {
    name: String,
    handle: ManagerHandle,
    listener: Arc<dyn ReservationListener>,
    boundary: Arc<dyn MemoryManagerBoundary>,
    released: AtomicBool,
}

impl NativeMemoryManager {
    pub fn create(
        name: impl Into<String>,
        listener: Arc<dyn ReservationListener>,
        boundary: Arc<dyn MemoryManagerBoundary>,
        config: &MemoryConfig,
        allocator: AllocatorId,
    ) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        let handle = boundary.create(
            &config.backend_name,
            &name,
            allocator,
            config.reservation_block_size,
            Arc::clone(&listener),
        )?;
        Ok(Self {
            name,
            handle,
            listener,
            boundary,
            released: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> ManagerHandle {
        self.handle
    }

    pub fn listener(&self) -> &Arc<dyn ReservationListener> {
        &self.listener
    }

    /// The handle, unless released. The boundary may hand a released handle
    /// to another manager.
    fn live_handle(&self, op: &str) -> Result<ManagerHandle> {
        if self.is_released() {
            return Err(Error::IllegalState(format!(
                "{op} on released memory manager '{}'",
                self.name
            )));
        }
        Ok(self.handle)
    }

    pub fn reserve(&self, bytes: u64) -> Result<u64> {
        self.boundary.reserve(self.live_handle("reserve")?, bytes)
    }

    pub fn unreserve(&self, bytes: u64) -> Result<u64> {
        self.boundary.unreserve(self.live_handle("unreserve")?, bytes)
    }

    pub fn shrink(&self, bytes: u64) -> Result<u64> {
        self.boundary.shrink(self.live_handle("shrink")?, bytes)
    }

    pub fn collect_memory_usage(&self) -> Result<UsageSnapshot> {
        let handle = self.live_handle("collect_memory_usage")?;
        let bytes = self.boundary.collect_memory_usage(handle)?;
        UsageSnapshot::from_bytes(&bytes)
    }

    /// Bytes the listener still holds from the host.
    pub fn used_bytes(&self) -> u64 {
        self.listener.used_bytes()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Release the native counterpart. Only the first call reaches the
    /// boundary; its leak report (if any) is returned.
    pub fn release(&self) -> Result<Option<LeakReport>> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }
        self.boundary.release(self.handle)
    }
}

impl TaskResource for NativeMemoryManager {
    fn release(&self) -> Result<()> {
        NativeMemoryManager::release(self).map(|_| ())
    }

    /// Lowest priority: released after everything that may still free into it.
    fn priority(&self) -> i32 {
        0
    }

    fn resource_name(&self) -> String {
        format!("{}_mem", self.name)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for NativeMemoryManager {
    fn drop(&mut self) {
        if !self.is_released() {
            if let Err(e) = NativeMemoryManager::release(self) {
                tracing::error!(manager = %self.name, error = %e, "release on drop failed");
            }
        }
    }
}
