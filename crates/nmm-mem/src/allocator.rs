//! Allocator instances handed out by the registry.
//!
//! The global allocator only counts bytes. A listenable allocator batches its
//! traffic to the memory manager: it keeps `reserved >= usage` and talks to
//! the manager only when an allocation outgrows the reservation or when frees
//! leave at least one whole block of slack.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use nmm_core::id::AllocatorId;

use crate::error::{Error, Result};
use crate::manager::LeakReport;
use crate::native::NativeMemoryManager;
use crate::task::TaskResource;

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    usage: u64,
    reserved: u64,
}

enum Backing {
    Unmanaged {
        usage: AtomicU64,
    },
    Listenable {
        manager: NativeMemoryManager,
        block_size: u64,
        counters: Mutex<Counters>,
    },
}

pub struct NativeMemoryAllocator {
    id: AllocatorId,
    name: String,
    backing: Backing,
}

impl NativeMemoryAllocator {
    /// Allocator that tracks bytes without reserving them anywhere.
    pub fn unmanaged(id: AllocatorId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            backing: Backing::Unmanaged {
                usage: AtomicU64::new(0),
            },
        }
    }

    /// Allocator that reserves through `manager` in `block_size` steps.
    pub fn listenable(
        id: AllocatorId,
        name: impl Into<String>,
        manager: NativeMemoryManager,
        block_size: u64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            backing: Backing::Listenable {
                manager,
                block_size: block_size.max(1),
                counters: Mutex::new(Counters::default()),
            },
        }
    }

    pub fn id(&self) -> AllocatorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> Option<&NativeMemoryManager> {
        match &self.backing {
            Backing::Unmanaged { .. } => None,
            Backing::Listenable { manager, .. } => Some(manager),
        }
    }

    /// Live bytes handed out by this allocator.
    pub fn bytes_allocated(&self) -> u64 {
        match &self.backing {
            Backing::Unmanaged { usage } => usage.load(Ordering::Relaxed),
            Backing::Listenable { counters, .. } => lock(counters).usage,
        }
    }

    /// Bytes currently reserved upstream on behalf of this allocator.
    pub fn bytes_reserved(&self) -> u64 {
        match &self.backing {
            Backing::Unmanaged { .. } => 0,
            Backing::Listenable { counters, .. } => lock(counters).reserved,
        }
    }

    pub fn allocate(&self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        match &self.backing {
            Backing::Unmanaged { usage } => {
                usage.fetch_add(bytes, Ordering::AcqRel);
                Ok(())
            }
            Backing::Listenable {
                manager, counters, ..
            } => {
                // The lock is not held across the manager call: a spiller
                // triggered by this reservation may free through us.
                let deficit = {
                    let mut c = lock(counters);
                    c.usage += bytes;
                    c.usage.saturating_sub(c.reserved)
                };
                if deficit == 0 {
                    return Ok(());
                }
                match manager.reserve(deficit) {
                    Ok(granted) => {
                        lock(counters).reserved += granted;
                        Ok(())
                    }
                    Err(e) => {
                        lock(counters).usage -= bytes;
                        Err(e)
                    }
                }
            }
        }
    }

    pub fn free(&self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        match &self.backing {
            Backing::Unmanaged { usage } => {
                let mut cur = usage.load(Ordering::Relaxed);
                loop {
                    let next = cur.checked_sub(bytes).ok_or_else(|| self.underflow(bytes, cur))?;
                    match usage.compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed) {
                        Ok(_) => return Ok(()),
                        Err(observed) => cur = observed,
                    }
                }
            }
            Backing::Listenable {
                manager,
                block_size,
                counters,
            } => {
                let give_back = {
                    let mut c = lock(counters);
                    let usage = c.usage;
                    c.usage = usage
                        .checked_sub(bytes)
                        .ok_or_else(|| self.underflow(bytes, usage))?;
                    let slack = c.reserved.saturating_sub(c.usage);
                    let whole = slack / *block_size * *block_size;
                    c.reserved -= whole;
                    whole
                };
                if give_back > 0 {
                    if let Err(e) = manager.unreserve(give_back) {
                        lock(counters).reserved += give_back;
                        return Err(e);
                    }
                }
                Ok(())
            }
        }
    }

    /// Return unused reservation and release the manager.
    ///
    /// Bytes still allocated stay reserved and surface as the manager's leak
    /// report. Calling this again is a no-op.
    pub fn release(&self) -> Result<Option<LeakReport>> {
        let Backing::Listenable {
            manager, counters, ..
        } = &self.backing
        else {
            return Ok(None);
        };
        if manager.is_released() {
            return Ok(None);
        }
        let slack = {
            let mut c = lock(counters);
            let slack = c.reserved.saturating_sub(c.usage);
            c.reserved -= slack;
            slack
        };
        if slack > 0 {
            if let Err(e) = manager.unreserve(slack) {
                tracing::warn!(allocator = %self.name, slack, error = %e, "could not return slack before release");
            }
        }
        manager.release()
    }

    fn underflow(&self, requested: u64, used: u64) -> Error {
        Error::ArithmeticUnderflow {
            name: self.name.clone(),
            requested,
            used,
        }
    }
}

impl TaskResource for NativeMemoryAllocator {
    fn release(&self) -> Result<()> {
        NativeMemoryAllocator::release(self).map(|_| ())
    }

    fn priority(&self) -> i32 {
        0
    }

    fn resource_name(&self) -> String {
        match self.manager() {
            Some(m) => TaskResource::resource_name(m),
            None => self.name.clone(),
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn lock(counters: &Mutex<Counters>) -> std::sync::MutexGuard<'_, Counters> {
    counters.lock().unwrap_or_else(PoisonError::into_inner)
}
