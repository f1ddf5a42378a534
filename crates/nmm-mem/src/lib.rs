#![forbid(unsafe_code)]
//! nmm-mem: task-scoped native memory reservation manager.
//!
//! Native allocations reserve bytes through a [`ReservationManager`], which
//! rounds every request up to the reservation block size and forwards it to a
//! [`ReservationListener`]. The listener's [`MemoryConsumer`] asks the host
//! budget for memory and, when refused, spills once through its [`Spiller`]
//! before failing with [`Error::OutOfMemory`].
//!
//! Managers are addressed by opaque handles through a [`MemoryManagerBoundary`]
//! and handed out, wrapped in allocators, by an [`AllocatorRegistry`] that ties
//! their lifetime to the owning task.

pub mod allocator;
pub mod boundary;
pub mod consumer;
pub mod error;
pub mod listener;
pub mod manager;
pub mod native;
pub mod pool;
pub mod registry;
pub mod snapshot;
pub mod spiller;
pub mod task;
pub mod tracking;

pub use allocator::NativeMemoryAllocator;
pub use boundary::{InProcessBoundary, MemoryManagerBoundary};
pub use consumer::MemoryConsumer;
pub use error::{Error, Result};
pub use listener::{ManagedReservationListener, ReservationListener};
pub use manager::{LeakReport, ManagerState, ReservationManager};
pub use native::NativeMemoryManager;
pub use pool::SharedMemoryPool;
pub use registry::{AllocatorRegistry, CONTEXT_ALLOCATOR_KEY};
pub use snapshot::UsageSnapshot;
pub use spiller::{NoopSpiller, Spiller};
pub use task::{TaskContext, TaskResource, TaskScope};
pub use tracking::{PeakTracker, TaskMemoryMetrics};
