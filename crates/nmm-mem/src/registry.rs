//! Allocator registry: the global allocator plus per-task instances.
//!
//! Construct one registry at process start and pass it to whoever allocates.
//! Per-task instances are owned by the task scope: the registry creates them
//! and registers them with the scope, which releases them when the task ends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use nmm_core::config::MemoryConfig;
use nmm_core::id::AllocatorId;

use crate::allocator::NativeMemoryAllocator;
use crate::boundary::{InProcessBoundary, MemoryManagerBoundary};
use crate::consumer::MemoryConsumer;
use crate::error::{Error, Result};
use crate::listener::{ManagedReservationListener, ReservationListener};
use crate::native::NativeMemoryManager;
use crate::snapshot::UsageSnapshot;
use crate::spiller::{self, Spiller};
use crate::task::{TaskResource, TaskScope};

/// Key under which a task caches its context allocator.
pub const CONTEXT_ALLOCATOR_KEY: &str = "nmm.allocator.context";

pub struct AllocatorRegistry {
    config: MemoryConfig,
    boundary: Arc<dyn MemoryManagerBoundary>,
    global: OnceCell<Arc<NativeMemoryAllocator>>,
    next_id: AtomicU64,
}

impl AllocatorRegistry {
    /// Registry over an in-process boundary.
    pub fn new(config: MemoryConfig) -> Result<Self> {
        Self::with_boundary(config, Arc::new(InProcessBoundary::new()))
    }

    pub fn with_boundary(
        config: MemoryConfig,
        boundary: Arc<dyn MemoryManagerBoundary>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            boundary,
            global: OnceCell::new(),
            next_id: AtomicU64::new(AllocatorId::GLOBAL.get() + 1),
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn boundary(&self) -> &Arc<dyn MemoryManagerBoundary> {
        &self.boundary
    }

    /// Process-lifetime allocator; created on first use.
    pub fn global_instance(&self) -> Arc<NativeMemoryAllocator> {
        Arc::clone(
            self.global
                .get_or_init(|| Arc::new(NativeMemoryAllocator::unmanaged(AllocatorId::GLOBAL, "global"))),
        )
    }

    /// Fresh unmanaged allocator for unit tests that run outside any task.
    ///
    /// Never cached and never the global instance, so each test sees its own
    /// counters.
    pub fn standalone_instance(&self) -> Arc<NativeMemoryAllocator> {
        let id = self.next_allocator_id();
        Arc::new(NativeMemoryAllocator::unmanaged(
            id,
            format!("standalone-{}", id.get()),
        ))
    }

    /// The current task's shared allocator, or the global one outside a task.
    pub fn context_instance(
        &self,
        scope: Option<&dyn TaskScope>,
    ) -> Result<Arc<NativeMemoryAllocator>> {
        let scope = match scope {
            Some(s) if s.in_task() => s,
            _ => return Ok(self.global_instance()),
        };

        let resource = scope.get_or_add_resource(CONTEXT_ALLOCATOR_KEY, &mut || {
            let name = format!("task-{}.context", scope.task_id().get());
            let allocator = self.create_task_allocator(scope, spiller::noop(), name)?;
            Ok(allocator as Arc<dyn TaskResource>)
        })?;

        resource
            .as_any()
            .downcast::<NativeMemoryAllocator>()
            .map_err(|_| {
                Error::IllegalState(format!(
                    "task resource '{CONTEXT_ALLOCATOR_KEY}' is not a native memory allocator"
                ))
            })
    }

    /// A fresh allocator whose reservations may spill through `spiller`.
    ///
    /// Only valid inside a task: the spiller evicts task-owned buffers, so its
    /// allocator must die with the task.
    pub fn create_spillable(
        &self,
        scope: Option<&dyn TaskScope>,
        spiller: Arc<dyn Spiller>,
    ) -> Result<Arc<NativeMemoryAllocator>> {
        let scope = match scope {
            Some(s) if s.in_task() => s,
            _ => {
                return Err(Error::IllegalState(
                    "spiller must be used in a task".into(),
                ))
            }
        };
        let id = self.next_allocator_id();
        let name = format!("task-{}.spillable-{}", scope.task_id().get(), id.get());
        let allocator = self.build_task_allocator(id, scope, spiller, name)?;
        scope.add_anonymous_resource(Arc::clone(&allocator) as Arc<dyn TaskResource>)?;
        Ok(allocator)
    }

    /// A manager bound to `listener`, attached to the global allocator.
    pub fn create_manager(
        &self,
        name: impl Into<String>,
        listener: Arc<dyn ReservationListener>,
    ) -> Result<NativeMemoryManager> {
        NativeMemoryManager::create(
            name,
            listener,
            Arc::clone(&self.boundary),
            &self.config,
            self.global_instance().id(),
        )
    }

    /// Aggregate usage of every live manager behind this registry's boundary.
    ///
    /// Managers released while the snapshot is being taken are skipped.
    pub fn collect_all(&self) -> Result<UsageSnapshot> {
        let mut children = Vec::new();
        for handle in self.boundary.live_handles() {
            match self.boundary.collect_memory_usage(handle) {
                Ok(bytes) => children.push(UsageSnapshot::from_bytes(&bytes)?),
                Err(Error::UnknownHandle(_)) | Err(Error::IllegalState(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(UsageSnapshot::aggregate("root", children))
    }

    fn next_allocator_id(&self) -> AllocatorId {
        AllocatorId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn create_task_allocator(
        &self,
        scope: &dyn TaskScope,
        spiller: Arc<dyn Spiller>,
        name: String,
    ) -> Result<Arc<NativeMemoryAllocator>> {
        let id = self.next_allocator_id();
        self.build_task_allocator(id, scope, spiller, name)
    }

    fn build_task_allocator(
        &self,
        id: AllocatorId,
        scope: &dyn TaskScope,
        spiller: Arc<dyn Spiller>,
        name: String,
    ) -> Result<Arc<NativeMemoryAllocator>> {
        let consumer = Arc::new(MemoryConsumer::new(
            name.clone(),
            scope.memory_budget(),
            spiller,
        ));
        let listener = Arc::new(ManagedReservationListener::new(consumer, scope.metrics()));
        let manager = NativeMemoryManager::create(
            name.clone(),
            listener,
            Arc::clone(&self.boundary),
            &self.config,
            id,
        )?;
        tracing::debug!(task = %scope.task_id(), allocator = %id, handle = %manager.handle(), "created task allocator");
        Ok(Arc::new(NativeMemoryAllocator::listenable(
            id,
            name,
            manager,
            self.config.reservation_block_size,
        )))
    }
}
