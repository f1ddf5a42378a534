//! Task scoping: per-task resources with guaranteed release.
//!
//! [`TaskScope`] is what the registry needs from the host engine. The
//! in-process [`TaskContext`] implements it and releases every registered
//! resource exactly once: on [`TaskContext::complete`], or on drop when the
//! task is aborted or unwinds.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use nmm_core::budget::HostMemoryBudget;
use nmm_core::id::TaskId;

use crate::error::{Error, Result};
use crate::tracking::TaskMemoryMetrics;

/// Something a task owns and must release when it ends.
pub trait TaskResource: Send + Sync + 'static {
    fn release(&self) -> Result<()>;

    /// Higher priorities are released first.
    fn priority(&self) -> i32 {
        0
    }

    fn resource_name(&self) -> String;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Host task-scoping collaborator.
pub trait TaskScope: Send + Sync {
    fn task_id(&self) -> TaskId;

    /// `false` once the task has ended.
    fn in_task(&self) -> bool;

    fn memory_budget(&self) -> Arc<dyn HostMemoryBudget>;

    fn metrics(&self) -> Arc<TaskMemoryMetrics>;

    fn is_resource_registered(&self, key: &str) -> bool;

    fn get_resource(&self, key: &str) -> Option<Arc<dyn TaskResource>>;

    /// Return the resource under `key`, creating and registering it with
    /// `init` when absent. Creation and registration are atomic.
    fn get_or_add_resource(
        &self,
        key: &str,
        init: &mut dyn FnMut() -> Result<Arc<dyn TaskResource>>,
    ) -> Result<Arc<dyn TaskResource>>;

    fn add_anonymous_resource(&self, resource: Arc<dyn TaskResource>) -> Result<()>;
}

struct Registered {
    key: Option<String>,
    resource: Arc<dyn TaskResource>,
}

pub struct TaskContext {
    id: TaskId,
    budget: Arc<dyn HostMemoryBudget>,
    metrics: Arc<TaskMemoryMetrics>,
    resources: Mutex<Vec<Registered>>,
    completed: AtomicBool,
}

impl TaskContext {
    pub fn new(id: TaskId, budget: Arc<dyn HostMemoryBudget>) -> Self {
        Self {
            id,
            budget,
            metrics: Arc::new(TaskMemoryMetrics::new()),
            resources: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        }
    }

    /// Run `f` inside a fresh task; resources are released even if `f` panics.
    pub fn run<R>(
        id: TaskId,
        budget: Arc<dyn HostMemoryBudget>,
        f: impl FnOnce(&TaskContext) -> R,
    ) -> R {
        let ctx = TaskContext::new(id, budget);
        let out = f(&ctx);
        if let Err(e) = ctx.complete() {
            tracing::error!(task = %id, error = %e, "task resource release failed");
        }
        out
    }

    pub fn resource_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Registered>> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.completed.load(Ordering::Acquire) {
            return Err(Error::IllegalState(format!(
                "task {} has already completed",
                self.id
            )));
        }
        Ok(())
    }

    /// End the task: release every resource once, highest priority first,
    /// ties in reverse registration order.
    ///
    /// Every resource is attempted; the first failure is returned after all
    /// of them ran. Later calls are no-ops.
    pub fn complete(&self) -> Result<()> {
        if self.completed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut entries: Vec<(usize, Arc<dyn TaskResource>)> = std::mem::take(&mut *self.lock())
            .into_iter()
            .map(|r| r.resource)
            .enumerate()
            .collect();
        entries.sort_by(|(ia, a), (ib, b)| b.priority().cmp(&a.priority()).then(ib.cmp(ia)));

        let mut first_err = None;
        for (_, resource) in entries {
            let name = resource.resource_name();
            match resource.release() {
                Ok(()) => tracing::trace!(task = %self.id, resource = %name, "released"),
                Err(e) => {
                    tracing::error!(task = %self.id, resource = %name, error = %e, "release failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl TaskScope for TaskContext {
    fn task_id(&self) -> TaskId {
        self.id
    }

    fn in_task(&self) -> bool {
        !self.completed.load(Ordering::Acquire)
    }

    fn memory_budget(&self) -> Arc<dyn HostMemoryBudget> {
        Arc::clone(&self.budget)
    }

    fn metrics(&self) -> Arc<TaskMemoryMetrics> {
        Arc::clone(&self.metrics)
    }

    fn is_resource_registered(&self, key: &str) -> bool {
        self.lock().iter().any(|r| r.key.as_deref() == Some(key))
    }

    fn get_resource(&self, key: &str) -> Option<Arc<dyn TaskResource>> {
        self.lock()
            .iter()
            .find(|r| r.key.as_deref() == Some(key))
            .map(|r| Arc::clone(&r.resource))
    }

    fn get_or_add_resource(
        &self,
        key: &str,
        init: &mut dyn FnMut() -> Result<Arc<dyn TaskResource>>,
    ) -> Result<Arc<dyn TaskResource>> {
        self.ensure_open()?;
        let mut resources = self.lock();
        if let Some(r) = resources.iter().find(|r| r.key.as_deref() == Some(key)) {
            return Ok(Arc::clone(&r.resource));
        }
        let resource = init()?;
        resources.push(Registered {
            key: Some(key.to_string()),
            resource: Arc::clone(&resource),
        });
        Ok(resource)
    }

    fn add_anonymous_resource(&self, resource: Arc<dyn TaskResource>) -> Result<()> {
        self.ensure_open()?;
        self.lock().push(Registered {
            key: None,
            resource,
        });
        Ok(())
    }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        if let Err(e) = self.complete() {
            tracing::error!(task = %self.id, error = %e, "task resource release failed during drop");
        }
    }
}
