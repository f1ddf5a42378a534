//! Spill capability injected into memory consumers.

use std::sync::Arc;

/// Frees memory on demand.
///
/// `spill` is called synchronously from the reserving thread (or from a host
/// pressure-relief thread via `shrink`). Implementations free task-owned
/// buffers, typically by writing them out, and return the bytes they actually
/// released. Freed native memory must flow back through the normal unreserve
/// path so the host budget sees it.
///
/// The reserving manager's lock is held while `spill` runs. A spiller may call
/// `unreserve` on that manager (it takes no lock) but must not call `reserve`
/// or `shrink` on it: those block on the same lock and deadlock.
pub trait Spiller: Send + Sync {
    fn spill(&self, size: u64) -> u64;
}

/// Spiller for consumers with nothing to evict. Always frees 0 bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSpiller;

impl Spiller for NoopSpiller {
    fn spill(&self, _size: u64) -> u64 {
        0
    }
}

impl<F> Spiller for F
where
    F: Fn(u64) -> u64 + Send + Sync,
{
    fn spill(&self, size: u64) -> u64 {
        self(size)
    }
}

/// Shared no-op spiller, the default for context allocators.
pub fn noop() -> Arc<dyn Spiller> {
    Arc::new(NoopSpiller)
}
