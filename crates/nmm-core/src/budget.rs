//! Abstract host memory budget interface.
//!
//! The host engine owns the shared memory pool that every task draws from.
//! We keep only the trait here; `nmm-mem` ships an in-process pool and the
//! reservation logic that drives it.

/// Admission control for the shared, host-side memory pool.
///
/// Implementations must be thread-safe: every task's consumer calls into the
/// same budget concurrently.
pub trait HostMemoryBudget: Send + Sync + 'static {
    /// Request `bytes` from the shared pool on behalf of `consumer`.
    ///
    /// Returns the number of bytes actually granted, which may be anything in
    /// `0..=bytes`. The caller owns the granted bytes and must hand them back
    /// through [`HostMemoryBudget::release`].
    fn acquire(&self, bytes: u64, consumer: &str) -> u64;

    /// Return `bytes` previously granted to `consumer`.
    fn release(&self, bytes: u64, consumer: &str);

    /// Total configured capacity (bytes).
    fn capacity_bytes(&self) -> u64;

    /// Approximate currently granted bytes (advisory; not a correctness API).
    fn used_bytes(&self) -> u64;
}

// NOTE: Do *not* add a default impl that grants everything. Unbounded budgets
// must be an explicit choice of the host.
