//! Peak and per-task usage tracking.
//!
//! Keep this cheap: everything here is read from monitoring threads while the
//! owning task keeps reserving.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct PeakTracker {
    peak_bytes: AtomicU64,
}

impl PeakTracker {
    pub fn new() -> Self {
        Self {
            peak_bytes: AtomicU64::new(0),
        }
    }

    /// Record a new "used bytes" value; updates peak if higher.
    pub fn record_used(&self, used_bytes: u64) {
        let mut cur = self.peak_bytes.load(Ordering::Relaxed);
        while used_bytes > cur {
            match self.peak_bytes.compare_exchange(
                cur,
                used_bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn peak(&self) -> u64 {
        self.peak_bytes.load(Ordering::Relaxed)
    }
}

/// Native bytes reserved by every listener of one task, shared between them.
#[derive(Debug, Default)]
pub struct TaskMemoryMetrics {
    reserved: AtomicU64,
    peak: PeakTracker,
}

impl TaskMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, bytes: u64) {
        let now = self.reserved.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak.record_used(now);
    }

    /// Fails instead of wrapping when more is released than was recorded.
    pub fn dec(&self, bytes: u64) -> Result<()> {
        let mut cur = self.reserved.load(Ordering::Relaxed);
        loop {
            let next = cur.checked_sub(bytes).ok_or_else(|| Error::ArithmeticUnderflow {
                name: "task metrics".into(),
                requested: bytes,
                used: cur,
            })?;
            match self
                .reserved
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Ok(()),
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved.load(Ordering::Relaxed)
    }

    pub fn peak_bytes(&self) -> u64 {
        self.peak.peak()
    }
}
