//! Reservation manager accounting, block rounding, spill, and shrink tests

use nmm_core::budget::HostMemoryBudget;
use nmm_core::id::AllocatorId;
use nmm_mem::{
    Error, ManagedReservationListener, ManagerState, MemoryConsumer, NoopSpiller,
    ReservationManager, SharedMemoryPool, Spiller, TaskMemoryMetrics, UsageSnapshot,
};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Host budget that records every admission request.
struct RecordingBudget {
    pool: SharedMemoryPool,
    requests: Mutex<Vec<u64>>,
}

impl RecordingBudget {
    fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            pool: SharedMemoryPool::new(capacity),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<u64> {
        self.requests.lock().unwrap().clone()
    }
}

impl HostMemoryBudget for RecordingBudget {
    fn acquire(&self, bytes: u64, consumer: &str) -> u64 {
        self.requests.lock().unwrap().push(bytes);
        self.pool.acquire(bytes, consumer)
    }
    fn release(&self, bytes: u64, consumer: &str) {
        self.pool.release(bytes, consumer)
    }
    fn capacity_bytes(&self) -> u64 {
        self.pool.capacity_bytes()
    }
    fn used_bytes(&self) -> u64 {
        self.pool.used_bytes()
    }
}

/// Spiller that frees buffered bytes back through the manager it serves.
#[derive(Default)]
struct BufferSpiller {
    manager: OnceCell<Arc<ReservationManager>>,
    buffered: AtomicU64,
    calls: Mutex<Vec<u64>>,
}

impl Spiller for BufferSpiller {
    fn spill(&self, size: u64) -> u64 {
        self.calls.lock().unwrap().push(size);
        let Some(manager) = self.manager.get() else {
            return 0;
        };
        let n = size.min(self.buffered.load(Ordering::Acquire));
        if n == 0 {
            return 0;
        }
        match manager.unreserve(n) {
            Ok(freed) => {
                self.buffered.fetch_sub(freed, Ordering::AcqRel);
                freed
            }
            Err(_) => 0,
        }
    }
}

fn build(
    budget: Arc<dyn HostMemoryBudget>,
    spiller: Arc<dyn Spiller>,
    block: u64,
) -> Arc<ReservationManager> {
    let consumer = Arc::new(MemoryConsumer::new("task-1", budget, spiller));
    let listener = Arc::new(ManagedReservationListener::new(
        consumer,
        Arc::new(TaskMemoryMetrics::new()),
    ));
    Arc::new(
        ReservationManager::create("task-1", "native", AllocatorId::GLOBAL, block, listener)
            .expect("create manager"),
    )
}

#[test]
fn test_one_byte_reserves_a_full_block_then_underflows() {
    let budget = RecordingBudget::new(u64::MAX);
    let m = build(budget.clone(), Arc::new(NoopSpiller), 1024);

    assert_eq!(m.reserve(1).unwrap(), 1024);
    assert_eq!(m.used_bytes(), 1024);
    assert_eq!(budget.requests(), vec![1024]);

    assert_eq!(m.unreserve(1024).unwrap(), 1024);
    assert_eq!(m.used_bytes(), 0);

    let err = m.unreserve(1).unwrap_err();
    assert!(matches!(
        err,
        Error::ArithmeticUnderflow {
            requested: 1,
            used: 0,
            ..
        }
    ));
    assert!(!err.is_recoverable());
    assert_eq!(m.used_bytes(), 0);
    assert_eq!(budget.used_bytes(), 0);
}

#[test]
fn test_requests_round_up_to_next_block_multiple() {
    let budget = RecordingBudget::new(u64::MAX);
    let m = build(budget.clone(), Arc::new(NoopSpiller), 1000);

    for (bytes, expected) in [(1, 1000), (1000, 1000), (1001, 2000), (2999, 3000)] {
        assert_eq!(m.reserve(bytes).unwrap(), expected);
    }
    assert_eq!(budget.requests(), vec![1000, 1000, 2000, 3000]);
    assert_eq!(m.used_bytes(), 7000);

    // Zero-byte reservations never reach the host.
    assert_eq!(m.reserve(0).unwrap(), 0);
    assert_eq!(budget.requests().len(), 4);
}

#[test]
fn test_used_bytes_tracks_reserve_unreserve_sequence() {
    let budget = RecordingBudget::new(u64::MAX);
    let m = build(budget.clone(), Arc::new(NoopSpiller), 256);

    let mut expected = 0u64;
    let mut seed = 0x2545_f491_4f6c_dd1du64;
    for _ in 0..500 {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        if seed % 3 == 0 && expected > 0 {
            let bytes = 1 + seed % expected;
            assert_eq!(m.unreserve(bytes).unwrap(), bytes);
            expected -= bytes;
        } else {
            let bytes = 1 + seed % 2000;
            let granted = m.reserve(bytes).unwrap();
            assert!(granted >= bytes && granted % 256 == 0);
            expected += granted;
        }
        assert_eq!(m.used_bytes(), expected);
        assert_eq!(budget.used_bytes(), expected);
    }
}

#[test]
fn test_spill_receives_exact_shortfall_after_partial_grant() {
    let budget = RecordingBudget::new(4096);
    // Another consumer holds 3072 bytes that the spiller can give back.
    assert_eq!(budget.pool.acquire(3072, "cache"), 3072);

    let calls = Arc::new(Mutex::new(Vec::new()));
    let spiller = {
        let pool = budget.pool.clone();
        let calls = Arc::clone(&calls);
        move |size: u64| {
            calls.lock().unwrap().push(size);
            pool.release(size, "cache");
            size
        }
    };
    let m = build(budget.clone(), Arc::new(spiller), 1024);

    assert_eq!(m.reserve(2048).unwrap(), 2048);
    assert_eq!(*calls.lock().unwrap(), vec![1024]);
    assert_eq!(budget.requests(), vec![2048, 1024]);
    assert_eq!(m.used_bytes(), 2048);
}

#[test]
fn test_insufficient_spill_fails_with_out_of_memory() {
    let budget = RecordingBudget::new(1024);
    assert_eq!(budget.pool.acquire(1024, "cache"), 1024);

    let calls = Arc::new(Mutex::new(Vec::new()));
    let spiller = {
        let pool = budget.pool.clone();
        let calls = Arc::clone(&calls);
        move |size: u64| {
            calls.lock().unwrap().push(size);
            pool.release(512, "cache");
            512
        }
    };
    let m = build(budget.clone(), Arc::new(spiller), 1024);

    let err = m.reserve(100).unwrap_err();
    assert!(matches!(
        err,
        Error::OutOfMemory {
            requested: 1024,
            granted: 512,
            spilled: 512,
            ..
        }
    ));
    assert!(err.is_recoverable());
    // Refused outright: the spiller is asked for the whole request.
    assert_eq!(*calls.lock().unwrap(), vec![1024]);
    // The partial grant went back to the host.
    assert_eq!(budget.used_bytes(), 512);
    assert_eq!(m.used_bytes(), 0);
}

#[test]
fn test_noop_spiller_out_of_memory() {
    let budget = RecordingBudget::new(2048);
    let m = build(budget.clone(), Arc::new(NoopSpiller), 1024);

    m.reserve(2048).unwrap();
    assert!(matches!(m.reserve(1), Err(Error::OutOfMemory { .. })));
    assert_eq!(m.used_bytes(), 2048);
    assert_eq!(budget.requests(), vec![2048, 1024, 1024]);
}

#[test]
fn test_spiller_can_free_through_the_reserving_manager() {
    let budget = RecordingBudget::new(4096);
    let spiller = Arc::new(BufferSpiller::default());
    let m = build(budget.clone(), spiller.clone(), 1024);
    assert!(spiller.manager.set(Arc::clone(&m)).is_ok());

    m.reserve(4096).unwrap();
    spiller.buffered.store(4096, Ordering::Release);

    // Pool is full: the reserve spills 1024 of its own bytes and retries.
    assert_eq!(m.reserve(1024).unwrap(), 1024);
    assert_eq!(*spiller.calls.lock().unwrap(), vec![1024]);
    assert_eq!(m.used_bytes(), 4096);
    assert_eq!(spiller.buffered.load(Ordering::Acquire), 3072);
    assert_eq!(budget.used_bytes(), 4096);
}

#[test]
fn test_shrink_never_reports_more_than_held() {
    let budget = RecordingBudget::new(u64::MAX);
    let spiller = Arc::new(BufferSpiller::default());
    let m = build(budget.clone(), spiller.clone(), 1024);
    assert!(spiller.manager.set(Arc::clone(&m)).is_ok());

    m.reserve(3000).unwrap();
    spiller.buffered.store(2048, Ordering::Release);

    // Partial relief.
    assert_eq!(m.shrink(1024).unwrap(), 1024);
    assert_eq!(m.used_bytes(), 2048);

    // Asking for more than held is capped at what is held and spillable.
    let before = m.used_bytes();
    let freed = m.shrink(1 << 40).unwrap();
    assert!(freed <= before);
    assert_eq!(freed, 1024);
    assert_eq!(*spiller.calls.lock().unwrap(), vec![1024, 2048]);

    // Nothing spillable left.
    assert_eq!(m.shrink(1 << 40).unwrap(), 0);
}

#[test]
fn test_shrink_ignores_spiller_overclaims() {
    let budget = RecordingBudget::new(u64::MAX);
    let m = build(budget.clone(), Arc::new(|_size: u64| 1_000_000u64), 1024);

    m.reserve(1024).unwrap();
    assert_eq!(m.shrink(1024).unwrap(), 0);
    assert_eq!(m.used_bytes(), 1024);

    m.unreserve(1024).unwrap();
    // Nothing held: the spiller is not even asked.
    assert_eq!(m.shrink(1024).unwrap(), 0);
}

#[test]
fn test_snapshot_is_readable_while_reserving() {
    let budget = RecordingBudget::new(u64::MAX);
    let m = build(budget, Arc::new(NoopSpiller), 512);

    let monitor = {
        let m = Arc::clone(&m);
        thread::spawn(move || {
            for _ in 0..1000 {
                let bytes = m.collect_memory_usage().expect("collect");
                let snap = UsageSnapshot::from_bytes(&bytes).expect("decode");
                assert_eq!(snap.name, "task-1");
                assert_eq!(snap.block_size, 512);
                assert!(snap.used_bytes <= snap.peak_bytes);
            }
        })
    };

    for _ in 0..1000 {
        let granted = m.reserve(700).unwrap();
        m.unreserve(granted).unwrap();
    }
    monitor.join().expect("monitor panicked");

    let snap = m.snapshot();
    assert_eq!(snap.used_bytes, 0);
    assert_eq!(snap.peak_bytes, 1024);
    assert_eq!(snap.reservations, 1000);
}

#[test]
fn test_release_is_idempotent_and_terminal() {
    let budget = RecordingBudget::new(u64::MAX);
    let m = build(budget, Arc::new(NoopSpiller), 1024);

    m.reserve(10).unwrap();
    m.unreserve(1024).unwrap();
    assert!(m.release().is_none());
    assert!(m.release().is_none());
    assert_eq!(m.state(), ManagerState::Released);
    assert!(matches!(m.reserve(1), Err(Error::IllegalState(_))));
    assert!(matches!(m.unreserve(1), Err(Error::IllegalState(_))));
}

#[test]
fn test_leak_report_returned_once() {
    let budget = RecordingBudget::new(u64::MAX);
    let m = build(budget, Arc::new(NoopSpiller), 1024);

    m.reserve(4096).unwrap();
    let report = m.release().expect("leak report");
    assert_eq!(report.leaked_bytes, 4096);
    assert_eq!(report.resource, "task-1_mem");
    assert!(m.release().is_none());
}
