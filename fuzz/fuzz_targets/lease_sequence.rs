#![no_main]

use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use resource_handle::{Lease, ResourceManager};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Arbitrary)]
enum LeaseOperation {
    Acquire,
    Release(usize), // Index into held leases
    Replace,
    ReplaceAndAcquire,
    WithLease,
    CheckInUse,
}

struct Payload {
    alive: AtomicBool,
    frees: Arc<AtomicUsize>,
}

impl Payload {
    fn new(frees: &Arc<AtomicUsize>) -> Self {
        Self {
            alive: AtomicBool::new(true),
            frees: frees.clone(),
        }
    }
}

fn free_payload(payload: Payload) {
    assert!(payload.alive.swap(false, Ordering::SeqCst), "payload freed twice");
    payload.frees.fetch_add(1, Ordering::SeqCst);
}

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);

    let operations: Result<Vec<LeaseOperation>, _> = (0..64)
        .map(|_| LeaseOperation::arbitrary(&mut u))
        .collect();

    if let Ok(ops) = operations {
        fuzz_lease_sequence(ops);
    }
});

fn fuzz_lease_sequence(operations: Vec<LeaseOperation>) {
    let frees = Arc::new(AtomicUsize::new(0));
    let manager = ResourceManager::with_free_fn(Payload::new(&frees), free_payload).unwrap();
    let mut held: Vec<Lease<Payload>> = Vec::new();
    let mut generations = 1usize;

    for op in operations {
        match op {
            LeaseOperation::Acquire => held.push(manager.acquire()),
            LeaseOperation::Release(idx) => {
                if !held.is_empty() {
                    let lease = held.swap_remove(idx % held.len());
                    assert!(lease.alive.load(Ordering::SeqCst));
                    lease.release();
                }
            }
            LeaseOperation::Replace => {
                manager.replace(Payload::new(&frees)).unwrap();
                generations += 1;
            }
            LeaseOperation::ReplaceAndAcquire => {
                held.push(manager.replace_and_acquire(Payload::new(&frees)).unwrap());
                generations += 1;
            }
            LeaseOperation::WithLease => {
                manager.with_lease(|payload| assert!(payload.alive.load(Ordering::SeqCst)));
            }
            LeaseOperation::CheckInUse => {
                let active = manager.active_id();
                let expected = held.iter().filter(|l| l.id() == active).count() as u64;
                assert_eq!(manager.in_use(), expected);
            }
        }

        for lease in &held {
            assert!(lease.alive.load(Ordering::SeqCst), "leased payload was freed");
        }
        assert!(frees.load(Ordering::SeqCst) < generations);
    }

    drop(held);
    drop(manager);
    assert_eq!(frees.load(Ordering::SeqCst), generations);
}
