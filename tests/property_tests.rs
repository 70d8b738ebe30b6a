//! Model-based property tests for lease accounting

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use resource_handle::{HandleState, Lease, ResourceManager};

#[derive(Debug, Clone)]
enum Op {
    Acquire,
    Release(usize),
    Replace,
    ReplaceAndAcquire,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Acquire),
        4 => any::<usize>().prop_map(Op::Release),
        1 => Just(Op::Replace),
        1 => Just(Op::ReplaceAndAcquire),
    ]
}

struct Payload {
    generation: u64,
    freed: Arc<Mutex<Vec<u64>>>,
}

fn free_payload(payload: Payload) {
    payload.freed.lock().unwrap().push(payload.generation);
}

/// Expected frees: every superseded generation without leases.
fn expected_freed(active: u64, held: &[Lease<Payload>]) -> Vec<u64> {
    let mut leases: BTreeMap<u64, usize> = BTreeMap::new();
    for lease in held {
        *leases.entry(lease.generation()).or_default() += 1;
    }
    (0..active).filter(|g| !leases.contains_key(g)).collect()
}

proptest! {
    #[test]
    fn lease_accounting_matches_model(ops in prop::collection::vec(op(), 1..200)) {
        let freed = Arc::new(Mutex::new(Vec::new()));
        let manager = ResourceManager::with_free_fn(
            Payload { generation: 0, freed: freed.clone() },
            free_payload,
        ).unwrap();

        let mut active = 0u64;
        let mut held: Vec<Lease<Payload>> = Vec::new();
        let (mut acquires, mut releases) = (0u64, 0u64);

        for op in ops {
            match op {
                Op::Acquire => {
                    let lease = manager.acquire();
                    prop_assert_eq!(lease.generation(), active);
                    held.push(lease);
                    acquires += 1;
                }
                Op::Release(index) => {
                    if !held.is_empty() {
                        held.swap_remove(index % held.len()).release();
                        releases += 1;
                    }
                }
                Op::Replace => {
                    active += 1;
                    let id = manager
                        .replace(Payload { generation: active, freed: freed.clone() })
                        .unwrap();
                    prop_assert_eq!(id.generation(), active);
                }
                Op::ReplaceAndAcquire => {
                    active += 1;
                    let lease = manager
                        .replace_and_acquire(Payload { generation: active, freed: freed.clone() })
                        .unwrap();
                    prop_assert_eq!(lease.generation(), active);
                    held.push(lease);
                    acquires += 1;
                }
            }

            let on_active = held.iter().filter(|l| l.generation() == active).count() as u64;
            prop_assert_eq!(manager.in_use(), on_active);
            prop_assert_eq!(manager.stats().outstanding(), acquires - releases);
            for lease in &held {
                let expected_state = if lease.generation() == active {
                    HandleState::Active
                } else {
                    HandleState::Superseded
                };
                prop_assert_eq!(lease.state(), expected_state);
            }

            let mut actual = freed.lock().unwrap().clone();
            actual.sort_unstable();
            prop_assert_eq!(actual, expected_freed(active, &held));
        }

        drop(held);
        manager.teardown();
        let mut actual = freed.lock().unwrap().clone();
        actual.sort_unstable();
        prop_assert_eq!(actual, (0..=active).collect::<Vec<_>>());
    }
}
