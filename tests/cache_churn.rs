//! Property-based tests for the cache as a whole.
//!
//! Random check/evict sequences share one allocator between single experts
//! and layer blocks; after every operation each slot must be either free or
//! owned by exactly one resident expert holding the right bytes.

mod common;

use common::{fixture, pattern, Fixture};
use moe_offload::{CacheConfig, CpuBackend, Error, ExpertCache, ShardRole};
use proptest::prelude::*;

const LAYERS: usize = 5;
const EXPERTS: usize = 4;
const SLOTS: usize = 10;

#[derive(Debug, Clone)]
enum Op {
    CheckExpert(usize, usize),
    CheckLayer(usize),
    EvictExpert(usize, usize),
    EvictLayer(usize),
}

fn op() -> impl Strategy<Value = Op> {
    let layer = 0..LAYERS;
    let expert = 0..EXPERTS;
    prop_oneof![
        4 => (layer.clone(), expert.clone()).prop_map(|(l, e)| Op::CheckExpert(l, e)),
        2 => layer.clone().prop_map(Op::CheckLayer),
        2 => (layer.clone(), expert).prop_map(|(l, e)| Op::EvictExpert(l, e)),
        1 => layer.prop_map(Op::EvictLayer),
    ]
}

fn cache(fx: &Fixture) -> ExpertCache {
    let config = CacheConfig {
        utilization: 1.0,
        memory_total: Some(1 << 30),
        max_slots: Some(SLOTS),
        ..Default::default()
    };
    ExpertCache::new(&fx.manifest, &fx.model, config, &CpuBackend::new()).unwrap()
}

/// Every slot is free or held by exactly one resident expert, and every
/// resident expert reads back its own bytes
fn assert_consistent(cache: &ExpertCache, fx: &Fixture) -> Result<(), TestCaseError> {
    let n_slots = cache.n_slots();
    let mut owner = vec![0u8; n_slots];

    let free = cache.free_ranges();
    let free_total: usize = free.iter().map(|&(_, len)| len).sum();
    prop_assert_eq!(free_total + cache.resident_slots(), n_slots);
    for (start, len) in free {
        for s in start..start + len {
            owner[s] += 1;
        }
    }

    for layer in 0..LAYERS {
        let slots = cache.layer_slots(layer).unwrap();
        for (expert, slot) in slots.into_iter().enumerate() {
            let slot = match slot {
                Some(slot) => slot,
                None => continue,
            };
            prop_assert!(slot < n_slots);
            prop_assert_eq!(cache.id_map(layer, expert).unwrap(), slot);
            owner[slot] += 1;
            for role in ShardRole::ALL {
                prop_assert_eq!(
                    cache.read_expert(layer, expert, role).unwrap(),
                    pattern(layer, expert, role, fx.expert_bytes())
                );
            }
        }
    }
    prop_assert!(owner.iter().all(|&c| c == 1), "slot ownership {:?}", owner);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn churn_keeps_slots_singly_owned(ops in prop::collection::vec(op(), 1..120)) {
        let fx = fixture(LAYERS, 0, EXPERTS);
        let cache = cache(&fx);

        for op in ops {
            match op {
                Op::CheckExpert(l, e) => {
                    let slot = cache.check_expert(l, e).unwrap();
                    prop_assert_eq!(cache.id_map(l, e).unwrap(), slot);
                }
                Op::CheckLayer(l) => {
                    cache.check_layer(l).unwrap();
                    let slots = cache.layer_slots(l).unwrap();
                    prop_assert!(slots.iter().all(Option::is_some));
                }
                Op::EvictExpert(l, e) => match cache.evict_expert(l, e) {
                    Ok(_) => prop_assert!(cache.id_map(l, e).is_err()),
                    // Experts inside a layer block are evicted with the layer
                    Err(Error::Invariant(_)) => {
                        prop_assert!(cache.layer_slots(l).unwrap().iter().all(Option::is_some));
                    }
                    Err(e) => return Err(TestCaseError::fail(format!("evict_expert: {}", e))),
                },
                Op::EvictLayer(l) => {
                    cache.evict_layer(l).unwrap();
                    prop_assert!(cache.layer_slots(l).unwrap().iter().all(Option::is_none));
                }
            }
            assert_consistent(&cache, &fx)?;
        }
    }
}
