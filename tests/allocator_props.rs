//! Property-based tests for the slot allocator.
//!
//! Random allocate/free churn must keep the free list exact, disjoint and
//! fully coalesced.

use moe_offload::SlotAllocator;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    /// Allocate a run of this many slots
    Allocate(usize),
    /// Free the live run at this index (modulo the live count)
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..=8).prop_map(Op::Allocate),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

/// Free ranges are ascending, disjoint and never touch
fn assert_coalesced(ranges: &[(usize, usize)]) -> Result<(), TestCaseError> {
    for w in ranges.windows(2) {
        let (a, a_len) = w[0];
        let (b, _) = w[1];
        prop_assert!(a + a_len < b, "ranges {:?} overlap or touch", w);
    }
    for &(_, len) in ranges {
        prop_assert!(len > 0);
    }
    Ok(())
}

proptest! {
    /// Free slots plus live slots always equal the pool size, and live
    /// runs never overlap each other or the free list
    #[test]
    fn churn_keeps_accounting_exact(n_slots in 1usize..64, ops in prop::collection::vec(op(), 0..200)) {
        let mut alloc = SlotAllocator::new(n_slots);
        let mut live: Vec<(usize, usize)> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate(n) => {
                    if let Some(pos) = alloc.allocate(n) {
                        prop_assert!(pos + n <= n_slots);
                        live.push((pos, n));
                    } else {
                        prop_assert!(n > alloc.largest_free());
                    }
                }
                Op::Free(i) => {
                    if !live.is_empty() {
                        let (pos, n) = live.swap_remove(i % live.len());
                        alloc.free(pos, n);
                    }
                }
            }

            let held: usize = live.iter().map(|&(_, n)| n).sum();
            prop_assert_eq!(alloc.free_slots() + held, n_slots);

            let mut owner = vec![0u8; n_slots];
            for &(pos, n) in &live {
                for s in pos..pos + n {
                    owner[s] += 1;
                }
            }
            for (start, len) in alloc.free_ranges() {
                for s in start..start + len {
                    owner[s] += 1;
                }
            }
            prop_assert!(owner.iter().all(|&c| c == 1), "slot ownership {:?}", owner);
            assert_coalesced(&alloc.free_ranges())?;
        }
    }

    /// Freeing everything always returns a single range over the pool
    #[test]
    fn freeing_all_restores_one_range(n_slots in 1usize..64, sizes in prop::collection::vec(1usize..6, 1..20)) {
        let mut alloc = SlotAllocator::new(n_slots);
        let live: Vec<_> = sizes
            .into_iter()
            .filter_map(|n| alloc.allocate(n).map(|pos| (pos, n)))
            .collect();

        for (pos, n) in live.into_iter().rev() {
            alloc.free(pos, n);
        }
        prop_assert_eq!(alloc.free_ranges(), vec![(0, n_slots)]);
    }

    /// Two adjacent runs freed in either order coalesce into one range
    #[test]
    fn adjacent_runs_coalesce(a in 1usize..10, b in 1usize..10, a_first in any::<bool>()) {
        let n_slots = a + b + 1;
        let mut alloc = SlotAllocator::new(n_slots);
        let pa = alloc.allocate(a).unwrap();
        let pb = alloc.allocate(b).unwrap();
        let _guard = alloc.allocate(1).unwrap();

        if a_first {
            alloc.free(pa, a);
            alloc.free(pb, b);
        } else {
            alloc.free(pb, b);
            alloc.free(pa, a);
        }
        prop_assert_eq!(alloc.free_ranges(), vec![(0, a + b)]);
    }
}
