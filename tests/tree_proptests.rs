//! Property-based differential tests against a `BTreeMap` oracle.

mod common;

use std::collections::BTreeMap;

use common::setup;
use nvtree::Key;
use nvtree::keyinput::VecKeys;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Insert(Key),
    Delete(Key),
    Lookup(Key),
}

/// Keys drawn from a small range so inserts, deletes and lookups collide.
fn op_strategy() -> impl Strategy<Value = Op> {
    let key = 1..=240i64;
    prop_oneof![
        3 => key.clone().prop_map(Op::Insert),
        2 => key.clone().prop_map(Op::Delete),
        2 => key.prop_map(Op::Lookup),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Any operation sequence leaves the tree agreeing with the oracle and
    /// structurally sound.
    #[test]
    fn tree_matches_btreemap_oracle(ops in prop::collection::vec(op_strategy(), 1..400)) {
        let env = setup(1, 4, 4);
        // Seed with key 0, outside the operation key range, so the tree is
        // never completely empty.
        env.tree.bulkload(1, &VecKeys::new(vec![0]), 1.0);

        let mut oracle: BTreeMap<Key, u64> = BTreeMap::new();
        for op in &ops {
            match *op {
                Op::Insert(k) => {
                    env.tree.insert(k, k as u64);
                    oracle.entry(k).or_insert(k as u64);
                }
                Op::Delete(k) => {
                    env.tree.del(k);
                    oracle.remove(&k);
                }
                Op::Lookup(k) => {
                    let (leaf, pos) = env.tree.lookup(k);
                    match oracle.get(&k) {
                        Some(&v) => {
                            let pos = pos.expect("oracle says present");
                            // SAFETY: (leaf, pos) came from this lookup.
                            prop_assert_eq!(unsafe { env.tree.get_recptr(leaf, pos) }, v);
                        }
                        None => prop_assert!(pos.is_none()),
                    }
                }
            }
        }

        // Final agreement on every key either side ever touched.
        for k in 0..=241i64 {
            let present = env.tree.lookup(k).1.is_some();
            let expected = k == 0 || oracle.contains_key(&k);
            prop_assert_eq!(present, expected, "key {}", k);
        }
        env.tree.check();
    }

    /// Bulk-loading any sorted unique key set yields exactly that set.
    #[test]
    fn bulkload_contains_exactly_the_input(
        raw in prop::collection::btree_set(1..100_000i64, 1..600),
        bfill in 0.1f32..=1.0,
    ) {
        let env = setup(1, 8, 8);
        let keys: Vec<Key> = raw.into_iter().collect();
        env.tree.bulkload(keys.len(), &VecKeys::new(keys.clone()), bfill);
        env.tree.check();

        for &k in &keys {
            let (leaf, pos) = env.tree.lookup(k);
            let pos = pos.expect("loaded key must be present");
            // SAFETY: (leaf, pos) came from this lookup.
            prop_assert_eq!(unsafe { env.tree.get_recptr(leaf, pos) }, k as u64);
        }
        // Neighbours of loaded keys that were not loaded must miss.
        for &k in keys.iter().take(50) {
            if !keys.contains(&(k + 1)) {
                prop_assert!(env.tree.lookup(k + 1).1.is_none());
            }
        }
    }
}
