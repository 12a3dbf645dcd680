//! End-to-end single-threaded tree scenarios.

mod common;

use common::{assert_found, assert_missing, setup};
use nvtree::Key;
use nvtree::keyinput::VecKeys;
use nvtree::leaf::Leaf;

/// Walk the sibling chain from the first leaf, returning per-leaf
/// `(entry count, min key, max key)`.
fn leaf_chain(tree: &nvtree::NvTree) -> Vec<(usize, Key, Key)> {
    let mut out = Vec::new();
    let mut p = tree.first_leaf();
    while p != 0 {
        // SAFETY: the chain holds live leaves; the tree is quiescent.
        let leaf = unsafe { &*(p as *const Leaf) };
        let meta = leaf.load_meta();
        out.push((meta.num(), leaf.min_key(&meta), leaf.max_key(&meta)));
        p = leaf.next_sibling();
    }
    out
}

#[test]
fn single_leaf_lifecycle() {
    let env = setup(1, 8, 8);
    let keys: Vec<Key> = (1..=10).collect();
    let level = env.tree.bulkload(keys.len(), &VecKeys::new(keys.clone()), 1.0);
    assert_eq!(level, 0, "ten keys fit in one leaf");

    let chain = leaf_chain(&env.tree);
    assert_eq!(chain, vec![(10, 1, 10)]);

    for &k in &keys {
        assert_found(&env.tree, k);
    }
    assert_missing(&env.tree, 11);

    env.tree.check();

    // Delete everything: the root leaf stays, empty.
    for &k in &keys {
        env.tree.del(k);
    }
    assert_eq!(env.tree.level(), 0);
    for &k in &keys {
        assert_missing(&env.tree, k);
    }
    assert_missing(&env.tree, 5);
}

#[test]
fn full_leaf_splits_at_the_median() {
    let env = setup(1, 8, 8);
    // Odd keys 1..=27: exactly 14, one full leaf.
    let odds: Vec<Key> = (0..14).map(|i| 2 * i + 1).collect();
    let level = env.tree.bulkload(odds.len(), &VecKeys::new(odds.clone()), 1.0);
    assert_eq!(level, 0);

    // The first insert splits at the median key 15.
    env.tree.insert(2, 2);
    assert_eq!(env.tree.level(), 1);
    env.tree.check();

    let chain = leaf_chain(&env.tree);
    assert_eq!(chain.len(), 2);
    let (left, right) = (chain[0], chain[1]);
    assert_eq!(left, (8, 1, 13), "left half keeps keys below 15 plus the new 2");
    assert_eq!(right, (7, 15, 27), "right half starts at the median");

    // Fill in the remaining even keys.
    for k in (4..=28).step_by(2) {
        env.tree.insert(k, k as u64);
    }
    env.tree.check();
    for k in 1..=28 {
        assert_found(&env.tree, k);
    }
}

#[test]
fn parallel_bulkload_million_keys() {
    let env = setup(4, 64, 96);
    let keys: Vec<Key> = (1..=1_000_000).collect();
    let level = env.tree.bulkload(keys.len(), &VecKeys::new(keys), 0.7);
    assert!(level >= 2);

    env.tree.check();

    // Fill factor 0.7 targets 9 keys per leaf; only the per-worker last
    // leaves may fall short.
    let chain = leaf_chain(&env.tree);
    assert_eq!(chain.first().unwrap().1, 1);
    assert_eq!(chain.last().unwrap().2, 1_000_000);

    let mut short_leaves = 0;
    let mut prev_max = 0;
    for &(num, min, max) in &chain {
        assert!(min > prev_max, "leaf chain must ascend");
        prev_max = max;
        if num < 9 {
            short_leaves += 1;
        }
    }
    assert!(short_leaves <= 4, "at most one short leaf per worker");

    assert_found(&env.tree, 1);
    assert_found(&env.tree, 567_890);
    assert_found(&env.tree, 1_000_000);
    assert_missing(&env.tree, 1_000_001);
}

#[test]
fn insert_lookup_delete_round_trip() {
    let env = setup(1, 8, 8);
    env.tree.bulkload(1, &VecKeys::new(vec![0]), 1.0);

    let keys: Vec<Key> = (1..=500).map(|i| i * 7).collect();
    for &k in &keys {
        env.tree.insert(k, k as u64);
    }
    env.tree.check();
    for &k in &keys {
        assert_found(&env.tree, k);
    }

    for &k in &keys {
        env.tree.del(k);
    }
    for &k in &keys {
        assert_missing(&env.tree, k);
    }
    env.tree.check();
    assert_found(&env.tree, 0);
}

#[test]
fn insert_is_idempotent() {
    let env = setup(1, 8, 8);
    env.tree.bulkload(1, &VecKeys::new(vec![0]), 1.0);

    for _ in 0..3 {
        env.tree.insert(42, 42);
    }
    // A duplicate insert is a no-op: the payload of the first wins and the
    // key exists exactly once (delete once removes it for good).
    assert_found(&env.tree, 42);
    env.tree.del(42);
    assert_missing(&env.tree, 42);
    env.tree.check();
}

#[test]
fn delete_is_idempotent() {
    let env = setup(1, 8, 8);
    let keys: Vec<Key> = (1..=20).collect();
    env.tree.bulkload(keys.len(), &VecKeys::new(keys), 1.0);

    env.tree.del(7);
    env.tree.del(7);
    env.tree.del(999); // never present
    assert_missing(&env.tree, 7);
    assert_found(&env.tree, 8);
    env.tree.check();
}

#[test]
fn ascending_deletes_track_the_first_leaf() {
    let env = setup(1, 8, 8);
    let keys: Vec<Key> = (1..=100).collect();
    env.tree.bulkload(keys.len(), &VecKeys::new(keys.clone()), 1.0);
    assert!(env.tree.level() >= 1);

    // Deleting in ascending order repeatedly empties the leftmost leaf, so
    // the persistent first-leaf slot must keep moving right.
    for &k in &keys[..keys.len() - 1] {
        env.tree.del(k);
        let first = env.tree.first_leaf();
        // SAFETY: quiescent tree.
        let leaf = unsafe { &*(first as *const Leaf) };
        let meta = leaf.load_meta();
        assert!(leaf.max_key(&meta) > k, "first leaf must hold undeleted keys");
    }

    // One key left; the tree has collapsed to a single root leaf.
    assert_eq!(env.tree.level(), 0);
    assert_found(&env.tree, 100);
}

#[test]
fn descending_deletes_unlink_through_left_siblings() {
    let env = setup(1, 8, 8);
    let keys: Vec<Key> = (1..=100).collect();
    env.tree.bulkload(keys.len(), &VecKeys::new(keys.clone()), 1.0);

    for &k in keys.iter().rev().take(99) {
        env.tree.del(k);
    }
    assert_eq!(env.tree.level(), 0);
    assert_found(&env.tree, 1);
    for &k in &keys[1..] {
        assert_missing(&env.tree, k);
    }
}

#[test]
fn randomize_keeps_the_tree_searchable() {
    let env = setup(1, 8, 8);
    let keys: Vec<Key> = (1..=200).map(|i| i * 3).collect();
    env.tree.bulkload(keys.len(), &VecKeys::new(keys.clone()), 0.8);

    env.tree.randomize();
    env.tree.randomize(); // shuffling twice is still consistent
    env.tree.check();

    for &k in &keys {
        assert_found(&env.tree, k);
    }
    assert_missing(&env.tree, 4);
}

#[test]
fn bulkload_respects_fill_factor() {
    let env = setup(1, 8, 8);
    let keys: Vec<Key> = (1..=70).collect();
    // fill 0.5 -> 7 keys per leaf -> 10 leaves.
    env.tree.bulkload(keys.len(), &VecKeys::new(keys), 0.5);
    env.tree.check();

    let chain = leaf_chain(&env.tree);
    assert_eq!(chain.len(), 10);
    assert!(chain.iter().all(|&(num, _, _)| num == 7));
}
