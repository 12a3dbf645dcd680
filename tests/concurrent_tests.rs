//! Concurrent point-operation tests.
//!
//! Every thread binds a distinct worker id before touching the tree, as the
//! per-thread pools require.

mod common;

use common::{assert_found, assert_missing, setup};
use nvtree::keyinput::VecKeys;
use nvtree::set_worker_id;

#[test]
fn concurrent_inserts_across_eight_threads() {
    const THREADS: usize = 8;
    const KEYS: i64 = 10_000;

    let env = setup(THREADS, 32, 32);
    // Point operations need a seeded tree.
    env.tree.bulkload(1, &VecKeys::new(vec![0]), 1.0);

    let tree = &env.tree;
    std::thread::scope(|s| {
        for t in 0..THREADS {
            s.spawn(move || {
                set_worker_id(t);
                let per = KEYS / THREADS as i64;
                let start = 1 + t as i64 * per;
                let end = if t == THREADS - 1 { KEYS } else { start + per - 1 };
                for k in start..=end {
                    tree.insert(k, k as u64);
                }
            });
        }
    });

    env.tree.check();
    for k in 0..=KEYS {
        assert_found(&env.tree, k);
    }
}

#[test]
fn interleaved_key_ranges_contend_on_shared_leaves() {
    const THREADS: usize = 4;
    const KEYS: i64 = 4_000;

    let env = setup(THREADS, 16, 16);
    env.tree.bulkload(1, &VecKeys::new(vec![0]), 1.0);

    // Thread t inserts keys congruent to t mod THREADS, so neighbours keep
    // landing in the same leaves and the lock-set retries get exercised.
    let tree = &env.tree;
    std::thread::scope(|s| {
        for t in 0..THREADS {
            s.spawn(move || {
                set_worker_id(t);
                let mut k = 1 + t as i64;
                while k <= KEYS {
                    tree.insert(k, k as u64);
                    k += THREADS as i64;
                }
            });
        }
    });

    env.tree.check();
    for k in 1..=KEYS {
        assert_found(&env.tree, k);
    }
}

#[test]
fn concurrent_deletes_leave_the_rest_intact() {
    const THREADS: usize = 4;
    const KEYS: i64 = 8_000;

    let env = setup(THREADS, 16, 32);
    let keys: Vec<i64> = (1..=KEYS).collect();
    env.tree.bulkload(keys.len(), &VecKeys::new(keys), 1.0);

    // Delete the even keys, split across threads.
    let tree = &env.tree;
    std::thread::scope(|s| {
        for t in 0..THREADS {
            s.spawn(move || {
                set_worker_id(t);
                let mut k = 2 + 2 * t as i64;
                while k <= KEYS {
                    tree.del(k);
                    k += 2 * THREADS as i64;
                }
            });
        }
    });

    env.tree.check();
    for k in 1..=KEYS {
        if k % 2 == 0 {
            assert_missing(&env.tree, k);
        } else {
            assert_found(&env.tree, k);
        }
    }
}

#[test]
fn mixed_inserts_and_deletes_on_disjoint_ranges() {
    const THREADS: usize = 4;

    let env = setup(THREADS, 16, 32);
    let keys: Vec<i64> = (1..=4_000).collect();
    env.tree.bulkload(keys.len(), &VecKeys::new(keys), 0.7);

    // Two threads delete within the loaded range while two insert above it.
    let tree = &env.tree;
    std::thread::scope(|s| {
        for t in 0..2 {
            s.spawn(move || {
                set_worker_id(t);
                let mut k = 1 + t as i64;
                while k <= 2_000 {
                    tree.del(k);
                    k += 2;
                }
            });
        }
        for t in 2..4 {
            s.spawn(move || {
                set_worker_id(t);
                let mut k = 4_001 + (t as i64 - 2);
                while k <= 6_000 {
                    tree.insert(k, k as u64);
                    k += 2;
                }
            });
        }
    });

    env.tree.check();
    for k in 1..=2_000 {
        assert_missing(&env.tree, k);
    }
    for k in 2_001..=6_000 {
        assert_found(&env.tree, k);
    }
}

#[test]
fn concurrent_readers_during_writes_never_misread() {
    const THREADS: usize = 4;
    const KEYS: i64 = 2_000;

    let env = setup(THREADS, 16, 16);
    let keys: Vec<i64> = (1..=KEYS).collect();
    env.tree.bulkload(keys.len(), &VecKeys::new(keys), 1.0);

    let tree = &env.tree;
    std::thread::scope(|s| {
        // Writers: insert a fresh range.
        for t in 0..2 {
            s.spawn(move || {
                set_worker_id(t);
                let mut k = KEYS + 1 + t as i64;
                while k <= 2 * KEYS {
                    tree.insert(k, k as u64);
                    k += 2;
                }
            });
        }
        // Readers: the bulk-loaded range must stay visible throughout.
        for t in 2..THREADS {
            s.spawn(move || {
                set_worker_id(t);
                for _ in 0..5 {
                    for k in 1..=KEYS {
                        let (leaf, pos) = tree.lookup(k);
                        let pos = pos.unwrap_or_else(|| panic!("key {k} vanished"));
                        // SAFETY: (leaf, pos) came from this lookup.
                        assert_eq!(unsafe { tree.get_recptr(leaf, pos) }, k as u64);
                    }
                }
            });
        }
    });

    env.tree.check();
}
