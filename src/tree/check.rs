//! Structural diagnostics: print, check, randomize.
//!
//! These helpers walk the quiescent tree single-threaded. `check` verifies
//! every structural invariant and panics on the first violation - an
//! inconsistent tree is a programming error, not a recoverable condition.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{NvTree, inner_at, leaf_at};
use crate::internode::header_locked;
use crate::key::{Key, fingerprint};
use crate::leaf::{LEAF_KEY_NUM, LeafMeta};

impl NvTree {
    // ========================================================================
    //  Print
    // ========================================================================

    /// Print the tree structure, nodes indented by level.
    pub fn print(&self) {
        let (root, level) = self.meta.root_pair();
        self.print_node(root, level);
    }

    fn print_node(&self, pnode: u64, level: usize) {
        let indent = 10 + level * 4;
        if level > 0 {
            // SAFETY: nodes above level 0 are inner nodes.
            let p = unsafe { inner_at(pnode) };
            println!("{:indent$}+nonleaf lev={} num={}", "", level, p.num());
            self.print_node(p.child(0), level - 1);
            for i in 1..=p.num() {
                println!("{:indent$}+{}", "", p.key(i));
                self.print_node(p.child(i), level - 1);
            }
        } else {
            // SAFETY: level 0: a leaf.
            let lp = unsafe { leaf_at(pnode) };
            let meta = lp.load_meta();
            for i in 0..LEAF_KEY_NUM {
                if meta.bitmap() & (1 << i) != 0 {
                    println!("[{i:2}] hash={:02x} key={}", meta.fgpt(i), lp.key(i));
                }
            }
            let pnext = lp.next_sibling();
            if pnext != 0 {
                // SAFETY: a live sibling leaf.
                let nl = unsafe { leaf_at(pnext) };
                let nm = nl.load_meta();
                println!("->({})", nl.min_key(&nm));
            } else {
                println!("->(null)");
            }
        }
    }

    // ========================================================================
    //  Check
    // ========================================================================

    /// Verify the whole tree; returns its `(smallest, largest)` key.
    ///
    /// Checks, per node: alignment, non-emptiness, fingerprint consistency,
    /// cleared lock bits, key ordering against the parent's separators, the
    /// sibling chain, and finally that the persistent `first_leaf` slot
    /// matches the leftmost leaf.
    ///
    /// # Panics
    ///
    /// Panics on the first violated invariant.
    pub fn check(&self) -> (Key, Key) {
        let (root, level) = self.meta.root_pair();
        let mut prev_leaf: u64 = 0;
        let range = self.check_node(root, level, &mut prev_leaf);
        self.check_first_leaf();
        range
    }

    fn check_node(&self, pnode: u64, level: usize, prev_leaf: &mut u64) -> (Key, Key) {
        assert!(pnode != 0, "level {}: null child pointer", level + 1);

        if level == 0 {
            // SAFETY: level 0: a leaf.
            let lp = unsafe { leaf_at(pnode) };
            assert_eq!(pnode % 256, 0, "leaf {pnode:#x}: not aligned at 256B");

            let meta = lp.load_meta();
            assert!(meta.num() >= 1, "leaf {pnode:#x}: empty");

            for i in 0..LEAF_KEY_NUM {
                if meta.bitmap() & (1 << i) != 0 {
                    assert_eq!(
                        meta.fgpt(i),
                        fingerprint(lp.key(i)),
                        "leaf {pnode:#x}: hash code for {} is wrong",
                        lp.key(i)
                    );
                }
            }
            assert!(!meta.locked(), "leaf {pnode:#x}: lock bit == 1");

            if *prev_leaf != 0 {
                // SAFETY: previously visited leaf.
                let prev = unsafe { leaf_at(*prev_leaf) };
                assert_eq!(
                    prev.next_sibling(),
                    pnode,
                    "leaf {pnode:#x}: sibling broken from previous node"
                );
            }
            *prev_leaf = pnode;

            (lp.min_key(&meta), lp.max_key(&meta))
        } else {
            // SAFETY: nodes above level 0 are inner nodes.
            let p = unsafe { inner_at(pnode) };
            assert_eq!(pnode % 64, 0, "nonleaf level {level}({pnode:#x}): not aligned at 64B");

            let num = p.num();

            let (start, mut end) = self.check_node(p.child(0), level - 1, prev_leaf);
            if num >= 1 {
                assert!(
                    end < p.key(1),
                    "nonleaf level {level}: key order wrong at child 0"
                );
            }

            for i in 1..num {
                let (cs, ce) = self.check_node(p.child(i), level - 1, prev_leaf);
                assert!(
                    p.key(i) <= cs && ce < p.key(i + 1),
                    "nonleaf level {level}: key order wrong at child {i}({})",
                    p.key(i)
                );
                end = ce;
            }

            if num >= 1 {
                let (cs, ce) = self.check_node(p.child(num), level - 1, prev_leaf);
                assert!(
                    cs >= p.key(num),
                    "nonleaf level {level}: key order wrong at last child {num}({})",
                    p.key(num)
                );
                end = ce;
            }

            assert!(
                !header_locked(p.header()),
                "nonleaf level {level}({pnode:#x}): lock bit is set"
            );

            (start, end)
        }
    }

    fn check_first_leaf(&self) {
        let (mut p, level) = self.meta.root_pair();
        for _ in 0..level {
            // SAFETY: descending child 0 pointers above level 0.
            p = unsafe { inner_at(p) }.child(0);
        }
        assert_eq!(
            self.first_leaf(),
            p,
            "first leaf slot does not match the leftmost leaf"
        );
    }

    // ========================================================================
    //  Randomize
    // ========================================================================

    /// Shuffle the entries within every leaf (keys stay in the same leaf).
    ///
    /// Leaves are deliberately unsorted; a freshly bulk-loaded tree happens
    /// to have sorted leaves, so tests shuffle them to exercise the
    /// fingerprint search against its real layout. Single-threaded only.
    pub fn randomize(&self) {
        let mut rng = StdRng::seed_from_u64(12_345_678);
        let (root, level) = self.meta.root_pair();
        self.randomize_node(root, level, &mut rng);
    }

    fn randomize_node(&self, pnode: u64, level: usize, rng: &mut StdRng) {
        if level > 0 {
            // SAFETY: nodes above level 0 are inner nodes.
            let p = unsafe { inner_at(pnode) };
            for i in 0..=p.num() {
                self.randomize_node(p.child(i), level - 1, rng);
            }
            return;
        }

        // SAFETY: level 0: a leaf.
        let lp = unsafe { leaf_at(pnode) };
        let mut meta: LeafMeta = lp.load_meta();

        let mut pos = [0usize; LEAF_KEY_NUM];
        let mut num = 0;
        for i in 0..LEAF_KEY_NUM {
            if meta.bitmap() & (1 << i) != 0 {
                pos[num] = i;
                num += 1;
            }
        }
        if num < 2 {
            return;
        }

        for _ in 0..(2 * num) {
            let aa = pos[rng.gen_range(0..num)];
            let bb = pos[rng.gen_range(0..num)];
            if aa != bb {
                let (ka, ra) = (lp.key(aa), lp.rec(aa));
                let (kb, rb) = (lp.key(bb), lp.rec(bb));
                lp.set_entry(aa, kb, rb);
                lp.set_entry(bb, ka, ra);

                let fa = meta.fgpt(aa);
                meta.set_fgpt(aa, meta.fgpt(bb));
                meta.set_fgpt(bb, fa);
            }
        }
        lp.set_both_words(&meta);
    }
}
