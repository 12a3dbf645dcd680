//! Parallel bulk construction.
//!
//! Bulk-load builds the tree bottom-up from a sorted, duplicate-free key
//! source. Each worker builds a complete subtree over a contiguous key
//! range in its own arenas; the per-worker subtrees are then stitched
//! together by linking the leaf chain across workers, collecting the
//! `(node, first key)` pairs at the workers' common top level, and running
//! the same bottom-up append loop once more to build the top tree.
//!
//! Leaves are populated right-aligned within their 14 slots, leaving the
//! line-0 slots free so that early inserts into a bulk-loaded leaf land in
//! the hot first line.

use parking_lot::Mutex;

use super::{MAX_LEVELS, NvTree, inner_at, leaf_at};
use crate::internode::{Internode, NON_LEAF_KEY_NUM, NONLEAF_SIZE};
use crate::key::{Key, fingerprint};
use crate::keyinput::{KeyCursor, KeyInput};
use crate::leaf::{LEAF_KEY_NUM, LEAF_SIZE, LeafMeta};
use crate::mempool::set_worker_id;
use crate::tracing_helpers::debug_log;

/// Per-worker build output: the first node and node count at every level.
#[derive(Clone)]
struct SubtreeBuild {
    top_level: usize,
    pfirst: [u64; MAX_LEVELS],
    n_nodes: [usize; MAX_LEVELS],
}

/// Bottom-up append state: one partially-filled node per level.
struct LevelAppender<'a> {
    pfirst: &'a [u64; MAX_LEVELS],
    n_nodes: &'a [usize; MAX_LEVELS],
    base_level: usize,
    top_level: usize,
    inner_fill: usize,
    /// Index of the node currently being filled at each level.
    ncur: [usize; MAX_LEVELS],
    /// Children appended to that node so far (0 = not started).
    nkids: [usize; MAX_LEVELS],
}

impl<'a> LevelAppender<'a> {
    fn new(
        pfirst: &'a [u64; MAX_LEVELS],
        n_nodes: &'a [usize; MAX_LEVELS],
        base_level: usize,
        top_level: usize,
        inner_fill: usize,
    ) -> Self {
        Self {
            pfirst,
            n_nodes,
            base_level,
            top_level,
            inner_fill,
            ncur: [0; MAX_LEVELS],
            nkids: [0; MAX_LEVELS],
        }
    }

    /// Append `(left_key, child)` to the node being built one level up.
    /// When that node was fresh, it propagates upward as a new child with
    /// the same left key.
    fn append(&mut self, left_key: Key, mut child: u64) {
        for ll in self.base_level..=self.top_level {
            let np_addr = self.pfirst[ll] + (self.ncur[ll] * NONLEAF_SIZE) as u64;

            if self.nkids[ll] > 0 {
                // SAFETY: initialized below on first touch.
                let np = unsafe { inner_at(np_addr) };
                let kk = self.nkids[ll]; // next entry slot == current num + 1
                np.set_key(kk, left_key);
                np.set_child(kk, child);
                np.init_header(kk, false);
                self.nkids[ll] += 1;

                // Seal the node at the fill target while more remain.
                if kk == self.inner_fill && self.ncur[ll] < self.n_nodes[ll] - 1 {
                    self.ncur[ll] += 1;
                    self.nkids[ll] = 0;
                }
                return;
            }

            // Fresh node: it becomes a new child of the level above.
            // SAFETY: np_addr is within the freshly allocated level array.
            let np = unsafe { Internode::init_at(np_addr as *mut u8) };
            np.set_child(0, child);
            np.init_header(0, false);
            self.nkids[ll] = 1;
            child = np_addr;
        }
    }
}

impl NvTree {
    /// Bulk-load `keynum` keys (payload = key) with fill factor `bfill`.
    /// Returns the root level.
    ///
    /// Uses every worker when `keynum > 10 x workers`, one thread
    /// otherwise. The input must be sorted and duplicate-free.
    pub fn bulkload(&self, keynum: usize, input: &dyn KeyInput, bfill: f32) -> usize {
        assert!(keynum >= 1, "bulkload needs at least one key");
        assert!(bfill > 0.0 && bfill <= 1.0, "fill factor must be in (0, 1]");

        let workers = self.nvm.num_workers();
        let num_threads = if keynum > 10 * workers { workers } else { 1 };
        debug_log!(keynum, num_threads, bfill, "bulkload");

        if num_threads == 1 {
            let mut cursor = input.open_cursor(0, keynum as i64);
            let b = self.bulkload_subtree(cursor.as_mut(), 0, keynum, bfill, MAX_LEVELS - 1);
            assert_eq!(b.n_nodes[b.top_level], 1, "tree exceeds the level limit");

            self.meta.set_root(b.pfirst[b.top_level], b.top_level);
            self.meta.set_first_leaf(b.pfirst[0]);
            return b.top_level;
        }

        // Workers 0..n-2 take keynum/n keys each; the last absorbs the rest.
        let kn_per = keynum / num_threads;

        let slots: Mutex<Vec<Option<SubtreeBuild>>> = Mutex::new(vec![None; num_threads]);
        std::thread::scope(|s| {
            for t in 0..num_threads {
                let slots = &slots;
                s.spawn(move || {
                    set_worker_id(t);
                    let start = t * kn_per;
                    let n = if t < num_threads - 1 {
                        kn_per
                    } else {
                        keynum - start
                    };
                    let mut cursor = input.open_cursor(start as i64, n as i64);
                    let b =
                        self.bulkload_subtree(cursor.as_mut(), start, n, bfill, MAX_LEVELS - 1);
                    slots.lock()[t] = Some(b);
                });
            }
        });
        let builds: Vec<SubtreeBuild> = slots
            .into_inner()
            .into_iter()
            .map(|b| b.expect("bulkload worker finished"))
            .collect();

        // Connect the leaf chain across workers.
        for t in 1..num_threads {
            let prev = &builds[t - 1];
            let last = prev.pfirst[0] + ((prev.n_nodes[0] - 1) * LEAF_SIZE) as u64;
            // SAFETY: last leaf of worker t-1's block.
            unsafe { leaf_at(last) }.set_next(0, builds[t].pfirst[0]);
        }

        // Collect (node, first key) pairs at the common level, freeing the
        // per-worker scaffolding above it.
        let level = builds.iter().map(|b| b.top_level).min().unwrap_or(0);
        let mut items: Vec<(u64, Key)> = Vec::with_capacity(num_threads * 3);
        for b in &builds {
            // SAFETY: worker's first leaf.
            let lp = unsafe { leaf_at(b.pfirst[0]) };
            let m = lp.load_meta();
            let left_key = lp.key(LEAF_KEY_NUM - m.num());
            self.collect_level(b.pfirst[b.top_level], b.top_level, left_key, level, &mut items, true);
        }
        assert!(items.len() >= 2, "stitch point must have multiple nodes");

        // Build the top tree over the collected nodes.
        let b = self.bulkload_toptree(&items, bfill, level, MAX_LEVELS - 1);
        assert_eq!(b.n_nodes[b.top_level], 1, "tree exceeds the level limit");

        self.meta.set_root(b.pfirst[b.top_level], b.top_level);
        self.meta.set_first_leaf(builds[0].pfirst[0]);
        b.top_level
    }

    /// Build one worker's subtree over `num_key` keys starting at absolute
    /// index `start_key`.
    fn bulkload_subtree(
        &self,
        input: &mut dyn KeyCursor,
        start_key: usize,
        num_key: usize,
        bfill: f32,
        target_level: usize,
    ) -> SubtreeBuild {
        debug_assert!(num_key > 0);

        // 1. per-node fill targets
        let leaf_fill = ((LEAF_KEY_NUM as f32 * bfill) as usize).max(1);
        let inner_fill = ((NON_LEAF_KEY_NUM as f32 * bfill) as usize).max(1);

        // 2. node counts per level
        let mut n_nodes = [0usize; MAX_LEVELS];
        n_nodes[0] = num_key.div_ceil(leaf_fill);
        let mut top_level = 0;
        let mut l = 1;
        while l <= target_level && n_nodes[l - 1] > 1 {
            n_nodes[l] = n_nodes[l - 1].div_ceil(inner_fill + 1);
            top_level = l;
            l += 1;
        }

        // 3. allocate whole levels at once
        let mut pfirst = [0u64; MAX_LEVELS];
        pfirst[0] = self.nvm.arena().alloc(LEAF_SIZE * n_nodes[0]) as u64;
        for l in 1..=top_level {
            pfirst[l] = self.mem.arena().alloc(NONLEAF_SIZE * n_nodes[l]) as u64;
        }

        // 4. populate leaves left to right, appending each to its parent
        let mut app = LevelAppender::new(&pfirst, &n_nodes, 1, top_level, inner_fill);
        let mut key_id = start_key as i64;

        for i in 0..n_nodes[0] {
            let lp_addr = pfirst[0] + (i * LEAF_SIZE) as u64;
            // SAFETY: freshly allocated leaf array.
            let lp = unsafe { leaf_at(lp_addr) };

            let fillnum = if i == n_nodes[0] - 1 {
                num_key - (n_nodes[0] - 1) * leaf_fill
            } else {
                leaf_fill
            };
            debug_assert!(fillnum >= 1 && fillnum <= leaf_fill);

            let mut meta = LeafMeta::default();
            meta.set_bitmap(((1u16 << fillnum) - 1) << (LEAF_KEY_NUM - fillnum));

            // Keys go right-aligned; line 0 stays free for future inserts.
            for j in (LEAF_KEY_NUM - fillnum)..LEAF_KEY_NUM {
                let k = input.key_at(key_id);
                key_id += 1;
                lp.set_entry(j, k, k as u64);
                meta.set_fgpt(j, fingerprint(k));
            }

            let next = if i < n_nodes[0] - 1 {
                pfirst[0] + ((i + 1) * LEAF_SIZE) as u64
            } else {
                0
            };
            lp.set_next(0, next);
            lp.set_next(1, 0);
            lp.set_both_words(&meta);

            app.append(lp.key(LEAF_KEY_NUM - fillnum), lp_addr);
        }

        SubtreeBuild {
            top_level,
            pfirst,
            n_nodes,
        }
    }

    /// Build the top tree over `(node, first key)` pairs sitting at
    /// `cur_level`.
    fn bulkload_toptree(
        &self,
        items: &[(u64, Key)],
        bfill: f32,
        cur_level: usize,
        target_level: usize,
    ) -> SubtreeBuild {
        debug_assert!(items.len() >= 2 && target_level > cur_level);

        let inner_fill = ((NON_LEAF_KEY_NUM as f32 * bfill) as usize).max(1);

        let mut n_nodes = [0usize; MAX_LEVELS];
        n_nodes[cur_level] = items.len();
        let mut top_level = cur_level;
        let mut l = cur_level + 1;
        while l <= target_level && n_nodes[l - 1] > 1 {
            n_nodes[l] = n_nodes[l - 1].div_ceil(inner_fill + 1);
            top_level = l;
            l += 1;
        }

        let mut pfirst = [0u64; MAX_LEVELS];
        for l in (cur_level + 1)..=top_level {
            pfirst[l] = self.mem.arena().alloc(NONLEAF_SIZE * n_nodes[l]) as u64;
        }

        let mut app = LevelAppender::new(&pfirst, &n_nodes, cur_level + 1, top_level, inner_fill);
        for &(child, left_key) in items {
            app.append(left_key, child);
        }

        SubtreeBuild {
            top_level,
            pfirst,
            n_nodes,
        }
    }

    /// Collect the `(node, first key)` pairs at `target` level under
    /// `pnode`, optionally freeing every node strictly above that level.
    fn collect_level(
        &self,
        pnode: u64,
        level: usize,
        left_key: Key,
        target: usize,
        out: &mut Vec<(u64, Key)>,
        free_above: bool,
    ) {
        if level == target {
            out.push((pnode, left_key));
            return;
        }

        // SAFETY: level > target >= 0, so pnode is an inner node.
        let p = unsafe { inner_at(pnode) };
        self.collect_level(p.child(0), level - 1, left_key, target, out, free_above);
        for i in 1..=p.num() {
            self.collect_level(p.child(i), level - 1, p.key(i), target, out, free_above);
        }

        if free_above {
            self.mem.arena().free_node(pnode as *mut u8);
        }
    }
}
