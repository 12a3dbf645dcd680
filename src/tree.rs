//! The hybrid B+-tree: volatile inner nodes over persistent leaves.
//!
//! [`NvTree`] ties the subsystems together. Inner nodes come from the
//! per-thread DRAM arenas, leaves from the NVM arenas. The volatile tree
//! metadata is the root pointer and root level (leaves are level 0),
//! published together in one tagged 8-byte word; the persistent metadata is
//! a single 8-byte NVM slot holding the pointer to the leftmost leaf, from
//! which a recovery scan can reach every leaf through the sibling chain.
//!
//! # Operation structure
//!
//! Every point operation runs in two phases:
//!
//! 1. **Optimistic descent** from the root, recording the node, child index
//!    and header snapshot per level. Observing a locked node restarts the
//!    operation. After the descent, the required lock set (leaf; for a full
//!    leaf the chain of full ancestors; for an emptying leaf the left
//!    sibling and emptying ancestors) is acquired with per-node CAS from
//!    the recorded snapshots. Any CAS failure releases everything acquired
//!    and restarts: a successful CAS proves the node is unchanged since it
//!    was read, so the complete acquisition is equivalent to an atomic
//!    validation of the whole read set.
//! 2. **Persistent mutation** outside any read-side critical section, using
//!    the flush+fence discipline. Leaf changes become visible through a
//!    single 8-byte store of metadata word 0; inner-node changes through
//!    the release store that unlocks the header. Locks are cleared only
//!    after the mutation's final fence.
//!
//! Operations require a bulk-loaded tree (the root must exist); the CLI
//! and tests always seed the tree before point operations.

mod bulkload;
mod check;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use crate::flush;
use crate::internode::{
    Internode, LEFT_KEY_NUM, NON_LEAF_KEY_NUM, NONLEAF_LINES, NONLEAF_SIZE, RIGHT_KEY_NUM,
    header_locked, header_num,
};
use crate::key::{Key, fingerprint};
use crate::leaf::{LAST_SLOT_IN_LINE, LEAF_KEY_NUM, LEAF_LINES, LEAF_SIZE, Leaf, LeafMeta};
use crate::mempool::MemPoolSet;
use crate::nvmpool::NvmPoolSet;
use crate::ordering::{READ_ORD, WRITE_ORD};
use crate::prefetch::prefetch_node;
use crate::tracing_helpers::trace_log;

/// Maximum tree height.
pub const MAX_LEVELS: usize = 32;

const ROOT_LEVEL_MASK: u64 = 63;

// ============================================================================
//  Node address helpers
// ============================================================================

/// Reborrow an inner-node address.
///
/// # Safety
///
/// `p` must be a live inner node allocated from a DRAM arena.
#[inline]
pub(crate) unsafe fn inner_at<'a>(p: u64) -> &'a Internode {
    debug_assert!(p != 0 && p % 64 == 0);
    unsafe { &*(p as *const Internode) }
}

/// Reborrow a leaf address.
///
/// # Safety
///
/// `p` must be a live leaf allocated from an NVM arena.
#[inline]
pub(crate) unsafe fn leaf_at<'a>(p: u64) -> &'a Leaf {
    debug_assert!(p != 0 && p % 256 == 0);
    unsafe { &*(p as *const Leaf) }
}

// ============================================================================
//  Tree metadata
// ============================================================================

struct TreeMeta {
    /// Tagged root word: node address in the high bits (nodes are at least
    /// 64-byte aligned), root level in the low 6 bits.
    root: AtomicU64,

    /// Persistent 8-byte slot on NVM holding the leftmost leaf.
    first_leaf: *mut u64,
}

impl TreeMeta {
    #[inline]
    fn root_pair(&self) -> (u64, usize) {
        let w = self.root.load(READ_ORD);
        (w & !ROOT_LEVEL_MASK, (w & ROOT_LEVEL_MASK) as usize)
    }

    #[inline]
    fn set_root(&self, ptr: u64, level: usize) {
        debug_assert_eq!(ptr & ROOT_LEVEL_MASK, 0);
        debug_assert!(level < MAX_LEVELS);
        self.root.store(ptr | level as u64, WRITE_ORD);
    }

    #[inline]
    fn first_leaf_slot(&self) -> &AtomicU64 {
        // SAFETY: the slot is an aligned, live 8-byte NVM location owned by
        // the tree for its whole lifetime.
        unsafe { &*self.first_leaf.cast::<AtomicU64>() }
    }

    fn first_leaf(&self) -> u64 {
        self.first_leaf_slot().load(READ_ORD)
    }

    fn set_first_leaf(&self, leaf: u64) {
        self.first_leaf_slot().store(leaf, WRITE_ORD);
        flush::flush_line(self.first_leaf.cast());
        flush::fence();
    }
}

// ============================================================================
//  NvTree
// ============================================================================

/// The persistent-memory-optimized B+-tree.
pub struct NvTree {
    meta: TreeMeta,
    mem: Arc<MemPoolSet>,
    nvm: Arc<NvmPoolSet>,
}

// SAFETY: all shared state is reached through atomics under the descent /
// lock-set protocol; the pools are Sync.
unsafe impl Send for NvTree {}
unsafe impl Sync for NvTree {}

impl NvTree {
    /// Create a tree whose persistent metadata lives at `nvm_meta_page`
    /// (byte 0 becomes the `first_leaf` slot).
    ///
    /// With `recover = false` the slot is reset; with `recover = true` it is
    /// preserved for an external replay to use.
    #[must_use]
    pub fn new(
        nvm_meta_page: *mut u8,
        mem: Arc<MemPoolSet>,
        nvm: Arc<NvmPoolSet>,
        recover: bool,
    ) -> Self {
        let tree = Self {
            meta: TreeMeta {
                root: AtomicU64::new(0),
                first_leaf: nvm_meta_page.cast(),
            },
            mem,
            nvm,
        };
        if !recover {
            tree.meta.set_first_leaf(0);
        }
        tree
    }

    /// Current root level (leaves are level 0).
    #[inline]
    #[must_use]
    pub fn level(&self) -> usize {
        self.meta.root_pair().1
    }

    /// Address of the leftmost leaf, from the persistent slot.
    #[inline]
    #[must_use]
    pub fn first_leaf(&self) -> u64 {
        self.meta.first_leaf()
    }

    /// Payload pointer at `(leaf, pos)`, as returned by [`NvTree::lookup`].
    ///
    /// # Safety
    ///
    /// `leaf` must be a leaf returned by `lookup` on this tree and `pos` a
    /// slot index it reported.
    #[inline]
    #[must_use]
    pub unsafe fn get_recptr(&self, leaf: *const Leaf, pos: usize) -> u64 {
        unsafe { &*leaf }.rec(pos)
    }

    // ========================================================================
    //  Lookup
    // ========================================================================

    /// Find `key`. Returns the leaf reached and the slot holding the key,
    /// or `None` if absent.
    #[must_use]
    pub fn lookup(&self, key: Key) -> (*const Leaf, Option<usize>) {
        let hash = fingerprint(key);

        'restart: loop {
            let (root, root_level) = self.meta.root_pair();
            let mut p = root;

            let mut lev = root_level;
            while lev > 0 {
                // SAFETY: child pointers at level > 0 are inner nodes.
                let node = unsafe { inner_at(p) };
                prefetch_node(node as *const Internode, NONLEAF_LINES);

                let h0 = node.header();
                if header_locked(h0) {
                    continue 'restart;
                }
                let (_, child) = node.search(key, header_num(h0));
                if node.header() != h0 {
                    continue 'restart;
                }
                p = child;
                lev -= 1;
            }

            let leaf_ptr = p as *const Leaf;
            // SAFETY: level-0 pointers are leaves.
            let leaf = unsafe { leaf_at(p) };
            prefetch_node(leaf_ptr, LEAF_LINES);

            let meta = leaf.load_meta();
            if meta.locked() {
                continue 'restart;
            }
            let slot = leaf.find_slot(&meta, hash, key);
            if leaf.word0() != meta.word0() {
                continue 'restart;
            }
            return (leaf_ptr, slot);
        }
    }

    // ========================================================================
    //  Insert
    // ========================================================================

    /// Insert `(key, ptr)`. Inserting a key that is already present is a
    /// silent no-op.
    pub fn insert(&self, key: Key, ptr: u64) {
        let hash = fingerprint(key);

        'restart: loop {
            let (root, root_level) = self.meta.root_pair();
            let mut parray = [0u64; MAX_LEVELS];
            let mut ppos = [0usize; MAX_LEVELS];
            let mut pseq = [0u64; MAX_LEVELS];
            let mut isfull = [false; MAX_LEVELS];

            // --- Part 1: descent + lock-set acquisition -------------------
            let mut p = root;
            let mut lev = root_level;
            while lev > 0 {
                // SAFETY: child pointers at level > 0 are inner nodes.
                let node = unsafe { inner_at(p) };
                prefetch_node(node as *const Internode, NONLEAF_LINES);

                let h0 = node.header();
                if header_locked(h0) {
                    continue 'restart;
                }
                let (pos, child) = node.search(key, header_num(h0));
                if node.header() != h0 {
                    continue 'restart;
                }
                parray[lev] = p;
                ppos[lev] = pos;
                pseq[lev] = h0;
                isfull[lev] = header_num(h0) == NON_LEAF_KEY_NUM;
                p = child;
                lev -= 1;
            }

            // SAFETY: level-0 pointers are leaves.
            let leaf = unsafe { leaf_at(p) };
            prefetch_node(p as *const Leaf, LEAF_LINES);

            let meta0 = leaf.load_meta();
            if meta0.locked() {
                continue 'restart;
            }
            if leaf.find_slot(&meta0, hash, key).is_some() {
                // Key already present: validate the read, then no-op.
                if leaf.word0() == meta0.word0() {
                    return;
                }
                continue 'restart;
            }
            if !leaf.try_lock(meta0.word0()) {
                trace_log!(key, "insert: leaf lock lost, restarting");
                continue 'restart;
            }

            isfull[0] = meta0.is_full();
            if isfull[0] {
                // Lock the chain of full ancestors, stopping at the first
                // ancestor with room.
                let mut top = 0usize;
                let mut ok = true;
                for l in 1..=root_level {
                    // SAFETY: recorded descent nodes are inner nodes.
                    let node = unsafe { inner_at(parray[l]) };
                    if !node.try_lock(pseq[l]) {
                        ok = false;
                        break;
                    }
                    top = l;
                    if !isfull[l] {
                        break;
                    }
                }
                if !ok {
                    for l in (1..=top).rev() {
                        // SAFETY: as above.
                        unsafe { inner_at(parray[l]) }.unlock_restore(pseq[l]);
                    }
                    leaf.unlock_restore(meta0.word0());
                    trace_log!(key, "insert: ancestor lock lost, restarting");
                    continue 'restart;
                }
            }

            // --- Part 2: leaf ---------------------------------------------
            let mut meta = meta0;
            meta.set_locked(true);

            if !isfull[0] {
                meta.set_locked(false);
                self.leaf_insert(leaf, &mut meta, key, ptr, hash);
                return;
            }

            let (up_key, up_ptr) =
                self.leaf_split_insert(leaf, &mut meta, key, ptr, hash, root_level);

            // --- Part 3: parent chain -------------------------------------
            self.insert_into_parents(up_key, up_ptr, &parray, &ppos, root_level, root);
            return;
        }
    }

    /// Insert into a non-full leaf whose lock we hold. `meta` already
    /// carries the lock bit the publication should expose.
    fn leaf_insert(&self, leaf: &Leaf, meta: &mut LeafMeta, key: Key, ptr: u64, hash: u8) {
        let mut bitmap = meta.bitmap();

        // First empty slot.
        let slot = (!u32::from(bitmap)).trailing_zeros() as usize;
        debug_assert!(slot < LEAF_KEY_NUM);

        leaf.set_entry(slot, key, ptr);
        meta.set_fgpt(slot, hash);
        bitmap |= 1 << slot;

        if slot < 3 {
            // The new entry lives in line 0: word 0 alone publishes it.
            meta.set_bitmap(bitmap);
            leaf.set_word0(meta);
            flush::flush_line((leaf as *const Leaf).cast());
            flush::fence();
            return;
        }

        // The entry lives in line 1..3. Keep line 0 sparse for the hot
        // metadata strip: migrate line-0 entries into this line's empty
        // slots before publishing.
        let last = LAST_SLOT_IN_LINE[slot];
        let mut from = 0usize;
        for to in (slot + 1)..=last {
            if bitmap & (1 << to) == 0 {
                leaf.move_entry(to, from);
                meta.set_fgpt(to, meta.fgpt(from));
                bitmap |= 1 << to;
                bitmap &= !(1 << from);
                from += 1;
            }
        }

        // Flush the mutated target line, then publish both words.
        flush::flush_line(leaf.entry_addr(slot));
        flush::fence();

        meta.set_bitmap(bitmap);
        leaf.set_both_words(meta);
        flush::flush_line((leaf as *const Leaf).cast());
        flush::fence();
    }

    /// Split a full leaf whose lock we hold and insert `(key, ptr)` into
    /// the correct half. Returns `(split_key, new_leaf)` to propagate.
    fn leaf_split_insert(
        &self,
        leaf: &Leaf,
        meta: &mut LeafMeta,
        key: Key,
        ptr: u64,
        hash: u8,
        root_level: usize,
    ) -> (Key, u64) {
        // Sort the 14 slots by key to find the median.
        let mut sorted: [usize; LEAF_KEY_NUM] = std::array::from_fn(|i| i);
        sorted.sort_unstable_by_key(|&i| leaf.key(i));

        let split = LEAF_KEY_NUM / 2;
        let split_key = leaf.key(sorted[split]);

        let newp = self.nvm.arena().alloc_node(LEAF_SIZE);
        // SAFETY: fresh 256-byte NVM node, exclusively ours until published.
        let new_leaf = unsafe { leaf_at(newp as u64) };

        // Move the upper half into the new leaf.
        let mut new_meta = LeafMeta::default();
        let mut freed: u16 = 0;
        for i in split..LEAF_KEY_NUM {
            new_leaf.set_entry(i, leaf.key(sorted[i]), leaf.rec(sorted[i]));
            new_meta.set_fgpt(i, meta.fgpt(sorted[i]));
            freed |= 1 << sorted[i];
        }
        new_meta.set_bitmap(((1u16 << (LEAF_KEY_NUM - split)) - 1) << split);
        meta.set_bitmap(meta.bitmap() & !freed);

        // Splice the sibling chain through the spare pointer; the alt flip
        // in word 0 is what commits it.
        let alt = meta.alt();
        new_leaf.set_next(0, leaf.next_ptr(alt));
        new_leaf.set_next(1, 0);
        leaf.set_next(1 - alt, newp as u64);
        meta.set_alt(1 - alt);

        if key > split_key {
            new_leaf.set_entry(split - 1, key, ptr);
            new_meta.set_fgpt(split - 1, hash);
            new_meta.set_bitmap(new_meta.bitmap() | (1 << (split - 1)));

            if root_level > 0 {
                meta.set_locked(false); // keep a root leaf locked
            }
        }
        new_leaf.set_both_words(&new_meta);

        // Durability order: whole new leaf, old leaf's sibling line, fence;
        // then the atomic word-0/word-1 publish flips alt and drops the
        // moved-out bits.
        flush::flush_range(newp.cast_const(), unsafe { newp.add(LEAF_SIZE - 1) }.cast_const());
        flush::flush_line(leaf.next_addr());
        flush::fence();

        leaf.set_both_words(meta);
        flush::flush_line((leaf as *const Leaf).cast());
        flush::fence();

        if key <= split_key {
            if root_level > 0 {
                meta.set_locked(false); // keep a root leaf locked
            }
            self.leaf_insert(leaf, meta, key, ptr, hash);
        }

        (split_key, newp as u64)
    }

    /// Propagate `(key, ptr)` up the locked ancestor chain, splitting full
    /// parents, growing the tree if the root itself splits.
    fn insert_into_parents(
        &self,
        mut key: Key,
        mut ptr: u64,
        parray: &[u64; MAX_LEVELS],
        ppos: &[usize; MAX_LEVELS],
        root_level: usize,
        old_root: u64,
    ) {
        let total_level = root_level;
        let mut lev = 1;

        while lev <= total_level {
            // SAFETY: locked ancestor recorded during descent.
            let p = unsafe { inner_at(parray[lev]) };
            let n = p.num();
            let pos = ppos[lev] + 1; // the new child goes right of the taken one

            if n < NON_LEAF_KEY_NUM {
                p.insert_entry(pos, key, ptr, n);
                flush::fence(); // all changes visible before the unlock
                p.publish_num(n + 1);
                return;
            }

            // Full: allocate a sibling and redistribute.
            let newp_raw = self.mem.arena().alloc_node(NONLEAF_SIZE);
            // SAFETY: fresh arena node, exclusively ours until linked.
            let newp = unsafe { Internode::init_at(newp_raw) };

            let mut push_key: Key = 0;
            {
                // Slot 0 of the conceptual right node is the pushed-up key
                // and the right node's child 0.
                let mut set_new = |r: usize, k: Key, c: u64| {
                    if r == 0 {
                        push_key = k;
                        newp.set_child(0, c);
                    } else {
                        newp.set_key(r, k);
                        newp.set_child(r, c);
                    }
                };

                if pos <= LEFT_KEY_NUM {
                    // New key lands in the left node.
                    for r in (0..=RIGHT_KEY_NUM).rev() {
                        set_new(r, p.key(LEFT_KEY_NUM + r), p.child(LEFT_KEY_NUM + r));
                    }
                    for i in (pos..LEFT_KEY_NUM).rev() {
                        p.copy_entry(i + 1, i);
                    }
                    p.set_key(pos, key);
                    p.set_child(pos, ptr);
                } else {
                    // New key lands in the right node (possibly as slot 0,
                    // i.e. the pushed-up key itself).
                    let mut r = RIGHT_KEY_NUM as isize;
                    let mut i = NON_LEAF_KEY_NUM as isize;
                    while i >= pos as isize {
                        set_new(r as usize, p.key(i as usize), p.child(i as usize));
                        r -= 1;
                        i -= 1;
                    }
                    set_new(r as usize, key, ptr);
                    r -= 1;
                    while r >= 0 {
                        set_new(r as usize, p.key(i as usize), p.child(i as usize));
                        r -= 1;
                        i -= 1;
                    }
                }
            }

            key = push_key;
            ptr = newp_raw as u64;

            p.set_num_locked(LEFT_KEY_NUM);
            if lev < total_level {
                p.unlock_bump(); // the root stays locked until replaced
            }
            newp.init_header(RIGHT_KEY_NUM, false);

            lev += 1;
        }

        // The root split: add a level.
        let newr_raw = self.mem.arena().alloc_node(NONLEAF_SIZE);
        // SAFETY: fresh arena node.
        let newr = unsafe { Internode::init_at(newr_raw) };
        newr.set_child(0, old_root);
        newr.set_key(1, key);
        newr.set_child(1, ptr);
        newr.init_header(1, true);
        flush::fence(); // new root consistent before publication

        self.meta.set_root(newr_raw as u64, total_level + 1);
        flush::fence(); // root change globally visible; both roots locked

        if total_level > 0 {
            // SAFETY: the old root is an inner node we hold locked.
            unsafe { inner_at(old_root) }.unlock_bump();
        } else {
            // SAFETY: the old root is the leaf we hold locked.
            unsafe { leaf_at(old_root) }.clear_lock();
        }
        newr.unlock_bump();
    }

    // ========================================================================
    //  Delete
    // ========================================================================

    /// Delete `key`. Deleting an absent key is a silent no-op.
    ///
    /// Deletion is lazy: no borrowing or merging. A leaf is only removed
    /// when its last entry goes; inner nodes are only removed when their
    /// last child goes.
    pub fn del(&self, key: Key) {
        let hash = fingerprint(key);

        'restart: loop {
            let (root, root_level) = self.meta.root_pair();
            let mut parray = [0u64; MAX_LEVELS];
            let mut ppos = [0usize; MAX_LEVELS];
            let mut pseq = [0u64; MAX_LEVELS];

            // --- Part 1: descent + lock-set acquisition -------------------
            let mut p = root;
            let mut lev = root_level;
            while lev > 0 {
                // SAFETY: child pointers at level > 0 are inner nodes.
                let node = unsafe { inner_at(p) };
                prefetch_node(node as *const Internode, NONLEAF_LINES);

                let h0 = node.header();
                if header_locked(h0) {
                    continue 'restart;
                }
                let (pos, child) = node.search(key, header_num(h0));
                if node.header() != h0 {
                    continue 'restart;
                }
                parray[lev] = p;
                ppos[lev] = pos;
                pseq[lev] = h0;
                p = child;
                lev -= 1;
            }

            // SAFETY: level-0 pointers are leaves.
            let leaf = unsafe { leaf_at(p) };
            prefetch_node(p as *const Leaf, LEAF_LINES);

            let meta0 = leaf.load_meta();
            if meta0.locked() {
                continue 'restart;
            }
            let Some(slot) = leaf.find_slot(&meta0, hash, key) else {
                // Absent: validate the read, then no-op.
                if leaf.word0() == meta0.word0() {
                    return;
                }
                continue 'restart;
            };
            if !leaf.try_lock(meta0.word0()) {
                trace_log!(key, "del: leaf lock lost, restarting");
                continue 'restart;
            }

            let removing_leaf = meta0.num() == 1 && root_level > 0;
            let mut sib: Option<(u64, u64)> = None; // (sibling addr, seen word0)
            let mut top = 0usize;

            if removing_leaf {
                // (a) find and lock the left sibling, if any
                let mut li = 1;
                while li <= root_level && ppos[li] == 0 {
                    li += 1;
                }
                if li <= root_level {
                    match self.lock_left_sibling(&parray, &ppos, li, p) {
                        Ok(found) => sib = Some(found),
                        Err(()) => {
                            leaf.unlock_restore(meta0.word0());
                            trace_log!(key, "del: sibling lock lost, restarting");
                            continue 'restart;
                        }
                    }
                }

                // (b) lock emptying ancestors, stopping at the first that
                //     keeps at least one key
                let mut ok = true;
                for l in 1..=root_level {
                    // SAFETY: recorded descent nodes are inner nodes.
                    let node = unsafe { inner_at(parray[l]) };
                    if !node.try_lock(pseq[l]) {
                        ok = false;
                        break;
                    }
                    top = l;
                    if header_num(pseq[l]) >= 1 {
                        break;
                    }
                }
                if !ok {
                    for l in (1..=top).rev() {
                        // SAFETY: as above.
                        unsafe { inner_at(parray[l]) }.unlock_restore(pseq[l]);
                    }
                    if let Some((s, w0)) = sib {
                        // SAFETY: locked sibling leaf.
                        unsafe { leaf_at(s) }.unlock_restore(w0);
                    }
                    leaf.unlock_restore(meta0.word0());
                    trace_log!(key, "del: ancestor lock lost, restarting");
                    continue 'restart;
                }
            }

            // --- Part 2: leaf ---------------------------------------------
            if !removing_leaf {
                // Clearing the bitmap bit (and the lock) in one word-0 store
                // is the whole deletion. A root leaf may become empty.
                let mut meta = meta0;
                meta.set_locked(false);
                meta.set_bitmap(meta.bitmap() & !(1 << slot));
                leaf.set_word0(&meta);
                flush::flush_line((leaf as *const Leaf).cast());
                flush::fence();
                return;
            }

            // Unlink the emptied leaf from the sibling chain.
            let succ = leaf.next_ptr(meta0.alt());
            if let Some((s_addr, s_w0)) = sib {
                // SAFETY: locked sibling leaf.
                let s = unsafe { leaf_at(s_addr) };
                s.set_next(crate::leaf::word0_alt(s_w0), succ);
                flush::flush_line(s.next_addr());
                flush::fence();
                s.unlock_restore(s_w0);
            } else {
                // No left sibling: the removed leaf was the first leaf.
                self.meta.set_first_leaf(succ);
            }
            self.nvm.arena().free_node(p as *mut u8);

            // --- Part 3: ancestors ----------------------------------------
            self.remove_from_parents(&parray, &ppos, root_level);
            return;
        }
    }

    /// Find the left sibling of `leaf_addr` by descending the rightmost
    /// path under `parray[li].child(ppos[li] - 1)`, then lock it.
    ///
    /// Returns `(sibling, observed word0)`. Fails (caller restarts) on any
    /// concurrent interference, including the sibling no longer preceding
    /// the leaf.
    fn lock_left_sibling(
        &self,
        parray: &[u64; MAX_LEVELS],
        ppos: &[usize; MAX_LEVELS],
        li: usize,
        leaf_addr: u64,
    ) -> Result<(u64, u64), ()> {
        // SAFETY: recorded descent node.
        let anc = unsafe { inner_at(parray[li]) };
        let h0 = anc.header();
        if header_locked(h0) {
            return Err(());
        }
        let mut q = anc.child(ppos[li] - 1);
        if anc.header() != h0 {
            return Err(());
        }

        let mut l = li - 1;
        while l >= 1 {
            // SAFETY: nodes above level 0 are inner nodes.
            let node = unsafe { inner_at(q) };
            let h = node.header();
            if header_locked(h) {
                return Err(());
            }
            // Clamped like search(): the re-read below rejects stale nodes.
            let next = node.child(header_num(h).min(NON_LEAF_KEY_NUM));
            if node.header() != h {
                return Err(());
            }
            q = next;
            l -= 1;
        }

        // SAFETY: level 0: a leaf.
        let sib = unsafe { leaf_at(q) };
        let w0 = sib.word0();
        if crate::leaf::word0_locked(w0) || !sib.try_lock(w0) {
            return Err(());
        }
        // The lock pins the chain; confirm this is still the leaf's
        // immediate predecessor.
        if sib.next_ptr(crate::leaf::word0_alt(w0)) != leaf_addr {
            sib.unlock_restore(w0);
            return Err(());
        }
        Ok((q, w0))
    }

    /// Remove the deleted child from the locked ancestor chain, freeing
    /// emptied nodes and collapsing the root when it loses its last key.
    fn remove_from_parents(
        &self,
        parray: &[u64; MAX_LEVELS],
        ppos: &[usize; MAX_LEVELS],
        root_level: usize,
    ) {
        let mut lev = 1;
        loop {
            let p_addr = parray[lev];
            // SAFETY: locked ancestor recorded during descent.
            let p = unsafe { inner_at(p_addr) };
            let n = p.num();
            let mut pos = ppos[lev];

            if n > 0 {
                if pos == 0 {
                    // Removing child 0: promote child 1, then close the gap.
                    p.set_child(0, p.child(1));
                    pos = 1;
                }
                p.remove_entry(pos, n);
                flush::fence(); // all changes visible before the unlock

                if n - 1 == 0 && lev >= root_level {
                    // The root kept a single child: drop a level.
                    let new_root = p.child(0);
                    self.meta.set_root(new_root, root_level - 1);
                    flush::fence(); // in-flight descents restart
                    self.mem.arena().free_node(p_addr as *mut u8);
                    return;
                }

                p.publish_num(n - 1);
                return;
            }

            // Only one child left: the node empties out with it.
            self.mem.arena().free_node(p_addr as *mut u8);
            lev += 1;
        }
    }
}
