//! Volatile inner node.
//!
//! Inner nodes route descents and live in the per-thread DRAM arenas. Each
//! node is 256 bytes, 64-byte aligned: an 8-byte header, `child[0]`, then
//! 15 sorted `(key, child)` entries occupying slots `1..=num`.
//!
//! # Invariants
//!
//! - `k(1) <= k(2) <= ... <= k(num)`
//! - every key under `child[i-1]` is `< k(i)`; every key under `child[i]`
//!   is `>= k(i)`
//! - `num >= 1` except transiently during construction or removal; a root
//!   with `num = 0` collapses
//!
//! # Header
//!
//! One `AtomicU64` combines everything a reader needs to validate a node:
//!
//! ```text
//! bit  0      lock
//! bits 1..32  sequence, bumped by every unlock-after-mutation
//! bits 32..   num (key count)
//! ```
//!
//! Readers snapshot the header, abort if the lock bit is set, read the
//! node, and re-read the header: any difference means a writer intervened.
//! Writers acquire the lock by CAS from the exact snapshot a descent
//! observed, which simultaneously re-validates the read. Mutations happen
//! with relaxed stores under the lock and become visible with the release
//! store that publishes the new header.

use std::sync::atomic::{AtomicI64, AtomicU64};

use crate::flush::CACHE_LINE_SIZE;
use crate::key::{KEY_SIZE, Key, POINTER_SIZE};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};

/// Size of an inner node in bytes (4 cache lines).
pub const NONLEAF_SIZE: usize = 256;

/// Cache lines per inner node.
pub const NONLEAF_LINES: usize = NONLEAF_SIZE / CACHE_LINE_SIZE;

/// Number of keys in a full inner node.
pub const NON_LEAF_KEY_NUM: usize = NONLEAF_SIZE / (KEY_SIZE + POINTER_SIZE) - 1;

/// Keys kept in the left node by an inner split.
pub const LEFT_KEY_NUM: usize = NON_LEAF_KEY_NUM / 2;

/// Keys moved to the right node by an inner split.
pub const RIGHT_KEY_NUM: usize = NON_LEAF_KEY_NUM - LEFT_KEY_NUM;

const LOCK_BIT: u64 = 1;
const SEQ_UNIT: u64 = 1 << 1;
const SEQ_MASK: u64 = 0xffff_fffe;
const NUM_SHIFT: u32 = 32;

/// Whether a header value has the lock bit set.
#[inline]
#[must_use]
pub fn header_locked(h: u64) -> bool {
    h & LOCK_BIT != 0
}

/// Key count encoded in a header value.
#[inline]
#[must_use]
pub fn header_num(h: u64) -> usize {
    (h >> NUM_SHIFT) as usize
}

#[repr(C)]
struct Entry {
    k: AtomicI64,
    ch: AtomicU64,
}

/// An inner routing node.
#[repr(C, align(64))]
pub struct Internode {
    header: AtomicU64,
    child0: AtomicU64,
    /// Entries for slots `1..=NON_LEAF_KEY_NUM`; `ent[i - 1]` is slot `i`.
    ent: [Entry; NON_LEAF_KEY_NUM],
}

const _: () = assert!(std::mem::size_of::<Internode>() == NONLEAF_SIZE);
const _: () = assert!(std::mem::align_of::<Internode>() == CACHE_LINE_SIZE);

impl Internode {
    /// Reinitialize a node freshly taken from an arena.
    ///
    /// # Safety
    ///
    /// `p` must point to `NONLEAF_SIZE` bytes owned by the caller; the node
    /// must not yet be reachable by other threads.
    #[inline]
    pub unsafe fn init_at<'a>(p: *mut u8) -> &'a Internode {
        let node = unsafe { &*p.cast::<Internode>() };
        node.header.store(0, RELAXED);
        node.child0.store(0, RELAXED);
        node
    }

    // ========================================================================
    //  Header
    // ========================================================================

    /// Snapshot the header for optimistic validation.
    #[inline]
    #[must_use]
    pub fn header(&self) -> u64 {
        self.header.load(READ_ORD)
    }

    /// Key count. Only stable while locked or validated.
    #[inline]
    #[must_use]
    pub fn num(&self) -> usize {
        header_num(self.header.load(READ_ORD))
    }

    /// Whether the node holds the maximum number of keys.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.num() == NON_LEAF_KEY_NUM
    }

    /// Try to acquire the lock, succeeding only if the header still equals
    /// the value `seen` from the descent. Success doubles as read-set
    /// validation: the node is unchanged since it was read.
    #[inline]
    #[must_use]
    pub fn try_lock(&self, seen: u64) -> bool {
        debug_assert!(!header_locked(seen));
        self.header
            .compare_exchange(seen, seen | LOCK_BIT, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    /// Release a lock acquired by [`try_lock`](Self::try_lock) without any
    /// mutation having happened: restore the exact observed header.
    #[inline]
    pub fn unlock_restore(&self, seen: u64) {
        debug_assert!(!header_locked(seen));
        self.header.store(seen, WRITE_ORD);
    }

    /// Publish a mutation: set the new key count, bump the sequence and
    /// clear the lock in one release store.
    #[inline]
    pub fn publish_num(&self, num: usize) {
        let h = self.header.load(RELAXED);
        debug_assert!(header_locked(h));
        let seq = (h & SEQ_MASK).wrapping_add(SEQ_UNIT) & SEQ_MASK;
        self.header.store(((num as u64) << NUM_SHIFT) | seq, WRITE_ORD);
    }

    /// Update the key count while keeping the lock held (used when a split
    /// must keep the root locked until the root pointer is replaced).
    #[inline]
    pub fn set_num_locked(&self, num: usize) {
        let h = self.header.load(RELAXED);
        debug_assert!(header_locked(h));
        self.header
            .store(((num as u64) << NUM_SHIFT) | (h & (SEQ_MASK | LOCK_BIT)), WRITE_ORD);
    }

    /// Release the lock after a mutation, bumping the sequence.
    #[inline]
    pub fn unlock_bump(&self) {
        let h = self.header.load(RELAXED);
        debug_assert!(header_locked(h));
        let seq = (h & SEQ_MASK).wrapping_add(SEQ_UNIT) & SEQ_MASK;
        self.header.store((h & !(SEQ_MASK | LOCK_BIT)) | seq, WRITE_ORD);
    }

    /// Initialize the header of a node not yet visible to other threads.
    #[inline]
    pub fn init_header(&self, num: usize, locked: bool) {
        let h = ((num as u64) << NUM_SHIFT) | u64::from(locked);
        self.header.store(h, WRITE_ORD);
    }

    // ========================================================================
    //  Keys and children
    // ========================================================================

    /// Key at slot `i` (valid for `1..=num`).
    #[inline]
    #[must_use]
    pub fn key(&self, i: usize) -> Key {
        debug_assert!((1..=NON_LEAF_KEY_NUM).contains(&i));
        self.ent[i - 1].k.load(RELAXED)
    }

    /// Child pointer at slot `i` (valid for `0..=num`).
    #[inline]
    #[must_use]
    pub fn child(&self, i: usize) -> u64 {
        debug_assert!(i <= NON_LEAF_KEY_NUM);
        if i == 0 {
            self.child0.load(RELAXED)
        } else {
            self.ent[i - 1].ch.load(RELAXED)
        }
    }

    /// Set the key at slot `i`. Caller holds the lock or owns the node.
    #[inline]
    pub fn set_key(&self, i: usize, k: Key) {
        debug_assert!((1..=NON_LEAF_KEY_NUM).contains(&i));
        self.ent[i - 1].k.store(k, RELAXED);
    }

    /// Set the child at slot `i`. Caller holds the lock or owns the node.
    #[inline]
    pub fn set_child(&self, i: usize, ch: u64) {
        debug_assert!(i <= NON_LEAF_KEY_NUM);
        if i == 0 {
            self.child0.store(ch, RELAXED);
        } else {
            self.ent[i - 1].ch.store(ch, RELAXED);
        }
    }

    /// Copy entry `src` over entry `dst` (both in `1..=NON_LEAF_KEY_NUM`).
    #[inline]
    pub fn copy_entry(&self, dst: usize, src: usize) {
        self.set_key(dst, self.key(src));
        self.set_child(dst, self.child(src));
    }

    /// Binary-search the child subtree for `key`, given the validated key
    /// count `num`.
    ///
    /// Narrows to a window of at most 8 entries, then scans linearly.
    /// Returns `(pos, child)` where `child = child(pos)` is the subtree to
    /// descend into.
    #[must_use]
    pub fn search(&self, key: Key, num: usize) -> (usize, u64) {
        let mut b = 1usize;
        // A stale descent can read the header of a node that was freed and
        // relinked; the re-read validation rejects the result, but the slot
        // accesses in between must stay in bounds.
        let mut t = num.min(NON_LEAF_KEY_NUM);
        while b + 7 <= t {
            let m = (b + t) >> 1;
            let km = self.key(m);
            if key > km {
                b = m + 1;
            } else if key < km {
                t = m - 1;
            } else {
                return (m, self.child(m));
            }
        }
        while b <= t {
            if key < self.key(b) {
                break;
            }
            b += 1;
        }
        (b - 1, self.child(b - 1))
    }

    /// Insert `(key, ch)` at slot `pos`, shifting `[pos..=num]` up by one.
    /// Caller holds the lock; `num` is the pre-insert key count.
    pub fn insert_entry(&self, pos: usize, key: Key, ch: u64, num: usize) {
        debug_assert!(pos >= 1 && pos <= num + 1);
        debug_assert!(num < NON_LEAF_KEY_NUM);
        let mut i = num;
        while i >= pos {
            self.copy_entry(i + 1, i);
            i -= 1;
        }
        self.set_key(pos, key);
        self.set_child(pos, ch);
    }

    /// Remove the entry at slot `pos`, shifting `[pos+1..=num]` down by one.
    /// Caller holds the lock; `num` is the pre-remove key count.
    pub fn remove_entry(&self, pos: usize, num: usize) {
        debug_assert!(pos >= 1 && pos <= num);
        for i in pos..num {
            self.copy_entry(i, i + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed_node() -> Box<Internode> {
        // SAFETY: zeroed bytes are a valid Internode (all fields atomics).
        unsafe { Box::new(std::mem::zeroed()) }
    }

    #[test]
    fn geometry() {
        assert_eq!(NON_LEAF_KEY_NUM, 15);
        assert_eq!(LEFT_KEY_NUM, 7);
        assert_eq!(RIGHT_KEY_NUM, 8);
        assert_eq!(std::mem::size_of::<Internode>(), 256);
    }

    #[test]
    fn header_roundtrip() {
        let n = boxed_node();
        n.init_header(5, false);
        let h = n.header();
        assert!(!header_locked(h));
        assert_eq!(header_num(h), 5);

        assert!(n.try_lock(h));
        assert!(header_locked(n.header()));
        // Second lock attempt with the stale snapshot fails.
        assert!(!n.try_lock(h));

        n.publish_num(6);
        let h2 = n.header();
        assert!(!header_locked(h2));
        assert_eq!(header_num(h2), 6);
        // Sequence bumped: old snapshot can no longer lock.
        assert!(!n.try_lock(h));
    }

    #[test]
    fn unlock_restore_leaves_header_unchanged() {
        let n = boxed_node();
        n.init_header(3, false);
        let h = n.header();
        assert!(n.try_lock(h));
        n.unlock_restore(h);
        assert_eq!(n.header(), h);
        // Restoring without a bump means the snapshot is still lockable.
        assert!(n.try_lock(h));
    }

    #[test]
    fn search_routes_to_correct_child() {
        let n = boxed_node();
        // Children: c0 < 10 <= c1 < 20 <= c2 < 30 <= c3
        n.set_child(0, 100);
        for (i, k) in [(1, 10), (2, 20), (3, 30)] {
            n.set_key(i, k);
            n.set_child(i, 100 + i as u64);
        }
        n.init_header(3, false);

        assert_eq!(n.search(5, 3), (0, 100));
        assert_eq!(n.search(10, 3), (1, 101));
        assert_eq!(n.search(15, 3), (1, 101));
        assert_eq!(n.search(20, 3), (2, 102));
        assert_eq!(n.search(29, 3), (2, 102));
        assert_eq!(n.search(30, 3), (3, 103));
        assert_eq!(n.search(1000, 3), (3, 103));
    }

    #[test]
    fn search_with_full_node_uses_binary_phase() {
        let n = boxed_node();
        n.set_child(0, 0);
        for i in 1..=NON_LEAF_KEY_NUM {
            n.set_key(i, (i * 10) as Key);
            n.set_child(i, i as u64);
        }
        n.init_header(NON_LEAF_KEY_NUM, false);

        for i in 1..=NON_LEAF_KEY_NUM {
            let (pos, ch) = n.search((i * 10) as Key, NON_LEAF_KEY_NUM);
            assert_eq!(pos, i);
            assert_eq!(ch, i as u64);
            let (pos, _) = n.search((i * 10 + 5) as Key, NON_LEAF_KEY_NUM);
            assert_eq!(pos, i);
        }
        assert_eq!(n.search(5, NON_LEAF_KEY_NUM).0, 0);
    }

    #[test]
    fn insert_and_remove_shift_entries() {
        let n = boxed_node();
        n.set_child(0, 0);
        n.set_key(1, 10);
        n.set_child(1, 1);
        n.set_key(2, 30);
        n.set_child(2, 3);
        n.init_header(2, true);

        n.insert_entry(2, 20, 2, 2);
        n.publish_num(3);
        assert_eq!((n.key(1), n.key(2), n.key(3)), (10, 20, 30));
        assert_eq!((n.child(1), n.child(2), n.child(3)), (1, 2, 3));

        let h = n.header();
        assert!(n.try_lock(h));
        n.remove_entry(2, 3);
        n.publish_num(2);
        assert_eq!((n.key(1), n.key(2)), (10, 30));
        assert_eq!((n.child(1), n.child(2)), (1, 3));
    }
}
