//! Persistent leaf node.
//!
//! Leaves live in the NVM arenas: 256 bytes, 256-byte aligned, 4 cache
//! lines. The layout, in order:
//!
//! ```text
//! 2 B   metadata: 14-bit bitmap | 1-bit lock | 1-bit alt
//! 14 B  fingerprints, one per slot
//! 14 x 16 B entries (key, ptr)
//! 2 x 8 B sibling pointers; the live one is next[alt]
//! ```
//!
//! The metadata-plus-fingerprint strip occupies the first 16 bytes, i.e.
//! two 8-byte words. Word 0 (metadata + fgpt[0..6]) is the leaf's
//! publication point: every committed mutation changes it, and a single
//! 8-byte store of it atomically exposes a new bitmap, lock and alt state.
//! [`Leaf::set_both_words`] stores word 1 first so that no reader treats a
//! new fingerprint in word 1 as authoritative before word 0's bitmap bit
//! appears.
//!
//! Keys are deliberately NOT sorted within a leaf: insertion into a
//! non-full leaf is O(1) cache lines of writes. Slot-to-line partitioning
//! is fixed: line 0 holds slots 0..=2 (after the 16-byte strip), line 1
//! slots 3..=6, line 2 slots 7..=10, line 3 slots 11..=13 followed by the
//! two sibling pointers.
//!
//! Lookup filters slots by comparing the search key's fingerprint against
//! all 14 fingerprint bytes at once (SSE2 on `x86_64`, scalar elsewhere),
//! masks with the bitmap, and only then compares full keys.

use std::sync::atomic::{AtomicI64, AtomicU64};

use crate::flush::CACHE_LINE_SIZE;
use crate::key::Key;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};

/// Size of a leaf node in bytes (4 cache lines).
pub const LEAF_SIZE: usize = 256;

/// Cache lines per leaf node.
pub const LEAF_LINES: usize = LEAF_SIZE / CACHE_LINE_SIZE;

/// Number of entry slots in a leaf.
pub const LEAF_KEY_NUM: usize = 14;

/// Bitmap value of a full leaf.
pub const FULL_BITMAP: u16 = 0x3fff;

/// Highest slot sharing a cache line with the given slot.
///
/// Line 0: slots 0..=2; line 1: 3..=6; line 2: 7..=10; line 3: 11..=13.
pub const LAST_SLOT_IN_LINE: [usize; LEAF_KEY_NUM] =
    [2, 2, 2, 6, 6, 6, 6, 10, 10, 10, 10, 13, 13, 13];

const BITMAP_MASK: u64 = 0x3fff;
const LOCK_BIT: u64 = 1 << 14;
const ALT_BIT: u64 = 1 << 15;

// ============================================================================
//  LeafMeta
// ============================================================================

/// A volatile copy of a leaf's two metadata words.
///
/// Mutation paths compose the desired final state in a `LeafMeta`, write
/// entries, and then publish with [`Leaf::set_word0`] or
/// [`Leaf::set_both_words`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LeafMeta {
    w0: u64,
    w1: u64,
}

impl LeafMeta {
    /// Word 0 (metadata + fgpt[0..6]).
    #[inline]
    #[must_use]
    pub fn word0(&self) -> u64 {
        self.w0
    }

    /// Word 1 (fgpt[6..14]).
    #[inline]
    #[must_use]
    pub fn word1(&self) -> u64 {
        self.w1
    }

    /// The 14-bit occupancy bitmap.
    #[inline]
    #[must_use]
    pub fn bitmap(&self) -> u16 {
        (self.w0 & BITMAP_MASK) as u16
    }

    /// Replace the bitmap.
    #[inline]
    pub fn set_bitmap(&mut self, bmp: u16) {
        debug_assert_eq!(u64::from(bmp) & !BITMAP_MASK, 0);
        self.w0 = (self.w0 & !BITMAP_MASK) | u64::from(bmp);
    }

    /// The lock bit.
    #[inline]
    #[must_use]
    pub fn locked(&self) -> bool {
        self.w0 & LOCK_BIT != 0
    }

    /// Set or clear the lock bit.
    #[inline]
    pub fn set_locked(&mut self, locked: bool) {
        if locked {
            self.w0 |= LOCK_BIT;
        } else {
            self.w0 &= !LOCK_BIT;
        }
    }

    /// The alt bit selecting the live sibling pointer.
    #[inline]
    #[must_use]
    pub fn alt(&self) -> usize {
        usize::from(self.w0 & ALT_BIT != 0)
    }

    /// Set the alt bit.
    #[inline]
    pub fn set_alt(&mut self, alt: usize) {
        debug_assert!(alt <= 1);
        if alt == 1 {
            self.w0 |= ALT_BIT;
        } else {
            self.w0 &= !ALT_BIT;
        }
    }

    /// Fingerprint of slot `i`.
    #[inline]
    #[must_use]
    pub fn fgpt(&self, i: usize) -> u8 {
        debug_assert!(i < LEAF_KEY_NUM);
        if i < 6 {
            (self.w0 >> (16 + 8 * i)) as u8
        } else {
            (self.w1 >> (8 * (i - 6))) as u8
        }
    }

    /// Set the fingerprint of slot `i`.
    #[inline]
    pub fn set_fgpt(&mut self, i: usize, v: u8) {
        debug_assert!(i < LEAF_KEY_NUM);
        if i < 6 {
            let sh = 16 + 8 * i;
            self.w0 = (self.w0 & !(0xffu64 << sh)) | (u64::from(v) << sh);
        } else {
            let sh = 8 * (i - 6);
            self.w1 = (self.w1 & !(0xffu64 << sh)) | (u64::from(v) << sh);
        }
    }

    /// Number of live entries.
    #[inline]
    #[must_use]
    pub fn num(&self) -> usize {
        self.bitmap().count_ones() as usize
    }

    /// Whether every slot is occupied.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.bitmap() == FULL_BITMAP
    }

    /// The 16 metadata bytes in line order, for the fingerprint scan.
    #[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
    #[inline]
    #[must_use]
    fn strip(&self) -> [u8; 16] {
        let mut s = [0u8; 16];
        s[..8].copy_from_slice(&self.w0.to_le_bytes());
        s[8..].copy_from_slice(&self.w1.to_le_bytes());
        s
    }
}

/// Lock bit of a raw word-0 value.
#[inline]
#[must_use]
pub fn word0_locked(w0: u64) -> bool {
    w0 & LOCK_BIT != 0
}

/// Alt bit of a raw word-0 value.
#[inline]
#[must_use]
pub fn word0_alt(w0: u64) -> usize {
    usize::from(w0 & ALT_BIT != 0)
}

// ============================================================================
//  Fingerprint scan
// ============================================================================

/// Candidate slots whose fingerprint equals `hash`: bit `i` of the result
/// corresponds to slot `i`, already masked with the bitmap.
#[inline]
#[must_use]
pub fn fgpt_match(meta: &LeafMeta, hash: u8) -> u16 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: SSE2 is baseline on x86_64.
        return unsafe { fgpt_match_sse2(meta, hash) };
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        fgpt_match_scalar(meta, hash)
    }
}

/// SSE2: broadcast the hash byte, compare against the 16-byte strip and
/// mask the movemask result down to the 14 slots.
#[cfg(target_arch = "x86_64")]
#[inline]
unsafe fn fgpt_match_sse2(meta: &LeafMeta, hash: u8) -> u16 {
    use std::arch::x86_64::{_mm_cmpeq_epi8, _mm_loadu_si128, _mm_movemask_epi8, _mm_set1_epi8};

    let strip = meta.strip();
    // SAFETY: strip is 16 valid bytes; loadu has no alignment requirement.
    unsafe {
        let key16 = _mm_set1_epi8(hash as i8);
        let fgpt16 = _mm_loadu_si128(strip.as_ptr().cast());
        let cmp = _mm_cmpeq_epi8(key16, fgpt16);
        let mask = _mm_movemask_epi8(cmp) as u32;
        // Drop the two metadata bytes, then bit i corresponds to slot i.
        ((mask >> 2) as u16) & meta.bitmap()
    }
}

/// Scalar fallback with identical semantics.
#[allow(dead_code)]
#[inline]
#[must_use]
fn fgpt_match_scalar(meta: &LeafMeta, hash: u8) -> u16 {
    let mut mask = 0u16;
    for i in 0..LEAF_KEY_NUM {
        if meta.fgpt(i) == hash {
            mask |= 1 << i;
        }
    }
    mask & meta.bitmap()
}

// ============================================================================
//  Leaf
// ============================================================================

#[repr(C)]
struct LeafEntry {
    k: AtomicI64,
    ch: AtomicU64,
}

/// A persistent leaf node. Lives in an NVM arena, never on the Rust heap.
#[repr(C, align(256))]
pub struct Leaf {
    meta: [AtomicU64; 2],
    ent: [LeafEntry; LEAF_KEY_NUM],
    next: [AtomicU64; 2],
}

const _: () = assert!(std::mem::size_of::<Leaf>() == LEAF_SIZE);
const _: () = assert!(std::mem::align_of::<Leaf>() == LEAF_SIZE);

impl Leaf {
    // ========================================================================
    //  Metadata words
    // ========================================================================

    /// Load word 0 (the publication word).
    #[inline]
    #[must_use]
    pub fn word0(&self) -> u64 {
        self.meta[0].load(READ_ORD)
    }

    /// Snapshot both metadata words.
    #[inline]
    #[must_use]
    pub fn load_meta(&self) -> LeafMeta {
        LeafMeta {
            w0: self.meta[0].load(READ_ORD),
            w1: self.meta[1].load(READ_ORD),
        }
    }

    /// Publish word 0: a single atomic 8-byte store covering bitmap, lock,
    /// alt and fgpt[0..6]. The caller flushes and fences.
    #[inline]
    pub fn set_word0(&self, m: &LeafMeta) {
        self.meta[0].store(m.w0, WRITE_ORD);
    }

    /// Publish both words: word 1 first, then word 0, so the bitmap bit in
    /// word 0 is what makes word 1's bytes authoritative. The two stores
    /// are not atomic together. The caller flushes and fences.
    #[inline]
    pub fn set_both_words(&self, m: &LeafMeta) {
        self.meta[1].store(m.w1, WRITE_ORD);
        self.meta[0].store(m.w0, WRITE_ORD);
    }

    /// Try to set the lock bit, succeeding only if word 0 still equals the
    /// value `seen` observed during descent. Success doubles as validation
    /// that the leaf is unchanged since it was read.
    #[inline]
    #[must_use]
    pub fn try_lock(&self, seen: u64) -> bool {
        debug_assert_eq!(seen & LOCK_BIT, 0);
        self.meta[0]
            .compare_exchange(seen, seen | LOCK_BIT, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    /// Release a lock acquired by [`try_lock`](Self::try_lock) without any
    /// mutation: restore the observed word.
    #[inline]
    pub fn unlock_restore(&self, seen: u64) {
        debug_assert_eq!(seen & LOCK_BIT, 0);
        self.meta[0].store(seen, WRITE_ORD);
    }

    /// Clear the lock bit, preserving everything else in word 0.
    #[inline]
    pub fn clear_lock(&self) {
        let w0 = self.meta[0].load(RELAXED);
        self.meta[0].store(w0 & !LOCK_BIT, WRITE_ORD);
    }

    /// Number of live entries.
    #[inline]
    #[must_use]
    pub fn num(&self) -> usize {
        self.load_meta().num()
    }

    // ========================================================================
    //  Entries
    // ========================================================================

    /// Key in slot `i`.
    #[inline]
    #[must_use]
    pub fn key(&self, i: usize) -> Key {
        debug_assert!(i < LEAF_KEY_NUM);
        self.ent[i].k.load(RELAXED)
    }

    /// Payload pointer in slot `i`.
    #[inline]
    #[must_use]
    pub fn rec(&self, i: usize) -> u64 {
        debug_assert!(i < LEAF_KEY_NUM);
        self.ent[i].ch.load(RELAXED)
    }

    /// Write `(key, ptr)` into slot `i`. Caller holds the lock or owns the
    /// leaf; visibility is governed by the subsequent word-0 publish.
    #[inline]
    pub fn set_entry(&self, i: usize, key: Key, ptr: u64) {
        debug_assert!(i < LEAF_KEY_NUM);
        self.ent[i].k.store(key, RELAXED);
        self.ent[i].ch.store(ptr, RELAXED);
    }

    /// Copy slot `src` over slot `dst` within this leaf.
    #[inline]
    pub fn move_entry(&self, dst: usize, src: usize) {
        self.set_entry(dst, self.key(src), self.rec(src));
    }

    /// Address of slot `i`'s entry, for targeted line flushes.
    #[inline]
    #[must_use]
    pub fn entry_addr(&self, i: usize) -> *const u8 {
        debug_assert!(i < LEAF_KEY_NUM);
        std::ptr::addr_of!(self.ent[i]).cast()
    }

    /// Address of the sibling-pointer pair, for targeted line flushes.
    #[inline]
    #[must_use]
    pub fn next_addr(&self) -> *const u8 {
        std::ptr::addr_of!(self.next).cast()
    }

    // ========================================================================
    //  Sibling pointers
    // ========================================================================

    /// Sibling pointer `i` (0 or 1).
    #[inline]
    #[must_use]
    pub fn next_ptr(&self, i: usize) -> u64 {
        debug_assert!(i <= 1);
        self.next[i].load(READ_ORD)
    }

    /// Set sibling pointer `i`.
    #[inline]
    pub fn set_next(&self, i: usize, v: u64) {
        debug_assert!(i <= 1);
        self.next[i].store(v, WRITE_ORD);
    }

    /// The live sibling: `next[alt]`.
    #[inline]
    #[must_use]
    pub fn next_sibling(&self) -> u64 {
        self.next_ptr(self.load_meta().alt())
    }

    // ========================================================================
    //  Search
    // ========================================================================

    /// Find the slot holding `key`, or `None`.
    ///
    /// `meta` must be a snapshot the caller validates (or has locked).
    #[must_use]
    pub fn find_slot(&self, meta: &LeafMeta, hash: u8, key: Key) -> Option<usize> {
        let mut mask = fgpt_match(meta, hash);
        while mask != 0 {
            let jj = mask.trailing_zeros() as usize;
            if self.key(jj) == key {
                return Some(jj);
            }
            mask &= mask - 1;
        }
        None
    }

    /// Smallest key in the leaf (`meta` tells which slots are live).
    #[must_use]
    pub fn min_key(&self, meta: &LeafMeta) -> Key {
        let mut min = crate::key::MAX_KEY;
        let mut bmp = meta.bitmap();
        while bmp != 0 {
            let i = bmp.trailing_zeros() as usize;
            min = min.min(self.key(i));
            bmp &= bmp - 1;
        }
        min
    }

    /// Largest key in the leaf.
    #[must_use]
    pub fn max_key(&self, meta: &LeafMeta) -> Key {
        let mut max = crate::key::MIN_KEY;
        let mut bmp = meta.bitmap();
        while bmp != 0 {
            let i = bmp.trailing_zeros() as usize;
            max = max.max(self.key(i));
            bmp &= bmp - 1;
        }
        max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::fingerprint;

    fn boxed_leaf() -> Box<Leaf> {
        // SAFETY: zeroed bytes are a valid Leaf (all fields atomics).
        unsafe { Box::new(std::mem::zeroed()) }
    }

    #[test]
    fn geometry() {
        assert_eq!(std::mem::size_of::<Leaf>(), LEAF_SIZE);
        assert_eq!(std::mem::align_of::<Leaf>(), 256);
    }

    #[test]
    fn meta_bit_accessors() {
        let mut m = LeafMeta::default();
        m.set_bitmap(0x2a5);
        m.set_locked(true);
        m.set_alt(1);
        assert_eq!(m.bitmap(), 0x2a5);
        assert!(m.locked());
        assert_eq!(m.alt(), 1);
        assert_eq!(m.num(), 0x2a5u16.count_ones() as usize);

        m.set_locked(false);
        m.set_alt(0);
        assert_eq!(m.bitmap(), 0x2a5, "bitmap survives flag changes");
        assert!(!m.locked());
        assert_eq!(m.alt(), 0);
    }

    #[test]
    fn meta_fgpt_covers_both_words() {
        let mut m = LeafMeta::default();
        for i in 0..LEAF_KEY_NUM {
            m.set_fgpt(i, 0x10 + i as u8);
        }
        for i in 0..LEAF_KEY_NUM {
            assert_eq!(m.fgpt(i), 0x10 + i as u8);
        }
        // Slots 0..6 live in word 0, the rest in word 1.
        assert_ne!(m.word0(), 0);
        assert_ne!(m.word1(), 0);
    }

    #[test]
    fn fgpt_match_agrees_with_scalar() {
        let mut m = LeafMeta::default();
        m.set_bitmap(FULL_BITMAP);
        for i in 0..LEAF_KEY_NUM {
            m.set_fgpt(i, (i % 3) as u8);
        }
        for hash in 0..4u8 {
            assert_eq!(fgpt_match(&m, hash), fgpt_match_scalar(&m, hash), "hash={hash}");
        }
    }

    #[test]
    fn fgpt_match_respects_bitmap() {
        let mut m = LeafMeta::default();
        for i in 0..LEAF_KEY_NUM {
            m.set_fgpt(i, 7);
        }
        m.set_bitmap(0b0000_0000_0101);
        assert_eq!(fgpt_match(&m, 7), 0b0000_0000_0101);
        assert_eq!(fgpt_match(&m, 8), 0);
    }

    #[test]
    fn find_slot_filters_by_fingerprint_then_key() {
        let leaf = boxed_leaf();
        let mut m = LeafMeta::default();
        let keys: [Key; 3] = [100, 200, 300];
        for (i, &k) in keys.iter().enumerate() {
            leaf.set_entry(i, k, k as u64);
            m.set_fgpt(i, fingerprint(k));
        }
        m.set_bitmap(0b111);
        leaf.set_both_words(&m);

        let meta = leaf.load_meta();
        for &k in &keys {
            let slot = leaf.find_slot(&meta, fingerprint(k), k).unwrap();
            assert_eq!(leaf.key(slot), k);
        }
        assert_eq!(leaf.find_slot(&meta, fingerprint(999), 999), None);
    }

    #[test]
    fn try_lock_validates_word0() {
        let leaf = boxed_leaf();
        let mut m = LeafMeta::default();
        m.set_bitmap(0b1);
        leaf.set_word0(&m);

        let seen = leaf.word0();
        assert!(leaf.try_lock(seen));
        assert!(leaf.load_meta().locked());
        // A stale snapshot no longer matches.
        assert!(!leaf.try_lock(seen));

        leaf.unlock_restore(seen);
        assert!(!leaf.load_meta().locked());
        assert!(leaf.try_lock(seen));
    }

    #[test]
    fn next_sibling_follows_alt() {
        let leaf = boxed_leaf();
        leaf.set_next(0, 0xaaaa);
        leaf.set_next(1, 0xbbbb);

        let mut m = LeafMeta::default();
        m.set_bitmap(1);
        m.set_alt(0);
        leaf.set_word0(&m);
        assert_eq!(leaf.next_sibling(), 0xaaaa);

        m.set_alt(1);
        leaf.set_word0(&m);
        assert_eq!(leaf.next_sibling(), 0xbbbb);
    }

    #[test]
    fn min_max_scan_live_slots_only() {
        let leaf = boxed_leaf();
        leaf.set_entry(3, 50, 0);
        leaf.set_entry(7, -20, 0);
        leaf.set_entry(13, 90, 0);
        let mut m = LeafMeta::default();
        m.set_bitmap((1 << 3) | (1 << 7) | (1 << 13));
        leaf.set_both_words(&m);

        let meta = leaf.load_meta();
        assert_eq!(leaf.min_key(&meta), -20);
        assert_eq!(leaf.max_key(&meta), 90);
    }
}
