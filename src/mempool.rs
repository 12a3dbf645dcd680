//! Per-thread DRAM memory pools.
//!
//! A [`MemPoolSet`] owns one contiguous region of DRAM, partitioned into
//! equal segments, one per worker thread. Each segment is managed by an
//! [`Arena`]: a bump allocator plus an intrusive free list of fixed-size
//! nodes. The thread-local [`worker_id`] selects the calling thread's
//! segment, so the allocation fast path is entirely uncontended.
//!
//! # Single-writer contract
//!
//! An [`Arena`] is mutated only by the thread bound to its `worker_id`.
//! Concurrent calls into the same arena are a protocol violation; the cursor
//! and free-list head use relaxed atomics so that cross-thread diagnostics
//! (`print_usage`) stay defined, not to make concurrent allocation safe.
//!
//! # Failure semantics
//!
//! Exhaustion is fail-stop: a diagnostic is printed and the process exits.
//! Callers on the tree's mutation paths cannot meaningfully recover from a
//! half-mutated node, so no `Result` is surfaced here.

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize};

use crate::ordering::RELAXED;

/// One mebibyte.
pub const MB: usize = 1024 * 1024;

/// Minimum size of a per-worker segment.
pub const MIN_SEGMENT: usize = MB;

thread_local! {
    static WORKER_ID: Cell<usize> = const { Cell::new(0) };
}

/// Get the calling thread's worker id (defaults to 0).
#[inline]
#[must_use]
pub fn worker_id() -> usize {
    WORKER_ID.with(Cell::get)
}

/// Bind the calling thread to a worker id.
///
/// The id selects the thread's segment in every pool set and its
/// mini-transaction log. It must be `< num_workers` and stable for the
/// thread's lifetime.
#[inline]
pub fn set_worker_id(id: usize) {
    WORKER_ID.with(|w| w.set(id));
}

// ============================================================================
//  Arena
// ============================================================================

/// A single worker's segment: bump allocation plus a node free list.
///
/// Freed nodes are chained through their own first 8 bytes, LIFO. All nodes
/// passed to [`Arena::free_node`] must have the same size, which must also be
/// the size passed to every [`Arena::alloc_node`] call.
pub struct Arena {
    base: *mut u8,
    size: usize,
    /// Bump cursor, as a byte offset from `base`.
    cur: AtomicUsize,
    /// Head of the intrusive free list (an address; 0 = empty).
    free_head: AtomicU64,
    name: String,
}

// SAFETY: per the single-writer contract above, mutation is confined to one
// thread per arena; the fields themselves are atomics.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub(crate) fn new_named(base: *mut u8, size: usize, name: String) -> Self {
        Self {
            base,
            size,
            cur: AtomicUsize::new(0),
            free_head: AtomicU64::new(0),
            name,
        }
    }

    /// Starting address of this segment.
    #[inline]
    #[must_use]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Bytes bump-allocated so far.
    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.cur.load(RELAXED)
    }

    /// Allocate `size` bytes from this segment.
    ///
    /// Alignment of `size` is the caller's responsibility: the cursor starts
    /// at a 4096-byte boundary and advances by exactly `size`, so callers
    /// that always request multiples of their node size keep every node
    /// aligned. Exhaustion is fail-stop.
    pub fn alloc(&self, size: usize) -> *mut u8 {
        let cur = self.cur.load(RELAXED);
        if cur + size > self.size {
            eprintln!("{}: alloc({size}) - out of memory", self.name);
            std::process::exit(1);
        }
        self.cur.store(cur + size, RELAXED);
        // SAFETY: cur + size <= self.size, in bounds of the owned region.
        unsafe { self.base.add(cur) }
    }

    /// Allocate a fixed-size node, reusing a freed node when one is available.
    pub fn alloc_node(&self, size: usize) -> *mut u8 {
        let head = self.free_head.load(RELAXED);
        if head != 0 {
            let p = head as *mut u8;
            // SAFETY: every free-list entry stores the next link in its
            // first 8 bytes; the node is ours until handed out.
            let next = unsafe { p.cast::<u64>().read() };
            self.free_head.store(next, RELAXED);
            p
        } else {
            self.alloc(size)
        }
    }

    /// Return a node to the free list (LIFO).
    pub fn free_node(&self, p: *mut u8) {
        // SAFETY: the node is dead; its first 8 bytes become the link.
        unsafe {
            p.cast::<u64>().write(self.free_head.load(RELAXED));
        }
        self.free_head.store(p as u64, RELAXED);
    }

    /// Free a general allocation: a no-op for bump-allocated memory.
    #[inline]
    pub fn free(&self, _p: *mut u8) {}

    /// Number of nodes currently on the free list.
    #[must_use]
    pub fn free_node_count(&self) -> usize {
        let mut n = 0;
        let mut p = self.free_head.load(RELAXED);
        while p != 0 {
            n += 1;
            // SAFETY: free-list links are valid node addresses within the
            // segment, written by free_node.
            p = unsafe { (p as *const u64).read() };
        }
        n
    }

    /// Print usage for diagnostics.
    pub fn print_usage(&self) {
        println!(
            "{}: total {:.1}MB, use {:.1}MB, among which {} free nodes",
            self.name,
            self.size as f64 / MB as f64,
            self.used() as f64 / MB as f64,
            self.free_node_count()
        );
    }

    /// Print internal parameters for debugging.
    pub fn print_params(&self) {
        println!("{}", self.name);
        println!("  base={:p} size={} cur={}", self.base, self.size, self.used());
        println!("  free_head={:#x}", self.free_head.load(RELAXED));
    }
}

// ============================================================================
//  MemPoolSet
// ============================================================================

/// A contiguous DRAM region split into per-worker [`Arena`] segments.
pub struct MemPoolSet {
    arenas: Box<[Arena]>,
    buf: *mut u8,
    layout: Layout,
}

// SAFETY: the arenas are Sync (single-writer contract); the owning buffer is
// only deallocated on drop.
unsafe impl Send for MemPoolSet {}
unsafe impl Sync for MemPoolSet {}

impl MemPoolSet {
    /// Allocate the region and initialize one arena per worker.
    ///
    /// `size` is the total pool size; each segment gets
    /// `max(size / num_workers rounded down to align, 1 MiB)`. Every page is
    /// touched up front so later allocation never faults.
    ///
    /// # Panics
    ///
    /// Panics if `num_workers == 0` or `align` is not a power of two.
    #[must_use]
    pub fn init(num_workers: usize, size: usize, align: usize) -> Self {
        assert!(num_workers > 0, "need at least one worker");
        assert!(align.is_power_of_two(), "align must be a power of two");

        let per_pool = ((size / num_workers) / align * align).max(MIN_SEGMENT);
        let total = per_pool * num_workers;

        let layout = Layout::from_size_align(total, align).expect("pool layout");
        // SAFETY: layout has non-zero size.
        let buf = unsafe { alloc::alloc(layout) };
        if buf.is_null() {
            eprintln!("mempool: cannot allocate {total} bytes");
            std::process::exit(1);
        }

        // Touch every page so that faults happen here, not mid-operation.
        let mut off = 0;
        while off < total {
            // SAFETY: off < total, in bounds.
            unsafe { buf.add(off).write_volatile(1) };
            off += 4096;
        }

        let arenas = (0..num_workers)
            .map(|i| {
                // SAFETY: segment i starts in bounds.
                let seg = unsafe { buf.add(i * per_pool) };
                Arena::new_named(seg, per_pool, format!("DRAM pool {i}"))
            })
            .collect();

        Self { arenas, buf, layout }
    }

    /// The calling thread's arena, selected by [`worker_id`].
    #[inline]
    #[must_use]
    pub fn arena(&self) -> &Arena {
        &self.arenas[worker_id()]
    }

    /// A specific worker's arena.
    #[inline]
    #[must_use]
    pub fn arena_for(&self, worker: usize) -> &Arena {
        &self.arenas[worker]
    }

    /// Number of worker segments.
    #[inline]
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.arenas.len()
    }

    /// Print per-worker usage.
    pub fn print_usage(&self) {
        println!("MemPoolSet");
        println!("--------------------");
        for a in self.arenas.iter() {
            a.print_usage();
        }
        println!("--------------------");
    }
}

impl Drop for MemPoolSet {
    fn drop(&mut self) {
        // SAFETY: buf was allocated with exactly this layout.
        unsafe { alloc::dealloc(self.buf, self.layout) };
    }
}
