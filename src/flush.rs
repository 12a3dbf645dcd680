//! Cache-line flush and store-fence primitives.
//!
//! Every durable write in the crate goes through this module: after
//! `flush_range(r); fence()` returns, every byte of `r` is durable on the
//! persistent medium. Three build-time modes select what the primitives
//! actually do:
//!
//! - **real** (default): issue the writeback and fence instructions
//! - **`flush-stat`**: count calls instead of issuing them (benchmarking)
//! - **`flush-noop`**: suppress all work (correctness isolation)
//!
//! The modes are mutually exclusive. A fourth helper, [`write_line_nt`],
//! copies exactly one 64-byte aligned line with non-temporal stores.
//!
//! # Platform notes
//!
//! On `x86_64` the real mode uses `clflush`, which is baseline and always
//! available; it evicts the line in addition to writing it back, which is
//! slower than `clwb` but has identical durability semantics. On other
//! architectures the writeback is a no-op and `fence` degrades to a
//! sequentially-consistent compiler/CPU fence.

#[cfg(all(feature = "flush-stat", feature = "flush-noop"))]
compile_error!("features `flush-stat` and `flush-noop` are mutually exclusive");

/// Size of a cache line in bytes.
pub const CACHE_LINE_SIZE: usize = 64;

/// Round an address down to its cache-line base.
#[inline]
#[must_use]
pub fn line_of(addr: usize) -> usize {
    addr & !(CACHE_LINE_SIZE - 1)
}

// ============================================================================
//  Real mode (default)
// ============================================================================

#[cfg(not(any(feature = "flush-stat", feature = "flush-noop")))]
mod imp {
    /// Schedule writeback of the cache line containing `addr`.
    #[inline]
    pub fn flush_line(addr: *const u8) {
        #[cfg(target_arch = "x86_64")]
        {
            // SAFETY: clflush accepts any mapped address; the line base is
            // derived from a live allocation.
            unsafe {
                std::arch::x86_64::_mm_clflush(addr);
            }
        }

        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = addr;
        }
    }

    /// Store fence: order all previously flushed lines before later stores.
    #[inline]
    pub fn fence() {
        #[cfg(target_arch = "x86_64")]
        {
            // SAFETY: sfence has no operands and no preconditions.
            unsafe {
                std::arch::x86_64::_mm_sfence();
            }
        }

        #[cfg(not(target_arch = "x86_64"))]
        {
            std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        }
    }
}

// ============================================================================
//  Stat mode
// ============================================================================

#[cfg(feature = "flush-stat")]
mod imp {
    use std::sync::atomic::{AtomicU64, Ordering};

    pub(super) static NUM_FLUSH: AtomicU64 = AtomicU64::new(0);
    pub(super) static NUM_FENCE: AtomicU64 = AtomicU64::new(0);

    #[inline]
    pub fn flush_line(_addr: *const u8) {
        NUM_FLUSH.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn fence() {
        NUM_FENCE.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
//  No-op mode
// ============================================================================

#[cfg(all(feature = "flush-noop", not(feature = "flush-stat")))]
mod imp {
    #[inline]
    pub fn flush_line(_addr: *const u8) {}

    #[inline]
    pub fn fence() {}
}

pub use imp::{fence, flush_line};

/// Flush every cache line spanned by `[start, end]` (end inclusive).
#[inline]
pub fn flush_range(start: *const u8, end: *const u8) {
    let mut line = line_of(start as usize);
    let end_line = line_of(end as usize);
    while line <= end_line {
        flush_line(line as *const u8);
        line += CACHE_LINE_SIZE;
    }
}

/// Copy one 64-byte line from `src` to `dst` with non-temporal stores.
///
/// Non-temporal stores bypass the cache, so the destination line does not
/// need a separate flush; a [`fence`] is still required to order it.
/// On platforms without streaming stores this degrades to a plain copy
/// followed by a line flush.
///
/// # Safety
///
/// `dst` and `src` must both be valid, 64-byte aligned, and non-overlapping.
pub unsafe fn write_line_nt(dst: *mut u8, src: *const u8) {
    debug_assert!(dst as usize % CACHE_LINE_SIZE == 0, "dst not line aligned");
    debug_assert!(src as usize % CACHE_LINE_SIZE == 0, "src not line aligned");

    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::{__m128i, _mm_load_si128, _mm_stream_si128};

        // SAFETY: caller guarantees 64B alignment and validity; four 16B
        // streaming stores cover exactly one line.
        unsafe {
            let s = src.cast::<__m128i>();
            let d = dst.cast::<__m128i>();
            _mm_stream_si128(d, _mm_load_si128(s));
            _mm_stream_si128(d.add(1), _mm_load_si128(s.add(1)));
            _mm_stream_si128(d.add(2), _mm_load_si128(s.add(2)));
            _mm_stream_si128(d.add(3), _mm_load_si128(s.add(3)));
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        // SAFETY: caller guarantees validity and non-overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(src, dst, CACHE_LINE_SIZE);
        }
        flush_line(dst);
    }
}

// ============================================================================
//  Flush statistics (only meaningful in `flush-stat` builds)
// ============================================================================

/// Reset the flush/fence counters.
pub fn stat_reset() {
    #[cfg(feature = "flush-stat")]
    {
        use std::sync::atomic::Ordering;
        imp::NUM_FLUSH.store(0, Ordering::Relaxed);
        imp::NUM_FENCE.store(0, Ordering::Relaxed);
    }
}

/// Read the flush/fence counters as `(flushes, fences)`.
///
/// Always `(0, 0)` outside `flush-stat` builds.
#[must_use]
pub fn stat_counts() -> (u64, u64) {
    #[cfg(feature = "flush-stat")]
    {
        use std::sync::atomic::Ordering;
        return (
            imp::NUM_FLUSH.load(Ordering::Relaxed),
            imp::NUM_FENCE.load(Ordering::Relaxed),
        );
    }

    #[cfg(not(feature = "flush-stat"))]
    {
        (0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_of_masks_low_bits() {
        assert_eq!(line_of(0), 0);
        assert_eq!(line_of(63), 0);
        assert_eq!(line_of(64), 64);
        assert_eq!(line_of(130), 128);
    }

    #[test]
    fn flush_range_covers_every_line() {
        // Must not panic regardless of mode; exercises the line walk.
        let buf = [0u8; 256];
        let start = buf.as_ptr();
        // SAFETY: in-bounds offset of a live array.
        let end = unsafe { start.add(255) };
        flush_range(start, end);
        fence();
    }

    #[test]
    fn nt_line_copy_round_trips() {
        #[repr(align(64))]
        struct Aligned([u8; 128]);

        let mut buf = Aligned([0u8; 128]);
        for (i, b) in buf.0[..64].iter_mut().enumerate() {
            *b = i as u8;
        }
        let base = buf.0.as_mut_ptr();
        let (src, dst) = (base.cast_const(), unsafe { base.add(64) });
        // SAFETY: both halves are 64B aligned, valid, and disjoint.
        unsafe { write_line_nt(dst, src) };
        fence();
        assert_eq!(buf.0[..64], buf.0[64..]);
    }
}
