//! Per-thread NVM pools over a memory-mapped region.
//!
//! [`NvmPoolSet`] follows the same allocator discipline as
//! [`MemPoolSet`](crate::mempool::MemPoolSet) - per-worker bump arenas with
//! node free lists - but the backing region is byte-addressable NVM: a
//! file mapped at page granularity (a DAX file on real hardware), or an
//! anonymous mapping when no file is given (DRAM emulating NVM).
//!
//! Mapping is done through `memmap2`. When the `NVTREE_MMAP_HINT`
//! environment variable holds a hex address and a file is used, the region
//! is mapped with that address as a hint so that persisted pointers stay
//! valid across runs. A SIGBUS handler is installed that terminates the
//! process on an NVM media fault, and every 4 KiB page is touched during
//! initialization so faults surface immediately.
//!
//! Worker 0's segment begins with the 4 KiB tree-metadata page (byte 0 is
//! the persistent `first_leaf` slot); leaves and the per-thread log rings
//! are carved out of the segments after it.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use thiserror::Error;

use crate::mempool::{Arena, MIN_SEGMENT, worker_id};
use crate::tracing_helpers::debug_log;

/// Environment variable naming the desired mapping address (hex).
pub const NVM_MMAP_HINT_ENV: &str = "NVTREE_MMAP_HINT";

/// Size of the tree-metadata page at the start of worker 0's segment.
pub const NVM_META_SIZE: usize = 4096;

/// Errors raised while setting up the NVM mapping.
///
/// Everything after a successful `init` is fail-stop (bus errors terminate
/// via the signal handler; exhaustion terminates in the arena).
#[derive(Debug, Error)]
pub enum NvmPoolError {
    #[error("cannot open NVM file {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot size NVM file {path} to {size} bytes: {source}")]
    Resize {
        path: String,
        size: usize,
        source: std::io::Error,
    },

    #[error("cannot map NVM region of {size} bytes: {source}")]
    Map {
        size: usize,
        source: std::io::Error,
    },

    #[error("invalid NVTREE_MMAP_HINT value {0:?} (expected a hex address)")]
    BadHint(String),
}

// ============================================================================
//  SIGBUS handling
// ============================================================================

extern "C" fn handle_sigbus(_sig: libc::c_int) {
    // Only async-signal-safe calls are allowed here.
    const MSG: &[u8] = b"nvtree: SIGBUS on NVM mapping, terminating\n";
    unsafe {
        libc::write(2, MSG.as_ptr().cast(), MSG.len());
        libc::_exit(1);
    }
}

fn install_sigbus_handler() {
    let handler: extern "C" fn(libc::c_int) = handle_sigbus;
    // SAFETY: installing a handler that only performs async-signal-safe work.
    unsafe {
        libc::signal(libc::SIGBUS, handler as libc::sighandler_t);
    }
}

// ============================================================================
//  Backing storage
// ============================================================================

enum Backing {
    /// memmap2-owned mapping (file-backed or anonymous).
    Mapped(#[allow(dead_code)] MmapMut),

    /// Raw libc mapping used when an address hint is requested.
    Raw { ptr: *mut u8, len: usize },
}

impl Drop for Backing {
    fn drop(&mut self) {
        if let Backing::Raw { ptr, len } = *self {
            // SAFETY: ptr/len describe a live mapping we own.
            unsafe {
                libc::munmap(ptr.cast(), len);
            }
        }
    }
}

fn parse_hint() -> Result<Option<usize>, NvmPoolError> {
    match std::env::var(NVM_MMAP_HINT_ENV) {
        Ok(s) => {
            let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
            usize::from_str_radix(trimmed, 16)
                .map(Some)
                .map_err(|_| NvmPoolError::BadHint(s))
        }
        Err(_) => Ok(None),
    }
}

// ============================================================================
//  NvmPoolSet
// ============================================================================

/// A mapped NVM region split into per-worker [`Arena`] segments.
pub struct NvmPoolSet {
    arenas: Box<[Arena]>,
    base: *mut u8,
    size: usize,
    _backing: Backing,
}

// SAFETY: arenas follow the single-writer contract; the mapping lives until
// drop.
unsafe impl Send for NvmPoolSet {}
unsafe impl Sync for NvmPoolSet {}

impl NvmPoolSet {
    /// Map the region and initialize one arena per worker.
    ///
    /// With `nvm_file = Some(path)` the file is created/extended and mapped
    /// shared; with `None` an anonymous mapping stands in for NVM. `size` is
    /// the total pool size; each worker segment is a multiple of 4 KiB and at
    /// least 1 MiB.
    pub fn init(
        num_workers: usize,
        nvm_file: Option<&Path>,
        size: usize,
    ) -> Result<Self, NvmPoolError> {
        assert!(num_workers > 0, "need at least one worker");

        install_sigbus_handler();

        let per_pool = ((size / num_workers) / 4096 * 4096).max(MIN_SEGMENT);
        let total = per_pool * num_workers;

        let (base, backing) = match nvm_file {
            Some(path) => Self::map_file(path, total)?,
            None => {
                let mut map = MmapOptions::new()
                    .len(total)
                    .map_anon()
                    .map_err(|source| NvmPoolError::Map { size: total, source })?;
                let base = map.as_mut_ptr();
                (base, Backing::Mapped(map))
            }
        };

        debug_log!(base = ?base, total, per_pool, "NVM region mapped");

        // Touch every page so the mapping is fully committed before any
        // operation depends on it. Read-then-write-back keeps file contents
        // intact when attaching to an existing pool.
        let mut off = 0;
        while off < total {
            // SAFETY: off < total, in bounds of the mapping.
            unsafe {
                let p = base.add(off);
                let v = p.read_volatile();
                p.write_volatile(v);
            }
            off += 4096;
        }

        let arenas = (0..num_workers)
            .map(|i| {
                // SAFETY: segment i starts in bounds.
                let seg = unsafe { base.add(i * per_pool) };
                Arena::new_named(seg, per_pool, format!("NVM pool {i}"))
            })
            .collect();

        Ok(Self {
            arenas,
            base,
            size: total,
            _backing: backing,
        })
    }

    fn map_file(path: &Path, total: usize) -> Result<(*mut u8, Backing), NvmPoolError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| NvmPoolError::Open {
                path: path.display().to_string(),
                source,
            })?;
        file.set_len(total as u64).map_err(|source| NvmPoolError::Resize {
            path: path.display().to_string(),
            size: total,
            source,
        })?;

        if let Some(hint) = parse_hint()? {
            use std::os::unix::io::AsRawFd;

            // SAFETY: fd is open for the duration of the call; hint is only
            // a hint (no MAP_FIXED), so no existing mapping is clobbered.
            let ptr = unsafe {
                libc::mmap(
                    hint as *mut libc::c_void,
                    total,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(NvmPoolError::Map {
                    size: total,
                    source: std::io::Error::last_os_error(),
                });
            }
            Ok((ptr.cast(), Backing::Raw { ptr: ptr.cast(), len: total }))
        } else {
            // SAFETY: the mapping is private to this process by protocol;
            // nothing else writes the file while it is mapped.
            let mut map = unsafe { MmapOptions::new().len(total).map_mut(&file) }
                .map_err(|source| NvmPoolError::Map { size: total, source })?;
            let base = map.as_mut_ptr();
            Ok((base, Backing::Mapped(map)))
        }
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

    /// Base address of the whole mapped region.
    #[inline]
    #[must_use]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Total mapped bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Print per-worker usage.
    pub fn print_usage(&self) {
        println!("NvmPoolSet");
        println!("--------------------");
        for a in self.arenas.iter() {
            a.print_usage();
        }
        println!("--------------------");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::{MB, set_worker_id};

    #[test]
    fn anon_pool_allocates_aligned_nodes() {
        let pools = NvmPoolSet::init(2, None, 4 * MB).unwrap();
        set_worker_id(0);
        // Carve the metadata page first, as the CLI does; later 256-byte
        // allocations then stay 256-byte aligned.
        let meta = pools.arena().alloc(NVM_META_SIZE);
        assert_eq!(meta as usize % 4096, 0);
        for _ in 0..8 {
            let leaf = pools.arena().alloc_node(256);
            assert_eq!(leaf as usize % 256, 0);
        }
    }

    #[test]
    fn file_pool_maps_and_touches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.nvm");
        let pools = NvmPoolSet::init(1, Some(&path), 2 * MB).unwrap();
        assert!(pools.size() >= 2 * MB);
        set_worker_id(0);
        let p = pools.arena().alloc(4096);
        // The mapping is writable.
        unsafe {
            p.write_volatile(0xab);
            assert_eq!(p.read_volatile(), 0xab);
        }
    }
}
