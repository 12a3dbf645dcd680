//! # nvtree
//!
//! A persistent-memory-optimized B+-tree for 8-byte integer keys and 8-byte
//! payload pointers, targeting byte-addressable NVM with cache-line flush
//! and store-fence primitives.
//!
//! The tree is hybrid: inner nodes are ordinary volatile B+-tree nodes in
//! DRAM, while leaves live on NVM with a crash-atomic layout - a 14-bit
//! occupancy bitmap, one fingerprint byte per slot, and an alternating
//! sibling pointer, all arranged so every mutation commits through a single
//! 8-byte (or ordered 16-byte) metadata store.
//!
//! ## Subsystems
//!
//! - [`flush`]: cache-line writeback / store fence, pluggable real, stat
//!   and no-op modes
//! - [`mempool`] / [`nvmpool`]: per-thread bump arenas with node free
//!   lists, over DRAM and mapped NVM
//! - [`logbuf`] / [`minilog`]: a per-thread wrap-around log ring with
//!   per-line checksum+version, and the undo/redo mini-transaction log on
//!   top of it
//! - [`internode`] / [`leaf`]: the two node shapes
//! - [`tree`]: lookup / insert / delete under an optimistic-descent,
//!   CAS-validated lock-set protocol, plus parallel bulk-load and
//!   structural checking
//!
//! ## Concurrency
//!
//! Readers never observe a locked node: a descent that sees a lock bit, or
//! whose re-read of a node header disagrees with the first read, restarts
//! from the root. Writers acquire every lock they need by CAS from the
//! exact values the descent observed, so a fully acquired lock set proves
//! the descent is still valid. Durability is flush+fence ordered; locks
//! clear only behind the mutation's final fence.

mod tracing_helpers;

pub mod flush;
pub mod internode;
pub mod key;
pub mod keyinput;
pub mod leaf;
pub mod logbuf;
pub mod mempool;
pub mod minilog;
pub mod nvmpool;
pub mod ordering;
pub mod prefetch;
pub mod tree;

pub use key::{Key, MAX_KEY, MIN_KEY};
pub use mempool::{MemPoolSet, set_worker_id, worker_id};
pub use minilog::{NvmLog, NvmLogSet};
pub use nvmpool::{NvmPoolSet, NvmPoolError};
pub use tree::NvTree;
