//! Shared test scaffolding: tracing setup and pool/tree construction.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;

use nvtree::mempool::MB;
use nvtree::nvmpool::NVM_META_SIZE;
use nvtree::{MemPoolSet, NvTree, NvmPoolSet, set_worker_id};

static INIT: Once = Once::new();

/// Initialize the tracing subscriber once per test binary.
///
/// Controlled by `RUST_LOG`; silent by default.
pub fn init_tracing() {
    INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A tree over freshly initialized pools (anonymous memory stands in for
/// NVM). Keep the whole struct alive while the tree is used.
pub struct TestEnv {
    pub mem: Arc<MemPoolSet>,
    pub nvm: Arc<NvmPoolSet>,
    pub tree: NvTree,
}

/// Build pools for `workers` threads and create an empty tree.
pub fn setup(workers: usize, mem_mb: usize, nvm_mb: usize) -> TestEnv {
    init_tracing();
    set_worker_id(0);

    let mem = Arc::new(MemPoolSet::init(workers, mem_mb * MB, 4096));
    let nvm = Arc::new(NvmPoolSet::init(workers, None, nvm_mb * MB).expect("anon NVM pool"));

    let meta_page = nvm.arena_for(0).alloc(NVM_META_SIZE);
    let tree = NvTree::new(meta_page, Arc::clone(&mem), Arc::clone(&nvm), false);

    TestEnv { mem, nvm, tree }
}

/// Assert that `key` is present with payload == key.
pub fn assert_found(tree: &NvTree, key: i64) {
    let (leaf, pos) = tree.lookup(key);
    let pos = pos.unwrap_or_else(|| panic!("key {key} not found"));
    // SAFETY: (leaf, pos) came from this lookup.
    let rec = unsafe { tree.get_recptr(leaf, pos) };
    assert_eq!(rec, key as u64, "payload mismatch for key {key}");
}

/// Assert that `key` is absent.
pub fn assert_missing(tree: &NvTree, key: i64) {
    assert!(tree.lookup(key).1.is_none(), "key {key} unexpectedly found");
}
