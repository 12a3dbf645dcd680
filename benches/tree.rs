//! Point-operation microbenchmarks over an anonymous-memory pool.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};

use nvtree::keyinput::VecKeys;
use nvtree::mempool::MB;
use nvtree::nvmpool::NVM_META_SIZE;
use nvtree::{Key, MemPoolSet, NvTree, NvmPoolSet, set_worker_id};

struct BenchEnv {
    _mem: Arc<MemPoolSet>,
    _nvm: Arc<NvmPoolSet>,
    tree: NvTree,
}

fn setup(keynum: usize) -> BenchEnv {
    set_worker_id(0);
    let mem = Arc::new(MemPoolSet::init(1, 64 * MB, 4096));
    let nvm = Arc::new(NvmPoolSet::init(1, None, 128 * MB).expect("anon NVM pool"));
    let meta_page = nvm.arena_for(0).alloc(NVM_META_SIZE);
    let tree = NvTree::new(meta_page, Arc::clone(&mem), Arc::clone(&nvm), false);

    let keys: Vec<Key> = (1..=keynum as Key).collect();
    tree.bulkload(keynum, &VecKeys::new(keys), 0.7);
    tree.randomize();

    BenchEnv {
        _mem: mem,
        _nvm: nvm,
        tree,
    }
}

fn bench_lookup(c: &mut Criterion) {
    let env = setup(100_000);
    let mut k: Key = 0;

    c.bench_function("lookup/hit", |b| {
        b.iter(|| {
            k = k % 100_000 + 1;
            let (_, pos) = env.tree.lookup(black_box(k));
            debug_assert!(pos.is_some());
            pos
        });
    });

    c.bench_function("lookup/miss", |b| {
        b.iter(|| {
            k = k % 100_000 + 1;
            env.tree.lookup(black_box(k + 1_000_000)).1
        });
    });
}

fn bench_insert_delete(c: &mut Criterion) {
    let env = setup(100_000);

    // Insert-then-delete keeps the footprint flat across iterations.
    let mut k: Key = 0;
    c.bench_function("insert+del", |b| {
        b.iter(|| {
            k = k % 100_000 + 1;
            let fresh = black_box(1_000_000 + k);
            env.tree.insert(fresh, fresh as u64);
            env.tree.del(fresh);
        });
    });
}

criterion_group!(benches, bench_lookup, bench_insert_delete);
criterion_main!(benches);
