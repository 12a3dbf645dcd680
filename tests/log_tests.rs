//! Mini-transaction log over a real (anonymous) NVM pool.

mod common;

use nvtree::logbuf::LogBuffer;
use nvtree::mempool::MB;
use nvtree::minilog::RecTag;
use nvtree::{NvmLogSet, NvmPoolSet, set_worker_id};

fn nvm_pool(workers: usize) -> NvmPoolSet {
    common::init_tracing();
    set_worker_id(0);
    NvmPoolSet::init(workers, None, workers * 4 * MB).expect("anon NVM pool")
}

#[test]
fn per_worker_logs_are_independent() {
    let nvm = nvm_pool(2);
    let logs = NvmLogSet::init(&nvm);
    assert_eq!(logs.num_workers(), 2);

    std::thread::scope(|s| {
        for t in 0..2 {
            let logs = &logs;
            let nvm = &nvm;
            s.spawn(move || {
                set_worker_id(t);
                // SAFETY: this thread is the only worker-t user.
                let log = unsafe { logs.local() };
                let arena = nvm.arena_for(t);

                let x = arena.alloc(256).cast::<u64>();
                // SAFETY: freshly allocated NVM word.
                unsafe {
                    x.write(t as u64);
                    log.start();
                    log.write8b(x, 100 + t as u64);
                    log.commit(arena);
                    assert_eq!(x.read(), 100 + t as u64);
                }
                assert_eq!(log.scan_since_tx(), vec![RecTag::Write8B, RecTag::Commit]);
            });
        }
    });
}

#[test]
fn abort_restores_nvm_state_and_logs_abort() {
    let nvm = nvm_pool(1);
    let logs = NvmLogSet::init(&nvm);
    set_worker_id(0);
    // SAFETY: single-threaded test.
    let log = unsafe { logs.local() };
    let arena = nvm.arena_for(0);

    let x = arena.alloc(256).cast::<u64>();
    // SAFETY: freshly allocated NVM word.
    unsafe {
        x.write(0xdead);
        log.start();
        log.write8b(x, 0xbeef);
        assert_eq!(x.read(), 0xbeef);
        log.abort(arena);
        assert_eq!(x.read(), 0xdead);
    }

    let tags = log.scan_since_tx();
    assert_eq!(tags.first(), Some(&RecTag::Write8B));
    assert_eq!(tags.last(), Some(&RecTag::Abort));
}

#[test]
fn commit_is_durable_before_redo_applies() {
    let nvm = nvm_pool(1);
    let logs = NvmLogSet::init(&nvm);
    set_worker_id(0);
    // SAFETY: single-threaded test.
    let log = unsafe { logs.local() };
    let arena = nvm.arena_for(0);

    let y = arena.alloc(256).cast::<u64>();
    // SAFETY: freshly allocated NVM word.
    unsafe {
        y.write(7);
        log.start();
        log.redo_write8b(y, 99);
        assert_eq!(y.read(), 7, "redo writes are buffered until commit");
        log.commit(arena);
        assert_eq!(y.read(), 99);
    }

    // The record stream shows the redo record strictly before COMMIT, which
    // is the order a recovery replay depends on.
    assert_eq!(log.scan_since_tx(), vec![RecTag::Redo8B, RecTag::Commit]);
}

#[test]
fn deferred_deletions_free_into_the_arena_at_commit() {
    let nvm = nvm_pool(1);
    let logs = NvmLogSet::init(&nvm);
    set_worker_id(0);
    // SAFETY: single-threaded test.
    let log = unsafe { logs.local() };
    let arena = nvm.arena_for(0);

    log.start();
    let node = log.alloc_node(256, arena);
    log.del_node(node);
    assert_eq!(arena.free_node_count(), 0, "free must wait for commit");
    log.commit(arena);
    assert_eq!(arena.free_node_count(), 1);

    let tags = log.scan_since_tx();
    assert_eq!(tags, vec![RecTag::AllocNode, RecTag::DelNode, RecTag::Commit]);
}

#[test]
fn forward_read_and_skip_agree_with_reverse_read() {
    let nvm = nvm_pool(1);
    set_worker_id(0);
    let mut log = LogBuffer::init(nvm.arena_for(0));

    let pos0 = log.cur_pos();
    let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    log.write(&payload);
    log.flush();

    // Forward: read == skip, byte for byte.
    let mut r1 = pos0;
    let mut r2 = pos0;
    log.prepare_for_read(&mut r1);
    let mut buf = vec![0u8; payload.len()];
    assert_eq!(log.read(&mut r1, &mut buf), payload.len());
    assert_eq!(buf, payload);
    assert_eq!(log.skip(&mut r2, payload.len()), payload.len());
    assert_eq!(r1, r2);

    // Backward from the end: the same bytes come back in forward order.
    let mut rev = log.cur_pos();
    log.prepare_for_reverse_read(&mut rev);
    let mut tail = vec![0u8; payload.len()];
    assert_eq!(log.read_reverse(&mut rev, &mut tail), payload.len());
    assert_eq!(tail, payload);
}
