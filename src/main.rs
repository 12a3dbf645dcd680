//! CLI driver.
//!
//! Executes a sequence of command tokens left to right:
//!
//! ```bash
//! nvtree thread 4 mempool 256 nvmpool /mnt/pmem/pool 512 \
//!        bulkload 1000000 keys.bin 0.7 check_tree \
//!        lookup 1000000 keys.bin
//! ```
//!
//! `thread` must come first, then `mempool`/`nvmpool`; everything after
//! operates on the tree created by `nvmpool`. Run without arguments for the
//! full command list. Fatal errors exit with status 1.

#![allow(clippy::too_many_lines)]

use std::path::Path;
use std::process::exit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use nvtree::key::Key;
use nvtree::keyinput::{FileKeys, KeyInput, RandomKeys, StepKeys, read_keys};
use nvtree::mempool::MB;
use nvtree::nvmpool::NVM_META_SIZE;
use nvtree::{MemPoolSet, NvTree, NvmLogSet, NvmPoolSet, set_worker_id};

fn usage(cmd: &str) -> ! {
    eprintln!(
        "Usage: {cmd} [<command> <params>] ...\n\
         --------------------------------------------------\n\
         [Initialization]\n \
         thread must be the first command, followed by mempool and nvmpool.\n\n\
         \x20  thread  <worker_thread_num>\n\
         \x20  mempool <size(MB)>\n\
         \x20  nvmpool <filename> <size(MB)>\n\
         --------------------------------------------------\n\
         [Debugging]\n \
         use these commands to test the correctness of the implementation\n\n\
         \x20  debug_bulkload <key_num> <fill_factor>\n\
         \x20  debug_randomize <key_num> <fill_factor>\n\
         \x20  debug_lookup <key_num> <fill_factor>\n\
         \x20  debug_insert <key_num>\n\
         \x20  debug_del <key_num>\n\
         \x20  debug_log\n\
         --------------------------------------------------\n\
         [Test Preparation]\n \
         prepare a tree before performance tests\n\n\
         \x20  bulkload <key_num> <key_file> <fill_factor>\n\
         \x20  randomize\n\
         \x20  stable <key_num> <key_file>\n\
         --------------------------------------------------\n\
         [Performance Tests]\n \
         measure performance of various tree operations\n\n\
         \x20  lookup <key_num> <key_file>\n\
         \x20  insert <key_num> <key_file>\n\
         \x20  del <key_num> <key_file>\n\
         --------------------------------------------------\n\
         [Misc]\n \
         helper commands. debug_test enables correctness check for performance tests.\n\n\
         \x20  print_tree\n\
         \x20  check_tree\n\
         \x20  print_mem\n\
         \x20  debug_test\n\
         \x20  sleep <seconds>\n\
         --------------------------------------------------"
    );
    exit(1);
}

// ============================================================================
//  CLI state
// ============================================================================

#[derive(Default)]
struct Cli {
    worker_thread_num: usize,
    debug_test: bool,
    mem: Option<Arc<MemPoolSet>>,
    nvm: Option<Arc<NvmPoolSet>>,
    logs: Option<NvmLogSet>,
    tree: Option<NvTree>,
}

impl Cli {
    fn tree(&self) -> &NvTree {
        self.tree.as_ref().unwrap_or_else(|| {
            eprintln!("need to initialize nvmpool first!");
            exit(1);
        })
    }

    fn threads(&self) -> usize {
        if self.worker_thread_num == 0 {
            eprintln!("need to set worker_thread_num first!");
            exit(1);
        }
        self.worker_thread_num
    }
}

// ============================================================================
//  Workload runners
// ============================================================================

/// Touch a buffer larger than the last-level cache so timed runs start cold.
fn clear_cache() {
    const N: usize = 64 * MB / 8;
    let mut buf = vec![1i64; N];
    let mut sum = 0i64;
    for v in &mut buf {
        *v = v.wrapping_add(1);
        sum = sum.wrapping_add(*v);
    }
    std::hint::black_box(sum);
}

fn partition(total: usize, threads: usize, t: usize) -> (usize, usize) {
    let range = total / threads;
    let start = range * t;
    let end = if t < threads - 1 { start + range } else { total };
    (start, end)
}

fn lookup_run(tree: &NvTree, keys: &[Key], start: usize, end: usize, verify: bool) -> usize {
    let mut found = 0;
    for &kk in &keys[start..end] {
        let (leaf, pos) = tree.lookup(kk);
        if verify {
            if let Some(pos) = pos {
                // SAFETY: (leaf, pos) came from this lookup.
                let rec = unsafe { tree.get_recptr(leaf, pos) };
                assert_eq!(rec, kk as u64, "payload mismatch for key {kk}");
                found += 1;
            }
        }
    }
    found
}

fn insert_run(tree: &NvTree, keys: &[Key], start: usize, end: usize, verify: bool) -> usize {
    for &kk in &keys[start..end] {
        tree.insert(kk, kk as u64);
    }
    if verify {
        keys[start..end]
            .iter()
            .filter(|&&kk| tree.lookup(kk).1.is_some())
            .count()
    } else {
        0
    }
}

fn del_run(tree: &NvTree, keys: &[Key], start: usize, end: usize, verify: bool) -> usize {
    for &kk in &keys[start..end] {
        tree.del(kk);
    }
    if verify {
        keys[start..end]
            .iter()
            .filter(|&&kk| tree.lookup(kk).1.is_some())
            .count()
    } else {
        0
    }
}

/// Run `op` over `keys` split across the worker threads, returning the
/// verification count. Prints the elapsed wall time.
fn timed_run(
    cli: &Cli,
    keys: &[Key],
    op: fn(&NvTree, &[Key], usize, usize, bool) -> usize,
) -> usize {
    let tree = cli.tree();
    let threads = cli.threads();
    let verify = cli.debug_test;
    let found = AtomicUsize::new(0);

    clear_cache();
    nvtree::flush::stat_reset();

    let start_t = Instant::now();
    if threads > 1 {
        std::thread::scope(|s| {
            for t in 0..threads {
                let found = &found;
                s.spawn(move || {
                    set_worker_id(t);
                    let (start, end) = partition(keys.len(), threads, t);
                    let n = op(tree, keys, start, end, verify);
                    if verify {
                        found.fetch_add(n, Ordering::Relaxed);
                    }
                });
            }
        });
    } else {
        found.store(op(tree, keys, 0, keys.len(), verify), Ordering::Relaxed);
    }
    println!("elapsed time:{} us", start_t.elapsed().as_micros());

    let (flushes, fences) = nvtree::flush::stat_counts();
    if cfg!(feature = "flush-stat") {
        println!("num_flush={flushes}, num_fence={fences}");
    }

    found.load(Ordering::Relaxed)
}

fn parallel_insert_range(cli: &Cli, input: &dyn KeyInput, lo: usize, hi: usize) {
    let tree = cli.tree();
    let threads = cli.threads();
    std::thread::scope(|s| {
        for t in 0..threads {
            s.spawn(move || {
                set_worker_id(t);
                let (start, end) = partition(hi - lo, threads, t);
                let (start, end) = (lo + start, lo + end);
                let mut cursor = input.open_cursor(start as i64, (end - start) as i64);
                for ii in start..end {
                    let kk = cursor.key_at(ii as i64);
                    tree.insert(kk, kk as u64);
                }
            });
        }
    });
}

// ============================================================================
//  Argument helpers
// ============================================================================

fn parse<T: std::str::FromStr>(args: &[String], i: usize, what: &str) -> T {
    args.get(i)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| {
            eprintln!("bad or missing {what}");
            exit(1);
        })
}

fn open_file_keys(path: &str, num: usize) -> FileKeys {
    FileKeys::new(Path::new(path), num as u64).unwrap_or_else(|e| {
        eprintln!("{e}");
        exit(1);
    })
}

// ============================================================================
//  main
// ============================================================================

fn main() {
    #[cfg(feature = "tracing")]
    {
        use tracing_subscriber::EnvFilter;
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    }

    let argv: Vec<String> = std::env::args().collect();
    let cmd = argv[0].clone();
    if argv.len() < 2 {
        usage(&cmd);
    }

    let mut cli = Cli::default();
    let args = &argv[1..];
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            // ================================================================
            // Initialization
            // ================================================================
            "thread" => {
                cli.worker_thread_num = parse(args, i + 1, "worker thread count");
                set_worker_id(0); // the main thread uses worker 0's pools
                println!("number of worker threads is {}", cli.worker_thread_num);
                i += 2;
            }

            "mempool" => {
                let size_mb: usize = parse(args, i + 1, "mempool size");
                let threads = cli.threads();
                cli.mem = Some(Arc::new(MemPoolSet::init(threads, size_mb * MB, 4096)));
                i += 2;
            }

            "nvmpool" => {
                let file = args.get(i + 1).unwrap_or_else(|| usage(&cmd)).clone();
                let size_mb: usize = parse(args, i + 2, "nvmpool size");
                let threads = cli.threads();

                let nvm = match NvmPoolSet::init(threads, Some(Path::new(&file)), size_mb * MB) {
                    Ok(p) => Arc::new(p),
                    Err(e) => {
                        eprintln!("{e}");
                        exit(1);
                    }
                };
                println!("NVM mapping address: {:p}, size: {}", nvm.base(), nvm.size());

                // The tree metadata page comes first in worker 0's segment.
                let meta_page = nvm.arena_for(0).alloc(NVM_META_SIZE);
                let mem = cli.mem.clone().unwrap_or_else(|| {
                    eprintln!("need to initialize mempool first!");
                    exit(1);
                });
                cli.tree = Some(NvTree::new(meta_page, mem, Arc::clone(&nvm), false));
                cli.logs = Some(NvmLogSet::init(&nvm));
                cli.nvm = Some(nvm);
                i += 3;
            }

            // ================================================================
            // Misc
            // ================================================================
            "print_tree" => {
                cli.tree().print();
                i += 1;
            }

            "check_tree" => {
                cli.tree().check();
                println!("Check tree structure OK");
                i += 1;
            }

            "print_mem" => {
                if let Some(mem) = &cli.mem {
                    mem.print_usage();
                }
                if let Some(nvm) = &cli.nvm {
                    nvm.print_usage();
                }
                i += 1;
            }

            "debug_test" => {
                cli.debug_test = true;
                i += 1;
            }

            "sleep" => {
                let seconds: u64 = parse(args, i + 1, "sleep seconds");
                println!("sleep {seconds} seconds");
                std::thread::sleep(std::time::Duration::from_secs(seconds));
                i += 2;
            }

            // ================================================================
            // Test preparation
            // ================================================================
            "bulkload" => {
                let keynum: usize = parse(args, i + 1, "key count");
                let keyfile = args.get(i + 2).unwrap_or_else(|| usage(&cmd));
                let bfill: f32 = parse(args, i + 3, "fill factor");
                println!("-- bulkload {keynum} {keyfile} {bfill}");

                let input = open_file_keys(keyfile, keynum);
                let level = cli.tree().bulkload(keynum, &input, bfill);
                println!("root is at {level} level");
                cli.tree().check();
                i += 4;
            }

            "randomize" => {
                println!("-- randomize");
                cli.tree().randomize();
                cli.tree().check();
                i += 1;
            }

            "stable" => {
                let keynum: usize = parse(args, i + 1, "key count");
                let keyfile = args.get(i + 2).unwrap_or_else(|| usage(&cmd));
                println!("-- stable {keynum} {keyfile}");

                // The key file is prepared for this: the first tenth is
                // sorted, the rest is random.
                let input = open_file_keys(keyfile, keynum);
                let bulkload_num = keynum / 10;
                let level = cli.tree().bulkload(bulkload_num, &input, 1.0);
                println!("After bulkloading {bulkload_num} keys, level is {level}");

                parallel_insert_range(&cli, &input, bulkload_num, keynum);
                cli.tree().check();
                println!("root is at {} level", cli.tree().level());
                i += 3;
            }

            // ================================================================
            // Performance tests
            // ================================================================
            "lookup" => {
                let keynum: usize = parse(args, i + 1, "key count");
                let keyfile = args.get(i + 2).unwrap_or_else(|| usage(&cmd));
                println!("-- lookup {keynum} {keyfile}");

                let keys = read_keys(Path::new(keyfile), keynum).unwrap_or_else(|e| {
                    eprintln!("{e}");
                    exit(1);
                });
                let found = timed_run(&cli, &keys, lookup_run);
                if cli.debug_test {
                    println!("lookup is good!");
                    println!("found {found} keys");
                }
                i += 3;
            }

            "insert" => {
                let keynum: usize = parse(args, i + 1, "key count");
                let keyfile = args.get(i + 2).unwrap_or_else(|| usage(&cmd));
                println!("-- insert {keynum} {keyfile}");

                let keys = read_keys(Path::new(keyfile), keynum).unwrap_or_else(|e| {
                    eprintln!("{e}");
                    exit(1);
                });
                let found = timed_run(&cli, &keys, insert_run);
                if cli.debug_test {
                    println!("Insert {found} keys / {keynum} keys");
                    cli.tree().check();
                    if found == keynum {
                        println!("Insertion is good!");
                    } else {
                        println!("{} keys are not successfully inserted!", keynum - found);
                    }
                }
                i += 3;
            }

            "del" => {
                let keynum: usize = parse(args, i + 1, "key count");
                let keyfile = args.get(i + 2).unwrap_or_else(|| usage(&cmd));
                println!("-- del {keynum} {keyfile}");

                let keys = read_keys(Path::new(keyfile), keynum).unwrap_or_else(|e| {
                    eprintln!("{e}");
                    exit(1);
                });
                let found = timed_run(&cli, &keys, del_run);
                if cli.debug_test {
                    cli.tree().check();
                    if found == 0 {
                        println!("Deletion is good!");
                    } else {
                        println!("{found} keys are not successfully deleted!");
                    }
                }
                i += 3;
            }

            // ================================================================
            // Debugging
            // ================================================================
            "debug_bulkload" => {
                let keynum: usize = parse(args, i + 1, "key count");
                let bfill: f32 = parse(args, i + 2, "fill factor");

                let input = StepKeys::new(0, 2);
                let level = cli.tree().bulkload(keynum, &input, bfill);
                println!("root is at {level} level");

                let (start, end) = cli.tree().check();
                assert_eq!(start, 0);
                assert_eq!(end, 2 * (keynum as Key - 1));
                println!("bulkload is good!");
                i += 3;
            }

            "debug_randomize" => {
                let keynum: usize = parse(args, i + 1, "key count");
                let bfill: f32 = parse(args, i + 2, "fill factor");

                let input = StepKeys::new(0, 2);
                let level = cli.tree().bulkload(keynum, &input, bfill);
                println!("root is at {level} level");
                cli.tree().randomize(); // randomize a sorted tree
                cli.tree().randomize(); // randomize an already random tree

                let (start, end) = cli.tree().check();
                assert_eq!(start, 0);
                assert_eq!(end, 2 * (keynum as Key - 1));
                println!("randomize is good!");
                i += 3;
            }

            "debug_lookup" => {
                let keynum: usize = parse(args, i + 1, "key count");
                let bfill: f32 = parse(args, i + 2, "fill factor");

                // Bulk-load the odd positions of a sorted random key set;
                // the even positions must then miss.
                let input = RandomKeys::new(2 * keynum, 1, 2, 20_250_802);
                cli.tree().bulkload(keynum, &input, bfill);
                cli.tree().randomize();
                cli.tree().check();

                let tree = cli.tree();
                for ii in 0..keynum {
                    let absent = input.keys[2 * ii];
                    assert!(tree.lookup(absent).1.is_none(), "key {absent} must miss");

                    let present = input.keys[2 * ii + 1];
                    let (leaf, pos) = tree.lookup(present);
                    let pos = pos.unwrap_or_else(|| panic!("key {present} must hit"));
                    // SAFETY: (leaf, pos) came from this lookup.
                    assert_eq!(unsafe { tree.get_recptr(leaf, pos) }, present as u64);
                }
                println!("lookup is good!");
                i += 2;
            }

            "debug_insert" => {
                let keynum: usize = parse(args, i + 1, "key count");

                // Bulk-load the even positions, insert the odd positions in
                // parallel, then insert them again (idempotence).
                let input = RandomKeys::new(2 * keynum, 0, 2, 20_250_802);
                cli.tree().bulkload(keynum, &input, 1.0);
                cli.tree().randomize();

                let odd = input.view(1, 2);
                parallel_insert_range(&cli, &odd, 0, keynum);
                cli.tree().check();

                parallel_insert_range(&cli, &odd, 0, keynum); // duplicates: no-ops
                cli.tree().check();

                let tree = cli.tree();
                for &kk in input.keys.iter().take(2 * keynum) {
                    let (leaf, pos) = tree.lookup(kk);
                    let pos = pos.unwrap_or_else(|| panic!("key {kk} must hit"));
                    // SAFETY: (leaf, pos) came from this lookup.
                    assert_eq!(unsafe { tree.get_recptr(leaf, pos) }, kk as u64);
                }
                println!("insert is good!");
                i += 2;
            }

            "debug_del" => {
                let keynum: usize = parse(args, i + 1, "key count");

                let input = RandomKeys::new(2 * keynum, 0, 1, 20_250_802);
                cli.tree().bulkload(2 * keynum, &input, 1.0);
                cli.tree().randomize();

                let evens: Vec<Key> = (0..keynum).map(|ii| input.keys[2 * ii]).collect();
                let threads = cli.threads();
                let tree = cli.tree();
                for _pass in 0..2 {
                    // Second pass deletes already-deleted keys: no-ops.
                    std::thread::scope(|s| {
                        for t in 0..threads {
                            let evens = &evens;
                            s.spawn(move || {
                                set_worker_id(t);
                                let (start, end) = partition(evens.len(), threads, t);
                                for &kk in &evens[start..end] {
                                    tree.del(kk);
                                }
                            });
                        }
                    });
                    cli.tree().check();
                }

                for ii in 0..keynum {
                    assert!(tree.lookup(input.keys[2 * ii]).1.is_none());
                    assert!(tree.lookup(input.keys[2 * ii + 1]).1.is_some());
                }
                println!("del is good!");
                i += 2;
            }

            "debug_log" => {
                let nvm = cli.nvm.as_ref().unwrap_or_else(|| {
                    eprintln!("need to initialize nvmpool first!");
                    exit(1);
                });
                let logs = cli.logs.as_ref().unwrap();
                set_worker_id(0);
                // SAFETY: the main thread is the only worker-0 user here.
                let log = unsafe { logs.local() };
                let arena = nvm.arena_for(0);

                // A leaf-sized allocation keeps later leaf allocations from
                // this arena 256-byte aligned.
                let x = arena.alloc(256).cast::<u64>();
                // SAFETY: freshly allocated NVM word.
                unsafe {
                    x.write(11);

                    log.start();
                    log.write8b(x, 22);
                    log.abort(arena);
                    assert_eq!(x.read(), 11, "abort must restore the old value");

                    log.start();
                    log.redo_write8b(x, 33);
                    log.commit(arena);
                    assert_eq!(x.read(), 33, "commit must apply the redo value");
                }
                log.print();
                println!("log is good!");
                i += 1;
            }

            other => {
                eprintln!("Unknown command: {other}");
                usage(&cmd);
            }
        }
    }
}
