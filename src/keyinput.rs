//! Key sources for bulk-loading and workloads.
//!
//! A [`KeyInput`] hands out per-thread [`KeyCursor`]s so parallel
//! bulk-loading can read disjoint ranges concurrently. Cursors are accessed
//! with non-descending indices.
//!
//! Three sources:
//!
//! - [`StepKeys`]: generated arithmetic sequence (debug commands)
//! - [`RandomKeys`]: sorted random keys with duplicates squashed
//! - [`FileKeys`]: a file of little-endian signed 64-bit keys, no header

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::key::Key;

/// Errors raised while opening a key file.
#[derive(Debug, Error)]
pub enum KeyFileError {
    #[error("cannot open key file {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("key file {path} holds {have} keys, need {need}")]
    TooShort { path: String, have: u64, need: u64 },
}

/// A positioned reader of keys. Indices must be non-descending.
pub trait KeyCursor: Send {
    /// The key at absolute index `index`.
    fn key_at(&mut self, index: i64) -> Key;
}

/// A source of keys that can open per-thread cursors over sub-ranges.
pub trait KeyInput: Sync {
    /// Open a cursor whose first key is at absolute index `start`.
    fn open_cursor(&self, start: i64, num: i64) -> Box<dyn KeyCursor + '_>;
}

// ============================================================================
//  StepKeys
// ============================================================================

/// Generated keys `start + step * index`.
#[derive(Clone, Copy, Debug)]
pub struct StepKeys {
    start: Key,
    step: Key,
}

impl StepKeys {
    #[must_use]
    pub fn new(start: Key, step: Key) -> Self {
        Self { start, step }
    }
}

impl KeyCursor for StepKeys {
    fn key_at(&mut self, index: i64) -> Key {
        self.start + self.step * index
    }
}

impl KeyInput for StepKeys {
    fn open_cursor(&self, _start: i64, _num: i64) -> Box<dyn KeyCursor + '_> {
        Box::new(*self)
    }
}

// ============================================================================
//  RandomKeys
// ============================================================================

/// Sorted random positive keys, regenerated until free of duplicates.
///
/// `key_at(i)` returns `keys[start + step * i]`, so a `step` of 2 lets a
/// test bulk-load the odd positions and later insert the even ones.
pub struct RandomKeys {
    pub keys: Vec<Key>,
    start: i64,
    step: i64,
}

impl RandomKeys {
    /// Generate `num` sorted duplicate-free keys.
    #[must_use]
    pub fn new(num: usize, start: i64, step: i64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut keys: Vec<Key> = (0..num).map(|_| rng.gen_range(1..Key::MAX)).collect();
        loop {
            keys.sort_unstable();
            let mut dups = 0;
            for i in 0..keys.len().saturating_sub(1) {
                if keys[i] == keys[i + 1] {
                    keys[i] = rng.gen_range(1..Key::MAX);
                    dups += 1;
                }
            }
            if dups == 0 {
                break;
            }
        }
        Self { keys, start, step }
    }
}

impl RandomKeys {
    /// A view over the same keys with a different start and stride, so a
    /// test can bulk-load one interleaving and insert the other.
    #[must_use]
    pub fn view(&self, start: i64, step: i64) -> RandomKeysView<'_> {
        RandomKeysView {
            keys: &self.keys,
            start,
            step,
        }
    }
}

/// A `(start, step)` reindexing of a [`RandomKeys`] set.
pub struct RandomKeysView<'a> {
    keys: &'a [Key],
    start: i64,
    step: i64,
}

impl KeyInput for RandomKeysView<'_> {
    fn open_cursor(&self, _start: i64, _num: i64) -> Box<dyn KeyCursor + '_> {
        Box::new(RandomKeysCursor {
            keys: self.keys,
            start: self.start,
            step: self.step,
        })
    }
}

struct RandomKeysCursor<'a> {
    keys: &'a [Key],
    start: i64,
    step: i64,
}

impl KeyCursor for RandomKeysCursor<'_> {
    fn key_at(&mut self, index: i64) -> Key {
        let ii = self.start + self.step * index;
        self.keys[ii as usize]
    }
}

impl KeyInput for RandomKeys {
    fn open_cursor(&self, _start: i64, _num: i64) -> Box<dyn KeyCursor + '_> {
        Box::new(RandomKeysCursor {
            keys: &self.keys,
            start: self.start,
            step: self.step,
        })
    }
}

// ============================================================================
//  VecKeys
// ============================================================================

/// An explicit in-memory key sequence (must already be sorted and free of
/// duplicates for bulk-loading).
pub struct VecKeys {
    keys: Vec<Key>,
}

impl VecKeys {
    #[must_use]
    pub fn new(keys: Vec<Key>) -> Self {
        Self { keys }
    }
}

struct VecKeysCursor<'a> {
    keys: &'a [Key],
}

impl KeyCursor for VecKeysCursor<'_> {
    fn key_at(&mut self, index: i64) -> Key {
        self.keys[index as usize]
    }
}

impl KeyInput for VecKeys {
    fn open_cursor(&self, _start: i64, _num: i64) -> Box<dyn KeyCursor + '_> {
        Box::new(VecKeysCursor { keys: &self.keys })
    }
}

// ============================================================================
//  FileKeys
// ============================================================================

/// A key file: a plain byte stream of little-endian signed 64-bit keys.
pub struct FileKeys {
    path: PathBuf,
}

impl FileKeys {
    /// Validate that `path` exists and holds at least `num` keys.
    pub fn new(path: &Path, num: u64) -> Result<Self, KeyFileError> {
        let file = File::open(path).map_err(|source| KeyFileError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let have = file
            .metadata()
            .map_err(|source| KeyFileError::Open {
                path: path.display().to_string(),
                source,
            })?
            .len()
            / 8;
        if have < num {
            return Err(KeyFileError::TooShort {
                path: path.display().to_string(),
                have,
                need: num,
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

/// Buffered sequential reader positioned at a byte offset computed from the
/// start index. Read errors are fail-stop.
struct FileKeysCursor {
    reader: BufReader<File>,
    /// Absolute index of the next key the reader will produce.
    next_index: i64,
    last: Key,
}

impl FileKeysCursor {
    fn open(path: &Path, start: i64) -> Self {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("{}: {e}", path.display());
                std::process::exit(1);
            }
        };
        if let Err(e) = file.seek(SeekFrom::Start(start as u64 * 8)) {
            eprintln!("{}: seek to key {start}: {e}", path.display());
            std::process::exit(1);
        }
        Self {
            reader: BufReader::with_capacity(1024 * 1024, file),
            next_index: start,
            last: 0,
        }
    }
}

impl KeyCursor for FileKeysCursor {
    fn key_at(&mut self, index: i64) -> Key {
        debug_assert!(index >= self.next_index - 1, "indices must be non-descending");
        while self.next_index <= index {
            let mut buf = [0u8; 8];
            if let Err(e) = self.reader.read_exact(&mut buf) {
                eprintln!("key file read: {e}");
                std::process::exit(1);
            }
            self.last = Key::from_le_bytes(buf);
            self.next_index += 1;
        }
        self.last
    }
}

impl KeyInput for FileKeys {
    fn open_cursor(&self, start: i64, _num: i64) -> Box<dyn KeyCursor + '_> {
        Box::new(FileKeysCursor::open(&self.path, start))
    }
}

/// Load `num` keys from a file into memory (for workload runs).
pub fn read_keys(path: &Path, num: usize) -> Result<Vec<Key>, KeyFileError> {
    let source = FileKeys::new(path, num as u64)?;
    let mut cursor = source.open_cursor(0, num as i64);
    Ok((0..num as i64).map(|i| cursor.key_at(i)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn step_keys_generate_arithmetic_sequence() {
        let src = StepKeys::new(5, 3);
        let mut c = src.open_cursor(0, 10);
        assert_eq!(c.key_at(0), 5);
        assert_eq!(c.key_at(4), 17);
    }

    #[test]
    fn random_keys_are_sorted_and_unique() {
        let src = RandomKeys::new(1000, 0, 1, 42);
        for w in src.keys.windows(2) {
            assert!(w[0] < w[1]);
        }
        let mut c = src.open_cursor(0, 1000);
        assert_eq!(c.key_at(7), src.keys[7]);
    }

    #[test]
    fn random_keys_step_two_interleaves() {
        let src = RandomKeys::new(20, 1, 2, 7);
        let mut c = src.open_cursor(0, 10);
        assert_eq!(c.key_at(0), src.keys[1]);
        assert_eq!(c.key_at(3), src.keys[7]);
    }

    #[test]
    fn file_keys_read_little_endian() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.bin");
        let keys: Vec<Key> = (0..100).map(|i| i * 11 - 50).collect();
        {
            let mut f = File::create(&path).unwrap();
            for k in &keys {
                f.write_all(&k.to_le_bytes()).unwrap();
            }
        }

        let src = FileKeys::new(&path, 100).unwrap();
        let mut c = src.open_cursor(0, 100);
        for (i, &k) in keys.iter().enumerate() {
            assert_eq!(c.key_at(i as i64), k);
        }

        // A cursor opened at an offset starts mid-file.
        let mut c = src.open_cursor(40, 60);
        assert_eq!(c.key_at(40), keys[40]);
        assert_eq!(c.key_at(99), keys[99]);

        assert_eq!(read_keys(&path, 100).unwrap(), keys);
    }

    #[test]
    fn short_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.bin");
        std::fs::write(&path, [0u8; 24]).unwrap();
        assert!(matches!(
            FileKeys::new(&path, 10),
            Err(KeyFileError::TooShort { have: 3, need: 10, .. })
        ));
    }
}
