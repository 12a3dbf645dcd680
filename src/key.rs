//! Key type and fingerprint hash.
//!
//! Keys are signed 64-bit integers. The two endpoints of the key space are
//! reserved as sentinels: [`MIN_KEY`] and [`MAX_KEY`] bound every key range
//! during structural checks and must not be inserted.
//!
//! The one-byte fingerprint is an XOR-fold of the key. Leaves store one
//! fingerprint per slot so that a lookup can compare 14 candidate bytes with
//! a single SIMD instruction before touching any full key.

/// Index key: a signed 64-bit integer.
pub type Key = i64;

/// Size of a key in bytes.
pub const KEY_SIZE: usize = 8;

/// Size of a payload pointer in bytes.
pub const POINTER_SIZE: usize = 8;

/// Smallest representable key, reserved as a sentinel.
pub const MIN_KEY: Key = i64::MIN;

/// Largest representable key, reserved as a sentinel.
pub const MAX_KEY: Key = i64::MAX;

/// Compute the one-byte fingerprint of a key.
///
/// XOR-folds the key down to a single byte:
/// `x ^= x >> 32; x ^= x >> 16; x ^= x >> 8; x & 0xff`.
///
/// Two equal keys always have equal fingerprints, so a fingerprint mismatch
/// proves a slot cannot hold the search key. A match still requires a full
/// key compare.
#[inline]
#[must_use]
pub fn fingerprint(key: Key) -> u8 {
    let mut x = key as u64;
    x ^= x >> 32;
    x ^= x >> 16;
    x ^= x >> 8;
    (x & 0xff) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        for k in [0, 1, -1, 42, MIN_KEY + 1, MAX_KEY - 1] {
            assert_eq!(fingerprint(k), fingerprint(k));
        }
    }

    #[test]
    fn fingerprint_folds_high_bits() {
        assert_ne!(fingerprint(1), fingerprint(1 << 32));
        assert_ne!(fingerprint(1), fingerprint(1 << 16));
    }

    #[test]
    fn fingerprint_matches_fold_definition() {
        let k: Key = 0x0102_0304_0506_0708;
        let mut x = k as u64;
        x ^= x >> 32;
        x ^= x >> 16;
        x ^= x >> 8;
        assert_eq!(fingerprint(k), (x & 0xff) as u8);
    }
}
