//! Content hashing for change detection and memoization.
//!
//! Every hash in the engine (call bodies, definition bodies, mix hashes,
//! expansion output) is a [`ContentHash`] computed with `FxHasher`. The hasher
//! has no per-process seed, so hashes are stable across runs and can be
//! persisted in the expansion index.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

/// A 64-bit content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct ContentHash(u64);

impl ContentHash {
    /// Create a content hash from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the underlying hash value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Format as a fixed-width hex string.
    #[must_use]
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        u64::from_str_radix(s, 16).ok().map(Self)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Hash raw bytes.
///
/// Used for expansion output, where byte identity is what matters.
#[must_use]
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    let mut hasher = FxHasher::default();
    data.hash(&mut hasher);
    ContentHash(hasher.finish())
}

/// Hash a string.
#[must_use]
pub fn hash_str(s: &str) -> ContentHash {
    let mut hasher = FxHasher::default();
    s.hash(&mut hasher);
    ContentHash(hasher.finish())
}

/// Combine multiple hashes into one. Order matters.
#[must_use]
pub fn combine_hashes(hash_list: &[ContentHash]) -> ContentHash {
    let mut state = FxHasher::default();
    hash_list.len().hash(&mut state);
    for hash in hash_list {
        hash.0.hash(&mut state);
    }
    ContentHash(state.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_str("foo!(1, 2)"), hash_str("foo!(1, 2)"));
        assert_eq!(hash_bytes(b"abc"), hash_bytes(b"abc"));
    }

    #[test]
    fn different_content_different_hash() {
        assert_ne!(hash_str("foo!(1)"), hash_str("foo!(2)"));
    }

    #[test]
    fn combine_is_order_sensitive() {
        let a = hash_str("a");
        let b = hash_str("b");
        assert_ne!(combine_hashes(&[a, b]), combine_hashes(&[b, a]));
    }

    #[test]
    fn hex_roundtrip() {
        let h = hash_str("macro");
        assert_eq!(ContentHash::from_hex(&h.to_hex()), Some(h));
        assert_eq!(h.to_string().len(), 16);
    }

    proptest! {
        #[test]
        fn hex_roundtrip_any(value in any::<u64>()) {
            let h = ContentHash::new(value);
            prop_assert_eq!(ContentHash::from_hex(&h.to_hex()), Some(h));
        }

        #[test]
        fn combine_depends_only_on_content(values in proptest::collection::vec(any::<u64>(), 0..8)) {
            let first: Vec<_> = values.iter().copied().map(ContentHash::new).collect();
            let second: Vec<_> = values.iter().copied().map(ContentHash::new).collect();
            prop_assert_eq!(combine_hashes(&first), combine_hashes(&second));
        }
    }
}
