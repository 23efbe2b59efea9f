//! Fixed-algorithm hashing for ids that must agree across builds.
//!
//! Stable element ids, screen signatures, fingerprints and promotion digests
//! all go through [`StableHasher`] (xxh3, little-endian integers,
//! length-prefixed strings), so the same input hashes to the same value in
//! every process and on every toolchain.

use xxhash_rust::xxh3::Xxh3;

pub struct StableHasher {
    inner: Xxh3,
}

impl Default for StableHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl StableHasher {
    pub fn new() -> Self {
        Self { inner: Xxh3::new() }
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.inner.update(&value.to_le_bytes());
        self
    }

    /// Length-prefixed, so `("ab", "c")` and `("a", "bc")` differ.
    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.write_u64(value.len() as u64);
        self.inner.update(value.as_bytes());
        self
    }

    pub fn write_opt_str(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(v) => self.write_u64(1).write_str(v),
            None => self.write_u64(0),
        }
    }

    pub fn finish(&self) -> u64 {
        self.inner.digest()
    }
}
