//! Bloom filter for SSTable point-lookup pruning.
//!
//! Each SSTable carries a bloom filter built from every key it contains.
//! A negative answer is definitive — `may_contain(k) == false` means the
//! table holds no record for `k` and the reader skips it without any
//! file I/O. Positive answers may be false with probability `p`.
//!
//! ## Construction
//!
//! Sized from the expected element count `n` and the target
//! false-positive rate `p`:
//!
//! - bit-array size `m = ceil(-n·ln(p) / (ln 2)²)`
//! - hash count `k = round((m/n)·ln 2)`
//!
//! Hashing is classic double hashing over two 64-bit lanes taken from a
//! SHA-256 digest of the key: bit index `i` is `(h1 + i·h2) mod m`.
//!
//! ## Serialization
//!
//! Self-describing, all integers little-endian:
//!
//! ```text
//! [u8 version][u64 m][u32 k][u32 bitmap_len][bitmap bytes]
//! ```

#[cfg(test)]
mod tests;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Current serialized bloom filter version.
const BLOOM_VERSION: u8 = 1;

/// Upper bound on a deserialized bitmap (64 MiB). A corrupted length
/// field must not translate into an allocation bomb.
const MAX_BITMAP_BYTES: u32 = 64 * 1024 * 1024;

/// Errors returned when deserializing a bloom filter blob.
#[derive(Debug, Error)]
pub enum BloomError {
    /// Blob too short for the fixed header or declared bitmap.
    #[error("bloom blob truncated (need {needed} bytes, have {available})")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// Unknown serialization version byte.
    #[error("unsupported bloom version {0}")]
    UnsupportedVersion(u8),

    /// Header fields are internally inconsistent.
    #[error("invalid bloom parameters: {0}")]
    InvalidParameters(String),
}

/// A bloom filter backed by a byte bitmap with `k` derived hash probes.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    /// The bitmap; `num_bits` bits packed little-endian within bytes.
    bits: Vec<u8>,

    /// Number of addressable bits `m`.
    num_bits: u64,

    /// Number of hash probes `k`.
    num_hashes: u32,
}

impl BloomFilter {
    /// Creates a filter sized for `expected_items` at the given target
    /// false-positive rate. `expected_items == 0` is treated as 1 so an
    /// empty table still produces a valid (tiny) filter.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(f64::MIN_POSITIVE, 0.5);

        // m = ceil(-n * ln(p) / (ln 2)^2), floor of 8 bits.
        let m = ((-n * p.ln()) / std::f64::consts::LN_2.powi(2)).ceil() as u64;
        let m = m.max(8);

        // k = round((m/n) * ln 2), floor of 1.
        let k = ((m as f64 / n) * std::f64::consts::LN_2).round() as u32;
        let k = k.max(1);

        Self {
            bits: vec![0u8; m.div_ceil(8) as usize],
            num_bits: m,
            num_hashes: k,
        }
    }

    /// Inserts a key, setting all `k` probe bits.
    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = hash_lanes(key);
        for i in 0..self.num_hashes {
            let idx = self.probe_index(h1, h2, i);
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    /// Returns `false` if the key is definitely absent, `true` if it may
    /// be present.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_lanes(key);
        (0..self.num_hashes).all(|i| {
            let idx = self.probe_index(h1, h2, i);
            self.bits[(idx / 8) as usize] >> (idx % 8) & 1 == 1
        })
    }

    /// Number of addressable bits `m`.
    #[must_use]
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Number of hash probes `k`.
    #[must_use]
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Serializes to `[version][m][k][bitmap_len][bitmap]`.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 8 + 4 + 4 + self.bits.len());
        out.push(BLOOM_VERSION);
        out.extend_from_slice(&self.num_bits.to_le_bytes());
        out.extend_from_slice(&self.num_hashes.to_le_bytes());
        out.extend_from_slice(&(self.bits.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    /// Reconstructs a filter from a [`serialize`](Self::serialize) blob.
    pub fn deserialize(blob: &[u8]) -> Result<Self, BloomError> {
        const HEADER: usize = 1 + 8 + 4 + 4;
        if blob.len() < HEADER {
            return Err(BloomError::Truncated {
                needed: HEADER,
                available: blob.len(),
            });
        }

        let version = blob[0];
        if version != BLOOM_VERSION {
            return Err(BloomError::UnsupportedVersion(version));
        }

        let num_bits = u64::from_le_bytes(blob[1..9].try_into().unwrap_or_default());
        let num_hashes = u32::from_le_bytes(blob[9..13].try_into().unwrap_or_default());
        let bitmap_len = u32::from_le_bytes(blob[13..17].try_into().unwrap_or_default());

        if bitmap_len > MAX_BITMAP_BYTES {
            return Err(BloomError::InvalidParameters(format!(
                "bitmap length {bitmap_len} exceeds limit {MAX_BITMAP_BYTES}"
            )));
        }
        if num_bits == 0 || num_hashes == 0 {
            return Err(BloomError::InvalidParameters(
                "m and k must be non-zero".into(),
            ));
        }
        if u64::from(bitmap_len) * 8 < num_bits {
            return Err(BloomError::InvalidParameters(format!(
                "bitmap of {bitmap_len} bytes cannot hold {num_bits} bits"
            )));
        }

        let bitmap = &blob[HEADER..];
        if bitmap.len() != bitmap_len as usize {
            return Err(BloomError::Truncated {
                needed: HEADER + bitmap_len as usize,
                available: blob.len(),
            });
        }

        Ok(Self {
            bits: bitmap.to_vec(),
            num_bits,
            num_hashes,
        })
    }

    /// Double hashing: probe `i` addresses bit `(h1 + i·h2) mod m`.
    #[inline]
    fn probe_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add(u64::from(i).wrapping_mul(h2)) % self.num_bits
    }
}

/// Splits a SHA-256 digest of the key into two independent 64-bit lanes.
#[inline]
fn hash_lanes(key: &[u8]) -> (u64, u64) {
    let digest = Sha256::digest(key);
    let h1 = u64::from_le_bytes(digest[0..8].try_into().unwrap_or_default());
    let h2 = u64::from_le_bytes(digest[8..16].try_into().unwrap_or_default());
    // h2 must be odd-ish relative to m in the degenerate all-zero case;
    // force a non-zero stride so probes don't collapse onto one bit.
    (h1, h2 | 1)
}
