//! Sparse block index.
//!
//! The data file is a flat sequence of record frames; a "block" is the
//! logical run of records between two sampled index entries. The writer
//! records the first key and file offset of every block, so a point
//! lookup seeks to the greatest sampled key ≤ the target and linearly
//! scans at most one block before either finding the key or passing it.

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::record::Key;

/// One sampled `(first_key, offset)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// First key of the block.
    pub key: Key,

    /// Byte offset of the block's first frame in the data file.
    pub offset: u64,
}

/// Sorted list of sampled block start points.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparseIndex {
    entries: Vec<IndexEntry>,
}

impl SparseIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a block start. Keys must arrive in ascending order —
    /// the writer samples while emitting a sorted stream.
    pub fn add(&mut self, key: Key, offset: u64) {
        self.entries.push(IndexEntry { key, offset });
    }

    /// Number of sampled blocks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing has been sampled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offset of the block that may contain `key`, ignoring the table's
    /// key range: the greatest sampled key ≤ `key`, or the first block.
    pub fn seek_offset(&self, key: &[u8]) -> u64 {
        // partition_point: count of entries with first_key <= key.
        let idx = self
            .entries
            .partition_point(|e| e.key.as_slice() <= key);
        if idx == 0 {
            self.entries.first().map_or(0, |e| e.offset)
        } else {
            self.entries[idx - 1].offset
        }
    }

    /// Offset of the block holding the greatest sampled key ≤ `key`,
    /// or `None` when `key` lies outside `[min_key, max_key]`.
    pub fn find_block_offset(&self, key: &[u8], min_key: &[u8], max_key: &[u8]) -> Option<u64> {
        if key < min_key || key > max_key {
            return None;
        }
        Some(self.seek_offset(key))
    }

    /// Offset at which a scan of keys ≥ `lo` should begin: the block
    /// that could contain `lo` itself, or the data start for an open
    /// bound.
    pub fn scan_start_offset(&self, lo: Option<&[u8]>) -> u64 {
        match lo {
            None => 0,
            Some(lo) => self.seek_offset(lo),
        }
    }
}

impl Encode for SparseIndex {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_vec(&self.entries, buf)
    }
}

impl Decode for SparseIndex {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (entries, n) = encoding::decode_vec::<IndexEntry>(buf)?;
        Ok((Self { entries }, n))
    }
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.offset.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (file_offset, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                key,
                offset: file_offset,
            },
            offset,
        ))
    }
}
