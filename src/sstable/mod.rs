//! Sorted String Tables: immutable, sorted on-disk runs of records.
//!
//! Each table is a pair of files produced by flush or compaction and
//! never modified afterwards:
//!
//! - **data file** (`sst-<level>-<id>.data`) — concatenated record
//!   frames in ascending key order, closed by a sentinel frame.
//! - **meta file** (`sst-<level>-<id>.meta`) — the resident sidecar:
//!   bloom filter, sparse index, and footer, each length-prefixed,
//!   protected by a trailing CRC32.
//!
//! # Data frame layout (bit-exact, little-endian)
//!
//! ```text
//! [u64 key_len][key bytes]
//! [u64 value_len][value bytes]     value_len = 0 for tombstones
//! [u64 timestamp]
//! [u8  op]                         0 = PUT, 1 = DELETE
//! ```
//!
//! The stream ends with a sentinel `key_len = 0xFFFF_FFFF_FFFF_FFFF`.
//!
//! # Meta file layout
//!
//! ```text
//! [4B magic "SSTM"][u32 format_version]
//! [u32 len][bloom blob]
//! [u32 len][sparse index]
//! [u32 len][footer]
//! [u32 crc32]                      over everything above
//! ```
//!
//! # Sub-modules
//!
//! - [`index`] — sparse block index.
//! - [`writer`] — [`SSTableWriter`] and the run-splitting
//!   [`write_sorted_run`].
//! - [`reader`] — [`SSTableReader`] over a memory-mapped data file.

pub mod index;
pub mod reader;
pub mod writer;

#[cfg(test)]
mod tests;

pub use reader::SSTableReader;
pub use writer::{SSTableWriter, TableOptions, write_sorted_run};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use thiserror::Error;

use crate::bloom::{BloomError, BloomFilter};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::record::{Key, Timestamp};
use index::SparseIndex;

/// Meta sidecar magic bytes.
pub(crate) const META_MAGIC: [u8; 4] = *b"SSTM";

/// Current on-disk format version, stamped in the meta header and the
/// footer.
pub const FORMAT_VERSION: u32 = 1;

/// Sentinel `key_len` marking the end of the data stream.
pub(crate) const SENTINEL_KEY_LEN: u64 = u64::MAX;

/// Sample an index entry at the first record of every block of this
/// many records.
pub(crate) const INDEX_SAMPLE_EVERY: usize = 16;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable build and read operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Meta sidecar encoding/decoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Bloom filter blob failure.
    #[error("bloom error: {0}")]
    Bloom(#[from] BloomError),

    /// Writer received keys out of order.
    #[error("out-of-order key: {0:?} after {1:?}")]
    OutOfOrder(Key, Key),

    /// Data or meta file contents violate the format.
    #[error("format error in {path}: {detail}")]
    Format {
        /// Offending file.
        path: PathBuf,
        /// What failed.
        detail: String,
    },
}

// ------------------------------------------------------------------------------------------------
// Descriptor
// ------------------------------------------------------------------------------------------------

/// Descriptor for one SSTable, as registered in the catalog.
///
/// Carries everything the read path needs for pruning without touching
/// the table's files: the key range, timestamp range, and sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SSTableMeta {
    /// Monotonically-assigned table identity.
    pub id: u64,

    /// Level this table belongs to.
    pub level: u32,

    /// Path of the data file.
    pub data_path: PathBuf,

    /// Path of the meta sidecar.
    pub meta_path: PathBuf,

    /// Smallest key in the table.
    pub min_key: Key,

    /// Largest key in the table.
    pub max_key: Key,

    /// Number of records, tombstones included.
    pub count: u64,

    /// Data file size in bytes, sentinel included.
    pub data_size: u64,

    /// Smallest timestamp in the table.
    pub ts_min: Timestamp,

    /// Largest timestamp in the table.
    pub ts_max: Timestamp,
}

impl SSTableMeta {
    /// Returns `true` if `key` falls within this table's key range.
    pub fn key_in_range(&self, key: &[u8]) -> bool {
        key >= self.min_key.as_slice() && key <= self.max_key.as_slice()
    }

    /// Returns `true` if the table's key range intersects `[lo, hi)`
    /// with `None` meaning open.
    pub fn overlaps_range(&self, lo: Option<&[u8]>, hi: Option<&[u8]>) -> bool {
        let above_lo = lo.is_none_or(|lo| self.max_key.as_slice() >= lo);
        let below_hi = hi.is_none_or(|hi| self.min_key.as_slice() < hi);
        above_lo && below_hi
    }
}

impl Encode for SSTableMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        u64::from(self.level).encode_to(buf)?;
        self.data_path.encode_to(buf)?;
        self.meta_path.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        self.count.encode_to(buf)?;
        self.data_size.encode_to(buf)?;
        self.ts_min.encode_to(buf)?;
        self.ts_max.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SSTableMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (level, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (data_path, n) = PathBuf::decode_from(&buf[offset..])?;
        offset += n;
        let (meta_path, n) = PathBuf::decode_from(&buf[offset..])?;
        offset += n;
        let (min_key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (max_key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (data_size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (ts_min, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (ts_max, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                id,
                level: level as u32,
                data_path,
                meta_path,
                min_key,
                max_key,
                count,
                data_size,
                ts_min,
                ts_max,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Footer
// ------------------------------------------------------------------------------------------------

/// Table-level statistics stored at the end of the meta sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Footer {
    pub(crate) min_key: Key,
    pub(crate) max_key: Key,
    pub(crate) ts_min: Timestamp,
    pub(crate) ts_max: Timestamp,
    pub(crate) count: u64,
    pub(crate) data_size: u64,
    pub(crate) format_version: u32,
}

impl Encode for Footer {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        self.ts_min.encode_to(buf)?;
        self.ts_max.encode_to(buf)?;
        self.count.encode_to(buf)?;
        self.data_size.encode_to(buf)?;
        self.format_version.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for Footer {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (min_key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (max_key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (ts_min, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (ts_max, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (data_size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (format_version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                min_key,
                max_key,
                ts_min,
                ts_max,
                count,
                data_size,
                format_version,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// Data file name for a table at `level` with identity `id`.
pub(crate) fn data_file_name(level: u32, id: u64) -> String {
    format!("sst-{level}-{id}.data")
}

/// Meta sidecar name for a table at `level` with identity `id`.
pub(crate) fn meta_file_name(level: u32, id: u64) -> String {
    format!("sst-{level}-{id}.meta")
}

// ------------------------------------------------------------------------------------------------
// Meta sidecar I/O
// ------------------------------------------------------------------------------------------------

/// Serializes the meta sidecar body (magic through footer section) and
/// appends the trailing CRC32.
pub(crate) fn encode_meta_file(
    bloom: &BloomFilter,
    index: &SparseIndex,
    footer: &Footer,
) -> Result<Vec<u8>, SSTableError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&META_MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());

    for section in [
        bloom.serialize(),
        encoding::encode_to_vec(index)?,
        encoding::encode_to_vec(footer)?,
    ] {
        buf.extend_from_slice(&(section.len() as u32).to_le_bytes());
        buf.extend_from_slice(&section);
    }

    let mut hasher = Crc32::new();
    hasher.update(&buf);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    Ok(buf)
}

/// Reads and validates a meta sidecar, returning its three sections.
pub(crate) fn read_meta_file(
    path: &Path,
) -> Result<(BloomFilter, SparseIndex, Footer), SSTableError> {
    let bytes = fs::read(path)?;
    let format = |detail: &str| SSTableError::Format {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    };

    if bytes.len() < 4 + 4 + 4 {
        return Err(format("file too short"));
    }

    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let mut hasher = Crc32::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(format("checksum mismatch"));
    }

    if body[0..4] != META_MAGIC {
        return Err(format("bad magic"));
    }
    let version = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    if version != FORMAT_VERSION {
        return Err(format(&format!("unsupported format version {version}")));
    }

    let mut pos = 8usize;
    let bloom = BloomFilter::deserialize(next_section(body, &mut pos, path)?)?;
    let (sparse_index, _) =
        encoding::decode_from_slice::<SparseIndex>(next_section(body, &mut pos, path)?)?;
    let (footer, _) = encoding::decode_from_slice::<Footer>(next_section(body, &mut pos, path)?)?;

    Ok((bloom, sparse_index, footer))
}

/// Reads one `[u32 len][bytes]` section from the meta sidecar body.
fn next_section<'a>(
    body: &'a [u8],
    pos: &mut usize,
    path: &Path,
) -> Result<&'a [u8], SSTableError> {
    let format = |detail: &str| SSTableError::Format {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    };
    let len_bytes = body
        .get(*pos..*pos + 4)
        .ok_or_else(|| format("truncated section length"))?;
    let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    *pos += 4;
    let section = body
        .get(*pos..*pos + len)
        .ok_or_else(|| format("truncated section"))?;
    *pos += len;
    Ok(section)
}
