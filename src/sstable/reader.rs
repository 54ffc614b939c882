//! SSTable reader: point lookups and range scans over an immutable
//! table.
//!
//! The meta sidecar (bloom filter, sparse index, footer) is loaded and
//! validated once at open and stays resident; the data file is
//! memory-mapped, so a point lookup touches at most one logical block
//! of frames. The reader owns its handles and releases them on `close`
//! (or drop).

use std::fs::File;

use memmap2::Mmap;
use tracing::trace;

use crate::bloom::BloomFilter;
use crate::memtable::ValueEntry;
use crate::record::{OP_DELETE, OP_PUT, Record};

use super::index::SparseIndex;
use super::{Footer, SENTINEL_KEY_LEN, SSTableError, SSTableMeta};

/// Read handle for one SSTable.
#[derive(Debug)]
pub struct SSTableReader {
    meta: SSTableMeta,
    bloom: BloomFilter,
    index: SparseIndex,
    footer: Footer,
    mmap: Mmap,
    /// Keeps the data file open for the lifetime of the mapping.
    _file: File,
}

impl SSTableReader {
    /// Opens a table from its catalog descriptor, validating the meta
    /// sidecar checksum.
    pub fn open(meta: &SSTableMeta) -> Result<Self, SSTableError> {
        let (bloom, index, footer) = super::read_meta_file(&meta.meta_path)?;

        let file = File::open(&meta.data_path)?;
        // Safety: the data file is immutable once published; nothing
        // remaps or truncates it while the store references it.
        let mmap = unsafe { Mmap::map(&file)? };

        if (mmap.len() as u64) < footer.data_size {
            return Err(SSTableError::Format {
                path: meta.data_path.clone(),
                detail: format!(
                    "data file is {} bytes, footer expects {}",
                    mmap.len(),
                    footer.data_size
                ),
            });
        }

        Ok(Self {
            meta: meta.clone(),
            bloom,
            index,
            footer,
            mmap,
            _file: file,
        })
    }

    /// The catalog descriptor this reader was opened from.
    pub fn meta(&self) -> &SSTableMeta {
        &self.meta
    }

    /// Bloom + key-range pruning check. `false` is definitive.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        key >= self.footer.min_key.as_slice()
            && key <= self.footer.max_key.as_slice()
            && self.bloom.may_contain(key)
    }

    /// Point lookup.
    ///
    /// Returns `None` when the key is outside the table's range, the
    /// bloom filter excludes it, or the bounded block scan passes it.
    pub fn get(&self, key: &[u8]) -> Result<Option<ValueEntry>, SSTableError> {
        if !self.may_contain(key) {
            return Ok(None);
        }

        let Some(offset) =
            self.index
                .find_block_offset(key, &self.footer.min_key, &self.footer.max_key)
        else {
            return Ok(None);
        };

        let mut pos = offset as usize;
        loop {
            match self.decode_frame(&mut pos)? {
                None => return Ok(None),
                Some(record) => {
                    if record.key.as_slice() == key {
                        return Ok(Some(ValueEntry {
                            value: record.value,
                            timestamp: record.timestamp,
                        }));
                    }
                    if record.key.as_slice() > key {
                        // Sorted data: the key cannot appear later.
                        trace!(table = self.meta.id, "sparse-index early exit");
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Records with `lo <= key < hi` in key order, `None` bounds open.
    /// Tombstones are included — merge layers above decide visibility.
    pub fn read_range(
        &self,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
    ) -> Result<Vec<Record>, SSTableError> {
        let mut out = Vec::new();
        let mut pos = self.index.scan_start_offset(lo) as usize;

        loop {
            match self.decode_frame(&mut pos)? {
                None => break,
                Some(record) => {
                    if let Some(hi) = hi
                        && record.key.as_slice() >= hi
                    {
                        break;
                    }
                    if let Some(lo) = lo
                        && record.key.as_slice() < lo
                    {
                        continue;
                    }
                    out.push(record);
                }
            }
        }

        Ok(out)
    }

    /// Every record in the table, in key order.
    pub fn read_all(&self) -> Result<Vec<Record>, SSTableError> {
        self.read_range(None, None)
    }

    /// Releases the mapping and file handle.
    pub fn close(self) {
        drop(self);
    }

    /// Decodes the frame at `*pos`, advancing it. Returns `None` at the
    /// sentinel.
    fn decode_frame(&self, pos: &mut usize) -> Result<Option<Record>, SSTableError> {
        let data: &[u8] = &self.mmap;
        let format = |detail: String| SSTableError::Format {
            path: self.meta.data_path.clone(),
            detail,
        };

        let key_len = read_u64(data, pos)
            .ok_or_else(|| format("truncated frame: key length".into()))?;
        if key_len == SENTINEL_KEY_LEN {
            return Ok(None);
        }
        let key_len = usize::try_from(key_len)
            .map_err(|_| format(format!("absurd key length {key_len}")))?;
        let key = read_bytes(data, pos, key_len)
            .ok_or_else(|| format("truncated frame: key".into()))?
            .to_vec();

        let value_len = read_u64(data, pos)
            .ok_or_else(|| format("truncated frame: value length".into()))?;
        let value_len = usize::try_from(value_len)
            .map_err(|_| format(format!("absurd value length {value_len}")))?;
        let value = read_bytes(data, pos, value_len)
            .ok_or_else(|| format("truncated frame: value".into()))?
            .to_vec();

        let timestamp = read_u64(data, pos)
            .ok_or_else(|| format("truncated frame: timestamp".into()))?;
        let op = *data
            .get(*pos)
            .ok_or_else(|| format("truncated frame: op".into()))?;
        *pos += 1;

        let value = match op {
            OP_PUT => Some(value),
            OP_DELETE => None,
            other => return Err(format(format!("unknown op byte 0x{other:02X}"))),
        };

        Ok(Some(Record {
            key,
            value,
            timestamp,
        }))
    }
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let bytes = buf.get(*pos..*pos + 8)?;
    *pos += 8;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

fn read_bytes<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Option<&'a [u8]> {
    let bytes = buf.get(*pos..*pos + len)?;
    *pos += len;
    Some(bytes)
}
