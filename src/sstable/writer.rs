//! SSTable writer: builds the data file and meta sidecar from a sorted
//! record stream, publishing both atomically.
//!
//! Records must arrive in non-decreasing key order; a key that sorts
//! before its predecessor fails with [`SSTableError::OutOfOrder`]. Every
//! key is inserted into the bloom filter; the first key of each
//! 16-record block is sampled into the sparse index.
//!
//! # Atomicity
//!
//! Both files are written under `.tmp` names, fsynced, and renamed into
//! place at `finalize` — data first, then meta. A crash mid-build
//! leaves only temporaries, which the store removes at next open.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::bloom::BloomFilter;
use crate::record::{Key, Record, Timestamp};

use super::{
    Footer, INDEX_SAMPLE_EVERY, SENTINEL_KEY_LEN, SSTableError, SSTableMeta, data_file_name,
    encode_meta_file, meta_file_name,
};
use super::index::SparseIndex;

/// Build-time knobs, derived from the store configuration.
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Target false-positive rate for the bloom filter.
    pub bloom_fp_rate: f64,

    /// Split a sorted run into a new table once the data file reaches
    /// this many bytes.
    pub table_max_bytes: u64,
}

/// Streams sorted records into one table's data file, accumulating the
/// sidecar state, and publishes both files on `finalize`.
pub struct SSTableWriter {
    id: u64,
    level: u32,
    data_path: PathBuf,
    meta_path: PathBuf,
    data_tmp: PathBuf,
    meta_tmp: PathBuf,
    writer: BufWriter<File>,
    opts: TableOptions,

    offset: u64,
    count: u64,
    last_key: Option<Key>,
    min_key: Option<Key>,
    max_key: Option<Key>,
    ts_min: Timestamp,
    ts_max: Timestamp,
    index: SparseIndex,
    /// Keys retained until `finalize` so the bloom filter can be sized
    /// from the exact count. Bounded by `table_max_bytes` worth of data.
    bloom_keys: Vec<Key>,
}

impl SSTableWriter {
    /// Opens a writer for table `id` at `level` under `sst_dir`.
    pub fn create(
        sst_dir: &Path,
        level: u32,
        id: u64,
        opts: TableOptions,
    ) -> Result<Self, SSTableError> {
        let data_path = sst_dir.join(data_file_name(level, id));
        let meta_path = sst_dir.join(meta_file_name(level, id));
        let data_tmp = tmp_path(&data_path);
        let meta_tmp = tmp_path(&meta_path);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&data_tmp)?;

        Ok(Self {
            id,
            level,
            data_path,
            meta_path,
            data_tmp,
            meta_tmp,
            writer: BufWriter::new(file),
            opts,
            offset: 0,
            count: 0,
            last_key: None,
            min_key: None,
            max_key: None,
            ts_min: u64::MAX,
            ts_max: 0,
            index: SparseIndex::new(),
            bloom_keys: Vec::new(),
        })
    }

    /// Appends one record. Keys must be non-decreasing.
    pub fn add(&mut self, record: &Record) -> Result<(), SSTableError> {
        if let Some(last) = &self.last_key
            && record.key < *last
        {
            return Err(SSTableError::OutOfOrder(record.key.clone(), last.clone()));
        }

        if self.count as usize % INDEX_SAMPLE_EVERY == 0 {
            self.index.add(record.key.clone(), self.offset);
        }

        let frame = encode_data_frame(record);
        self.writer.write_all(&frame)?;
        self.offset += frame.len() as u64;

        self.count += 1;
        self.ts_min = self.ts_min.min(record.timestamp);
        self.ts_max = self.ts_max.max(record.timestamp);
        if self.min_key.is_none() {
            self.min_key = Some(record.key.clone());
        }
        self.max_key = Some(record.key.clone());
        self.last_key = Some(record.key.clone());
        self.bloom_keys.push(record.key.clone());

        Ok(())
    }

    /// Bytes written to the data file so far (sentinel excluded).
    pub fn data_bytes(&self) -> u64 {
        self.offset
    }

    /// Number of records added so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Writes the sentinel and meta sidecar, fsyncs, and renames both
    /// files into place. Returns the table's descriptor.
    pub fn finalize(mut self) -> Result<SSTableMeta, SSTableError> {
        // Sentinel frame: just the reserved key length.
        self.writer.write_all(&SENTINEL_KEY_LEN.to_le_bytes())?;
        self.offset += 8;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        let mut bloom = BloomFilter::new(self.bloom_keys.len(), self.opts.bloom_fp_rate);
        for key in &self.bloom_keys {
            bloom.add(key);
        }

        let footer = Footer {
            min_key: self.min_key.clone().unwrap_or_default(),
            max_key: self.max_key.clone().unwrap_or_default(),
            ts_min: if self.count == 0 { 0 } else { self.ts_min },
            ts_max: self.ts_max,
            count: self.count,
            data_size: self.offset,
            format_version: super::FORMAT_VERSION,
        };

        let meta_bytes = encode_meta_file(&bloom, &self.index, &footer)?;
        let meta_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.meta_tmp)?;
        let mut meta_writer = BufWriter::new(meta_file);
        meta_writer.write_all(&meta_bytes)?;
        meta_writer.flush()?;
        meta_writer.get_ref().sync_all()?;
        drop(meta_writer);

        fs::rename(&self.data_tmp, &self.data_path)?;
        fs::rename(&self.meta_tmp, &self.meta_path)?;

        info!(
            id = self.id,
            level = self.level,
            count = self.count,
            bytes = self.offset,
            "SSTable published"
        );

        Ok(SSTableMeta {
            id: self.id,
            level: self.level,
            data_path: self.data_path,
            meta_path: self.meta_path,
            min_key: footer.min_key,
            max_key: footer.max_key,
            count: self.count,
            data_size: self.offset,
            ts_min: footer.ts_min,
            ts_max: footer.ts_max,
        })
    }

    /// Abandons the build, removing any temporaries.
    pub fn abort(self) -> Result<(), SSTableError> {
        drop(self.writer);
        let _ = fs::remove_file(&self.data_tmp);
        let _ = fs::remove_file(&self.meta_tmp);
        Ok(())
    }
}

/// Drains a sorted record stream into one or more tables at `level`,
/// splitting whenever the data file reaches `table_max_bytes`.
///
/// `next_id` allocates table identities (the catalog's monotonic
/// counter). Returns the descriptors in key order. An empty stream
/// produces no tables.
pub fn write_sorted_run(
    sst_dir: &Path,
    level: u32,
    opts: &TableOptions,
    records: impl Iterator<Item = Record>,
    mut next_id: impl FnMut() -> u64,
) -> Result<Vec<SSTableMeta>, SSTableError> {
    let mut outputs = Vec::new();
    let mut writer: Option<SSTableWriter> = None;

    for record in records {
        if writer.is_none() {
            writer = Some(SSTableWriter::create(sst_dir, level, next_id(), opts.clone())?);
        }

        let mut split = false;
        if let Some(w) = writer.as_mut() {
            w.add(&record)?;
            split = w.data_bytes() >= opts.table_max_bytes;
        }

        if split && let Some(finished) = writer.take() {
            debug!(level, bytes = finished.data_bytes(), "splitting sorted run");
            outputs.push(finished.finalize()?);
        }
    }

    if let Some(w) = writer {
        outputs.push(w.finalize()?);
    }

    Ok(outputs)
}

/// Encodes one record's data frame.
pub(crate) fn encode_data_frame(record: &Record) -> Vec<u8> {
    let value: &[u8] = record.value.as_deref().unwrap_or(&[]);
    let mut frame = Vec::with_capacity(8 + record.key.len() + 8 + value.len() + 8 + 1);
    frame.extend_from_slice(&(record.key.len() as u64).to_le_bytes());
    frame.extend_from_slice(&record.key);
    frame.extend_from_slice(&(value.len() as u64).to_le_bytes());
    frame.extend_from_slice(value);
    frame.extend_from_slice(&record.timestamp.to_le_bytes());
    frame.push(record.op());
    frame
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}
