//! Store configuration.
//!
//! All tunables live on [`StoreConfig`], passed to `Store::open` /
//! `AsyncStore::open`. Construction starts from [`StoreConfig::new`]
//! with production defaults; tests override individual fields with
//! struct-update syntax. `validate()` runs at open and rejects
//! nonsensical values before any file is touched.

use std::path::PathBuf;

use crate::error::StoreError;

/// Configuration for a store instance.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for all on-disk artifacts (`wal/`, `sst/`, `meta/`).
    pub data_dir: PathBuf,

    /// Memtable flush threshold in approximate bytes.
    pub memtable_max_bytes: usize,

    /// When true, every WAL append fsyncs before returning. When false,
    /// appends are buffered by the OS and synced at rotation and close.
    pub wal_flush_every_write: bool,

    /// Rotate the active WAL segment once it exceeds this many bytes.
    pub wal_file_rotate_bytes: u64,

    /// Target false-positive rate for each SSTable's bloom filter.
    pub bloom_false_positive_rate: f64,

    /// Split flush/compaction output into a new SSTable at this size.
    pub sstable_max_bytes: u64,

    /// Depth of the LSM tree. Level `max_levels - 1` is the deepest and
    /// the only level where expired tombstones are dropped.
    pub max_levels: usize,

    /// Tombstones younger than this survive even deepest-level
    /// compaction, so late-arriving replicas of the deleted key cannot
    /// resurrect it.
    pub tombstone_retention_seconds: u64,

    /// Capacity of the async apply queue.
    pub apply_queue_max: usize,

    /// Bound on the timed store-lock acquire an async writer falls back
    /// to when the apply queue is full.
    pub apply_lock_timeout_ms: u64,
}

impl StoreConfig {
    /// Creates a configuration rooted at `data_dir` with defaults.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            memtable_max_bytes: 64 * 1024 * 1024,
            wal_flush_every_write: true,
            wal_file_rotate_bytes: 4 * 1024 * 1024,
            bloom_false_positive_rate: 0.01,
            sstable_max_bytes: 4 * 1024 * 1024,
            max_levels: 4,
            tombstone_retention_seconds: 24 * 60 * 60,
            apply_queue_max: 1024,
            apply_lock_timeout_ms: 50,
        }
    }

    /// Rejects configurations that cannot produce a working store.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(StoreError::InvalidArgument("data_dir is empty".into()));
        }
        if self.memtable_max_bytes == 0 {
            return Err(StoreError::InvalidArgument(
                "memtable_max_bytes must be > 0".into(),
            ));
        }
        if self.wal_file_rotate_bytes == 0 {
            return Err(StoreError::InvalidArgument(
                "wal_file_rotate_bytes must be > 0".into(),
            ));
        }
        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return Err(StoreError::InvalidArgument(format!(
                "bloom_false_positive_rate must be in (0, 1), got {}",
                self.bloom_false_positive_rate
            )));
        }
        if self.sstable_max_bytes == 0 {
            return Err(StoreError::InvalidArgument(
                "sstable_max_bytes must be > 0".into(),
            ));
        }
        if self.max_levels < 2 {
            return Err(StoreError::InvalidArgument(format!(
                "max_levels must be >= 2, got {}",
                self.max_levels
            )));
        }
        if self.apply_queue_max == 0 {
            return Err(StoreError::InvalidArgument(
                "apply_queue_max must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding WAL segments.
    pub(crate) fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    /// Directory holding SSTable data and meta files.
    pub(crate) fn sst_dir(&self) -> PathBuf {
        self.data_dir.join("sst")
    }

    /// Directory holding the manifest and its backup.
    pub(crate) fn meta_dir(&self) -> PathBuf {
        self.data_dir.join("meta")
    }
}
