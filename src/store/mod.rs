//! Store orchestration: the synchronous public API.
//!
//! [`Store`] ties the subsystems together: writes go timestamp → WAL →
//! memtable → (over threshold) flush to a new L0 table; reads probe the
//! memtable, then L0 newest-first, then deeper levels with bloom and
//! key-range pruning; recovery rebuilds the memtable from the WAL
//! against the persisted catalog.
//!
//! ## Locking
//!
//! - **Store lock** — guards the active/frozen memtable handles. Held
//!   only for bounded work: apply one record, swap the memtable
//!   reference. Never held across SSTable I/O.
//! - **Timestamp lock** — inside [`TimestampOracle`]; contention is
//!   isolated from the store lock.
//! - **Flush lock** — serializes whole flush cycles.
//! - The catalog carries its own lock and persists atomically.
//!
//! Readers snapshot the memtable handles under the store lock, then
//! work lock-free against immutable tables. A reader racing a
//! compaction swap can observe `file-not-found`; this surfaces as a
//! transient error ([`StoreError::is_transient`]) and a retry against
//! the swapped catalog succeeds.

pub mod async_store;
pub mod clock;

#[cfg(test)]
mod tests;

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::compaction::{self, CompactionParams};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::memtable::Memtable;
use crate::record::{Key, Record, Seq, Timestamp, Value};
use crate::sstable::{SSTableReader, TableOptions, write_sorted_run};
use crate::wal::{Wal, WalOptions};
use clock::TimestampOracle;

pub use async_store::{AsyncStore, JobId, JobState, JobStatus};

// ------------------------------------------------------------------------------------------------
// Stats
// ------------------------------------------------------------------------------------------------

/// Point-in-time statistics for one level.
#[derive(Debug, Clone)]
pub struct LevelStats {
    /// Number of tables in the level.
    pub tables: usize,
    /// Sum of the tables' data sizes in bytes.
    pub bytes: u64,
}

/// Snapshot of store statistics returned by [`Store::stats`].
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Approximate bytes buffered in the active memtable.
    pub memtable_bytes: usize,
    /// Entries in the active memtable, tombstones included.
    pub memtable_entries: usize,
    /// Per-level table counts and sizes, L0 first.
    pub levels: Vec<LevelStats>,
}

// ------------------------------------------------------------------------------------------------
// Store
// ------------------------------------------------------------------------------------------------

struct StoreInner {
    /// Active memtable; replaced wholesale at flush rotation.
    memtable: Arc<Memtable>,

    /// Frozen memtable being drained by an in-flight flush. Readers
    /// probe it between the active memtable and the tables.
    frozen: Option<Arc<Memtable>>,

    /// WAL segment boundary recorded at the previous flush rotation.
    /// Segments below it only protect data that has since been flushed,
    /// and are pruned by the next flush.
    prune_boundary: Option<u64>,
}

/// The synchronous store.
pub struct Store {
    config: StoreConfig,
    wal: Wal,
    clock: TimestampOracle,
    catalog: Catalog,
    inner: Mutex<StoreInner>,
    /// Serializes flush cycles end to end.
    flush_lock: Mutex<()>,
    /// Last WAL sequence replayed at open; the async fence starts here.
    recovered_seq: Seq,
    closed: AtomicBool,
}

impl Store {
    /// Opens (or creates) a store rooted at `config.data_dir`.
    ///
    /// Recovery order: clean temporaries, load the catalog (falling
    /// back to the manifest backup), drop orphaned table files, replay
    /// the WAL into a fresh memtable, and seed the timestamp oracle
    /// past everything observed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let wal_dir = config.wal_dir();
        let sst_dir = config.sst_dir();
        let meta_dir = config.meta_dir();
        for dir in [&wal_dir, &sst_dir, &meta_dir] {
            fs::create_dir_all(dir)?;
        }

        let catalog = Catalog::open(&meta_dir, config.max_levels)?;
        remove_orphan_tables(&sst_dir, &catalog.live_table_ids()?)?;

        let (wal, replayed) = Wal::open(
            &wal_dir,
            WalOptions {
                flush_every_write: config.wal_flush_every_write,
                rotate_bytes: config.wal_file_rotate_bytes,
            },
        )?;

        // The replay does not rewrite the WAL; records are applied in
        // append order so equal timestamps resolve to the later write.
        let memtable = Arc::new(Memtable::new());
        for (record, _seq) in &replayed {
            memtable.apply(record);
        }

        let clock = TimestampOracle::new();
        clock.observe(memtable.max_timestamp());
        for level in catalog.levels()? {
            for table in level {
                clock.observe(table.ts_max);
            }
        }

        info!(
            data_dir = %config.data_dir.display(),
            replayed = replayed.len(),
            "store opened"
        );

        let recovered_seq = replayed.last().map(|(_, seq)| *seq).unwrap_or(0);

        Ok(Self {
            config,
            wal,
            clock,
            catalog,
            inner: Mutex::new(StoreInner {
                memtable,
                frozen: None,
                prune_boundary: None,
            }),
            flush_lock: Mutex::new(()),
            recovered_seq,
            closed: AtomicBool::new(false),
        })
    }

    /// Inserts or replaces a value. Returns the WAL sequence.
    pub fn put(&self, key: Key, value: Value) -> Result<Seq, StoreError> {
        self.write(key, Some(value))
    }

    /// Deletes a key by writing a tombstone. Returns the WAL sequence.
    pub fn delete(&self, key: Key) -> Result<Seq, StoreError> {
        self.write(key, None)
    }

    fn write(&self, key: Key, value: Option<Value>) -> Result<Seq, StoreError> {
        self.ensure_open()?;
        validate_key(&key)?;

        let record = Record {
            key,
            value,
            timestamp: self.clock.next(),
        };
        let seq = self.wal.append(&record)?;

        let needs_flush = self.apply_record(&record)?;
        if needs_flush {
            self.flush_memtable()?;
        }
        Ok(seq)
    }

    /// Looks up the current value for a key. Tombstoned and absent keys
    /// both return `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>, StoreError> {
        Ok(self.get_with_meta(key)?.and_then(|(value, _)| value))
    }

    /// Looks up a key, exposing the tombstone state and timestamp of
    /// the authoritative record. `None` means no record exists at all.
    pub fn get_with_meta(
        &self,
        key: &[u8],
    ) -> Result<Option<(Option<Value>, Timestamp)>, StoreError> {
        self.ensure_open()?;
        validate_key(key)?;

        // Snapshot the memtable handles under the store lock, then read
        // without it.
        let (memtable, frozen) = {
            let inner = self.lock_inner()?;
            (Arc::clone(&inner.memtable), inner.frozen.clone())
        };

        if let Some(entry) = memtable.get(key) {
            return Ok(Some((entry.value, entry.timestamp)));
        }
        if let Some(frozen) = frozen
            && let Some(entry) = frozen.get(key)
        {
            return Ok(Some((entry.value, entry.timestamp)));
        }

        let levels = self.catalog.levels()?;

        // L0: newest-first, overlapping tables; first hit wins.
        if let Some(l0) = levels.first() {
            for meta in l0 {
                if !meta.key_in_range(key) {
                    continue;
                }
                let reader = SSTableReader::open(meta)?;
                if let Some(entry) = reader.get(key)? {
                    return Ok(Some((entry.value, entry.timestamp)));
                }
            }
        }

        // L1..: non-overlapping, so at most one candidate per level.
        for tables in levels.iter().skip(1) {
            let idx = tables.partition_point(|t| t.max_key.as_slice() < key);
            if let Some(meta) = tables.get(idx) {
                if !meta.key_in_range(key) {
                    continue;
                }
                let reader = SSTableReader::open(meta)?;
                if let Some(entry) = reader.get(key)? {
                    return Ok(Some((entry.value, entry.timestamp)));
                }
            }
        }

        Ok(None)
    }

    /// Ordered scan of live keys in `[lo, hi)`; `None` bounds are open.
    /// Tombstoned keys are filtered; each yielded pair is the
    /// greatest-timestamp record across all sources.
    pub fn range(
        &self,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
    ) -> Result<Vec<(Key, Value)>, StoreError> {
        self.ensure_open()?;
        if let (Some(lo), Some(hi)) = (lo, hi)
            && hi < lo
        {
            return Err(StoreError::InvalidArgument(
                "range upper bound is below lower bound".into(),
            ));
        }

        let (memtable, frozen) = {
            let inner = self.lock_inner()?;
            (Arc::clone(&inner.memtable), inner.frozen.clone())
        };

        let mut sources = Vec::new();
        sources.push(compaction::MergeSource::new(
            entries_to_records(memtable.iter_range(lo, hi)),
            0,
            u64::MAX,
        ));
        if let Some(frozen) = frozen {
            sources.push(compaction::MergeSource::new(
                entries_to_records(frozen.iter_range(lo, hi)),
                0,
                u64::MAX - 1,
            ));
        }

        for tables in self.catalog.levels()? {
            for meta in tables {
                if !meta.overlaps_range(lo, hi) {
                    continue;
                }
                let reader = SSTableReader::open(&meta)?;
                let records = reader.read_range(lo, hi)?;
                sources.push(compaction::MergeSource::new(records, meta.level, meta.id));
            }
        }

        let merged = compaction::LatestWins::new(compaction::MergeIterator::new(sources));
        Ok(merged
            .filter(|r| !r.is_tombstone())
            .map(|r| {
                let value = r.value.unwrap_or_default();
                (r.key, value)
            })
            .collect())
    }

    /// Flushes the active memtable to a new L0 table.
    ///
    /// Rotates in a fresh memtable and a fresh WAL segment, drains the
    /// frozen table to disk, registers it in the catalog, prunes WAL
    /// segments made obsolete by the *previous* flush, and fsyncs the
    /// new segment boundary. Returns `false` when the memtable was
    /// empty (a second flush in a row is a no-op).
    pub fn flush_memtable(&self) -> Result<bool, StoreError> {
        self.ensure_open()?;
        self.flush_internal()
    }

    fn flush_internal(&self) -> Result<bool, StoreError> {
        let _flush = self
            .flush_lock
            .lock()
            .map_err(|_| StoreError::Internal("flush mutex poisoned".into()))?;

        let (frozen, prune_below) = {
            let mut inner = self.lock_inner()?;
            if inner.memtable.is_empty() {
                return Ok(false);
            }
            let boundary = self.wal.rotate()?;
            let old = Arc::clone(&inner.memtable);
            inner.memtable = Arc::new(Memtable::new());
            inner.frozen = Some(Arc::clone(&old));
            let prune_below = inner.prune_boundary.replace(boundary);
            (old, prune_below)
        };

        debug!(
            entries = frozen.len(),
            bytes = frozen.size_bytes(),
            "flush started"
        );

        let result = self.write_frozen(&frozen);

        match result {
            Ok(()) => {
                let mut inner = self.lock_inner()?;
                inner.frozen = None;
            }
            Err(e) => {
                // Fold the frozen entries back into the active memtable
                // so nothing becomes unreadable; the WAL still holds
                // every record for crash recovery.
                warn!(error = %e, "flush failed, restoring frozen memtable");
                let mut inner = self.lock_inner()?;
                for (key, entry) in frozen.items() {
                    inner.memtable.apply(&Record {
                        key,
                        value: entry.value,
                        timestamp: entry.timestamp,
                    });
                }
                inner.frozen = None;
                return Err(e);
            }
        }

        if let Some(boundary) = prune_below {
            self.wal.remove_segments_below(boundary)?;
        }
        self.wal.sync()?;
        Ok(true)
    }

    /// Drains a frozen memtable into L0 tables and registers them.
    fn write_frozen(&self, frozen: &Memtable) -> Result<(), StoreError> {
        let records = entries_to_records(frozen.items());
        let added = write_sorted_run(
            &self.config.sst_dir(),
            0,
            &self.table_options(),
            records.into_iter(),
            || self.catalog.allocate_sst_id(),
        )?;

        for meta in added {
            self.catalog.add_sstable(meta)?;
        }
        Ok(())
    }

    /// Compacts every table of `level` (plus the overlapping tables of
    /// the target level) into `level + 1`, swapping the catalog
    /// atomically and unlinking the inputs afterwards.
    ///
    /// Compacting the deepest level rewrites it in place, which is
    /// where expired tombstones are dropped. Returns `false` when the
    /// level is empty.
    pub fn compact_level(&self, level: usize) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let max_levels = self.config.max_levels;
        if level >= max_levels {
            return Err(StoreError::InvalidArgument(format!(
                "level {level} out of range (max_levels = {max_levels})"
            )));
        }

        let target = (level + 1).min(max_levels - 1);
        let mut inputs = self.catalog.level(level)?;
        if inputs.is_empty() {
            return Ok(false);
        }

        // Merge with overlapping target-level tables so levels ≥ 1 stay
        // non-overlapping.
        if target != level {
            let span_lo = inputs.iter().map(|t| t.min_key.clone()).min();
            let span_hi = inputs.iter().map(|t| t.max_key.clone()).max();
            if let (Some(lo), Some(hi)) = (span_lo, span_hi) {
                for meta in self.catalog.level(target)? {
                    if meta.max_key >= lo && meta.min_key <= hi {
                        inputs.push(meta);
                    }
                }
            }
        }

        let params = CompactionParams {
            target_level: target as u32,
            is_deepest_level: target == max_levels - 1,
            tombstone_retention_seconds: self.config.tombstone_retention_seconds,
            now: clock::wall_clock_ns(),
        };

        let outcome = compaction::compact(
            &self.config.sst_dir(),
            &inputs,
            &params,
            &self.table_options(),
            || self.catalog.allocate_sst_id(),
        )?;

        let Some(outcome) = outcome else {
            return Ok(false);
        };

        // The swap is the only catalog mutation; inputs are unlinked
        // after it, so a crash in between leaves harmless orphans.
        self.catalog
            .apply_compaction(&outcome.removed_ids, outcome.added)?;
        for path in &outcome.removed_paths {
            if let Err(e) = fs::remove_file(path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                return Err(StoreError::Io(e));
            }
        }
        Ok(true)
    }

    /// Returns a snapshot of store statistics.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.ensure_open()?;
        let memtable = {
            let inner = self.lock_inner()?;
            Arc::clone(&inner.memtable)
        };
        let levels = self
            .catalog
            .levels()?
            .into_iter()
            .map(|tables| LevelStats {
                tables: tables.len(),
                bytes: tables.iter().map(|t| t.data_size).sum(),
            })
            .collect();
        Ok(StoreStats {
            memtable_bytes: memtable.size_bytes(),
            memtable_entries: memtable.len(),
            levels,
        })
    }

    /// Flushes outstanding data, syncs the WAL, and marks the store
    /// closed. Idempotent; later operations fail with
    /// `InvalidArgument`.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut first_error = None;
        if let Err(e) = self.flush_internal() {
            warn!(error = %e, "flush during close failed");
            first_error = Some(e);
        }
        if let Err(e) = self.wal.sync()
            && first_error.is_none()
        {
            first_error = Some(e.into());
        }

        info!("store closed");
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Internals shared with the async store
    // --------------------------------------------------------------------------------------------

    pub(crate) fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::InvalidArgument("store is closed".into()));
        }
        Ok(())
    }

    pub(crate) fn next_timestamp(&self) -> Timestamp {
        self.clock.next()
    }

    pub(crate) fn wal_append(&self, record: &Record) -> Result<Seq, StoreError> {
        Ok(self.wal.append(record)?)
    }

    /// Applies one record under the store lock. Returns `true` when the
    /// memtable has crossed the flush threshold.
    pub(crate) fn apply_record(&self, record: &Record) -> Result<bool, StoreError> {
        let inner = self.lock_inner()?;
        inner.memtable.apply(record);
        Ok(inner.memtable.size_bytes() > self.config.memtable_max_bytes)
    }

    /// Non-blocking variant of [`apply_record`]: `None` when the store
    /// lock is busy.
    pub(crate) fn try_apply_record(&self, record: &Record) -> Result<Option<bool>, StoreError> {
        match self.inner.try_lock() {
            Ok(inner) => {
                inner.memtable.apply(record);
                Ok(Some(
                    inner.memtable.size_bytes() > self.config.memtable_max_bytes,
                ))
            }
            Err(std::sync::TryLockError::WouldBlock) => Ok(None),
            Err(std::sync::TryLockError::Poisoned(_)) => {
                Err(StoreError::Internal("store mutex poisoned".into()))
            }
        }
    }

    pub(crate) fn memtable_over_threshold(&self) -> Result<bool, StoreError> {
        let inner = self.lock_inner()?;
        Ok(inner.memtable.size_bytes() > self.config.memtable_max_bytes)
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn l0_table_count(&self) -> Result<usize, StoreError> {
        Ok(self.catalog.level(0)?.len())
    }

    pub(crate) fn recovered_seq(&self) -> Seq {
        self.recovered_seq
    }

    fn table_options(&self) -> TableOptions {
        TableOptions {
            bloom_fp_rate: self.config.bloom_false_positive_rate,
            table_max_bytes: self.config.sstable_max_bytes,
        }
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, StoreInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Internal("store mutex poisoned".into()))
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst)
            && let Err(e) = self.close()
        {
            warn!(error = %e, "close on drop failed");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn validate_key(key: &[u8]) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidArgument("key is empty".into()));
    }
    Ok(())
}

/// Converts memtable entries into merge records.
fn entries_to_records(entries: Vec<(Key, crate::memtable::ValueEntry)>) -> Vec<Record> {
    entries
        .into_iter()
        .map(|(key, entry)| Record {
            key,
            value: entry.value,
            timestamp: entry.timestamp,
        })
        .collect()
}

/// Removes `.tmp` leftovers and table files the catalog no longer
/// references (outputs of a crashed flush or compaction).
fn remove_orphan_tables(sst_dir: &Path, live_ids: &[u64]) -> Result<(), StoreError> {
    for entry in fs::read_dir(sst_dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };

        if name.ends_with(".tmp") {
            fs::remove_file(&path)?;
            debug!(path = %path.display(), "stale temporary removed");
            continue;
        }

        let Some(id) = parse_table_id(name) else {
            continue;
        };
        if !live_ids.contains(&id) {
            fs::remove_file(&path)?;
            info!(path = %path.display(), "orphaned table file removed");
        }
    }
    Ok(())
}

/// Extracts the table id from `sst-<level>-<id>.data` / `.meta`.
fn parse_table_id(name: &str) -> Option<u64> {
    let rest = name.strip_prefix("sst-")?;
    let rest = rest
        .strip_suffix(".data")
        .or_else(|| rest.strip_suffix(".meta"))?;
    let (_level, id) = rest.split_once('-')?;
    id.parse().ok()
}
