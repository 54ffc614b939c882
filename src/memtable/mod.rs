//! In-memory sorted write buffer.
//!
//! The memtable absorbs recent mutations as a sorted map from key to
//! `(value-or-tombstone, timestamp)`. It holds exactly one entry per
//! key: an apply keeps whichever pair carries the greater timestamp, so
//! out-of-order application (the async path) converges on the same
//! state as in-order application.
//!
//! ## Lifecycle
//!
//! Created empty at store open (then populated by WAL replay) or after
//! a flush rotation. Mutated only through [`Memtable::apply`]. At
//! flush-start the store swaps in a fresh memtable and drains the
//! frozen one via [`Memtable::items`]; the frozen table stays readable
//! until the flush completes.
//!
//! ## Concurrency
//!
//! Interior `RwLock`: the write path takes the write lock per record,
//! readers share the read lock on a cloned `Arc` handle. Lock poisoning
//! is absorbed with `into_inner` — entries are written atomically under
//! the lock, so a panicking writer cannot leave a partial entry behind.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::record::{Key, Record, Timestamp, Value};

/// Fixed bookkeeping charge per entry in [`Memtable::size_bytes`],
/// approximating the `BTreeMap` node and allocation overhead.
const ENTRY_OVERHEAD: usize = 32;

/// The stored pair for one key: value (or tombstone) plus timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueEntry {
    /// Current value, or `None` if the key is tombstoned.
    pub value: Option<Value>,

    /// Timestamp of the winning write.
    pub timestamp: Timestamp,
}

struct MemtableInner {
    tree: BTreeMap<Key, ValueEntry>,
    approx_bytes: usize,
}

/// Sorted in-memory map from key to `(Option<Value>, Timestamp)`.
pub struct Memtable {
    inner: RwLock<MemtableInner>,
}

impl Memtable {
    /// Creates an empty memtable.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemtableInner {
                tree: BTreeMap::new(),
                approx_bytes: 0,
            }),
        }
    }

    /// Applies one record with last-writer-wins semantics.
    ///
    /// If the key already holds an entry with a strictly greater
    /// timestamp, the incoming record is ignored; on equal timestamps
    /// the incoming record wins (applies arrive in WAL order, so the
    /// later sequence prevails).
    pub fn apply(&self, record: &Record) {
        let mut inner = write_lock(&self.inner);

        if let Some(existing) = inner.tree.get(&record.key)
            && existing.timestamp > record.timestamp
        {
            return;
        }

        // Accounting only ever grows — see size_bytes().
        inner.approx_bytes += record.key.len()
            + record.value.as_ref().map_or(0, Vec::len)
            + ENTRY_OVERHEAD;

        inner.tree.insert(
            record.key.clone(),
            ValueEntry {
                value: record.value.clone(),
                timestamp: record.timestamp,
            },
        );
    }

    /// Inserts or replaces a value.
    pub fn put(&self, key: Key, value: Value, timestamp: Timestamp) {
        self.apply(&Record {
            key,
            value: Some(value),
            timestamp,
        });
    }

    /// Records a tombstone for the key.
    pub fn delete(&self, key: Key, timestamp: Timestamp) {
        self.apply(&Record {
            key,
            value: None,
            timestamp,
        });
    }

    /// Looks up a key.
    ///
    /// Returns `None` when the key is absent; a present tombstone comes
    /// back as `Some(ValueEntry { value: None, .. })` so callers can
    /// distinguish "deleted here" from "not here".
    pub fn get(&self, key: &[u8]) -> Option<ValueEntry> {
        read_lock(&self.inner).tree.get(key).cloned()
    }

    /// All entries in ascending key order.
    pub fn items(&self) -> Vec<(Key, ValueEntry)> {
        read_lock(&self.inner)
            .tree
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Entries with `lo <= key < hi`, ascending. `None` bounds are open.
    pub fn iter_range(&self, lo: Option<&[u8]>, hi: Option<&[u8]>) -> Vec<(Key, ValueEntry)> {
        let inner = read_lock(&self.inner);
        let lower = lo.map_or(Bound::Unbounded, |k| Bound::Included(k.to_vec()));
        let upper = hi.map_or(Bound::Unbounded, |k| Bound::Excluded(k.to_vec()));
        inner
            .tree
            .range((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Approximate memory footprint: key bytes + value bytes + a fixed
    /// per-entry overhead, accumulated per apply. Replacements charge
    /// the new entry without refunding the old one, keeping the figure
    /// monotonically non-decreasing under insertion.
    pub fn size_bytes(&self) -> usize {
        read_lock(&self.inner).approx_bytes
    }

    /// Number of distinct keys, tombstones included.
    pub fn len(&self) -> usize {
        read_lock(&self.inner).tree.len()
    }

    /// Returns `true` if no entries are present.
    pub fn is_empty(&self) -> bool {
        read_lock(&self.inner).tree.is_empty()
    }

    /// Greatest timestamp present, or 0 when empty. Used at recovery to
    /// seed the timestamp oracle past everything already written.
    pub fn max_timestamp(&self) -> Timestamp {
        read_lock(&self.inner)
            .tree
            .values()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(0)
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

fn read_lock(lock: &RwLock<MemtableInner>) -> std::sync::RwLockReadGuard<'_, MemtableInner> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock(lock: &RwLock<MemtableInner>) -> std::sync::RwLockWriteGuard<'_, MemtableInner> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
