//! # stratumdb
//!
//! An embeddable, persistent, ordered key-value store built on a
//! **leveled log-structured merge tree (LSM-tree)**. Keys and values
//! are opaque byte sequences, updates are last-writer-wins by
//! timestamp, and deletions are tombstones purged by compaction.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        Store                               │
//! │   put/delete            get/range                          │
//! │      │                     │                               │
//! │      ▼                     ▼                               │
//! │  ┌───────┐   apply   ┌───────────┐   probe   ┌──────────┐  │
//! │  │  WAL  │──────────►│ Memtable  │──────────►│ SSTables │  │
//! │  └───────┘           └─────┬─────┘  L0..Ln   │ (bloom + │  │
//! │   durable                  │ flush           │  index)  │  │
//! │                            ▼                 └────┬─────┘  │
//! │                      new L0 table                 │        │
//! │                                                   ▼        │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │   Compaction: merge L → L+1, LWW dedup, tombstone GC │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │   Catalog: per-level table lists, atomic manifest    │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`store`] | Orchestration — sync [`Store`] and async [`AsyncStore`] |
//! | [`memtable`] | Sorted in-memory write buffer |
//! | [`wal`] | Framed, CRC-protected write-ahead log with rotation |
//! | [`sstable`] | Immutable sorted tables with bloom + sparse index sidecars |
//! | [`catalog`] | Persisted per-level table lists, atomic manifest replace |
//! | [`compaction`] | K-way merge, last-writer-wins, tombstone GC |
//! | [`bloom`] | Double-hashed bloom filter |
//! | [`encoding`] | Byte-stable serialization for metadata |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use stratumdb::{Store, StoreConfig};
//!
//! let store = Store::open(StoreConfig::new("/tmp/my_db"))?;
//!
//! store.put(b"hello".to_vec(), b"world".to_vec())?;
//! assert_eq!(store.get(b"hello")?, Some(b"world".to_vec()));
//!
//! store.delete(b"hello".to_vec())?;
//! assert_eq!(store.get(b"hello")?, None);
//!
//! let pairs = store.range(None, None)?;
//! store.close()?;
//! # Ok::<(), stratumdb::StoreError>(())
//! ```
//!
//! ## Guarantees
//!
//! - **Durability** — every acknowledged write is WAL-durable first
//!   (fsync per write or batched, per configuration) and survives a
//!   crash-and-reopen.
//! - **Ordering** — range scans yield strictly ascending keys; for any
//!   key the greatest-timestamp record is authoritative, with ties
//!   broken by WAL order.
//! - **Crash safety** — torn WAL tails are skipped, SSTables and the
//!   manifest are published by atomic rename, and temporaries are
//!   reclaimed at open.
//! - **Bounded reads** — bloom filters and sparse indices keep a point
//!   lookup to at most one block scan per consulted table.

pub mod bloom;
pub mod catalog;
pub mod compaction;
pub mod config;
pub mod encoding;
pub mod error;
pub mod memtable;
pub mod record;
pub mod sstable;
pub mod store;
pub mod wal;

pub use config::StoreConfig;
pub use error::StoreError;
pub use record::{Key, Record, Seq, Timestamp, Value};
pub use store::{AsyncStore, JobId, JobState, JobStatus, Store};
