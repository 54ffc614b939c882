//! Crate-level error taxonomy.
//!
//! Each subsystem defines its own error enum (`WalError`,
//! `SSTableError`, `CatalogError`, `CompactionError`); the public API
//! surfaces everything as [`StoreError`], whose variants distinguish
//! the failure classes callers act on: corruption, recovery failure,
//! compaction failure, plain I/O, and caller mistakes.

use std::io;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::compaction::CompactionError;
use crate::sstable::SSTableError;
use crate::wal::WalError;

/// Errors surfaced by the public store API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// WAL data failed integrity validation (bad magic or bad CRC that
    /// is not a plain truncated tail).
    #[error("WAL corruption: {0}")]
    WalCorruption(String),

    /// SSTable build or read failure.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// The store could not be brought to a consistent state at open:
    /// manifest unreadable (live and backup), or a referenced file is
    /// missing.
    #[error("recovery error: {0}")]
    Recovery(String),

    /// A compaction failed; inputs remain referenced and the store
    /// stays operational.
    #[error("compaction error: {0}")]
    Compaction(String),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The caller passed an invalid argument (empty key, inverted
    /// range, unusable configuration) or used a closed store.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Returns `true` for failures a caller can retry immediately —
    /// currently a reader observing `file-not-found` because a
    /// compaction unlinked an input after the catalog swap. A retry
    /// against the swapped catalog succeeds.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            StoreError::SSTable(SSTableError::Io(e)) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<WalError> for StoreError {
    fn from(err: WalError) -> Self {
        match err {
            WalError::Io(e) => StoreError::Io(e),
            WalError::RecordTooLarge(bytes) => {
                StoreError::InvalidArgument(format!("record part of {bytes} bytes exceeds limit"))
            }
            other => StoreError::WalCorruption(other.to_string()),
        }
    }
}

impl From<CatalogError> for StoreError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Io(e) => StoreError::Io(e),
            other => StoreError::Recovery(other.to_string()),
        }
    }
}

impl From<CompactionError> for StoreError {
    fn from(err: CompactionError) -> Self {
        StoreError::Compaction(err.to_string())
    }
}
