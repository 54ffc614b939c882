use crate::record::{Record, Seq};
use crate::wal::{Wal, WalError, WalOptions};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing controlled by `RUST_LOG`. Safe to call multiple
/// times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Default options: fsync every append, large rotation threshold so
/// tests control rotation explicitly.
pub fn default_opts() -> WalOptions {
    init_tracing();
    WalOptions {
        flush_every_write: true,
        rotate_bytes: 64 * 1024 * 1024,
    }
}

/// Options with a tiny rotation threshold to force frequent rotation.
pub fn tiny_rotate_opts() -> WalOptions {
    init_tracing();
    WalOptions {
        flush_every_write: true,
        rotate_bytes: 64,
    }
}

/// Open the WAL at `dir`, discarding replayed records.
pub fn open_fresh(dir: &Path) -> Wal {
    let (wal, replayed) = Wal::open(dir, default_opts()).unwrap();
    assert!(replayed.is_empty(), "expected a fresh WAL");
    wal
}

/// Reopen the WAL at `dir` and return only the replayed records.
pub fn replay(dir: &Path) -> Result<Vec<(Record, Seq)>, WalError> {
    Wal::open(dir, default_opts()).map(|(_, records)| records)
}
