use crate::config::StoreConfig;
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

/// Config with a large memtable so nothing flushes unless asked to.
pub fn memtable_only_config(dir: &Path) -> StoreConfig {
    init_tracing();
    StoreConfig::new(dir)
}

/// Tiny memtable threshold so writes flush to L0 quickly.
pub fn small_buffer_config(dir: &Path) -> StoreConfig {
    init_tracing();
    StoreConfig {
        memtable_max_bytes: 1024,
        sstable_max_bytes: 64 * 1024,
        ..StoreConfig::new(dir)
    }
}
