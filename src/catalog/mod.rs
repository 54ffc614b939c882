//! Level catalog: the persisted list of live SSTables per level.
//!
//! The catalog owns the authoritative mapping from level to an ordered
//! list of table descriptors, plus the monotonic table-id counter.
//! L0 is ordered newest-first (flush order); levels ≥ 1 are ordered by
//! `min_key` and non-overlapping after compaction.
//!
//! ## Persistence
//!
//! The catalog is serialized as a single manifest document:
//!
//! ```text
//! [4B magic "MAN0"][u32 format_version][body][u32 crc32]
//! ```
//!
//! Mutations are applied in memory under an exclusive lock, then the
//! whole document is written to `manifest.tmp`, fsynced, and renamed
//! over the live file — the previous manifest is first renamed to
//! `manifest.bak`, so a crash at any point leaves a loadable manifest.
//! On open the live file is tried first; on checksum or decode failure
//! the backup is loaded with a warning. Both failing is fatal.

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::sstable::SSTableMeta;

/// Manifest document magic bytes.
const MANIFEST_MAGIC: [u8; 4] = *b"MAN0";

/// Current manifest format version.
const MANIFEST_VERSION: u32 = 1;

/// Live manifest file name under the meta directory.
const MANIFEST_FILE: &str = "manifest";

/// Backup of the previously committed manifest.
const MANIFEST_BACKUP: &str = "manifest.bak";

/// Temporary name used during atomic replace.
const MANIFEST_TMP: &str = "manifest.tmp";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by catalog operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CatalogError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Manifest encoding/decoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Neither the live manifest nor its backup could be loaded.
    #[error("manifest unreadable: {0}")]
    Unreadable(String),

    /// The manifest references a file that no longer exists.
    #[error("manifest references missing file {0}")]
    MissingFile(PathBuf),

    /// A level index outside the configured depth was requested.
    #[error("level {level} out of range (max_levels = {max_levels})")]
    LevelOutOfRange {
        /// Requested level.
        level: usize,
        /// Configured depth.
        max_levels: usize,
    },

    /// Internal invariant violation (poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// In-memory state
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct CatalogData {
    next_sst_id: u64,
    levels: Vec<Vec<SSTableMeta>>,
}

impl Encode for CatalogData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.next_sst_id.encode_to(buf)?;
        (self.levels.len() as u32).encode_to(buf)?;
        for level in &self.levels {
            encoding::encode_vec(level, buf)?;
        }
        Ok(())
    }
}

impl Decode for CatalogData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (next_sst_id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (level_count, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let mut levels = Vec::with_capacity(level_count as usize);
        for _ in 0..level_count {
            let (tables, n) = encoding::decode_vec::<SSTableMeta>(&buf[offset..])?;
            offset += n;
            levels.push(tables);
        }
        Ok((
            Self {
                next_sst_id,
                levels,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Catalog
// ------------------------------------------------------------------------------------------------

/// The level catalog. Thread-safe; every mutation persists the manifest
/// atomically before returning.
#[derive(Debug)]
pub struct Catalog {
    meta_dir: PathBuf,
    /// Monotonic table-id counter. Kept outside the level lock so id
    /// allocation never blocks on (or fails with) manifest writes; the
    /// current value rides along with every persisted manifest.
    next_sst_id: AtomicU64,
    inner: Mutex<Vec<Vec<SSTableMeta>>>,
}

impl Catalog {
    /// Opens (or creates) the catalog under `meta_dir` with `max_levels`
    /// levels. Removes stale manifest temporaries and verifies that
    /// every referenced SSTable file still exists.
    pub fn open(meta_dir: impl AsRef<Path>, max_levels: usize) -> Result<Self, CatalogError> {
        let meta_dir = meta_dir.as_ref().to_path_buf();
        fs::create_dir_all(&meta_dir)?;

        // A crash mid-replace can leave a temporary behind.
        let tmp = meta_dir.join(MANIFEST_TMP);
        if tmp.exists() {
            fs::remove_file(&tmp)?;
            debug!(path = %tmp.display(), "stale manifest temporary removed");
        }

        let live = meta_dir.join(MANIFEST_FILE);
        let backup = meta_dir.join(MANIFEST_BACKUP);

        let mut fell_back = false;
        let data = if live.exists() || backup.exists() {
            match load_manifest(&live) {
                Ok(data) => data,
                Err(live_err) => {
                    warn!(
                        error = %live_err,
                        "live manifest unreadable, falling back to backup"
                    );
                    fell_back = true;
                    load_manifest(&backup).map_err(|bak_err| {
                        CatalogError::Unreadable(format!(
                            "live: {live_err}; backup: {bak_err}"
                        ))
                    })?
                }
            }
        } else {
            CatalogData {
                next_sst_id: 1,
                levels: vec![Vec::new(); max_levels],
            }
        };

        let mut data = data;
        // A manifest written under a smaller depth grows empty levels.
        while data.levels.len() < max_levels {
            data.levels.push(Vec::new());
        }

        // Never hand out an id that a registered table already uses.
        let max_id = data.levels.iter().flatten().map(|t| t.id).max().unwrap_or(0);
        data.next_sst_id = data.next_sst_id.max(max_id + 1);

        for table in data.levels.iter().flatten() {
            if !table.data_path.exists() {
                return Err(CatalogError::MissingFile(table.data_path.clone()));
            }
            if !table.meta_path.exists() {
                return Err(CatalogError::MissingFile(table.meta_path.clone()));
            }
        }

        let tables: usize = data.levels.iter().map(Vec::len).sum();
        info!(meta_dir = %meta_dir.display(), tables, "catalog opened");

        let catalog = Self {
            meta_dir,
            next_sst_id: AtomicU64::new(data.next_sst_id),
            inner: Mutex::new(data.levels),
        };
        // Persist immediately so a fresh store has a manifest on disk,
        // and so a backup-recovered state overwrites the damaged live
        // file before it can rotate onto the good backup.
        if !live.exists() || fell_back {
            let inner = catalog.lock()?;
            catalog.persist(&inner)?;
        }
        Ok(catalog)
    }

    /// Allocates the next monotonic SSTable id.
    ///
    /// The counter is persisted with the next manifest write; ids
    /// handed out but never registered are simply skipped, and their
    /// orphaned files are removed at next open.
    pub fn allocate_sst_id(&self) -> u64 {
        self.next_sst_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Registers a freshly-flushed table at the front of its level
    /// (L0 is ordered newest-first) and persists the manifest.
    pub fn add_sstable(&self, meta: SSTableMeta) -> Result<(), CatalogError> {
        let mut inner = self.lock()?;
        let level = meta.level as usize;
        let max_levels = inner.len();
        if level >= max_levels {
            return Err(CatalogError::LevelOutOfRange { level, max_levels });
        }

        if level == 0 {
            inner[0].insert(0, meta);
        } else {
            let pos = inner[level].partition_point(|t| t.min_key < meta.min_key);
            inner[level].insert(pos, meta);
        }

        self.persist(&inner)
    }

    /// Removes the listed table ids from every level and persists.
    pub fn remove_sstables(&self, ids: &[u64]) -> Result<(), CatalogError> {
        let mut inner = self.lock()?;
        for level in inner.iter_mut() {
            level.retain(|t| !ids.contains(&t.id));
        }
        self.persist(&inner)
    }

    /// Atomically applies a compaction result: removes every input
    /// descriptor, adds every output descriptor, and persists once.
    /// Either the whole swap lands or the previous manifest remains.
    pub fn apply_compaction(
        &self,
        removed_ids: &[u64],
        added: Vec<SSTableMeta>,
    ) -> Result<(), CatalogError> {
        let mut inner = self.lock()?;
        let max_levels = inner.len();

        for meta in &added {
            let level = meta.level as usize;
            if level >= max_levels {
                return Err(CatalogError::LevelOutOfRange { level, max_levels });
            }
        }

        for level in inner.iter_mut() {
            level.retain(|t| !removed_ids.contains(&t.id));
        }
        for meta in added {
            let level = meta.level as usize;
            let pos = inner[level].partition_point(|t| t.min_key < meta.min_key);
            inner[level].insert(pos, meta);
        }

        self.persist(&inner)
    }

    /// Snapshot of one level's descriptor list.
    pub fn level(&self, level: usize) -> Result<Vec<SSTableMeta>, CatalogError> {
        let inner = self.lock()?;
        let max_levels = inner.len();
        inner
            .get(level)
            .cloned()
            .ok_or(CatalogError::LevelOutOfRange { level, max_levels })
    }

    /// Snapshot of every level's descriptor list.
    pub fn levels(&self) -> Result<Vec<Vec<SSTableMeta>>, CatalogError> {
        Ok(self.lock()?.clone())
    }

    /// Ids of every live table, across all levels.
    pub fn live_table_ids(&self) -> Result<Vec<u64>, CatalogError> {
        let inner = self.lock()?;
        Ok(inner.iter().flatten().map(|t| t.id).collect())
    }

    /// Number of configured levels.
    pub fn depth(&self) -> Result<usize, CatalogError> {
        Ok(self.lock()?.len())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Vec<SSTableMeta>>>, CatalogError> {
        self.inner
            .lock()
            .map_err(|_| CatalogError::Internal("catalog mutex poisoned".into()))
    }

    /// Serializes the levels and atomically replaces the live manifest,
    /// keeping the previous one as `manifest.bak`.
    fn persist(&self, levels: &[Vec<SSTableMeta>]) -> Result<(), CatalogError> {
        let live = self.meta_dir.join(MANIFEST_FILE);
        let backup = self.meta_dir.join(MANIFEST_BACKUP);
        let tmp = self.meta_dir.join(MANIFEST_TMP);

        let data = CatalogData {
            next_sst_id: self.next_sst_id.load(Ordering::SeqCst),
            levels: levels.to_vec(),
        };

        let mut buf = Vec::new();
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        data.encode_to(&mut buf)?;
        let mut hasher = Crc32::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        drop(file);

        if live.exists() {
            fs::rename(&live, &backup)?;
        }
        fs::rename(&tmp, &live)?;

        // Make the rename itself durable.
        if let Ok(dir) = File::open(&self.meta_dir) {
            let _ = dir.sync_all();
        }

        debug!(bytes = buf.len(), "manifest persisted");
        Ok(())
    }
}

/// Loads and validates one manifest file.
fn load_manifest(path: &Path) -> Result<CatalogData, CatalogError> {
    let bytes = fs::read(path)?;
    if bytes.len() < 4 + 4 + 4 {
        return Err(CatalogError::Unreadable(format!(
            "{}: too short",
            path.display()
        )));
    }

    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let mut hasher = Crc32::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(CatalogError::Unreadable(format!(
            "{}: checksum mismatch",
            path.display()
        )));
    }

    if body[0..4] != MANIFEST_MAGIC {
        return Err(CatalogError::Unreadable(format!(
            "{}: bad magic",
            path.display()
        )));
    }
    let version = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    if version != MANIFEST_VERSION {
        return Err(CatalogError::Unreadable(format!(
            "{}: unsupported version {version}",
            path.display()
        )));
    }

    let (data, _) = encoding::decode_from_slice::<CatalogData>(&body[8..])?;
    Ok(data)
}
