//! Merge/compaction engine: level L → L+1.
//!
//! A compaction k-way merges the input tables' full record streams,
//! keeps the greatest-timestamp record per key, optionally garbage-
//! collects expired tombstones, and writes the surviving records as
//! one or more tables at the target level (split at the configured
//! size).
//!
//! The compactor itself only produces files and an outcome description.
//! The store performs the atomic catalog swap and unlinks the inputs
//! afterwards, so a crash mid-compaction leaves the inputs referenced,
//! the outputs orphaned, and the orphans reclaimed at next open.
//!
//! ## Tombstone GC
//!
//! Tombstones are re-emitted so they keep shadowing older versions in
//! deeper levels — except when the target level is the deepest one and
//! the tombstone is older than the retention window, at which point
//! nothing below can resurface and the marker is dropped.

pub mod merge;

#[cfg(test)]
mod tests;

pub use merge::{LatestWins, MergeIterator, MergeSource};

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::record::Timestamp;
use crate::sstable::{SSTableError, SSTableMeta, SSTableReader, TableOptions, write_sorted_run};

/// Compact all of L0 into L1 once this many L0 tables accumulate.
pub const L0_COMPACTION_THRESHOLD: usize = 4;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by the compactor.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CompactionError {
    /// Reading an input or writing an output failed.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),
}

// ------------------------------------------------------------------------------------------------
// Parameters and outcome
// ------------------------------------------------------------------------------------------------

/// Per-run compaction parameters, derived from store configuration.
#[derive(Debug, Clone)]
pub struct CompactionParams {
    /// Level the outputs are written to.
    pub target_level: u32,

    /// Whether `target_level` is the deepest level — the only place
    /// where expired tombstones may be dropped.
    pub is_deepest_level: bool,

    /// Tombstones younger than this many seconds always survive.
    pub tombstone_retention_seconds: u64,

    /// Current time in nanoseconds, for tombstone age checks.
    pub now: Timestamp,
}

/// What a completed compaction produced and consumed.
#[derive(Debug)]
pub struct CompactionOutcome {
    /// Output descriptors, registered by the caller in one catalog swap.
    pub added: Vec<SSTableMeta>,

    /// Ids of the consumed input tables.
    pub removed_ids: Vec<u64>,

    /// Files of the consumed inputs, unlinked after the swap.
    pub removed_paths: Vec<PathBuf>,
}

// ------------------------------------------------------------------------------------------------
// Compaction
// ------------------------------------------------------------------------------------------------

/// Returns `true` when L0 has accumulated enough tables to warrant the
/// default L0 → L1 compaction.
pub fn l0_needs_compaction(l0_table_count: usize) -> bool {
    l0_table_count >= L0_COMPACTION_THRESHOLD
}

/// Merges `inputs` into fresh tables at `params.target_level`.
///
/// Returns `Ok(None)` when there is nothing to do. Output files are
/// built under `.tmp` names and published by the table writer; the
/// catalog swap is the caller's job.
pub fn compact(
    sst_dir: &Path,
    inputs: &[SSTableMeta],
    params: &CompactionParams,
    opts: &TableOptions,
    next_id: impl FnMut() -> u64,
) -> Result<Option<CompactionOutcome>, CompactionError> {
    if inputs.is_empty() {
        debug!(target_level = params.target_level, "compaction: no inputs, skipping");
        return Ok(None);
    }

    info!(
        inputs = inputs.len(),
        target_level = params.target_level,
        deepest = params.is_deepest_level,
        "compaction started"
    );

    // Materialize each input. Tables are bounded by sstable_max_bytes,
    // so this holds at most one level's worth of records.
    let mut sources = Vec::with_capacity(inputs.len());
    for meta in inputs {
        let reader = SSTableReader::open(meta)?;
        let records = reader.read_all()?;
        sources.push(MergeSource::new(records, meta.level, meta.id));
    }

    let retention_ns = params
        .tombstone_retention_seconds
        .saturating_mul(1_000_000_000);
    let drop_expired = params.is_deepest_level;
    let now = params.now;

    let survivors = LatestWins::new(MergeIterator::new(sources)).filter(move |record| {
        if !record.is_tombstone() {
            return true;
        }
        let expired = now.saturating_sub(record.timestamp) > retention_ns;
        !(drop_expired && expired)
    });

    let added = write_sorted_run(sst_dir, params.target_level, opts, survivors, next_id)?;

    let removed_ids: Vec<u64> = inputs.iter().map(|t| t.id).collect();
    let removed_paths: Vec<PathBuf> = inputs
        .iter()
        .flat_map(|t| [t.data_path.clone(), t.meta_path.clone()])
        .collect();

    info!(
        outputs = added.len(),
        removed = removed_ids.len(),
        "compaction finished"
    );

    Ok(Some(CompactionOutcome {
        added,
        removed_ids,
        removed_paths,
    }))
}
