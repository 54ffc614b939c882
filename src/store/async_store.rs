//! Asynchronous store: WAL-first writes and background workers.
//!
//! [`AsyncStore`] wraps the synchronous [`Store`] with two long-lived
//! OS threads:
//!
//! - the **apply worker** drains a bounded queue of WAL-durable
//!   records into the memtable and advances the `last_applied_seq`
//!   watermark;
//! - the **compaction worker** drains a job queue, running one
//!   compaction at a time with per-level locks and recorded job
//!   states.
//!
//! ## Write path
//!
//! `put`/`delete` acquire a timestamp, append to the WAL (durable per
//! config), then try a non-blocking store-lock apply. If the lock is
//! busy the record is enqueued; if the queue is full the writer falls
//! back to a timed lock acquire bounded by `apply_lock_timeout_ms`,
//! and as a last resort blocks on the queue so progress is never lost.
//! Writers never block on flush or compaction.
//!
//! ## Read-your-write
//!
//! [`AsyncStore::wait_for_seq`] polls the watermark, which every apply
//! path advances monotonically — once it passes a write's sequence,
//! subsequent reads observe that write.
//!
//! ## Shutdown
//!
//! `close()` flips the shutdown flag, enqueues sentinels, joins both
//! workers (they drain whatever is already queued first), then closes
//! the underlying store, which syncs the WAL last.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use tracing::{debug, error, info, warn};

use crate::compaction::l0_needs_compaction;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::record::{Key, Record, Seq, Timestamp, Value};

use super::clock::wall_clock_ns;
use super::{Store, StoreStats, validate_key};

/// Identifier of a scheduled compaction job.
pub type JobId = u64;

/// Poll interval for `wait_for_seq` / `wait_for_compaction`.
const WAIT_POLL: Duration = Duration::from_micros(200);

/// Backoff before requeueing a job whose level is already compacting.
const REQUEUE_BACKOFF: Duration = Duration::from_millis(10);

// ------------------------------------------------------------------------------------------------
// Job bookkeeping
// ------------------------------------------------------------------------------------------------

/// Lifecycle of a compaction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Queued, not yet picked up.
    Pending,
    /// Currently executing on the compaction worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error (see [`JobStatus::error`]).
    Failed,
}

/// Tracked state of one compaction job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    /// Job identifier.
    pub id: JobId,
    /// Level being compacted.
    pub level: usize,
    /// Current lifecycle state.
    pub state: JobState,
    /// Creation wall-clock time (ns since epoch).
    pub created_at: Timestamp,
    /// When the worker picked the job up.
    pub started_at: Option<Timestamp>,
    /// When the job reached a terminal state.
    pub finished_at: Option<Timestamp>,
    /// Captured error text for failed jobs.
    pub error: Option<String>,
}

/// Shared job table used by callers and both workers.
struct JobTable {
    jobs: Mutex<HashMap<JobId, JobStatus>>,
    next_id: AtomicU64,
}

impl JobTable {
    fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn create(&self, level: usize) -> JobId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let status = JobStatus {
            id,
            level,
            state: JobState::Pending,
            created_at: wall_clock_ns(),
            started_at: None,
            finished_at: None,
            error: None,
        };
        self.lock().insert(id, status);
        id
    }

    fn get(&self, id: JobId) -> Option<JobStatus> {
        self.lock().get(&id).cloned()
    }

    fn level_of(&self, id: JobId) -> Option<usize> {
        self.lock().get(&id).map(|j| j.level)
    }

    /// Whether any job for `level` is pending or running — used to
    /// avoid piling up duplicate background jobs.
    fn has_active(&self, level: usize) -> bool {
        self.lock()
            .values()
            .any(|j| j.level == level && matches!(j.state, JobState::Pending | JobState::Running))
    }

    fn set_running(&self, id: JobId) {
        if let Some(job) = self.lock().get_mut(&id) {
            job.state = JobState::Running;
            job.started_at = Some(wall_clock_ns());
        }
    }

    fn set_completed(&self, id: JobId) {
        if let Some(job) = self.lock().get_mut(&id) {
            job.state = JobState::Completed;
            job.finished_at = Some(wall_clock_ns());
        }
    }

    fn set_failed(&self, id: JobId, error: String) {
        if let Some(job) = self.lock().get_mut(&id) {
            job.state = JobState::Failed;
            job.finished_at = Some(wall_clock_ns());
            job.error = Some(error);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobStatus>> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ------------------------------------------------------------------------------------------------
// Seq watermark
// ------------------------------------------------------------------------------------------------

/// Contiguous `last_applied_seq` watermark.
///
/// Applies can complete out of order (inline fast path vs. queue), so
/// the public watermark only advances once *every* lower sequence has
/// been applied — otherwise `wait_for_seq(s)` could return true while
/// an earlier write is still invisible. Out-of-order completions park
/// in a min-heap until the gap below them closes.
struct SeqWatermark {
    /// Highest sequence with no unapplied sequence below it.
    applied: AtomicU64,
    /// Completed sequences waiting for the gap below them to close.
    pending: Mutex<BinaryHeap<Reverse<Seq>>>,
}

impl SeqWatermark {
    /// Starts with everything up to `base` considered applied (recovery
    /// replays the WAL into the memtable before workers start).
    fn new(base: Seq) -> Self {
        Self {
            applied: AtomicU64::new(base),
            pending: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Records that `seq` has been applied.
    fn note(&self, seq: Seq) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.push(Reverse(seq));

        let mut applied = self.applied.load(Ordering::SeqCst);
        while let Some(&Reverse(next)) = pending.peek() {
            if next != applied + 1 {
                break;
            }
            pending.pop();
            applied = next;
        }
        // Written under the pending lock, so updates stay ordered.
        self.applied.store(applied, Ordering::SeqCst);
    }

    fn get(&self) -> Seq {
        self.applied.load(Ordering::SeqCst)
    }
}

// ------------------------------------------------------------------------------------------------
// Worker messages
// ------------------------------------------------------------------------------------------------

enum ApplyMsg {
    /// A WAL-durable record awaiting memtable application.
    Entry { record: Record, seq: Seq },
    /// Hint that the memtable may be over the flush threshold.
    Flush,
    /// Stop after draining what is already queued.
    Shutdown,
}

enum CompactMsg {
    Job(JobId),
    Shutdown,
}

// ------------------------------------------------------------------------------------------------
// AsyncStore
// ------------------------------------------------------------------------------------------------

/// The asynchronous store handle.
pub struct AsyncStore {
    store: Arc<Store>,
    apply_tx: Sender<ApplyMsg>,
    compact_tx: Sender<CompactMsg>,
    watermark: Arc<SeqWatermark>,
    jobs: Arc<JobTable>,
    shutdown: Arc<AtomicBool>,
    apply_handle: Mutex<Option<JoinHandle<()>>>,
    compact_handle: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncStore {
    /// Opens the underlying store and starts both background workers.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let apply_queue_max = config.apply_queue_max;
        let max_levels = config.max_levels;
        let store = Arc::new(Store::open(config)?);

        let (apply_tx, apply_rx) = bounded(apply_queue_max);
        let (compact_tx, compact_rx) = unbounded();
        // Everything the WAL replayed at open is already in the
        // memtable; the fence starts past it.
        let watermark = Arc::new(SeqWatermark::new(store.recovered_seq()));
        let jobs = Arc::new(JobTable::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let apply_handle = {
            let ctx = ApplyWorker {
                store: Arc::clone(&store),
                rx: apply_rx,
                watermark: Arc::clone(&watermark),
                jobs: Arc::clone(&jobs),
                compact_tx: compact_tx.clone(),
            };
            thread::Builder::new()
                .name("stratumdb-apply".into())
                .spawn(move || ctx.run())
                .map_err(StoreError::Io)?
        };

        let compact_handle = {
            let ctx = CompactWorker {
                store: Arc::clone(&store),
                rx: compact_rx,
                requeue_tx: compact_tx.clone(),
                jobs: Arc::clone(&jobs),
                level_locks: (0..max_levels).map(|_| Mutex::new(())).collect(),
                shutdown: Arc::clone(&shutdown),
            };
            thread::Builder::new()
                .name("stratumdb-compact".into())
                .spawn(move || ctx.run())
                .map_err(StoreError::Io)?
        };

        Ok(Self {
            store,
            apply_tx,
            compact_tx,
            watermark,
            jobs,
            shutdown,
            apply_handle: Mutex::new(Some(apply_handle)),
            compact_handle: Mutex::new(Some(compact_handle)),
        })
    }

    /// WAL-first insert. Durable when this returns (per fsync config);
    /// visible once applied — immediately on the fast path, or after
    /// the apply worker drains the entry.
    pub fn put(&self, key: Key, value: Value) -> Result<Seq, StoreError> {
        self.write(key, Some(value))
    }

    /// WAL-first delete.
    pub fn delete(&self, key: Key) -> Result<Seq, StoreError> {
        self.write(key, None)
    }

    fn write(&self, key: Key, value: Option<Value>) -> Result<Seq, StoreError> {
        self.ensure_open()?;
        validate_key(&key)?;

        let record = Record {
            key,
            value,
            timestamp: self.store.next_timestamp(),
        };
        let seq = self.store.wal_append(&record)?;

        // Fast path: the store lock is free.
        if let Some(needs_flush) = self.store.try_apply_record(&record)? {
            self.note_applied(seq);
            if needs_flush {
                let _ = self.apply_tx.try_send(ApplyMsg::Flush);
            }
            return Ok(seq);
        }

        // Lock busy: hand the record to the apply worker.
        match self.apply_tx.try_send(ApplyMsg::Entry {
            record: record.clone(),
            seq,
        }) {
            Ok(()) => Ok(seq),
            Err(TrySendError::Full(msg)) => {
                // Queue full: bounded timed acquire, then block on the
                // queue as the last resort so the write is never lost.
                if self.timed_apply(&record, seq)? {
                    return Ok(seq);
                }
                self.apply_tx
                    .send(msg)
                    .map_err(|_| StoreError::Internal("apply queue closed".into()))?;
                Ok(seq)
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(StoreError::Internal("apply worker gone".into()))
            }
        }
    }

    /// Timed store-lock acquire bounded by `apply_lock_timeout_ms`.
    /// Returns `true` if the record was applied.
    fn timed_apply(&self, record: &Record, seq: Seq) -> Result<bool, StoreError> {
        let timeout = Duration::from_millis(self.store.config().apply_lock_timeout_ms);
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(needs_flush) = self.store.try_apply_record(record)? {
                self.note_applied(seq);
                if needs_flush {
                    let _ = self.apply_tx.try_send(ApplyMsg::Flush);
                }
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::yield_now();
        }
    }

    /// Point lookup; delegates to the sync read path.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>, StoreError> {
        self.store.get(key)
    }

    /// Point lookup with tombstone state and timestamp.
    pub fn get_with_meta(
        &self,
        key: &[u8],
    ) -> Result<Option<(Option<Value>, Timestamp)>, StoreError> {
        self.store.get_with_meta(key)
    }

    /// Ordered range scan; delegates to the sync read path.
    pub fn range(
        &self,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
    ) -> Result<Vec<(Key, Value)>, StoreError> {
        self.store.range(lo, hi)
    }

    /// Flushes the active memtable. Runs on the caller's thread.
    pub fn flush_memtable(&self) -> Result<bool, StoreError> {
        self.store.flush_memtable()
    }

    /// Snapshot of store statistics.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.store.stats()
    }

    /// The `last_applied_seq` watermark: the highest sequence such
    /// that every write at or below it has been applied.
    pub fn last_applied_seq(&self) -> Seq {
        self.watermark.get()
    }

    /// Blocks until every write with sequence ≤ `seq` is applied, or
    /// the timeout elapses. `true` means the fence holds: a subsequent
    /// `get` observes the write identified by `seq`.
    pub fn wait_for_seq(&self, seq: Seq, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.watermark.get() >= seq {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_POLL);
        }
    }

    /// Enqueues a compaction of `level` into `level + 1`. With `wait`
    /// the call also blocks (up to a generous internal timeout) for the
    /// job to reach a terminal state.
    pub fn schedule_compaction(&self, level: usize, wait: bool) -> Result<JobId, StoreError> {
        self.ensure_open()?;
        if level >= self.store.config().max_levels {
            return Err(StoreError::InvalidArgument(format!(
                "level {level} out of range"
            )));
        }

        let id = self.jobs.create(level);
        self.compact_tx
            .send(CompactMsg::Job(id))
            .map_err(|_| StoreError::Internal("compaction worker gone".into()))?;
        debug!(job = id, level, "compaction scheduled");

        if wait {
            self.wait_for_compaction(id, Duration::from_secs(600))?;
        }
        Ok(id)
    }

    /// Waits for a job to reach `Completed` or `Failed`. Returns the
    /// terminal state, or `None` on timeout (the job keeps running).
    pub fn wait_for_compaction(
        &self,
        id: JobId,
        timeout: Duration,
    ) -> Result<Option<JobState>, StoreError> {
        if self.jobs.get(id).is_none() {
            return Err(StoreError::InvalidArgument(format!("unknown job {id}")));
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.jobs.get(id)
                && matches!(status.state, JobState::Completed | JobState::Failed)
            {
                return Ok(Some(status.state));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(WAIT_POLL);
        }
    }

    /// Current status of a job, if known.
    pub fn job_status(&self, id: JobId) -> Option<JobStatus> {
        self.jobs.get(id)
    }

    /// Stops both workers (draining queued work), then closes the
    /// underlying store. Idempotent.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.apply_tx.send(ApplyMsg::Shutdown);
        let _ = self.compact_tx.send(CompactMsg::Shutdown);

        if let Ok(mut guard) = self.apply_handle.lock()
            && let Some(handle) = guard.take()
            && handle.join().is_err()
        {
            warn!("apply worker panicked");
        }
        if let Ok(mut guard) = self.compact_handle.lock()
            && let Some(handle) = guard.take()
            && handle.join().is_err()
        {
            warn!("compaction worker panicked");
        }

        self.store.close()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(StoreError::InvalidArgument("store is closed".into()));
        }
        self.store.ensure_open()
    }

    fn note_applied(&self, seq: Seq) {
        self.watermark.note(seq);
    }
}

impl Drop for AsyncStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "close on drop failed");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Apply worker
// ------------------------------------------------------------------------------------------------

struct ApplyWorker {
    store: Arc<Store>,
    rx: Receiver<ApplyMsg>,
    watermark: Arc<SeqWatermark>,
    jobs: Arc<JobTable>,
    compact_tx: Sender<CompactMsg>,
}

impl ApplyWorker {
    fn run(self) {
        info!("apply worker started");
        loop {
            match self.rx.recv() {
                Ok(ApplyMsg::Entry { record, seq }) => self.apply(record, seq),
                Ok(ApplyMsg::Flush) => self.maybe_flush(),
                Ok(ApplyMsg::Shutdown) | Err(_) => break,
            }
        }
        // Entries enqueued by writers racing close() still get applied.
        while let Ok(msg) = self.rx.try_recv() {
            if let ApplyMsg::Entry { record, seq } = msg {
                self.apply(record, seq);
            }
        }
        info!("apply worker stopped");
    }

    fn apply(&self, record: Record, seq: Seq) {
        // The store lock is held only for bounded work; briefly yield
        // and retry rather than blocking hard.
        let needs_flush = loop {
            match self.store.try_apply_record(&record) {
                Ok(Some(needs_flush)) => break needs_flush,
                Ok(None) => thread::yield_now(),
                Err(e) => {
                    error!(error = %e, "apply worker cannot apply record");
                    return;
                }
            }
        };
        self.watermark.note(seq);
        if needs_flush {
            self.maybe_flush();
        }
    }

    fn maybe_flush(&self) {
        match self.store.memtable_over_threshold() {
            Ok(true) => {}
            _ => return,
        }
        match self.store.flush_memtable() {
            Ok(flushed) => {
                if flushed {
                    self.schedule_l0_compaction_if_needed();
                }
            }
            Err(e) => error!(error = %e, "background flush failed"),
        }
    }

    /// Background picking policy: compact all of L0 into L1 once the
    /// L0 table count reaches the threshold.
    fn schedule_l0_compaction_if_needed(&self) {
        let Ok(count) = self.store.l0_table_count() else {
            return;
        };
        if l0_needs_compaction(count) && !self.jobs.has_active(0) {
            let id = self.jobs.create(0);
            if self.compact_tx.send(CompactMsg::Job(id)).is_ok() {
                debug!(job = id, l0_tables = count, "L0 compaction auto-scheduled");
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Compaction worker
// ------------------------------------------------------------------------------------------------

struct CompactWorker {
    store: Arc<Store>,
    rx: Receiver<CompactMsg>,
    requeue_tx: Sender<CompactMsg>,
    jobs: Arc<JobTable>,
    level_locks: Vec<Mutex<()>>,
    shutdown: Arc<AtomicBool>,
}

impl CompactWorker {
    fn run(self) {
        info!("compaction worker started");
        loop {
            match self.rx.recv() {
                Ok(CompactMsg::Job(id)) => self.execute(id, true),
                Ok(CompactMsg::Shutdown) | Err(_) => break,
            }
        }
        // Drain jobs that were queued before shutdown; no requeueing.
        while let Ok(msg) = self.rx.try_recv() {
            if let CompactMsg::Job(id) = msg {
                self.execute(id, false);
            }
        }
        info!("compaction worker stopped");
    }

    fn execute(&self, id: JobId, may_requeue: bool) {
        let Some(level) = self.jobs.level_of(id) else {
            return;
        };

        let Some(level_lock) = self.level_locks.get(level) else {
            self.jobs.set_failed(id, format!("level {level} out of range"));
            return;
        };

        // Serialize compaction within a level; requeue with a short
        // backoff when it is already busy.
        let guard = match level_lock.try_lock() {
            Ok(guard) => guard,
            Err(std::sync::TryLockError::WouldBlock) => {
                if may_requeue && !self.shutdown.load(Ordering::SeqCst) {
                    thread::sleep(REQUEUE_BACKOFF);
                    let _ = self.requeue_tx.send(CompactMsg::Job(id));
                } else {
                    self.jobs.set_failed(id, "level busy at shutdown".into());
                }
                return;
            }
            Err(std::sync::TryLockError::Poisoned(_)) => {
                self.jobs.set_failed(id, "level lock poisoned".into());
                return;
            }
        };

        self.jobs.set_running(id);
        // Merge and output I/O run outside the store lock; only the
        // catalog swap inside compact_level takes catalog-internal
        // locking.
        match self.store.compact_level(level) {
            Ok(_) => self.jobs.set_completed(id),
            Err(e) => {
                warn!(job = id, level, error = %e, "compaction job failed");
                self.jobs.set_failed(id, e.to_string());
            }
        }
        drop(guard);
    }
}
