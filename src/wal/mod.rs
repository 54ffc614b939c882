//! Write-ahead log: framed, CRC-protected, crash-safe append.
//!
//! Every mutation is appended here before it is applied to the
//! memtable. On reopen the segments are replayed in creation order to
//! rebuild the in-memory state, so an acknowledged write survives any
//! crash (subject to the configured fsync policy).
//!
//! # Frame layout (bit-exact, little-endian)
//!
//! ```text
//! [u32 magic = 0x4C534D01]
//! [u64 key_len][key bytes]
//! [u64 value_len][value bytes]     value_len = 0 for tombstones
//! [u64 timestamp]
//! [u8  op]                         0 = PUT, 1 = DELETE
//! [u32 crc32]                      over key_len .. op inclusive
//! ```
//!
//! The op byte, not the value length, decides whether a record is a
//! tombstone — an empty-value put round-trips as an empty value.
//!
//! # Segments
//!
//! Segments are named `wal-<nnnnnn>.wal` and rotate once the active
//! file exceeds the configured byte threshold. Open always rotates to
//! a fresh segment before accepting appends, so a segment that ended
//! in a torn frame is never appended to.
//!
//! # Replay tolerance
//!
//! - A truncated trailing frame is skipped silently — the normal shape
//!   of a crash mid-append.
//! - A bad CRC or bad magic after at least one valid frame terminates
//!   that segment with a warning; replay continues with the next
//!   segment.
//! - A non-empty segment whose very first frame has invalid magic is
//!   wholly unreadable and surfaces as [`WalError::Corruption`].

#[cfg(test)]
mod tests;

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::record::{OP_DELETE, OP_PUT, Record, Seq};

/// Frame magic, written little-endian at the start of every record.
pub const WAL_MAGIC: u32 = 0x4C53_4D01;

/// Upper bound on a single key or value accepted by the WAL (256 MiB).
/// A decoded length beyond this is treated as corruption during replay
/// and rejected outright during append.
const MAX_PART_LEN: u64 = 256 * 1024 * 1024;

/// Fixed frame overhead: magic + key_len + value_len + ts + op + crc.
const FRAME_OVERHEAD: usize = 4 + 8 + 8 + 8 + 1 + 4;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A segment is wholly unreadable: its first frame has invalid
    /// magic, so nothing in it can be trusted.
    #[error("WAL segment {segment} unreadable: {detail}")]
    Corruption {
        /// Segment number of the damaged file.
        segment: u64,
        /// What failed.
        detail: String,
    },

    /// Key or value exceeds the per-part size limit.
    #[error("WAL record part of {0} bytes exceeds limit")]
    RecordTooLarge(usize),
}

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// WAL behavior knobs, derived from the store configuration.
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// fsync after every append when true; otherwise sync happens at
    /// rotation, explicit [`Wal::sync`], and close.
    pub flush_every_write: bool,

    /// Rotate the active segment once it exceeds this many bytes.
    pub rotate_bytes: u64,
}

// ------------------------------------------------------------------------------------------------
// Wal
// ------------------------------------------------------------------------------------------------

/// Append-side state of the active segment.
struct ActiveSegment {
    file: File,
    segment: u64,
    written: u64,
}

/// The write-ahead log: one directory of rotating segments.
///
/// Thread-safe: appends serialize on an internal mutex; the returned
/// [`Seq`] values reflect the actual on-disk append order.
pub struct Wal {
    dir: PathBuf,
    opts: WalOptions,
    inner: Mutex<ActiveSegment>,
    next_seq: AtomicU64,
}

impl Wal {
    /// Opens the WAL directory, replays all segments in creation order,
    /// and prepares a fresh active segment for appends.
    ///
    /// Returns the WAL handle and the replayed records in append order,
    /// each paired with its reassigned sequence number.
    pub fn open(
        dir: impl AsRef<Path>,
        opts: WalOptions,
    ) -> Result<(Self, Vec<(Record, Seq)>), WalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut segments = list_segments(&dir)?;
        segments.sort_by_key(|(seg, _)| *seg);

        let mut replayed = Vec::new();
        let mut seq: Seq = 0;
        for (segment, path) in &segments {
            let records = replay_segment(path, *segment)?;
            for record in records {
                seq += 1;
                replayed.push((record, seq));
            }
        }

        // Never append to a segment that may end in a torn frame.
        let active_segment = segments.last().map_or(0, |(seg, _)| seg + 1);
        let file = open_segment(&dir, active_segment)?;

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            replayed = replayed.len(),
            active_segment,
            "WAL opened"
        );

        Ok((
            Self {
                dir,
                opts,
                inner: Mutex::new(ActiveSegment {
                    file,
                    segment: active_segment,
                    written: 0,
                }),
                next_seq: AtomicU64::new(seq + 1),
            },
            replayed,
        ))
    }

    /// Appends one record, returning its sequence number.
    ///
    /// The frame is fully written before the sequence is handed out; if
    /// `flush_every_write` is set the record is fsynced before return.
    pub fn append(&self, record: &Record) -> Result<Seq, WalError> {
        if record.key.len() as u64 > MAX_PART_LEN {
            return Err(WalError::RecordTooLarge(record.key.len()));
        }
        if let Some(value) = &record.value
            && value.len() as u64 > MAX_PART_LEN
        {
            return Err(WalError::RecordTooLarge(value.len()));
        }

        let frame = encode_frame(record);

        let mut inner = lock_inner(&self.inner)?;
        if inner.written >= self.opts.rotate_bytes {
            self.rotate_locked(&mut inner)?;
        }

        inner.file.write_all(&frame)?;
        inner.written += frame.len() as u64;
        if self.opts.flush_every_write {
            inner.file.sync_data()?;
        }

        // Taken under the lock so sequence order matches append order.
        Ok(self.next_seq.fetch_add(1, Ordering::SeqCst))
    }

    /// Fsyncs the active segment. Idempotent.
    pub fn sync(&self) -> Result<(), WalError> {
        let inner = lock_inner(&self.inner)?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Syncs the current segment and switches appends to a fresh one.
    /// Returns the new segment number.
    pub fn rotate(&self) -> Result<u64, WalError> {
        let mut inner = lock_inner(&self.inner)?;
        self.rotate_locked(&mut inner)?;
        Ok(inner.segment)
    }

    /// Removes all segments numbered strictly below `segment`.
    ///
    /// Called after a flush has durably moved the data those segments
    /// protect into an SSTable registered in the catalog.
    pub fn remove_segments_below(&self, segment: u64) -> Result<(), WalError> {
        for (seg, path) in list_segments(&self.dir)? {
            if seg < segment {
                fs::remove_file(&path)?;
                debug!(segment = seg, path = %path.display(), "WAL segment pruned");
            }
        }
        Ok(())
    }

    /// Current active segment number.
    pub fn active_segment(&self) -> Result<u64, WalError> {
        Ok(lock_inner(&self.inner)?.segment)
    }

    fn rotate_locked(&self, inner: &mut ActiveSegment) -> Result<(), WalError> {
        inner.file.sync_data()?;
        let next = inner.segment + 1;
        inner.file = open_segment(&self.dir, next)?;
        inner.segment = next;
        inner.written = 0;
        debug!(segment = next, "WAL rotated");
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.lock()
            && let Err(e) = inner.file.sync_data()
        {
            warn!(error = %e, "WAL sync failed on drop");
        }
    }
}

fn lock_inner(
    inner: &Mutex<ActiveSegment>,
) -> Result<std::sync::MutexGuard<'_, ActiveSegment>, WalError> {
    inner
        .lock()
        .map_err(|_| WalError::Io(io::Error::other("WAL mutex poisoned")))
}

// ------------------------------------------------------------------------------------------------
// Frame codec
// ------------------------------------------------------------------------------------------------

/// Encodes one record into its on-disk frame.
fn encode_frame(record: &Record) -> Vec<u8> {
    let value: &[u8] = record.value.as_deref().unwrap_or(&[]);
    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + record.key.len() + value.len());

    frame.extend_from_slice(&WAL_MAGIC.to_le_bytes());

    let payload_start = frame.len();
    frame.extend_from_slice(&(record.key.len() as u64).to_le_bytes());
    frame.extend_from_slice(&record.key);
    frame.extend_from_slice(&(value.len() as u64).to_le_bytes());
    frame.extend_from_slice(value);
    frame.extend_from_slice(&record.timestamp.to_le_bytes());
    frame.push(record.op());

    let mut hasher = Crc32::new();
    hasher.update(&frame[payload_start..]);
    frame.extend_from_slice(&hasher.finalize().to_le_bytes());

    frame
}

/// How a segment replay ended.
enum SegmentEnd {
    /// Clean end of file on a frame boundary.
    Clean,
    /// A torn trailing frame — the normal crash shape. Skipped silently.
    TruncatedTail,
    /// A complete but invalid frame mid-segment. Logged by the caller.
    Corrupt(String),
}

/// Replays one segment, returning every fully-valid record in order.
fn replay_segment(path: &Path, segment: u64) -> Result<Vec<Record>, WalError> {
    let bytes = fs::read(path)?;
    let mut records = Vec::new();
    let mut pos = 0usize;

    let end = loop {
        match parse_frame(&bytes[pos..]) {
            FrameResult::Done => break SegmentEnd::Clean,
            FrameResult::Truncated => break SegmentEnd::TruncatedTail,
            FrameResult::BadMagic(detail) => {
                // Invalid magic on the very first frame means the whole
                // segment is untrustworthy; later frames merely end it.
                if pos == 0 {
                    return Err(WalError::Corruption { segment, detail });
                }
                break SegmentEnd::Corrupt(detail);
            }
            FrameResult::Invalid(detail) => break SegmentEnd::Corrupt(detail),
            FrameResult::Frame { record, consumed } => {
                records.push(record);
                pos += consumed;
            }
        }
    };

    match end {
        SegmentEnd::Clean => {}
        SegmentEnd::TruncatedTail => {
            debug!(segment, offset = pos, "WAL segment ends in torn frame, skipped");
        }
        SegmentEnd::Corrupt(detail) => {
            warn!(
                segment,
                offset = pos,
                detail = %detail,
                "WAL mid-segment corruption, remainder of segment discarded"
            );
        }
    }

    Ok(records)
}

/// Outcome of parsing a single frame from the front of `buf`.
enum FrameResult {
    /// `buf` is empty — clean segment end.
    Done,
    /// The frame's bytes are not all present.
    Truncated,
    /// The frame does not start with the expected magic.
    BadMagic(String),
    /// The frame is complete but fails validation.
    Invalid(String),
    /// A valid frame.
    Frame { record: Record, consumed: usize },
}

fn parse_frame(buf: &[u8]) -> FrameResult {
    if buf.is_empty() {
        return FrameResult::Done;
    }
    if buf.len() < 4 {
        return FrameResult::Truncated;
    }

    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != WAL_MAGIC {
        return FrameResult::BadMagic(format!("bad magic 0x{magic:08X}"));
    }

    let mut pos = 4usize;
    let Some(key_len) = read_u64(buf, &mut pos) else {
        return FrameResult::Truncated;
    };
    if key_len > MAX_PART_LEN {
        return FrameResult::Invalid(format!("key length {key_len} exceeds limit"));
    }
    let Some(key) = read_bytes(buf, &mut pos, key_len as usize) else {
        return FrameResult::Truncated;
    };
    let key = key.to_vec();

    let Some(value_len) = read_u64(buf, &mut pos) else {
        return FrameResult::Truncated;
    };
    if value_len > MAX_PART_LEN {
        return FrameResult::Invalid(format!("value length {value_len} exceeds limit"));
    }
    let Some(value) = read_bytes(buf, &mut pos, value_len as usize) else {
        return FrameResult::Truncated;
    };
    let value = value.to_vec();

    let Some(timestamp) = read_u64(buf, &mut pos) else {
        return FrameResult::Truncated;
    };
    if pos >= buf.len() {
        return FrameResult::Truncated;
    }
    let op = buf[pos];
    pos += 1;

    let Some(stored_crc) = read_u32(buf, &mut pos) else {
        return FrameResult::Truncated;
    };

    let mut hasher = Crc32::new();
    hasher.update(&buf[4..pos - 4]);
    if hasher.finalize() != stored_crc {
        return FrameResult::Invalid("CRC mismatch".into());
    }

    let record = match op {
        OP_PUT => Record {
            key,
            value: Some(value),
            timestamp,
        },
        OP_DELETE => Record {
            key,
            value: None,
            timestamp,
        },
        other => return FrameResult::Invalid(format!("unknown op byte 0x{other:02X}")),
    };

    FrameResult::Frame {
        record,
        consumed: pos,
    }
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let bytes = buf.get(*pos..*pos + 8)?;
    *pos += 8;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Option<u32> {
    let bytes = buf.get(*pos..*pos + 4)?;
    *pos += 4;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_bytes<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Option<&'a [u8]> {
    let bytes = buf.get(*pos..*pos + len)?;
    *pos += len;
    Some(bytes)
}

// ------------------------------------------------------------------------------------------------
// Segment files
// ------------------------------------------------------------------------------------------------

/// Formats the file name of segment `n`.
fn segment_file_name(segment: u64) -> String {
    format!("wal-{segment:06}.wal")
}

fn open_segment(dir: &Path, segment: u64) -> Result<File, WalError> {
    let path = dir.join(segment_file_name(segment));
    Ok(OpenOptions::new().create(true).append(true).open(&path)?)
}

/// Lists `(segment_number, path)` for every WAL segment in `dir`.
fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>, WalError> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(seg) = name
            .strip_prefix("wal-")
            .and_then(|s| s.strip_suffix(".wal"))
            .and_then(|s| s.parse::<u64>().ok())
        {
            segments.push((seg, path));
        }
    }
    Ok(segments)
}
