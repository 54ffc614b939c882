//! Async store: WAL-first writes, the seq fence, and background jobs.

use crate::store::{AsyncStore, JobState};
use crate::store::tests::helpers::*;
use crate::config::StoreConfig;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn async_config(dir: &std::path::Path) -> StoreConfig {
    init_tracing();
    // Defaults: large memtable, so tests control flushing explicitly.
    StoreConfig::new(dir)
}

#[test]
fn writes_are_visible_after_seq_fence() {
    let tmp = TempDir::new().unwrap();
    let store = AsyncStore::open(async_config(tmp.path())).unwrap();

    let mut last_seq = 0;
    for i in 0..100u32 {
        last_seq = store
            .put(format!("k{i:03}").into_bytes(), format!("v{i}").into_bytes())
            .unwrap();
    }

    assert!(store.wait_for_seq(last_seq, Duration::from_secs(5)));
    for i in 0..100u32 {
        assert_eq!(
            store.get(format!("k{i:03}").as_bytes()).unwrap(),
            Some(format!("v{i}").into_bytes())
        );
    }
    store.close().unwrap();
}

#[test]
fn watermark_is_monotonic() {
    let tmp = TempDir::new().unwrap();
    let store = AsyncStore::open(async_config(tmp.path())).unwrap();

    let mut seen = 0;
    for i in 0..50u32 {
        store.put(format!("k{i}").into_bytes(), b"v".to_vec()).unwrap();
        let now = store.last_applied_seq();
        assert!(now >= seen, "watermark went backwards: {seen} -> {now}");
        seen = now;
    }
    store.close().unwrap();
}

#[test]
fn wait_for_seq_times_out_for_future_seq() {
    let tmp = TempDir::new().unwrap();
    let store = AsyncStore::open(async_config(tmp.path())).unwrap();

    store.put(b"k".to_vec(), b"v".to_vec()).unwrap();
    assert!(!store.wait_for_seq(1_000_000, Duration::from_millis(50)));
    store.close().unwrap();
}

#[test]
fn concurrent_writers_make_progress() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig {
        apply_queue_max: 8, // tiny queue to exercise the fallback paths
        apply_lock_timeout_ms: 20,
        ..async_config(tmp.path())
    };
    let store = Arc::new(AsyncStore::open(config).unwrap());

    let mut handles = Vec::new();
    for t in 0..4 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            let mut last = 0;
            for i in 0..250u32 {
                last = store
                    .put(
                        format!("t{t}-k{i:04}").into_bytes(),
                        format!("t{t}-v{i}").into_bytes(),
                    )
                    .unwrap();
            }
            last
        }));
    }

    let max_seq = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .max()
        .unwrap();
    assert!(store.wait_for_seq(max_seq, Duration::from_secs(10)));

    for t in 0..4 {
        for i in 0..250u32 {
            assert_eq!(
                store.get(format!("t{t}-k{i:04}").as_bytes()).unwrap(),
                Some(format!("t{t}-v{i}").into_bytes()),
                "t{t}-k{i:04} must be readable"
            );
        }
    }
    store.close().unwrap();
}

#[test]
fn scheduled_compaction_completes_and_is_tracked() {
    let tmp = TempDir::new().unwrap();
    let store = AsyncStore::open(async_config(tmp.path())).unwrap();

    store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    store.flush_memtable().unwrap();
    store.put(b"a".to_vec(), b"2".to_vec()).unwrap();
    store.flush_memtable().unwrap();

    let job = store.schedule_compaction(0, false).unwrap();
    let state = store
        .wait_for_compaction(job, Duration::from_secs(10))
        .unwrap();
    assert_eq!(state, Some(JobState::Completed));

    let status = store.job_status(job).unwrap();
    assert_eq!(status.level, 0);
    assert!(status.started_at.is_some());
    assert!(status.finished_at.is_some());
    assert!(status.error.is_none());

    assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));
    store.close().unwrap();
}

#[test]
fn schedule_with_wait_blocks_until_done() {
    let tmp = TempDir::new().unwrap();
    let store = AsyncStore::open(async_config(tmp.path())).unwrap();

    store.put(b"k".to_vec(), b"v".to_vec()).unwrap();
    store.flush_memtable().unwrap();

    let job = store.schedule_compaction(0, true).unwrap();
    let status = store.job_status(job).unwrap();
    assert!(matches!(
        status.state,
        JobState::Completed | JobState::Failed
    ));
    assert_eq!(status.state, JobState::Completed);
    store.close().unwrap();
}

#[test]
fn unknown_job_is_an_error_and_out_of_range_level_rejected() {
    let tmp = TempDir::new().unwrap();
    let store = AsyncStore::open(async_config(tmp.path())).unwrap();

    assert!(store.wait_for_compaction(42, Duration::from_millis(10)).is_err());
    assert!(store.schedule_compaction(99, false).is_err());
    assert!(store.job_status(7).is_none());
    store.close().unwrap();
}

#[test]
fn close_drains_and_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let store = AsyncStore::open(async_config(tmp.path())).unwrap();
        let mut last = 0;
        for i in 0..500u32 {
            last = store
                .put(format!("k{i:04}").into_bytes(), b"v".to_vec())
                .unwrap();
        }
        // Close without an explicit fence: the workers drain first.
        let _ = last;
        store.close().unwrap();
        store.close().unwrap(); // idempotent
    }

    let store = AsyncStore::open(async_config(tmp.path())).unwrap();
    for i in 0..500u32 {
        assert_eq!(
            store.get(format!("k{i:04}").as_bytes()).unwrap(),
            Some(b"v".to_vec()),
        );
    }
    store.close().unwrap();
}

#[test]
fn writes_during_compaction_do_not_stall() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig {
        apply_lock_timeout_ms: 100,
        ..async_config(tmp.path())
    };
    let store = Arc::new(AsyncStore::open(config).unwrap());

    // Seed a few L0 tables to give the compactor real work.
    for round in 0..3 {
        for i in 0..100u32 {
            store
                .put(format!("seed-{round}-{i:04}").into_bytes(), vec![b'x'; 128])
                .unwrap();
        }
        store.flush_memtable().unwrap();
    }

    let job = store.schedule_compaction(0, false).unwrap();

    let mut last_seq = 0;
    for i in 0..1000u32 {
        last_seq = store
            .put(format!("live-{i:05}").into_bytes(), b"v".to_vec())
            .unwrap();
    }

    assert!(store.wait_for_seq(last_seq, Duration::from_secs(10)));
    store
        .wait_for_compaction(job, Duration::from_secs(30))
        .unwrap();

    for i in 0..1000u32 {
        assert_eq!(
            store.get(format!("live-{i:05}").as_bytes()).unwrap(),
            Some(b"v".to_vec())
        );
    }
    store.close().unwrap();
}
