//! Crash recovery: WAL replay, catalog reload, orphan cleanup.

use crate::store::Store;
use crate::store::tests::helpers::*;
use std::fs;
use tempfile::TempDir;

#[test]
fn unflushed_writes_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let store = Store::open(memtable_only_config(tmp.path())).unwrap();
        store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        store.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        store.delete(b"a".to_vec()).unwrap();
        // No flush, no close: simulate a crash by leaking the store.
        std::mem::forget(store);
    }

    let store = Store::open(memtable_only_config(tmp.path())).unwrap();
    assert_eq!(store.get(b"a").unwrap(), None);
    assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn flushed_and_unflushed_data_merge_after_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let store = Store::open(memtable_only_config(tmp.path())).unwrap();
        store.put(b"flushed".to_vec(), b"1".to_vec()).unwrap();
        store.flush_memtable().unwrap();
        store.put(b"buffered".to_vec(), b"2".to_vec()).unwrap();
        store.put(b"flushed".to_vec(), b"3".to_vec()).unwrap();
        std::mem::forget(store);
    }

    let store = Store::open(memtable_only_config(tmp.path())).unwrap();
    assert_eq!(store.get(b"buffered").unwrap(), Some(b"2".to_vec()));
    // The buffered overwrite beats the flushed version.
    assert_eq!(store.get(b"flushed").unwrap(), Some(b"3".to_vec()));
}

#[test]
fn timestamps_continue_increasing_after_reopen() {
    let tmp = TempDir::new().unwrap();
    let first_ts = {
        let store = Store::open(memtable_only_config(tmp.path())).unwrap();
        store.put(b"k".to_vec(), b"v1".to_vec()).unwrap();
        let (_, ts) = store.get_with_meta(b"k").unwrap().unwrap();
        std::mem::forget(store);
        ts
    };

    let store = Store::open(memtable_only_config(tmp.path())).unwrap();
    store.put(b"k".to_vec(), b"v2".to_vec()).unwrap();
    let (value, ts) = store.get_with_meta(b"k").unwrap().unwrap();
    assert_eq!(value, Some(b"v2".to_vec()));
    assert!(ts > first_ts, "post-reopen write must carry a later timestamp");
}

#[test]
fn orphaned_table_files_are_removed_at_open() {
    let tmp = TempDir::new().unwrap();
    {
        let store = Store::open(memtable_only_config(tmp.path())).unwrap();
        store.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        store.flush_memtable().unwrap();
        store.close().unwrap();
    }

    // Fabricate leftovers of a crashed flush: an unreferenced table and
    // a bare temporary.
    let sst_dir = tmp.path().join("sst");
    fs::write(sst_dir.join("sst-0-999.data"), b"orphan").unwrap();
    fs::write(sst_dir.join("sst-0-999.meta"), b"orphan").unwrap();
    fs::write(sst_dir.join("sst-0-1000.data.tmp"), b"half").unwrap();

    let store = Store::open(memtable_only_config(tmp.path())).unwrap();
    assert!(!sst_dir.join("sst-0-999.data").exists());
    assert!(!sst_dir.join("sst-0-999.meta").exists());
    assert!(!sst_dir.join("sst-0-1000.data.tmp").exists());
    assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn reopen_after_clean_close_sees_everything() {
    let tmp = TempDir::new().unwrap();
    {
        let store = Store::open(small_buffer_config(tmp.path())).unwrap();
        for i in 0..100u32 {
            store
                .put(format!("k{i:04}").into_bytes(), format!("v{i}").into_bytes())
                .unwrap();
        }
        store.close().unwrap();
    }

    let store = Store::open(small_buffer_config(tmp.path())).unwrap();
    for i in 0..100u32 {
        assert_eq!(
            store.get(format!("k{i:04}").as_bytes()).unwrap(),
            Some(format!("v{i}").into_bytes())
        );
    }
    let pairs = store.range(None, None).unwrap();
    assert_eq!(pairs.len(), 100);
}
