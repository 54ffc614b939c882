//! Memtable basics: put/delete/get, last-writer-wins, sizing.

use crate::memtable::Memtable;
use crate::record::Record;

#[test]
fn get_absent_key_is_none() {
    let mem = Memtable::new();
    assert!(mem.get(b"missing").is_none());
    assert!(mem.is_empty());
}

#[test]
fn put_then_get() {
    let mem = Memtable::new();
    mem.put(b"k".to_vec(), b"v".to_vec(), 10);

    let entry = mem.get(b"k").unwrap();
    assert_eq!(entry.value, Some(b"v".to_vec()));
    assert_eq!(entry.timestamp, 10);
    assert_eq!(mem.len(), 1);
}

#[test]
fn tombstone_is_present_not_absent() {
    let mem = Memtable::new();
    mem.put(b"k".to_vec(), b"v".to_vec(), 10);
    mem.delete(b"k".to_vec(), 11);

    let entry = mem.get(b"k").unwrap();
    assert_eq!(entry.value, None);
    assert_eq!(entry.timestamp, 11);
    // A tombstone still occupies a slot.
    assert_eq!(mem.len(), 1);
}

#[test]
fn later_timestamp_replaces_earlier() {
    let mem = Memtable::new();
    mem.put(b"k".to_vec(), b"old".to_vec(), 10);
    mem.put(b"k".to_vec(), b"new".to_vec(), 20);

    assert_eq!(mem.get(b"k").unwrap().value, Some(b"new".to_vec()));
    assert_eq!(mem.len(), 1);
}

#[test]
fn stale_apply_is_ignored() {
    // The async apply path can deliver records out of order; an older
    // timestamp must not clobber a newer entry.
    let mem = Memtable::new();
    mem.apply(&Record::put(b"k".to_vec(), b"new".to_vec(), 20));
    mem.apply(&Record::put(b"k".to_vec(), b"old".to_vec(), 10));

    assert_eq!(mem.get(b"k").unwrap().value, Some(b"new".to_vec()));
}

#[test]
fn equal_timestamp_later_apply_wins() {
    let mem = Memtable::new();
    mem.apply(&Record::put(b"k".to_vec(), b"first".to_vec(), 10));
    mem.apply(&Record::put(b"k".to_vec(), b"second".to_vec(), 10));

    assert_eq!(mem.get(b"k").unwrap().value, Some(b"second".to_vec()));
}

#[test]
fn reinsert_after_delete_yields_later_write() {
    let mem = Memtable::new();
    mem.put(b"k".to_vec(), b"v1".to_vec(), 10);
    mem.delete(b"k".to_vec(), 11);
    mem.put(b"k".to_vec(), b"v2".to_vec(), 12);

    assert_eq!(mem.get(b"k").unwrap().value, Some(b"v2".to_vec()));
}

#[test]
fn empty_value_is_a_value() {
    let mem = Memtable::new();
    mem.put(b"k".to_vec(), Vec::new(), 10);

    let entry = mem.get(b"k").unwrap();
    assert_eq!(entry.value, Some(Vec::new()));
}

#[test]
fn size_is_monotonic_under_insertion() {
    let mem = Memtable::new();
    let mut last = mem.size_bytes();
    for i in 0..100u64 {
        // Overwrite the same key with shrinking values; the accounting
        // must still never decrease.
        let value = vec![0u8; (100 - i) as usize];
        mem.put(b"k".to_vec(), value, i);
        let now = mem.size_bytes();
        assert!(now >= last, "size shrank from {last} to {now}");
        last = now;
    }
}

#[test]
fn size_reflects_key_and_value_bytes() {
    let mem = Memtable::new();
    assert_eq!(mem.size_bytes(), 0);
    mem.put(vec![0u8; 10], vec![0u8; 90], 1);
    assert!(mem.size_bytes() >= 100);
}

#[test]
fn max_timestamp_tracks_entries() {
    let mem = Memtable::new();
    assert_eq!(mem.max_timestamp(), 0);
    mem.put(b"a".to_vec(), b"1".to_vec(), 5);
    mem.delete(b"b".to_vec(), 9);
    mem.put(b"c".to_vec(), b"3".to_vec(), 7);
    assert_eq!(mem.max_timestamp(), 9);
}
