//! Administrative compaction through the sync store.

use crate::store::Store;
use crate::store::tests::helpers::*;
use crate::config::StoreConfig;
use tempfile::TempDir;

#[test]
fn compact_l0_collapses_duplicates_into_l1() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(memtable_only_config(tmp.path())).unwrap();

    // Three generations of the same key across three L0 tables.
    for value in ["1", "2", "3"] {
        store.put(b"x".to_vec(), value.as_bytes().to_vec()).unwrap();
        store.flush_memtable().unwrap();
    }
    assert_eq!(store.stats().unwrap().levels[0].tables, 3);

    assert!(store.compact_level(0).unwrap());

    let stats = store.stats().unwrap();
    assert_eq!(stats.levels[0].tables, 0);
    assert_eq!(stats.levels[1].tables, 1);
    assert_eq!(store.get(b"x").unwrap(), Some(b"3".to_vec()));

    // Input files are gone from disk; only the output remains.
    let data_files = std::fs::read_dir(tmp.path().join("sst"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                == Some("data")
        })
        .count();
    assert_eq!(data_files, 1);
}

#[test]
fn compacting_an_empty_level_is_a_noop() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(memtable_only_config(tmp.path())).unwrap();
    assert!(!store.compact_level(0).unwrap());
    assert!(!store.compact_level(2).unwrap());
}

#[test]
fn compact_level_out_of_range_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(memtable_only_config(tmp.path())).unwrap();
    assert!(store.compact_level(99).is_err());
}

#[test]
fn successive_compactions_merge_with_target_level() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(memtable_only_config(tmp.path())).unwrap();

    store.put(b"a".to_vec(), b"old-a".to_vec()).unwrap();
    store.put(b"b".to_vec(), b"old-b".to_vec()).unwrap();
    store.flush_memtable().unwrap();
    store.compact_level(0).unwrap();

    // Second round overlaps the L1 table produced above.
    store.put(b"b".to_vec(), b"new-b".to_vec()).unwrap();
    store.put(b"c".to_vec(), b"new-c".to_vec()).unwrap();
    store.flush_memtable().unwrap();
    store.compact_level(0).unwrap();

    // L1 stays non-overlapping: one merged table.
    let stats = store.stats().unwrap();
    assert_eq!(stats.levels[1].tables, 1);
    assert_eq!(store.get(b"a").unwrap(), Some(b"old-a".to_vec()));
    assert_eq!(store.get(b"b").unwrap(), Some(b"new-b".to_vec()));
    assert_eq!(store.get(b"c").unwrap(), Some(b"new-c".to_vec()));
}

#[test]
fn expired_tombstone_vanishes_at_deepest_level() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig {
        max_levels: 2,
        tombstone_retention_seconds: 0,
        ..memtable_only_config(tmp.path())
    };
    let store = Store::open(config).unwrap();

    store.put(b"d".to_vec(), b"doomed".to_vec()).unwrap();
    store.delete(b"d".to_vec()).unwrap();
    store.flush_memtable().unwrap();

    // L0 → L1 with max_levels = 2: the target is the deepest level and
    // retention is zero, so the tombstone (and the value it shadows)
    // disappear entirely.
    assert!(store.compact_level(0).unwrap());

    assert_eq!(store.get(b"d").unwrap(), None);
    let stats = store.stats().unwrap();
    let total_tables: usize = stats.levels.iter().map(|l| l.tables).sum();
    assert_eq!(total_tables, 0, "no record for the key should remain on disk");
}

#[test]
fn compaction_preserves_tombstones_above_deepest_level() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig {
        max_levels: 4,
        tombstone_retention_seconds: 0,
        ..memtable_only_config(tmp.path())
    };
    let store = Store::open(config).unwrap();

    store.put(b"d".to_vec(), b"v".to_vec()).unwrap();
    store.delete(b"d".to_vec()).unwrap();
    store.flush_memtable().unwrap();
    store.compact_level(0).unwrap();

    // L1 is not the deepest of four levels; the tombstone must survive
    // so deeper duplicates stay shadowed.
    assert_eq!(store.get(b"d").unwrap(), None);
    let stats = store.stats().unwrap();
    assert_eq!(stats.levels[1].tables, 1);
}

#[test]
fn deepest_level_self_compaction_rewrites_in_place() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig {
        max_levels: 2,
        ..memtable_only_config(tmp.path())
    };
    let store = Store::open(config).unwrap();

    store.put(b"k".to_vec(), b"v".to_vec()).unwrap();
    store.flush_memtable().unwrap();
    store.compact_level(0).unwrap();
    assert_eq!(store.stats().unwrap().levels[1].tables, 1);

    // Compacting the deepest level targets itself.
    assert!(store.compact_level(1).unwrap());
    assert_eq!(store.stats().unwrap().levels[1].tables, 1);
    assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
}
