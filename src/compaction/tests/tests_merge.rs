//! Merge ordering and last-writer-wins resolution.

use crate::compaction::merge::{LatestWins, MergeIterator, MergeSource};
use crate::record::Record;

fn keys(records: &[Record]) -> Vec<Vec<u8>> {
    records.iter().map(|r| r.key.clone()).collect()
}

#[test]
fn merges_disjoint_sources_in_key_order() {
    let a = vec![
        Record::put(b"a".to_vec(), b"1".to_vec(), 1),
        Record::put(b"c".to_vec(), b"3".to_vec(), 1),
    ];
    let b = vec![
        Record::put(b"b".to_vec(), b"2".to_vec(), 1),
        Record::put(b"d".to_vec(), b"4".to_vec(), 1),
    ];

    let merged: Vec<_> = MergeIterator::new(vec![
        MergeSource::new(a, 0, 1),
        MergeSource::new(b, 0, 2),
    ])
    .collect();

    assert_eq!(
        keys(&merged),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
    );
}

#[test]
fn greater_timestamp_pops_first_for_equal_keys() {
    let old = vec![Record::put(b"k".to_vec(), b"old".to_vec(), 10)];
    let new = vec![Record::put(b"k".to_vec(), b"new".to_vec(), 20)];

    let merged: Vec<_> = MergeIterator::new(vec![
        MergeSource::new(old, 1, 1),
        MergeSource::new(new, 0, 2),
    ])
    .collect();

    assert_eq!(merged[0].value, Some(b"new".to_vec()));
    assert_eq!(merged[1].value, Some(b"old".to_vec()));
}

#[test]
fn equal_timestamps_break_by_level_then_id() {
    let l1 = vec![Record::put(b"k".to_vec(), b"level1".to_vec(), 10)];
    let l0_old = vec![Record::put(b"k".to_vec(), b"l0-id3".to_vec(), 10)];
    let l0_new = vec![Record::put(b"k".to_vec(), b"l0-id7".to_vec(), 10)];

    let merged: Vec<_> = MergeIterator::new(vec![
        MergeSource::new(l1, 1, 1),
        MergeSource::new(l0_old, 0, 3),
        MergeSource::new(l0_new, 0, 7),
    ])
    .collect();

    // Level ascending first, then table id descending.
    assert_eq!(merged[0].value, Some(b"l0-id7".to_vec()));
    assert_eq!(merged[1].value, Some(b"l0-id3".to_vec()));
    assert_eq!(merged[2].value, Some(b"level1".to_vec()));
}

#[test]
fn latest_wins_keeps_one_record_per_key() {
    let a = vec![
        Record::put(b"k1".to_vec(), b"old".to_vec(), 1),
        Record::put(b"k2".to_vec(), b"only".to_vec(), 1),
    ];
    let b = vec![Record::put(b"k1".to_vec(), b"new".to_vec(), 9)];

    let winners: Vec<_> = LatestWins::new(MergeIterator::new(vec![
        MergeSource::new(a, 1, 1),
        MergeSource::new(b, 0, 2),
    ]))
    .collect();

    assert_eq!(winners.len(), 2);
    assert_eq!(winners[0].value, Some(b"new".to_vec()));
    assert_eq!(winners[1].value, Some(b"only".to_vec()));
}

#[test]
fn latest_wins_preserves_winning_tombstone() {
    let data = vec![Record::put(b"k".to_vec(), b"v".to_vec(), 1)];
    let tomb = vec![Record::tombstone(b"k".to_vec(), 5)];

    let winners: Vec<_> = LatestWins::new(MergeIterator::new(vec![
        MergeSource::new(data, 1, 1),
        MergeSource::new(tomb, 0, 2),
    ]))
    .collect();

    assert_eq!(winners.len(), 1);
    assert!(winners[0].is_tombstone());
}

#[test]
fn empty_sources_are_fine() {
    let merged: Vec<_> = MergeIterator::new(vec![
        MergeSource::new(Vec::new(), 0, 1),
        MergeSource::new(vec![Record::put(b"k".to_vec(), b"v".to_vec(), 1)], 0, 2),
        MergeSource::new(Vec::new(), 1, 3),
    ])
    .collect();
    assert_eq!(merged.len(), 1);
}
