//! Basic bloom filter behavior: membership, serialization, bad blobs.

use crate::bloom::{BloomError, BloomFilter};

#[test]
fn no_false_negatives() {
    let mut bloom = BloomFilter::new(100, 0.01);
    for i in 0..100 {
        bloom.add(format!("key-{i}").as_bytes());
    }
    for i in 0..100 {
        assert!(
            bloom.may_contain(format!("key-{i}").as_bytes()),
            "inserted key key-{i} must be reported present"
        );
    }
}

#[test]
fn empty_filter_contains_nothing() {
    let bloom = BloomFilter::new(100, 0.01);
    assert!(!bloom.may_contain(b"anything"));
}

#[test]
fn parameters_follow_target_rate() {
    // Tighter p needs more bits and more hashes.
    let loose = BloomFilter::new(1000, 0.1);
    let tight = BloomFilter::new(1000, 0.001);
    assert!(tight.num_bits() > loose.num_bits());
    assert!(tight.num_hashes() >= loose.num_hashes());
}

#[test]
fn zero_expected_items_still_valid() {
    let mut bloom = BloomFilter::new(0, 0.01);
    bloom.add(b"k");
    assert!(bloom.may_contain(b"k"));
}

#[test]
fn serialize_roundtrip_preserves_membership() {
    let mut bloom = BloomFilter::new(500, 0.01);
    let keys: Vec<Vec<u8>> = (0..500).map(|i| format!("k{i:04}").into_bytes()).collect();
    for key in &keys {
        bloom.add(key);
    }

    let blob = bloom.serialize();
    let restored = BloomFilter::deserialize(&blob).unwrap();

    assert_eq!(restored.num_bits(), bloom.num_bits());
    assert_eq!(restored.num_hashes(), bloom.num_hashes());
    for key in &keys {
        assert!(restored.may_contain(key));
    }
    // Negative answers agree too.
    for i in 0..500 {
        let probe = format!("absent{i:04}").into_bytes();
        assert_eq!(restored.may_contain(&probe), bloom.may_contain(&probe));
    }
}

#[test]
fn deserialize_rejects_truncated_blob() {
    let bloom = BloomFilter::new(10, 0.01);
    let mut blob = bloom.serialize();
    blob.truncate(blob.len() - 1);
    assert!(matches!(
        BloomFilter::deserialize(&blob),
        Err(BloomError::Truncated { .. })
    ));
}

#[test]
fn deserialize_rejects_unknown_version() {
    let bloom = BloomFilter::new(10, 0.01);
    let mut blob = bloom.serialize();
    blob[0] = 0xFF;
    assert!(matches!(
        BloomFilter::deserialize(&blob),
        Err(BloomError::UnsupportedVersion(0xFF))
    ));
}

#[test]
fn deserialize_rejects_inconsistent_header() {
    let bloom = BloomFilter::new(10, 0.01);
    let mut blob = bloom.serialize();
    // Claim far more bits than the bitmap can hold.
    blob[1..9].copy_from_slice(&u64::MAX.to_le_bytes());
    assert!(matches!(
        BloomFilter::deserialize(&blob),
        Err(BloomError::InvalidParameters(_))
    ));
}
