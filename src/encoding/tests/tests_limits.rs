//! Decode-side safety limits: truncated buffers and allocation bombs.

use crate::encoding::{Decode, EncodingError, decode_from_slice, decode_vec};

#[test]
fn truncated_integer() {
    let err = decode_from_slice::<u64>(&[1, 2, 3]).unwrap_err();
    assert!(matches!(err, EncodingError::UnexpectedEof { .. }));
}

#[test]
fn truncated_byte_vector_payload() {
    // Length prefix says 100 bytes but only 2 follow.
    let mut buf = Vec::new();
    buf.extend_from_slice(&100u32.to_le_bytes());
    buf.extend_from_slice(&[0xAA, 0xBB]);
    let err = Vec::<u8>::decode_from(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::UnexpectedEof { .. }));
}

#[test]
fn oversized_byte_length_rejected_before_allocation() {
    // A corrupted length field of u32::MAX must not allocate 4 GiB.
    let buf = u32::MAX.to_le_bytes();
    let err = Vec::<u8>::decode_from(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOverflow(_)));
}

#[test]
fn oversized_element_count_rejected() {
    let buf = u32::MAX.to_le_bytes();
    let err = decode_vec::<u64>(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOverflow(_)));
}

#[test]
fn invalid_option_tag() {
    let err = decode_from_slice::<Option<u64>>(&[7]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidTag { tag: 7, .. }));
}
