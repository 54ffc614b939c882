//! Deterministic binary encoding for structured on-disk metadata.
//!
//! The manifest and the SSTable meta sidecar are encoded through the
//! [`Encode`] and [`Decode`] traits defined here — a hand-written,
//! byte-stable wire format, so the on-disk representation never changes
//! because a dependency was upgraded. The WAL record frame and the
//! SSTable data frame are **not** routed through this module: their
//! layouts are fixed byte-for-byte and written directly.
//!
//! # Wire format
//!
//! | Rust type         | Encoding                                     |
//! |-------------------|----------------------------------------------|
//! | `u8`              | 1 byte                                       |
//! | `u32`             | 4 bytes, little-endian                       |
//! | `u64`             | 8 bytes, little-endian                       |
//! | `bool`            | 1 byte (`0x00` = false, `0x01` = true)       |
//! | `[u8; 4]`         | 4 raw bytes (no length prefix)               |
//! | `Vec<u8>`         | `[u32 len][bytes]`                           |
//! | `PathBuf`         | `[u32 len][raw bytes]`                       |
//! | `Option<T>`       | `[u8 tag: 0=None, 1=Some][T if Some]`        |
//! | `Vec<T>`          | via [`encode_vec`]: `[u32 count][T₀][T₁]…`   |
//!
//! All multi-byte integers are little-endian. Lengths and counts are
//! `u32`, limiting individual items to 4 GiB.
//!
//! # Safety limits
//!
//! Variable-length decoders enforce upper bounds so corrupted or
//! crafted input cannot trigger allocation bombs: [`MAX_BYTE_LEN`] for
//! byte sequences and [`MAX_VEC_ELEMENTS`] for element counts.
//!
//! No function in this module panics; all failures surface as
//! [`EncodingError`].

#[cfg(test)]
mod tests;

use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use thiserror::Error;

/// Maximum byte length accepted when decoding a `Vec<u8>` or `PathBuf`
/// (64 MiB). Manifest and meta blocks are far smaller in practice.
pub const MAX_BYTE_LEN: u32 = 64 * 1024 * 1024;

/// Maximum element count accepted when decoding a `Vec<T>` (1 M).
pub const MAX_VEC_ELEMENTS: u32 = 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// An enum or `Option` discriminant was not recognised.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag {
        /// The tag value that was read.
        tag: u32,
        /// The Rust type being decoded.
        type_name: &'static str,
    },

    /// A bool field contained a byte other than `0x00` or `0x01`.
    #[error("invalid bool byte: 0x{0:02X}")]
    InvalidBool(u8),

    /// A length or count exceeded its safety limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` into a byte buffer. The same logical value always
/// yields the same byte sequence.
pub trait Encode {
    /// Append the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from the front of a byte slice.
///
/// Returns `(value, bytes_consumed)` so callers can advance a cursor
/// through a buffer of consecutive items.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

/// Encode a value into a freshly-allocated `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the beginning of `buf`, returning
/// `(value, bytes_consumed)`.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

#[inline]
fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("length {len} exceeds u32::MAX")))
}

// ------------------------------------------------------------------------------------------------
// Primitive implementations
// ------------------------------------------------------------------------------------------------

impl Encode for u8 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(*self);
        Ok(())
    }
}

impl Decode for u8 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        Ok((buf[0], 1))
    }
}

impl Encode for u32 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u32 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[..4]);
        Ok((u32::from_le_bytes(bytes), 4))
    }
}

impl Encode for u64 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u64 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[..8]);
        Ok((u64::from_le_bytes(bytes), 8))
    }
}

impl Encode for bool {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        match buf[0] {
            0x00 => Ok((false, 1)),
            0x01 => Ok((true, 1)),
            other => Err(EncodingError::InvalidBool(other)),
        }
    }
}

impl Encode for [u8; 4] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Decode for [u8; 4] {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[..4]);
        Ok((bytes, 4))
    }
}

impl Encode for Vec<u8> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let len = len_to_u32(self.len())?;
        len.encode_to(buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Decode for Vec<u8> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (len, n) = u32::decode_from(buf)?;
        if len > MAX_BYTE_LEN {
            return Err(EncodingError::LengthOverflow(format!(
                "byte length {len} exceeds limit {MAX_BYTE_LEN}"
            )));
        }
        let len = len as usize;
        require(&buf[n..], len)?;
        Ok((buf[n..n + len].to_vec(), n + len))
    }
}

impl Encode for PathBuf {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let bytes = self.as_os_str().as_bytes().to_vec();
        bytes.encode_to(buf)
    }
}

impl Decode for PathBuf {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (bytes, n) = Vec::<u8>::decode_from(buf)?;
        let os = std::ffi::OsStr::from_bytes(&bytes);
        Ok((PathBuf::from(os), n))
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            None => 0u8.encode_to(buf),
            Some(inner) => {
                1u8.encode_to(buf)?;
                inner.encode_to(buf)
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u8::decode_from(buf)?;
        match tag {
            0 => Ok((None, offset)),
            1 => {
                let (inner, n) = T::decode_from(&buf[offset..])?;
                offset += n;
                Ok((Some(inner), offset))
            }
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "Option",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Vec<T> helpers
// ------------------------------------------------------------------------------------------------

/// Encode a slice of items as `[u32 count][T₀][T₁]…`.
///
/// A free function rather than a blanket `impl Encode for Vec<T>` so it
/// cannot collide with the raw-bytes `Vec<u8>` encoding above.
pub fn encode_vec<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    let count = len_to_u32(items.len())?;
    count.encode_to(buf)?;
    for item in items {
        item.encode_to(buf)?;
    }
    Ok(())
}

/// Decode a `[u32 count][T₀][T₁]…` sequence, returning
/// `(items, bytes_consumed)`.
pub fn decode_vec<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), EncodingError> {
    let (count, mut offset) = u32::decode_from(buf)?;
    if count > MAX_VEC_ELEMENTS {
        return Err(EncodingError::LengthOverflow(format!(
            "element count {count} exceeds limit {MAX_VEC_ELEMENTS}"
        )));
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (item, n) = T::decode_from(&buf[offset..])?;
        offset += n;
        items.push(item);
    }
    Ok((items, offset))
}
