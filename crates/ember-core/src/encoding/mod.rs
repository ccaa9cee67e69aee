//! Canonical binary encoding.
//!
//! Used for every wire message and every stored record so that the same value
//! always produces the same bytes (MACs and digests depend on it).
//!
//! # Encoding Rules
//!
//! - **Integers**: little-endian, fixed width
//! - **Booleans**: one byte, 0x00 or 0x01
//! - **Fixed Arrays**: raw bytes, no length prefix
//! - **Sequences, strings, byte buffers**: u32 length prefix then contents
//! - **Options**: 0x00 for None, 0x01 + value for Some
//! - **Enums**: u32 tag followed by the variant fields

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Upper bound on any decoded length prefix; guards allocation on corrupt input.
pub const MAX_DECODE_LEN: usize = 16 * 1024 * 1024;

/// Errors during canonical decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes to decode
    #[error("Insufficient bytes: expected {expected}, got {available}")]
    InsufficientBytes {
        /// Expected number of bytes
        expected: usize,
        /// Actually available bytes
        available: usize,
    },

    /// Invalid UTF-8 string
    #[error("Invalid UTF-8 string: {0}")]
    InvalidUtf8(String),

    /// Invalid enum or option tag
    #[error("Invalid enum tag: {0}")]
    InvalidEnumTag(u32),

    /// Length prefix larger than [`MAX_DECODE_LEN`]
    #[error("Length {0} exceeds decode limit")]
    LengthTooLarge(usize),

    /// Bytes left over after a complete value
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// Custom decode error
    #[error("{0}")]
    Custom(String),
}

/// Trait for types that can be canonically encoded.
pub trait CanonicalEncode {
    /// Encodes the value to canonical byte representation.
    fn encode(&self, buf: &mut BytesMut);

    /// Returns the encoded byte representation.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Returns the encoded byte representation as a Vec.
    fn to_vec(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}

/// Trait for types that can be decoded from canonical encoding.
pub trait CanonicalDecode: Sized {
    /// Decodes from canonical byte representation.
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError>;

    /// Decodes a complete value from a byte slice, rejecting trailing bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let value = Self::decode(&mut buf)?;
        if buf.has_remaining() {
            return Err(DecodeError::TrailingBytes(buf.remaining()));
        }
        Ok(value)
    }
}

fn ensure(buf: &Bytes, expected: usize) -> Result<(), DecodeError> {
    if buf.remaining() < expected {
        return Err(DecodeError::InsufficientBytes {
            expected,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn decode_len(buf: &mut Bytes) -> Result<usize, DecodeError> {
    let len = u32::decode(buf)? as usize;
    if len > MAX_DECODE_LEN {
        return Err(DecodeError::LengthTooLarge(len));
    }
    Ok(len)
}

fn encode_len(len: usize, buf: &mut BytesMut) {
    assert!(len <= u32::MAX as usize, "Sequence length exceeds u32::MAX");
    buf.put_u32_le(len as u32);
}

macro_rules! impl_int {
    ($ty:ty, $size:expr, $put:ident, $get:ident) => {
        impl CanonicalEncode for $ty {
            fn encode(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }
        }

        impl CanonicalDecode for $ty {
            fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
                ensure(buf, $size)?;
                Ok(buf.$get())
            }
        }
    };
}

impl_int!(u8, 1, put_u8, get_u8);
impl_int!(u16, 2, put_u16_le, get_u16_le);
impl_int!(u32, 4, put_u32_le, get_u32_le);
impl_int!(i32, 4, put_i32_le, get_i32_le);
impl_int!(u64, 8, put_u64_le, get_u64_le);
impl_int!(i64, 8, put_i64_le, get_i64_le);

impl CanonicalEncode for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }
}

impl CanonicalDecode for bool {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u8::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(DecodeError::InvalidEnumTag(tag as u32)),
        }
    }
}

impl<const N: usize> CanonicalEncode for [u8; N] {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }
}

impl<const N: usize> CanonicalDecode for [u8; N] {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(buf, N)?;
        let mut arr = [0u8; N];
        buf.copy_to_slice(&mut arr);
        Ok(arr)
    }
}

impl<T: CanonicalEncode> CanonicalEncode for Vec<T> {
    fn encode(&self, buf: &mut BytesMut) {
        encode_len(self.len(), buf);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: CanonicalDecode> CanonicalDecode for Vec<T> {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let len = decode_len(buf)?;
        // Every element takes at least one byte.
        ensure(buf, len)?;
        let mut vec = Vec::with_capacity(len);
        for _ in 0..len {
            vec.push(T::decode(buf)?);
        }
        Ok(vec)
    }
}

impl CanonicalEncode for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        encode_len(self.len(), buf);
        buf.put_slice(self);
    }
}

impl CanonicalDecode for Bytes {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let len = decode_len(buf)?;
        ensure(buf, len)?;
        Ok(buf.split_to(len))
    }
}

impl CanonicalEncode for String {
    fn encode(&self, buf: &mut BytesMut) {
        self.as_str().encode(buf);
    }
}

impl CanonicalEncode for &str {
    fn encode(&self, buf: &mut BytesMut) {
        encode_len(self.len(), buf);
        buf.put_slice(self.as_bytes());
    }
}

impl CanonicalDecode for String {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let bytes = Bytes::decode(buf)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))
    }
}

impl<T: CanonicalEncode> CanonicalEncode for Option<T> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            None => buf.put_u8(0x00),
            Some(value) => {
                buf.put_u8(0x01);
                value.encode(buf);
            }
        }
    }
}

impl<T: CanonicalDecode> CanonicalDecode for Option<T> {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u8::decode(buf)? {
            0x00 => Ok(None),
            0x01 => Ok(Some(T::decode(buf)?)),
            tag => Err(DecodeError::InvalidEnumTag(tag as u32)),
        }
    }
}

impl<A: CanonicalEncode, B: CanonicalEncode> CanonicalEncode for (A, B) {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf);
        self.1.encode(buf);
    }
}

impl<A: CanonicalDecode, B: CanonicalDecode> CanonicalDecode for (A, B) {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok((A::decode(buf)?, B::decode(buf)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u32_encoding() {
        assert_eq!(1u32.to_vec(), vec![0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_string_encoding() {
        let encoded = String::from("hello").to_vec();
        assert_eq!(
            encoded,
            vec![0x05, 0x00, 0x00, 0x00, b'h', b'e', b'l', b'l', b'o']
        );
    }

    #[test]
    fn test_option_encoding() {
        assert_eq!(Option::<u32>::None.to_vec(), vec![0x00]);
        assert_eq!(
            Some(0x12345678u32).to_vec(),
            vec![0x01, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_insufficient_bytes() {
        let err = u64::from_bytes(&[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::InsufficientBytes {
                expected: 8,
                available: 3
            }
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let err = u8::from_bytes(&[1, 2]).unwrap_err();
        assert_eq!(err, DecodeError::TrailingBytes(1));
    }

    #[test]
    fn test_vec_length_bomb_rejected() {
        // Claims 1000 elements but carries none.
        let mut bytes = 1000u32.to_vec();
        bytes.push(0);
        assert!(Vec::<u64>::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_invalid_bool() {
        assert_eq!(
            bool::from_bytes(&[7]).unwrap_err(),
            DecodeError::InvalidEnumTag(7)
        );
    }

    #[test]
    fn test_invalid_utf8() {
        let mut bytes = 2u32.to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe]);
        assert!(matches!(
            String::from_bytes(&bytes),
            Err(DecodeError::InvalidUtf8(_))
        ));
    }
}
