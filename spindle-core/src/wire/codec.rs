//! Primitive encoding in the wire's canonical big-endian byte order.
//!
//! The layout is bit-exact:
//! - `bool`: 1 byte, `0` or `1`.
//! - `i32`: 4 bytes, big-endian two's-complement.
//! - `i64`: 8 bytes, big-endian two's-complement.
//! - `f64`: 8 bytes, big-endian IEEE-754.
//! - `String`: 4-byte big-endian length `N`, then `N` bytes of UTF-8.
//!
//! The host's native byte order never leaks onto the wire; `bytes`' `put_*`
//! and `get_*` accessors are big-endian regardless of platform.
//!
//! # Example
//! ```
//! use spindle::wire::codec::{from_bytes, to_bytes};
//!
//! let encoded = to_bytes(&258i32);
//! assert_eq!(&encoded[..], &[0, 0, 1, 2]);
//! assert_eq!(from_bytes::<i32>(&encoded).unwrap(), 258);
//! ```
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{Result, WireError};

/// A value with a fixed representation on the wire.
///
/// Encoding never fails for well-formed inputs. Decoding consumes exactly the
/// bytes of one value from the front of the buffer.
pub trait WirePrimitive: Sized {
    /// Width in bytes for fixed-width types, `None` for length-prefixed ones.
    const WIDTH: Option<usize>;

    fn encode<B: BufMut>(&self, buf: &mut B);

    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
}

fn ensure<B: Buf>(buf: &B, needed: usize) -> Result<()> {
    let available = buf.remaining();
    if available < needed {
        return Err(WireError::InsufficientData { needed, available });
    }
    Ok(())
}

impl WirePrimitive for bool {
    const WIDTH: Option<usize> = Some(1);

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(u8::from(*self));
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 1)?;
        match buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidBool(other)),
        }
    }
}

impl WirePrimitive for i32 {
    const WIDTH: Option<usize> = Some(4);

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(*self);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 4)?;
        Ok(buf.get_i32())
    }
}

impl WirePrimitive for i64 {
    const WIDTH: Option<usize> = Some(8);

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64(*self);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 8)?;
        Ok(buf.get_i64())
    }
}

impl WirePrimitive for f64 {
    const WIDTH: Option<usize> = Some(8);

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_f64(*self);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 8)?;
        Ok(buf.get_f64())
    }
}

impl WirePrimitive for String {
    const WIDTH: Option<usize> = None;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        encode_str(self, buf);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let len = i32::decode(buf)?;
        let len = usize::try_from(len).map_err(|_| WireError::NegativeLength(len))?;
        ensure(buf, len)?;
        let payload = buf.copy_to_bytes(len);
        decode_str(&payload)
    }
}

/// Encode a string slice with its 4-byte length prefix.
///
/// `value` must be at most `i32::MAX` bytes long; the prefix cannot
/// represent anything longer. [`FrameWriter::write_string`] checks this and
/// fails with [`WireError::FrameTooLarge`] instead.
///
/// [`FrameWriter::write_string`]: super::FrameWriter::write_string
pub fn encode_str<B: BufMut>(value: &str, buf: &mut B) {
    buf.put_i32(prefix_len(value.len()));
    buf.put_slice(value.as_bytes());
}

fn prefix_len(len: usize) -> i32 {
    debug_assert!(
        len <= i32::MAX as usize,
        "string of {len} bytes does not fit a length prefix"
    );
    len as i32
}

/// Decode a string whose length is already known: the whole slice is the
/// UTF-8 payload and no prefix is expected.
pub fn decode_str(bytes: &[u8]) -> Result<String> {
    Ok(String::from_utf8(bytes.to_vec())?)
}

/// Encode a single value into a fresh buffer.
pub fn to_bytes<T: WirePrimitive>(value: &T) -> Bytes {
    let mut buf = BytesMut::with_capacity(T::WIDTH.unwrap_or(16));
    value.encode(&mut buf);
    buf.freeze()
}

/// Decode a single value from the front of a byte slice.
///
/// Trailing bytes are left untouched and ignored.
pub fn from_bytes<T: WirePrimitive>(mut bytes: &[u8]) -> Result<T> {
    T::decode(&mut bytes)
}
