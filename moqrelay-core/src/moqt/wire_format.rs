//! MoQ Transport wire format primitives
//!
//! Binary encoding and decoding of the building blocks every message is made of:
//! - Variable-length integers (RFC 9000, Section 16)
//! - Fixed-width unsigned integers in a chosen byte order
//! - Length-prefixed byte strings and namespace tuples
//! - Message framing: `varint(type) ++ varint(body_length) ++ body`
//!
//! Serialization is "measure, then write": every message reports its body length
//! before anything is written, so the header can be emitted in front of the body
//! without a scratch buffer.

use crate::error::MoqtError;
use crate::moqt::TrackNamespace;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest value representable as a QUIC varint (2^62 - 1)
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// MoQ wire format encoder/decoder
#[derive(Debug)]
pub struct WireFormat;

/// Variable-length unsigned integer (RFC 9000, Section 16)
///
/// The encoded size is derived from the value, so a `QuicVarInt` always encodes
/// in the smallest of the 1, 2, 4 and 8 byte classes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QuicVarInt(u64);

impl QuicVarInt {
    /// Largest representable varint
    pub const MAX: QuicVarInt = QuicVarInt(MAX_VARINT);

    /// Create a varint, rejecting values of 2^62 and above
    pub fn new(value: u64) -> Result<Self, MoqtError> {
        if value > MAX_VARINT {
            return Err(MoqtError::VarIntOutOfRange { value });
        }
        Ok(Self(value))
    }

    /// Create a varint from a value that always fits
    pub const fn from_u32(value: u32) -> Self {
        Self(value as u64)
    }

    /// Raw value
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Encoded size in bytes
    pub const fn size(self) -> usize {
        if self.0 < 0x40 {
            1
        } else if self.0 < 0x4000 {
            2
        } else if self.0 < 0x4000_0000 {
            4
        } else {
            8
        }
    }
}

impl TryFrom<u64> for QuicVarInt {
    type Error = MoqtError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<u32> for QuicVarInt {
    fn from(value: u32) -> Self {
        Self::from_u32(value)
    }
}

impl From<QuicVarInt> for u64 {
    fn from(value: QuicVarInt) -> Self {
        value.0
    }
}

/// Byte order for fixed-width integers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Endianness {
    /// Network byte order
    #[default]
    Big,
    /// Little endian
    Little,
    /// Host byte order
    Native,
}

impl Endianness {
    /// Network byte order, the default for everything on the wire
    pub const NETWORK: Endianness = Endianness::Big;

    fn is_big(self) -> bool {
        match self {
            Endianness::Big => true,
            Endianness::Little => false,
            Endianness::Native => cfg!(target_endian = "big"),
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// Unsigned integers with a fixed encoded width (8, 16, 32 or 64 bits)
pub trait FixedWidth: sealed::Sealed + Copy {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Append the value in the given byte order
    fn put(self, buf: &mut BytesMut, endianness: Endianness);

    /// Read the value in the given byte order; caller checks the length
    fn get<B: Buf>(buf: &mut B, endianness: Endianness) -> Self;
}

impl FixedWidth for u8 {
    const SIZE: usize = 1;

    fn put(self, buf: &mut BytesMut, _endianness: Endianness) {
        buf.put_u8(self);
    }

    fn get<B: Buf>(buf: &mut B, _endianness: Endianness) -> Self {
        buf.get_u8()
    }
}

macro_rules! impl_fixed_width {
    ($ty:ty, $put_be:ident, $put_le:ident, $get_be:ident, $get_le:ident) => {
        impl FixedWidth for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn put(self, buf: &mut BytesMut, endianness: Endianness) {
                if endianness.is_big() {
                    buf.$put_be(self);
                } else {
                    buf.$put_le(self);
                }
            }

            fn get<B: Buf>(buf: &mut B, endianness: Endianness) -> Self {
                if endianness.is_big() {
                    buf.$get_be()
                } else {
                    buf.$get_le()
                }
            }
        }
    };
}

impl_fixed_width!(u16, put_u16, put_u16_le, get_u16, get_u16_le);
impl_fixed_width!(u32, put_u32, put_u32_le, get_u32, get_u32_le);
impl_fixed_width!(u64, put_u64, put_u64_le, get_u64, get_u64_le);

/// A message with a fixed type tag and a length-delimited body
pub trait WireMessage: Sized {
    /// Type tag written in the frame header
    const MESSAGE_TYPE: u64;

    /// Body length in bytes, computed without writing anything
    fn body_len(&self) -> Result<usize, MoqtError>;

    /// Write the body fields in declaration order
    fn write_body(&self, buf: &mut BytesMut) -> Result<(), MoqtError>;

    /// Read the body fields in declaration order
    fn read_body(body: &mut Bytes) -> Result<Self, MoqtError>;
}

/// Primitive encoders
impl WireFormat {
    /// Write an unsigned integer of fixed width, returns bytes written
    pub fn serialize_fixed<W: FixedWidth>(
        buf: &mut BytesMut,
        value: W,
        endianness: Endianness,
    ) -> usize {
        buf.reserve(W::SIZE);
        value.put(buf, endianness);
        W::SIZE
    }

    /// Write a varint with its 2-bit length class prefix, returns bytes written
    pub fn serialize_varint(buf: &mut BytesMut, value: QuicVarInt) -> usize {
        let raw = value.value();
        match value.size() {
            // 00xxxxxx
            1 => Self::serialize_fixed(buf, raw as u8, Endianness::NETWORK),
            // 01xxxxxx xxxxxxxx
            2 => Self::serialize_fixed(buf, (0x4000 | raw) as u16, Endianness::NETWORK),
            // 10xxxxxx xxxxxxxx xxxxxxxx xxxxxxxx
            4 => Self::serialize_fixed(buf, (0x8000_0000 | raw) as u32, Endianness::NETWORK),
            // 11xxxxxx ...
            _ => Self::serialize_fixed(buf, 0xC000_0000_0000_0000 | raw, Endianness::NETWORK),
        }
    }

    /// Write a raw `u64` as a varint
    pub fn put_varint(buf: &mut BytesMut, value: u64) -> Result<usize, MoqtError> {
        Ok(Self::serialize_varint(buf, QuicVarInt::new(value)?))
    }

    /// Write a length-prefixed byte string
    pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) -> Result<usize, MoqtError> {
        let prefix = Self::put_varint(buf, data.len() as u64)?;
        buf.extend_from_slice(data);
        Ok(prefix + data.len())
    }

    /// Write a namespace tuple: element count, then each element length-prefixed
    pub fn put_namespace(buf: &mut BytesMut, namespace: &TrackNamespace) -> Result<usize, MoqtError> {
        let mut written = Self::put_varint(buf, namespace.0.len() as u64)?;
        for element in &namespace.0 {
            written += Self::put_bytes(buf, element.as_bytes())?;
        }
        Ok(written)
    }
}

/// Length pass helpers, mirroring the encoders without writing
impl WireFormat {
    /// Encoded size of a varint
    pub fn varint_len(value: u64) -> Result<usize, MoqtError> {
        Ok(QuicVarInt::new(value)?.size())
    }

    /// Encoded size of a length-prefixed byte string
    pub fn bytes_len(data: &[u8]) -> Result<usize, MoqtError> {
        Ok(Self::varint_len(data.len() as u64)? + data.len())
    }

    /// Encoded size of a namespace tuple
    pub fn namespace_len(namespace: &TrackNamespace) -> Result<usize, MoqtError> {
        namespace
            .0
            .iter()
            .try_fold(Self::varint_len(namespace.0.len() as u64)?, |acc, element| {
                Ok(acc + Self::bytes_len(element.as_bytes())?)
            })
    }
}

/// Primitive decoders
impl WireFormat {
    fn ensure<B: Buf>(buf: &B, needed: usize) -> Result<(), MoqtError> {
        if buf.remaining() < needed {
            return Err(MoqtError::Truncated {
                needed,
                available: buf.remaining(),
            });
        }
        Ok(())
    }

    /// Read an unsigned integer of fixed width
    pub fn deserialize_fixed<W: FixedWidth, B: Buf>(
        buf: &mut B,
        endianness: Endianness,
    ) -> Result<W, MoqtError> {
        Self::ensure(buf, W::SIZE)?;
        Ok(W::get(buf, endianness))
    }

    /// Read a varint
    pub fn deserialize_varint<B: Buf>(buf: &mut B) -> Result<QuicVarInt, MoqtError> {
        Self::ensure(buf, 1)?;
        let first_byte = buf.chunk()[0];
        let length = 1usize << (first_byte >> 6);
        Self::ensure(buf, length)?;

        let value = match length {
            1 => (buf.get_u8() & 0x3F) as u64,
            2 => (buf.get_u16() & 0x3FFF) as u64,
            4 => (buf.get_u32() & 0x3FFF_FFFF) as u64,
            _ => buf.get_u64() & MAX_VARINT,
        };
        Ok(QuicVarInt(value))
    }

    /// Read a varint as a raw `u64`
    pub fn get_varint<B: Buf>(buf: &mut B) -> Result<u64, MoqtError> {
        Ok(Self::deserialize_varint(buf)?.value())
    }

    /// Read a length-prefixed byte string without copying
    pub fn get_bytes(buf: &mut Bytes) -> Result<Bytes, MoqtError> {
        let length = Self::get_varint(buf)?;
        let length = usize::try_from(length).map_err(|_| MoqtError::Truncated {
            needed: usize::MAX,
            available: buf.remaining(),
        })?;
        Self::ensure(buf, length)?;
        Ok(buf.split_to(length))
    }

    /// Read a length-prefixed UTF-8 string
    pub fn get_string(buf: &mut Bytes) -> Result<String, MoqtError> {
        let raw = Self::get_bytes(buf)?;
        String::from_utf8(raw.to_vec()).map_err(|_| MoqtError::InvalidData {
            reason: "Invalid UTF-8 in string field".to_string(),
        })
    }

    /// Read a namespace tuple
    pub fn get_namespace(buf: &mut Bytes) -> Result<TrackNamespace, MoqtError> {
        let count = Self::get_varint(buf)?;
        // Every element takes at least one byte, which bounds the allocation
        if count > buf.remaining() as u64 {
            return Err(MoqtError::Truncated {
                needed: count as usize,
                available: buf.remaining(),
            });
        }
        let mut elements = Vec::with_capacity(count as usize);
        for _ in 0..count {
            elements.push(Self::get_string(buf)?);
        }
        Ok(TrackNamespace(elements))
    }

    /// Peek a varint at the start of `data` without consuming it
    ///
    /// Returns the value and its encoded length, or `None` when `data` does not
    /// yet hold the whole varint.
    pub fn peek_varint(data: &[u8]) -> Option<(u64, usize)> {
        let first_byte = *data.first()?;
        let length = 1usize << (first_byte >> 6);
        if data.len() < length {
            return None;
        }
        let mut prefix = &data[..length];
        Self::get_varint(&mut prefix).ok().map(|value| (value, length))
    }
}

/// Message framing
impl WireFormat {
    /// Serialize a message: header `{type, body length}` followed by the body
    ///
    /// Returns the total number of bytes appended.
    pub fn serialize_message<M: WireMessage>(
        buf: &mut BytesMut,
        message: &M,
    ) -> Result<usize, MoqtError> {
        let body_len = message.body_len()?;
        let message_type = QuicVarInt::new(M::MESSAGE_TYPE)?;
        let length = QuicVarInt::new(body_len as u64)?;

        buf.reserve(message_type.size() + length.size() + body_len);
        let header_len =
            Self::serialize_varint(buf, message_type) + Self::serialize_varint(buf, length);

        let body_start = buf.len();
        message.write_body(buf)?;
        debug_assert_eq!(buf.len() - body_start, body_len, "measured body length mismatch");

        Ok(header_len + body_len)
    }

    /// Read a frame header, returning `(message_type, body_length)`
    pub fn deserialize_header<B: Buf>(buf: &mut B) -> Result<(u64, usize), MoqtError> {
        let message_type = Self::get_varint(buf)?;
        let body_len = Self::get_varint(buf)?;
        let body_len = usize::try_from(body_len).map_err(|_| MoqtError::Truncated {
            needed: usize::MAX,
            available: buf.remaining(),
        })?;
        Ok((message_type, body_len))
    }

    /// Decode a body that must be consumed exactly
    pub fn read_exact<M: WireMessage>(mut body: Bytes) -> Result<M, MoqtError> {
        let message = M::read_body(&mut body)?;
        if body.has_remaining() {
            return Err(MoqtError::TrailingBytes {
                message_type: M::MESSAGE_TYPE,
                remaining: body.remaining(),
            });
        }
        Ok(message)
    }
}
