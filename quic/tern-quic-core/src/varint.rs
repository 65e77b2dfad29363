// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::codec::{DecoderError, DecoderResult};
use bytes::{Buf, BufMut};
use core::{fmt, ops::Deref};

#[cfg(any(test, feature = "generator"))]
use bolero_generator::*;

//= https://www.rfc-editor.org/rfc/rfc9000#section-16
//# QUIC packets and frames commonly use a variable-length encoding for
//# non-negative integer values.  This encoding ensures that smaller
//# integer values need fewer bytes to encode.

//= https://www.rfc-editor.org/rfc/rfc9000#section-16
//# This means that integers are encoded on 1, 2, 4, or 8 bytes and can
//# encode 6-, 14-, 30-, or 62-bit values, respectively.

pub const MAX_VARINT_VALUE: u64 = 4_611_686_018_427_387_903;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("varint range exceeded")]
pub struct VarIntError;

#[inline]
pub const fn encoding_size(x: u64) -> usize {
    if x <= 63 {
        1
    } else if x <= 16_383 {
        2
    } else if x <= 1_073_741_823 {
        4
    } else {
        8
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
#[cfg_attr(any(feature = "generator", test), derive(TypeGenerator))]
pub struct VarInt(#[cfg_attr(any(feature = "generator", test), generator(Self::GENERATOR))] u64);

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl VarInt {
    pub const MAX: Self = Self(MAX_VARINT_VALUE);

    pub const ZERO: Self = Self(0);

    #[cfg(any(feature = "generator", test))]
    const GENERATOR: core::ops::RangeInclusive<u64> = 0..=MAX_VARINT_VALUE;

    pub const fn new(v: u64) -> Result<Self, VarIntError> {
        if v > MAX_VARINT_VALUE {
            return Err(VarIntError);
        }
        Ok(Self(v))
    }

    pub const fn from_u8(v: u8) -> Self {
        Self(v as u64)
    }

    pub const fn from_u16(v: u16) -> Self {
        Self(v as u64)
    }

    pub const fn from_u32(v: u32) -> Self {
        Self(v as u64)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn checked_add(self, value: Self) -> Option<Self> {
        Self::new(self.0.checked_add(value.0)?).ok()
    }

    #[inline]
    #[must_use]
    pub fn saturating_add(self, value: Self) -> Self {
        Self::new(self.0.saturating_add(value.0)).unwrap_or(Self::MAX)
    }

    #[inline]
    pub fn checked_sub(self, value: Self) -> Option<Self> {
        Some(Self(self.0.checked_sub(value.0)?))
    }

    #[inline]
    pub const fn encoding_size(self) -> usize {
        encoding_size(self.0)
    }

    #[inline]
    pub fn encode<B: BufMut + ?Sized>(self, buf: &mut B) {
        match self.encoding_size() {
            1 => buf.put_u8(self.0 as u8),
            2 => buf.put_u16(0b01 << 14 | self.0 as u16),
            4 => buf.put_u32(0b10 << 30 | self.0 as u32),
            _ => buf.put_u64(0b11 << 62 | self.0),
        }
    }

    #[inline]
    pub fn decode<B: Buf + ?Sized>(buf: &mut B) -> DecoderResult<Self> {
        if !buf.has_remaining() {
            return Err(DecoderError::UnexpectedEof(1));
        }
        let len = 1usize << (buf.chunk()[0] >> 6);
        if buf.remaining() < len {
            return Err(DecoderError::UnexpectedEof(len));
        }
        let value = match len {
            1 => (buf.get_u8() & 0x3f) as u64,
            2 => (buf.get_u16() & 0x3fff) as u64,
            4 => (buf.get_u32() & 0x3fff_ffff) as u64,
            _ => buf.get_u64() & 0x3fff_ffff_ffff_ffff,
        };
        Ok(Self(value))
    }
}

impl Deref for VarInt {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

macro_rules! impl_from_lesser {
    ($ty:ty) => {
        impl From<$ty> for VarInt {
            fn from(value: $ty) -> Self {
                Self(value.into())
            }
        }
    };
}

impl_from_lesser!(u8);
impl_from_lesser!(u16);
impl_from_lesser!(u32);

impl From<VarInt> for u64 {
    fn from(value: VarInt) -> Self {
        value.0
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<usize> for VarInt {
    type Error = VarIntError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolero::check;
    use bytes::BytesMut;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn round_trip() {
        check!().with_type::<VarInt>().cloned().for_each(|value| {
            let mut buf = BytesMut::new();
            value.encode(&mut buf);
            assert_eq!(buf.len(), value.encoding_size());
            let mut buf = buf.freeze();
            assert_eq!(VarInt::decode(&mut buf), Ok(value));
            assert!(buf.is_empty());
        });
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.1
    //= type=test
    //# For example, the eight-byte sequence 0xc2197c5eff14e88c decodes to
    //# the decimal value 151,288,809,941,952,652; the four-byte sequence
    //# 0x9d7f3e7d decodes to 494,878,333; the two-byte sequence 0x7bbd
    //# decodes to 15,293; and the single byte 0x25 decodes to 37 (as does
    //# the two-byte sequence 0x4025).
    #[test]
    fn rfc_examples() {
        let cases: &[(&[u8], u64)] = &[
            (&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c], 151_288_809_941_952_652),
            (&[0x9d, 0x7f, 0x3e, 0x7d], 494_878_333),
            (&[0x7b, 0xbd], 15_293),
            (&[0x25], 37),
            (&[0x40, 0x25], 37),
        ];

        for (bytes, expected) in cases {
            let mut buf = *bytes;
            assert_eq!(VarInt::decode(&mut buf).unwrap().as_u64(), *expected);
        }
    }

    #[test]
    fn truncated_input() {
        let mut buf: &[u8] = &[0x9d, 0x7f];
        assert_eq!(VarInt::decode(&mut buf), Err(DecoderError::UnexpectedEof(4)));
    }

    #[test]
    fn out_of_range() {
        assert!(VarInt::new(MAX_VARINT_VALUE + 1).is_err());
        assert_eq!(VarInt::MAX.saturating_add(VarInt::from_u8(1)), VarInt::MAX);
    }
}
