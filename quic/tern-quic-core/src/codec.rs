// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Checked decoding helpers over [`bytes::Buf`]
//!
//! Every read validates the remaining capacity first so malformed peer input surfaces as a
//! [`DecoderError`] instead of a panic inside `bytes`.

use crate::varint::VarInt;
use bytes::{Buf, Bytes};

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecoderError {
    #[error("unexpected eof: {0}")]
    UnexpectedEof(usize),
    #[error("unexpected bytes: {0}")]
    UnexpectedBytes(usize),
    #[error("length capacity exceeded")]
    LengthCapacityExceeded,
    #[error("{0}")]
    InvariantViolation(&'static str),
}

pub type DecoderResult<T> = Result<T, DecoderError>;

/// Returns an `InvariantViolation` if the condition does not hold
#[macro_export]
macro_rules! decoder_invariant {
    ($expr:expr, $invariant:expr) => {
        if !($expr) {
            return ::core::result::Result::Err(
                $crate::codec::DecoderError::InvariantViolation($invariant).into(),
            );
        }
    };
}

pub trait DecoderBuffer: Buf {
    #[inline]
    fn ensure_len(&self, len: usize) -> DecoderResult<()> {
        if self.remaining() < len {
            Err(DecoderError::UnexpectedEof(len))
        } else {
            Ok(())
        }
    }

    #[inline]
    fn decode_u8(&mut self) -> DecoderResult<u8> {
        self.ensure_len(1)?;
        Ok(self.get_u8())
    }

    #[inline]
    fn decode_u16(&mut self) -> DecoderResult<u16> {
        self.ensure_len(2)?;
        Ok(self.get_u16())
    }

    #[inline]
    fn decode_u32(&mut self) -> DecoderResult<u32> {
        self.ensure_len(4)?;
        Ok(self.get_u32())
    }

    #[inline]
    fn decode_varint(&mut self) -> DecoderResult<VarInt> {
        VarInt::decode(self)
    }

    /// Splits off `len` bytes without copying when the buffer is a `Bytes`
    #[inline]
    fn decode_slice(&mut self, len: usize) -> DecoderResult<Bytes> {
        self.ensure_len(len)?;
        Ok(self.copy_to_bytes(len))
    }

    #[inline]
    fn decode_slice_with_len_prefix_u8(&mut self) -> DecoderResult<Bytes> {
        let len = self.decode_u8()? as usize;
        self.decode_slice(len)
    }

    #[inline]
    fn decode_slice_with_len_prefix_varint(&mut self) -> DecoderResult<Bytes> {
        let len = self.decode_varint()?.as_u64();
        let len = usize::try_from(len).map_err(|_| DecoderError::LengthCapacityExceeded)?;
        self.decode_slice(len)
    }

    #[inline]
    fn skip(&mut self, len: usize) -> DecoderResult<()> {
        self.ensure_len(len)?;
        self.advance(len);
        Ok(())
    }

    #[inline]
    fn ensure_empty(&self) -> DecoderResult<()> {
        match self.remaining() {
            0 => Ok(()),
            len => Err(DecoderError::UnexpectedBytes(len)),
        }
    }
}

impl<B: Buf + ?Sized> DecoderBuffer for B {}
