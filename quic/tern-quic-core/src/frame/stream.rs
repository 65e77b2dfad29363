// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::tag;
use crate::{
    codec::{DecoderBuffer, DecoderResult},
    decoder_invariant,
    varint::{encoding_size, VarInt, MAX_VARINT_VALUE},
};
use bytes::{Buf, BufMut, Bytes};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
//# STREAM Frame {
//#   Type (i) = 0x08..0x0f,
//#   Stream ID (i),
//#   [Offset (i)],
//#   [Length (i)],
//#   Stream Data (..),
//# }

const OFF_BIT: u8 = 0x04;
const LEN_BIT: u8 = 0x02;
const FIN_BIT: u8 = 0x01;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stream {
    pub stream_id: u64,
    pub offset: u64,
    pub data: Bytes,
    pub is_fin: bool,
}

impl Stream {
    /// Returns the size of the frame header for the given fields, length prefix included
    #[inline]
    pub fn header_len(stream_id: u64, offset: u64, data_len: usize) -> usize {
        let mut len = 1 + encoding_size(stream_id);
        if offset > 0 {
            len += encoding_size(offset);
        }
        len + encoding_size(data_len as u64)
    }

    #[inline]
    pub fn encoding_size(&self) -> usize {
        Self::header_len(self.stream_id, self.offset, self.data.len()) + self.data.len()
    }

    pub fn encode<B: BufMut + ?Sized>(&self, buf: &mut B) {
        let mut tag = tag::STREAM | LEN_BIT;
        if self.offset > 0 {
            tag |= OFF_BIT;
        }
        if self.is_fin {
            tag |= FIN_BIT;
        }
        buf.put_u8(tag);
        VarInt::new(self.stream_id).unwrap_or(VarInt::MAX).encode(buf);
        if self.offset > 0 {
            VarInt::new(self.offset).unwrap_or(VarInt::MAX).encode(buf);
        }
        VarInt::new(self.data.len() as u64)
            .unwrap_or(VarInt::MAX)
            .encode(buf);
        buf.put_slice(&self.data);
    }

    pub fn decode(tag: u8, buf: &mut Bytes) -> DecoderResult<Self> {
        let stream_id = buf.decode_varint()?.as_u64();
        let offset = if tag & OFF_BIT != 0 {
            buf.decode_varint()?.as_u64()
        } else {
            0
        };
        let data = if tag & LEN_BIT != 0 {
            buf.decode_slice_with_len_prefix_varint()?
        } else {
            let len = buf.remaining();
            buf.decode_slice(len)?
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
        //# The largest offset delivered on a stream -- the sum of the offset and
        //# data length -- cannot exceed 2^62-1, as it is not possible to provide
        //# flow control credit for that data.
        decoder_invariant!(
            offset.saturating_add(data.len() as u64) <= MAX_VARINT_VALUE,
            "stream offset exceeds maximum"
        );

        Ok(Self {
            stream_id,
            offset,
            data,
            is_fin: tag & FIN_BIT != 0,
        })
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.6
//# CRYPTO Frame {
//#   Type (i) = 0x06,
//#   Offset (i),
//#   Length (i),
//#   Crypto Data (..),
//# }

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Crypto {
    pub offset: u64,
    pub data: Bytes,
}

impl Crypto {
    #[inline]
    pub fn header_len(offset: u64, data_len: usize) -> usize {
        1 + encoding_size(offset) + encoding_size(data_len as u64)
    }

    #[inline]
    pub fn encoding_size(&self) -> usize {
        Self::header_len(self.offset, self.data.len()) + self.data.len()
    }

    pub fn encode<B: BufMut + ?Sized>(&self, buf: &mut B) {
        buf.put_u8(tag::CRYPTO);
        VarInt::new(self.offset).unwrap_or(VarInt::MAX).encode(buf);
        VarInt::new(self.data.len() as u64)
            .unwrap_or(VarInt::MAX)
            .encode(buf);
        buf.put_slice(&self.data);
    }

    pub fn decode(buf: &mut Bytes) -> DecoderResult<Self> {
        let offset = buf.decode_varint()?.as_u64();
        let data = buf.decode_slice_with_len_prefix_varint()?;
        decoder_invariant!(
            offset.saturating_add(data.len() as u64) <= MAX_VARINT_VALUE,
            "crypto offset exceeds maximum"
        );
        Ok(Self { offset, data })
    }
}
