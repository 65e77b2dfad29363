// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    codec::{DecoderBuffer, DecoderError, DecoderResult},
    decoder_invariant,
    varint::{encoding_size, VarInt},
};
use bytes::{Buf, BufMut};
use core::ops::RangeInclusive;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.3
//# ACK Frame {
//#   Type (i) = 0x02..0x03,
//#   Largest Acknowledged (i),
//#   ACK Delay (i),
//#   ACK Range Count (i),
//#   First ACK Range (i),
//#   ACK Range (..) ...,
//#   [ECN Counts (..)],
//# }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect_0_count: u64,
    pub ect_1_count: u64,
    pub ce_count: u64,
}

/// An ACK frame with its ranges stored largest first.
///
/// Ranges never overlap or touch, and `ranges` is never empty for a decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    /// The encoded ACK Delay field, in units of `2^ack_delay_exponent` microseconds
    pub ack_delay: u64,
    pub ranges: Vec<RangeInclusive<u64>>,
    pub ecn_counts: Option<EcnCounts>,
}

impl Ack {
    #[inline]
    pub fn tag(&self) -> u8 {
        if self.ecn_counts.is_some() {
            super::tag::ACK_ECN
        } else {
            super::tag::ACK
        }
    }

    #[inline]
    pub fn largest_acknowledged(&self) -> u64 {
        self.ranges.first().map_or(0, |range| *range.end())
    }

    #[inline]
    pub fn smallest_acknowledged(&self) -> u64 {
        self.ranges.last().map_or(0, |range| *range.start())
    }

    /// Returns true if `packet_number` falls in one of the ranges
    pub fn contains(&self, packet_number: u64) -> bool {
        // ranges are descending so a binary search runs on reversed comparisons
        self.ranges
            .binary_search_by(|range| {
                if packet_number > *range.end() {
                    core::cmp::Ordering::Greater
                } else if packet_number < *range.start() {
                    core::cmp::Ordering::Less
                } else {
                    core::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Iterates over every acknowledged packet number, largest first
    pub fn packet_numbers(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|range| range.clone().rev())
    }

    pub fn encoding_size(&self) -> usize {
        let mut len = 1;
        let Some(first) = self.ranges.first() else {
            return len + 4;
        };
        len += encoding_size(*first.end());
        len += encoding_size(self.ack_delay.min(crate::varint::MAX_VARINT_VALUE));
        len += encoding_size(self.ranges.len() as u64 - 1);
        len += encoding_size(first.end() - first.start());
        let mut smallest = *first.start();
        for range in &self.ranges[1..] {
            len += encoding_size(smallest - range.end() - 2);
            len += encoding_size(range.end() - range.start());
            smallest = *range.start();
        }
        if let Some(ecn) = &self.ecn_counts {
            len += encoding_size(ecn.ect_0_count);
            len += encoding_size(ecn.ect_1_count);
            len += encoding_size(ecn.ce_count);
        }
        len
    }

    pub fn encode<B: BufMut + ?Sized>(&self, buf: &mut B) {
        buf.put_u8(self.tag());
        let Some(first) = self.ranges.first() else {
            // an empty frame is never sent; keep the output well-formed anyway
            buf.put_slice(&[0, 0, 0, 0]);
            return;
        };
        let varint = |value: u64| VarInt::new(value).unwrap_or(VarInt::MAX);
        varint(*first.end()).encode(buf);
        varint(self.ack_delay).encode(buf);
        varint(self.ranges.len() as u64 - 1).encode(buf);
        varint(first.end() - first.start()).encode(buf);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.3.1
        //# Gap:  A variable-length integer indicating the number of contiguous
        //#    unacknowledged packets preceding the packet number one lower than
        //#    the smallest in the preceding ACK Range.
        let mut smallest = *first.start();
        for range in &self.ranges[1..] {
            varint(smallest - range.end() - 2).encode(buf);
            varint(range.end() - range.start()).encode(buf);
            smallest = *range.start();
        }

        if let Some(ecn) = &self.ecn_counts {
            varint(ecn.ect_0_count).encode(buf);
            varint(ecn.ect_1_count).encode(buf);
            varint(ecn.ce_count).encode(buf);
        }
    }

    /// Decodes the frame body; the tag has already been consumed
    pub fn decode<B: Buf + ?Sized>(tag: u8, buf: &mut B) -> DecoderResult<Self> {
        let largest = buf.decode_varint()?.as_u64();
        let ack_delay = buf.decode_varint()?.as_u64();
        let range_count = buf.decode_varint()?.as_u64();
        let first_range = buf.decode_varint()?.as_u64();

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.3.1
        //# If any computed packet number is negative, an endpoint MUST
        //# generate a connection error of type FRAME_ENCODING_ERROR.
        decoder_invariant!(first_range <= largest, "ack range underflow");

        // every range takes at least two bytes, which bounds the allocation
        decoder_invariant!(
            range_count <= (buf.remaining() as u64) / 2,
            "ack range count exceeds frame"
        );

        let mut ranges = Vec::with_capacity(range_count as usize + 1);
        let mut smallest = largest - first_range;
        ranges.push(smallest..=largest);

        for _ in 0..range_count {
            let gap = buf.decode_varint()?.as_u64();
            let len = buf.decode_varint()?.as_u64();
            let end = smallest
                .checked_sub(gap)
                .and_then(|v| v.checked_sub(2))
                .ok_or(DecoderError::InvariantViolation("ack range underflow"))?;
            let start = end
                .checked_sub(len)
                .ok_or(DecoderError::InvariantViolation("ack range underflow"))?;
            ranges.push(start..=end);
            smallest = start;
        }

        let ecn_counts = if tag == super::tag::ACK_ECN {
            Some(EcnCounts {
                ect_0_count: buf.decode_varint()?.as_u64(),
                ect_1_count: buf.decode_varint()?.as_u64(),
                ce_count: buf.decode_varint()?.as_u64(),
            })
        } else {
            None
        };

        Ok(Self {
            ack_delay,
            ranges,
            ecn_counts,
        })
    }
}
