// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

#[cfg(any(test, feature = "generator"))]
use bolero_generator::*;

//= https://www.rfc-editor.org/rfc/rfc9000#section-12.3
//# Packet numbers are divided into three spaces in QUIC:
//#
//# Initial space:  All Initial packets (Section 17.2.2) are in this
//#    space.
//#
//# Handshake space:  All Handshake packets (Section 17.2.4) are in
//#    this space.
//#
//# Application data space:  All 0-RTT (Section 17.2.3) and 1-RTT
//#    (Section 17.3.1) packets are in this space.

/// Contains all of the available packet spaces for QUIC packets
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(any(test, feature = "generator"), derive(TypeGenerator))]
pub enum PacketNumberSpace {
    Initial,
    Handshake,
    ApplicationData,
}

impl PacketNumberSpace {
    pub const ALL: [Self; 3] = [Self::Initial, Self::Handshake, Self::ApplicationData];

    #[inline]
    pub fn is_initial(self) -> bool {
        matches!(self, Self::Initial)
    }

    #[inline]
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Handshake)
    }

    #[inline]
    pub fn is_application_data(self) -> bool {
        matches!(self, Self::ApplicationData)
    }

    /// Returns a dense index usable for per-space arrays
    #[inline]
    pub const fn as_index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for PacketNumberSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "INITIAL",
            Self::Handshake => "HANDSHAKE",
            Self::ApplicationData => "APPLICATION",
        };
        f.write_str(name)
    }
}

/// The largest value a packet number can take
pub const MAX_PACKET_NUMBER: u64 = (1 << 62) - 1;

/// Packet numbers are always written with this many bytes
pub const ENCODED_LEN: usize = 4;

/// Truncates a full packet number to the bytes written on the wire
#[inline]
pub fn truncate(packet_number: u64) -> u32 {
    (packet_number & 0xffff_ffff) as u32
}

//= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.3
//# DecodePacketNumber(largest_pn, truncated_pn, pn_nbits):
//#   expected_pn  = largest_pn + 1
//#   pn_win       = 1 << pn_nbits
//#   pn_hwin      = pn_win / 2
//#   pn_mask      = pn_win - 1
/// Recovers a full packet number from its truncated wire form
#[inline]
pub fn decode(largest_pn: Option<u64>, truncated_pn: u64, pn_nbits: u32) -> u64 {
    let expected = largest_pn.map_or(0, |pn| pn + 1);
    let win = 1u64 << pn_nbits;
    let hwin = win / 2;
    let mask = win - 1;
    let candidate = (expected & !mask) | truncated_pn;

    //#   if candidate_pn <= expected_pn - pn_hwin and
    //#      candidate_pn < (1 << 62) - pn_win:
    //#      return candidate_pn + pn_win
    //#   if candidate_pn > expected_pn + pn_hwin and
    //#      candidate_pn >= pn_win:
    //#      return candidate_pn - pn_win
    //#   return candidate_pn
    if candidate + hwin <= expected && candidate < (1 << 62) - win {
        candidate + win
    } else if candidate > expected + hwin && candidate >= win {
        candidate - win
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    //= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.3
    //= type=test
    //# For example, if the highest successfully authenticated packet had a
    //# packet number of 0xa82f30ea, then a packet containing a 16-bit value
    //# of 0x9b32 will be decoded as 0xa82f9b32.
    #[test]
    fn rfc_example() {
        assert_eq!(decode(Some(0xa82f30ea), 0x9b32, 16), 0xa82f9b32);
    }

    #[test]
    fn first_packet_decodes_to_itself() {
        assert_eq!(decode(None, 0, 32), 0);
        assert_eq!(decode(None, 7, 32), 7);
    }

    #[test]
    fn round_trip_near_largest() {
        bolero::check!()
            .with_type::<(u32, u16)>()
            .cloned()
            .for_each(|(largest, offset)| {
                let largest = largest as u64 + (1 << 33);
                let pn = largest + offset as u64;
                assert_eq!(decode(Some(largest), truncate(pn) as u64, 32), pn);
            });
    }
}
