// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{number, PacketType, FIXED_BIT, LONG_HEADER_BIT};
use crate::{
    codec::{DecoderBuffer, DecoderError, DecoderResult},
    connection, decoder_invariant,
    varint::VarInt,
    version,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# Long Header Packet {
//#   Header Form (1) = 1,
//#   Fixed Bit (1) = 1,
//#   Long Packet Type (2),
//#   Type-Specific Bits (4),
//#   Version (32),
//#   Destination Connection ID Length (8),
//#   Destination Connection ID (0..160),
//#   Source Connection ID Length (8),
//#   Source Connection ID (0..160),
//#   Type-Specific Payload (..),
//# }

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.3.1
//# 1-RTT Packet {
//#   Header Form (1) = 0,
//#   Fixed Bit (1) = 1,
//#   Spin Bit (1),
//#   Reserved Bits (2),
//#   Key Phase (1),
//#   Packet Number Length (2),
//#   Destination Connection ID (0..160),
//#   Packet Number (8..32),
//#   Packet Payload (8..),
//# }

const PACKET_NUMBER_LEN_BITS: u8 = (number::ENCODED_LEN - 1) as u8;
const KEY_PHASE_BIT: u8 = 0x04;

/// Header of an outgoing packet that carries a packet number
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Header {
    Long {
        packet_type: PacketType,
        version: u32,
        destination: connection::Id,
        source: connection::Id,
        /// Only written for Initial packets
        token: Bytes,
    },
    Short {
        destination: connection::Id,
        key_phase: bool,
    },
}

impl Header {
    #[inline]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Long { packet_type, .. } => *packet_type,
            Self::Short { .. } => PacketType::OneRtt,
        }
    }

    /// Returns the encoded header length given the protected payload length
    pub fn encoding_size(&self, payload_len: usize) -> usize {
        match self {
            Self::Long {
                packet_type,
                destination,
                source,
                token,
                ..
            } => {
                let mut len = 1 + 4 + 1 + destination.len() + 1 + source.len();
                if *packet_type == PacketType::Initial {
                    len += VarInt::try_from(token.len()).map_or(8, |v| v.encoding_size());
                    len += token.len();
                }
                let length = (number::ENCODED_LEN + payload_len) as u64;
                len + crate::varint::encoding_size(length) + number::ENCODED_LEN
            }
            Self::Short { destination, .. } => 1 + destination.len() + number::ENCODED_LEN,
        }
    }

    /// Writes the header and returns the offset of the packet number in `buf`.
    ///
    /// `payload_len` is the length of the protected payload, AEAD tag included.
    pub fn encode(&self, packet_number: u64, payload_len: usize, buf: &mut BytesMut) -> usize {
        match self {
            Self::Long {
                packet_type,
                version,
                destination,
                source,
                token,
            } => {
                let first = LONG_HEADER_BIT
                    | FIXED_BIT
                    | (packet_type.long_type_bits(*version) << 4)
                    | PACKET_NUMBER_LEN_BITS;
                buf.put_u8(first);
                buf.put_u32(*version);
                destination.encode_len_prefixed(buf);
                source.encode_len_prefixed(buf);
                if *packet_type == PacketType::Initial {
                    VarInt::try_from(token.len())
                        .unwrap_or(VarInt::ZERO)
                        .encode(buf);
                    buf.put_slice(token);
                }
                let length = VarInt::try_from(number::ENCODED_LEN + payload_len)
                    .unwrap_or(VarInt::MAX);
                length.encode(buf);
            }
            Self::Short {
                destination,
                key_phase,
            } => {
                let mut first = FIXED_BIT | PACKET_NUMBER_LEN_BITS;
                if *key_phase {
                    first |= KEY_PHASE_BIT;
                }
                buf.put_u8(first);
                buf.put_slice(destination.as_bytes());
            }
        }
        let pn_offset = buf.len();
        buf.put_u32(number::truncate(packet_number));
        pn_offset
    }
}

/// A packet split out of a datagram whose header protection has not been removed yet
#[derive(Clone, Debug)]
pub struct ProtectedPacket {
    pub packet_type: PacketType,
    /// `None` for short headers
    pub version: Option<u32>,
    pub destination: connection::Id,
    pub source: Option<connection::Id>,
    /// Initial token, or the Retry token
    pub token: Bytes,
    /// Offset of the packet number field inside `packet`; zero for Retry and Version
    /// Negotiation packets
    pub pn_offset: usize,
    /// The bytes of this packet only
    pub packet: Bytes,
}

impl ProtectedPacket {
    /// Splits the first packet off `datagram`.
    ///
    /// Returns the packet and the remaining coalesced bytes.
    pub fn decode(datagram: Bytes, short_id_len: usize) -> DecoderResult<(Self, Bytes)> {
        let mut buf = datagram.clone();
        let first = buf.decode_u8()?;
        decoder_invariant!(
            first & LONG_HEADER_BIT != 0 || first & FIXED_BIT != 0,
            "fixed bit not set"
        );

        if first & LONG_HEADER_BIT == 0 {
            let destination = connection::Id::decode_with_len(&mut buf, short_id_len)?;
            let pn_offset = 1 + short_id_len;
            // the packet number is at least one byte and the sample requires more, so the
            // full four byte window has to be present
            if datagram.len() < pn_offset + number::ENCODED_LEN {
                return Err(DecoderError::UnexpectedEof(pn_offset + number::ENCODED_LEN));
            }
            let packet = Self {
                packet_type: PacketType::OneRtt,
                version: None,
                destination,
                source: None,
                token: Bytes::new(),
                pn_offset,
                packet: datagram,
            };
            return Ok((packet, Bytes::new()));
        }

        let version = buf.decode_u32()?;
        let destination = connection::Id::decode_len_prefixed(&mut buf)?;
        let source = connection::Id::decode_len_prefixed(&mut buf)?;

        if version == version::NEGOTIATION {
            let packet = Self {
                packet_type: PacketType::VersionNegotiation,
                version: Some(version),
                destination,
                source: Some(source),
                token: Bytes::new(),
                pn_offset: 0,
                packet: datagram,
            };
            return Ok((packet, Bytes::new()));
        }

        let packet_type = PacketType::from_long_type_bits((first >> 4) & 0b11, version);

        if packet_type == PacketType::Retry {
            decoder_invariant!(
                buf.remaining() >= super::retry::INTEGRITY_TAG_LEN,
                "retry packet too short"
            );
            let token_len = buf.remaining() - super::retry::INTEGRITY_TAG_LEN;
            let token = buf.decode_slice(token_len)?;
            let packet = Self {
                packet_type,
                version: Some(version),
                destination,
                source: Some(source),
                token,
                pn_offset: 0,
                packet: datagram,
            };
            return Ok((packet, Bytes::new()));
        }

        let token = if packet_type == PacketType::Initial {
            buf.decode_slice_with_len_prefix_varint()?
        } else {
            Bytes::new()
        };

        let length = buf.decode_varint()?.as_u64() as usize;
        let pn_offset = datagram.len() - buf.remaining();
        decoder_invariant!(length >= number::ENCODED_LEN, "packet length too short");
        if buf.remaining() < length {
            return Err(DecoderError::UnexpectedEof(length));
        }
        let end = pn_offset + length;

        let packet = Self {
            packet_type,
            version: Some(version),
            destination,
            source: Some(source),
            token,
            pn_offset,
            packet: datagram.slice(..end),
        };
        Ok((packet, datagram.slice(end..)))
    }

    /// Returns the packet number length encoded in an unprotected first byte
    #[inline]
    pub fn packet_number_len(first_byte: u8) -> usize {
        (first_byte & 0b11) as usize + 1
    }

    /// Returns the reserved bits of an unprotected first byte, which must be zero
    #[inline]
    pub fn reserved_bits(first_byte: u8, packet_type: PacketType) -> u8 {
        match packet_type {
            PacketType::OneRtt => first_byte & 0x18,
            _ => first_byte & 0x0c,
        }
    }

    /// Returns the key phase bit of an unprotected short header first byte
    #[inline]
    pub fn key_phase(first_byte: u8) -> bool {
        first_byte & KEY_PHASE_BIT != 0
    }
}

/// Reads a truncated packet number of `len` bytes starting at `offset`
pub fn read_truncated_packet_number(packet: &[u8], offset: usize, len: usize) -> DecoderResult<u64> {
    let bytes = packet
        .get(offset..offset + len)
        .ok_or(DecoderError::UnexpectedEof(len))?;
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}
