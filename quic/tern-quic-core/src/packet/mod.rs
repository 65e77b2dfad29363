// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod header;
pub mod number;
pub mod retry;
pub mod stateless_reset;
pub mod version_negotiation;

pub use header::{Header, ProtectedPacket};
pub use number::PacketNumberSpace;

use crate::{connection, version};
use core::fmt;

//= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
//# A client MUST expand the payload of all UDP datagrams carrying
//# Initial packets to at least the smallest allowed maximum datagram
//# size of 1200 bytes
pub const MIN_INITIAL_DATAGRAM_LEN: usize = 1200;

/// The largest UDP payload that fits in an IPv6 datagram
pub const MAX_IPV6_DATAGRAM_LEN: usize = 65527;

const LONG_HEADER_BIT: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeaderType {
    Long,
    Short,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    VersionNegotiation,
    OneRtt,
}

impl PacketType {
    /// Returns the packet number space, or `None` for packets without packet numbers
    #[inline]
    pub fn packet_number_space(self) -> Option<PacketNumberSpace> {
        match self {
            Self::Initial => Some(PacketNumberSpace::Initial),
            Self::Handshake => Some(PacketNumberSpace::Handshake),
            Self::ZeroRtt | Self::OneRtt => Some(PacketNumberSpace::ApplicationData),
            Self::Retry | Self::VersionNegotiation => None,
        }
    }

    #[inline]
    pub fn header_type(self) -> HeaderType {
        match self {
            Self::OneRtt => HeaderType::Short,
            _ => HeaderType::Long,
        }
    }

    /// Returns the long-header type bits for `version`
    //= https://www.rfc-editor.org/rfc/rfc9369#section-3.2
    //# Initial: 0b01
    //# 0-RTT: 0b10
    //# Handshake: 0b11
    //# Retry: 0b00
    pub(crate) fn long_type_bits(self, version: u32) -> u8 {
        let bits = match self {
            Self::Initial => 0,
            Self::ZeroRtt => 1,
            Self::Handshake => 2,
            _ => 3,
        };
        if version == version::QUIC_V2 {
            (bits + 1) & 0b11
        } else {
            bits
        }
    }

    pub(crate) fn from_long_type_bits(bits: u8, version: u32) -> Self {
        let bits = if version == version::QUIC_V2 {
            (bits + 3) & 0b11
        } else {
            bits
        };
        match bits {
            0 => Self::Initial,
            1 => Self::ZeroRtt,
            2 => Self::Handshake,
            _ => Self::Retry,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Peeks at the first byte of a datagram to determine its header form
#[inline]
pub fn peek_header_type(datagram: &[u8]) -> Option<HeaderType> {
    let first = *datagram.first()?;
    if first & LONG_HEADER_BIT != 0 {
        Some(HeaderType::Long)
    } else {
        Some(HeaderType::Short)
    }
}

/// Peeks at the version field of a long header datagram
#[inline]
pub fn peek_version(datagram: &[u8]) -> Option<u32> {
    if peek_header_type(datagram)? != HeaderType::Long {
        return None;
    }
    let bytes = datagram.get(1..5)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Peeks at the packet type of the first packet in a datagram
#[inline]
pub fn peek_packet_type(datagram: &[u8]) -> Option<PacketType> {
    match peek_header_type(datagram)? {
        HeaderType::Short => Some(PacketType::OneRtt),
        HeaderType::Long => {
            let version = peek_version(datagram)?;
            if version == version::NEGOTIATION {
                return Some(PacketType::VersionNegotiation);
            }
            Some(PacketType::from_long_type_bits(
                (datagram[0] >> 4) & 0b11,
                version,
            ))
        }
    }
}

/// Peeks at the destination connection ID of the first packet in a datagram.
///
/// Short headers do not carry the ID length so the locally issued length is used.
#[inline]
pub fn peek_destination_id(datagram: &[u8], short_id_len: usize) -> Option<connection::Id> {
    match peek_header_type(datagram)? {
        HeaderType::Long => {
            let len = *datagram.get(5)? as usize;
            connection::Id::try_from_bytes(datagram.get(6..6 + len)?).ok()
        }
        HeaderType::Short => {
            connection::Id::try_from_bytes(datagram.get(1..1 + short_id_len)?).ok()
        }
    }
}

/// Peeks at the source connection ID of a long header datagram
#[inline]
pub fn peek_source_id(datagram: &[u8]) -> Option<connection::Id> {
    if peek_header_type(datagram)? != HeaderType::Long {
        return None;
    }
    let dcid_len = *datagram.get(5)? as usize;
    let offset = 6 + dcid_len;
    let len = *datagram.get(offset)? as usize;
    connection::Id::try_from_bytes(datagram.get(offset + 1..offset + 1 + len)?).ok()
}
