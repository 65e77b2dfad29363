// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::LONG_HEADER_BIT;
use crate::{
    codec::{DecoderBuffer, DecoderResult},
    connection, decoder_invariant, version,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
//# Version Negotiation Packet {
//#   Header Form (1) = 1,
//#   Unused (7),
//#   Version (32) = 0,
//#   Destination Connection ID Length (8),
//#   Destination Connection ID (0..2040),
//#   Source Connection ID Length (8),
//#   Source Connection ID (0..2040),
//#   Supported Version (32) ...,
//# }

/// Encodes a Version Negotiation packet answering a client's Initial.
///
/// The IDs are echoed swapped: `destination` is the client's source ID.
pub fn encode(
    unused_bits: u8,
    destination: &connection::Id,
    source: &connection::Id,
    supported: &[u32],
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(7 + 40 + supported.len() * 4);
    buf.put_u8(LONG_HEADER_BIT | (unused_bits & 0x7f));
    buf.put_u32(version::NEGOTIATION);
    destination.encode_len_prefixed(&mut buf);
    source.encode_len_prefixed(&mut buf);
    for version in supported {
        buf.put_u32(*version);
    }
    buf
}

/// Returns the versions offered by a Version Negotiation packet
pub fn decode_versions(packet: Bytes) -> DecoderResult<Vec<u32>> {
    let mut buf = packet;
    buf.skip(5)?;
    let _destination = connection::Id::decode_len_prefixed(&mut buf)?;
    let _source = connection::Id::decode_len_prefixed(&mut buf)?;
    decoder_invariant!(
        buf.remaining() % 4 == 0 && buf.has_remaining(),
        "malformed supported versions list"
    );
    let mut versions = Vec::with_capacity(buf.remaining() / 4);
    while buf.has_remaining() {
        versions.push(buf.decode_u32()?);
    }
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_round_trip() {
        let dcid = connection::Id::try_from_bytes(&[1; 8]).unwrap();
        let scid = connection::Id::try_from_bytes(&[2; 4]).unwrap();
        let packet = encode(0x15, &dcid, &scid, &[version::QUIC_V2, version::QUIC_V1]);
        assert_eq!(
            crate::packet::peek_packet_type(&packet),
            Some(crate::packet::PacketType::VersionNegotiation)
        );
        let versions = decode_versions(packet.freeze()).unwrap();
        assert_eq!(versions, vec![version::QUIC_V2, version::QUIC_V1]);
    }

    #[test]
    fn empty_list_is_malformed() {
        let dcid = connection::Id::EMPTY;
        let packet = encode(0, &dcid, &dcid, &[]);
        assert!(decode_versions(packet.freeze()).is_err());
    }
}
