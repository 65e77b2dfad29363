// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{PacketType, FIXED_BIT, LONG_HEADER_BIT};
use crate::connection;
use bytes::{BufMut, Bytes, BytesMut};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5
//# Retry Packet {
//#   Header Form (1) = 1,
//#   Fixed Bit (1) = 1,
//#   Long Packet Type (2) = 3,
//#   Unused (4),
//#   Version (32),
//#   Destination Connection ID Length (8),
//#   Destination Connection ID (0..160),
//#   Source Connection ID Length (8),
//#   Source Connection ID (0..160),
//#   Retry Token (..),
//#   Retry Integrity Tag (128),
//# }

pub const INTEGRITY_TAG_LEN: usize = 16;

/// Encodes a Retry packet without its integrity tag
pub fn encode_without_tag(
    version: u32,
    destination: &connection::Id,
    source: &connection::Id,
    token: &[u8],
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(1 + 4 + 2 + 40 + token.len() + INTEGRITY_TAG_LEN);
    buf.put_u8(LONG_HEADER_BIT | FIXED_BIT | (PacketType::Retry.long_type_bits(version) << 4));
    buf.put_u32(version);
    destination.encode_len_prefixed(&mut buf);
    source.encode_len_prefixed(&mut buf);
    buf.put_slice(token);
    buf
}

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.8
//# Retry Pseudo-Packet {
//#   ODCID Length (8),
//#   Original Destination Connection ID (0..160),
//#   Header Form (1) = 1,
//#   Fixed Bit (1) = 1,
//#   Long Packet Type (2) = 3,
//#   Unused (4),
//#   Version (32),
//#   DCID Len (8),
//#   Destination Connection ID (0..160),
//#   SCID Len (8),
//#   Source Connection ID (0..160),
//#   Retry Token (..),
//# }
/// Builds the pseudo-packet the integrity tag is computed over
pub fn pseudo_packet(original_destination: &connection::Id, retry_without_tag: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + original_destination.len() + retry_without_tag.len());
    original_destination.encode_len_prefixed(&mut buf);
    buf.put_slice(retry_without_tag);
    buf.freeze()
}

/// Splits a full Retry packet into its body and integrity tag
pub fn split_tag(packet: &[u8]) -> Option<(&[u8], &[u8])> {
    if packet.len() < INTEGRITY_TAG_LEN {
        return None;
    }
    Some(packet.split_at(packet.len() - INTEGRITY_TAG_LEN))
}
