// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::FIXED_BIT;
use crate::stateless_reset::{Token, MIN_PACKET_LEN, TOKEN_LEN};
use bytes::{BufMut, BytesMut};

//= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
//# An endpoint that sends a Stateless Reset in response to a packet that is
//# 43 bytes or shorter SHOULD send a Stateless Reset that is one byte
//# shorter than the packet it responds to.

/// Datagrams shorter than this are never answered with a stateless reset
pub const MIN_TRIGGERING_LEN: usize = 44;

/// Returns the length of a reset answering a datagram of `triggering_len` bytes, or `None`
/// if no reset may be sent
pub fn packet_len(triggering_len: usize, max_len: usize) -> Option<usize> {
    if triggering_len < MIN_TRIGGERING_LEN {
        return None;
    }
    Some((triggering_len - 1).min(max_len).max(MIN_PACKET_LEN))
}

/// Encodes a stateless reset packet.
///
/// `unpredictable` provides the random bytes that precede the token; the first one is
/// masked into a short header first byte.
pub fn encode(unpredictable: &[u8], token: &Token) -> BytesMut {
    debug_assert!(unpredictable.len() + TOKEN_LEN >= MIN_PACKET_LEN);
    let mut buf = BytesMut::with_capacity(unpredictable.len() + TOKEN_LEN);
    match unpredictable.split_first() {
        Some((first, rest)) => {
            buf.put_u8((*first & 0x3f) | FIXED_BIT);
            buf.put_slice(rest);
        }
        None => buf.put_u8(FIXED_BIT),
    }
    buf.put_slice(token.as_ref());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{packet, stateless_reset::trailing_token};

    #[test]
    fn reset_looks_like_short_header() {
        let token = Token::from([0x5a; TOKEN_LEN]);
        let len = packet_len(60, 1200).unwrap();
        assert_eq!(len, 59);
        let packet = encode(&vec![0xff; len - TOKEN_LEN], &token);
        assert_eq!(packet.len(), len);
        assert_eq!(
            packet::peek_header_type(&packet),
            Some(packet::HeaderType::Short)
        );
        assert_eq!(trailing_token(&packet), Some(token));
    }

    #[test]
    fn short_triggers_are_ignored() {
        assert_eq!(packet_len(43, 1200), None);
        assert_eq!(packet_len(44, 1200), Some(43));
        assert_eq!(packet_len(1500, 1200), Some(1200));
    }
}
