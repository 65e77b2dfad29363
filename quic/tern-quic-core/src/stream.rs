// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::connection::Role;

//= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
//# The least significant bit (0x01) of the stream ID identifies the
//# initiator of the stream.  Client-initiated streams have even-numbered
//# stream IDs (with the bit set to 0), and server-initiated streams have
//# odd-numbered stream IDs (with the bit set to 1).
//#
//# The second least significant bit (0x02) of the stream ID
//# distinguishes between bidirectional streams (with the bit set to 0)
//# and unidirectional streams (with the bit set to 1).

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamType {
    Bidirectional,
    Unidirectional,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u64);

impl StreamId {
    #[inline]
    pub const fn from_u64(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn initiator(self) -> Role {
        if self.0 & 0x01 == 0 {
            Role::Client
        } else {
            Role::Server
        }
    }

    #[inline]
    pub fn stream_type(self) -> StreamType {
        if self.0 & 0x02 == 0 {
            StreamType::Bidirectional
        } else {
            StreamType::Unidirectional
        }
    }

    #[inline]
    pub fn is_unidirectional(self) -> bool {
        self.stream_type() == StreamType::Unidirectional
    }

    /// Returns true if `local` opened the stream
    #[inline]
    pub fn is_locally_initiated(self, local: Role) -> bool {
        self.initiator() == local
    }

    /// Returns true if `local` may receive data on this stream
    #[inline]
    pub fn is_receivable_by(self, local: Role) -> bool {
        !(self.is_unidirectional() && self.is_locally_initiated(local))
    }

    /// Returns true if `local` may send data on this stream
    #[inline]
    pub fn is_sendable_by(self, local: Role) -> bool {
        !(self.is_unidirectional() && !self.is_locally_initiated(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_bits() {
        let client_bidi = StreamId::from_u64(0);
        let server_bidi = StreamId::from_u64(1);
        let client_uni = StreamId::from_u64(2);
        let server_uni = StreamId::from_u64(3);

        assert_eq!(client_bidi.initiator(), Role::Client);
        assert_eq!(server_bidi.initiator(), Role::Server);
        assert_eq!(client_uni.stream_type(), StreamType::Unidirectional);

        assert!(client_bidi.is_receivable_by(Role::Client));
        assert!(!client_uni.is_receivable_by(Role::Client));
        assert!(client_uni.is_receivable_by(Role::Server));
        assert!(!server_uni.is_sendable_by(Role::Client));
        assert!(server_uni.is_sendable_by(Role::Server));
    }
}
