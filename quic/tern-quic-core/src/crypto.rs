// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::packet::number::PacketNumberSpace;
use core::fmt;

/// The set of packet protection keys a packet is sealed with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeySpace {
    Initial,
    Handshake,
    ZeroRtt,
    OneRtt,
}

impl KeySpace {
    /// Returns the packet number space whose packets use these keys
    pub fn packet_number_space(self) -> PacketNumberSpace {
        match self {
            Self::Initial => PacketNumberSpace::Initial,
            Self::Handshake => PacketNumberSpace::Handshake,
            Self::ZeroRtt | Self::OneRtt => PacketNumberSpace::ApplicationData,
        }
    }
}

impl From<PacketNumberSpace> for KeySpace {
    fn from(space: PacketNumberSpace) -> Self {
        match space {
            PacketNumberSpace::Initial => Self::Initial,
            PacketNumberSpace::Handshake => Self::Handshake,
            PacketNumberSpace::ApplicationData => Self::OneRtt,
        }
    }
}

impl fmt::Display for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::Handshake => "handshake",
            Self::ZeroRtt => "0-rtt",
            Self::OneRtt => "1-rtt",
        };
        f.write_str(name)
    }
}

/// Failures of the packet protection layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// The keys for the space have not been derived yet
    #[error("{0} keys not available")]
    KeysUnavailable(KeySpace),
    /// The keys for the space were derived and then discarded
    #[error("{0} keys discarded")]
    KeysDiscarded(KeySpace),
    /// The packet failed AEAD authentication
    #[error("packet authentication failed")]
    DecryptError,
    /// The TLS stack raised the given alert
    #[error("TLS alert {0}")]
    Alert(u8),
}

impl CryptoError {
    /// Returns true for errors that only mean the keys are not (or no longer) present
    #[inline]
    pub fn is_key_unavailable(&self) -> bool {
        matches!(self, Self::KeysUnavailable(_) | Self::KeysDiscarded(_))
    }
}
