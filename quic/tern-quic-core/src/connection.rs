// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Defines the QUIC connection ID

use crate::codec::{DecoderBuffer, DecoderError, DecoderResult};
use bytes::{Buf, BufMut};
use core::fmt;

#[cfg(any(test, feature = "generator"))]
use bolero_generator::*;

//= https://www.rfc-editor.org/rfc/rfc9000#section-5.1
//# Each connection possesses a set of connection identifiers, or
//# connection IDs, each of which can identify the connection.

/// The maximum size of a connection ID.
pub const MAX_LEN: usize = 20;

/// Uniquely identifies a QUIC connection between 2 peers
#[derive(Copy, Clone)]
#[cfg_attr(any(feature = "generator", test), derive(TypeGenerator))]
pub struct Id {
    bytes: [u8; MAX_LEN],
    #[cfg_attr(any(feature = "generator", test), generator(0..=(MAX_LEN as u8)))]
    len: u8,
}

// only the used prefix of `bytes` participates in comparisons
impl PartialEq for Id {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Id {}

impl PartialOrd for Id {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Id {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl core::hash::Hash for Id {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id(")?;
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("connection ID exceeds {MAX_LEN} bytes")]
pub struct IdLengthError;

impl Id {
    /// A zero-length connection ID
    pub const EMPTY: Self = Self {
        bytes: [0; MAX_LEN],
        len: 0,
    };

    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, IdLengthError> {
        if bytes.len() > MAX_LEN {
            return Err(IdLengthError);
        }
        let mut id = Self::EMPTY;
        id.bytes[..bytes.len()].copy_from_slice(bytes);
        id.len = bytes.len() as u8;
        Ok(id)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Decodes a connection ID of exactly `len` bytes
    pub fn decode_with_len<B: Buf + ?Sized>(buf: &mut B, len: usize) -> DecoderResult<Self> {
        if len > MAX_LEN {
            return Err(DecoderError::InvariantViolation("connection ID too long"));
        }
        buf.ensure_len(len)?;
        let mut id = Self::EMPTY;
        buf.copy_to_slice(&mut id.bytes[..len]);
        id.len = len as u8;
        Ok(id)
    }

    /// Decodes a connection ID prefixed with its one-byte length
    pub fn decode_len_prefixed<B: Buf + ?Sized>(buf: &mut B) -> DecoderResult<Self> {
        let len = buf.decode_u8()? as usize;
        Self::decode_with_len(buf, len)
    }

    pub fn encode_len_prefixed<B: BufMut + ?Sized>(&self, buf: &mut B) {
        buf.put_u8(self.len);
        buf.put_slice(self.as_bytes());
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl TryFrom<&[u8]> for Id {
    type Error = IdLengthError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::try_from_bytes(bytes)
    }
}

/// Whether the local endpoint acts as a client or a server
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    #[inline]
    pub fn is_client(self) -> bool {
        matches!(self, Self::Client)
    }

    #[inline]
    pub fn is_server(self) -> bool {
        matches!(self, Self::Server)
    }

    #[inline]
    pub fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};

    #[test]
    fn length_limits() {
        assert!(Id::try_from_bytes(&[0; 20]).is_ok());
        assert_eq!(Id::try_from_bytes(&[0; 21]), Err(IdLengthError));
        assert!(Id::EMPTY.is_empty());
    }

    #[test]
    fn len_prefixed_round_trip() {
        bolero::check!().with_type::<Id>().cloned().for_each(|id| {
            let mut buf = BytesMut::new();
            id.encode_len_prefixed(&mut buf);
            let mut buf: Bytes = buf.freeze();
            assert_eq!(Id::decode_len_prefixed(&mut buf), Ok(id));
        });
    }

    #[test]
    fn rejects_oversized_prefix() {
        let mut buf: &[u8] = &[21; 22];
        assert!(Id::decode_len_prefixed(&mut buf).is_err());
    }

    #[test]
    fn display_is_hex() {
        let id = Id::try_from_bytes(&[0xab, 0x01]).unwrap();
        assert_eq!(id.to_string(), "ab01");
        assert_eq!(format!("{id:?}"), "Id(ab01)");
    }
}
