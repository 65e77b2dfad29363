// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The seam to the TLS 1.3 handshake and packet protection.
//!
//! A connection never looks inside the handshake: it moves CRYPTO bytes between the wire
//! and a [`Session`], asks it to seal and open packets for a [`KeySpace`], and reads the
//! peer's transport parameters once they are available.

use bytes::{Bytes, BytesMut};
use tern_quic_core::{
    connection,
    crypto::{CryptoError, KeySpace},
    packet::retry::INTEGRITY_TAG_LEN,
};

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// What the handshake needs next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    /// Handshake bytes are ready to be taken with [`Session::produce_handshake_bytes`]
    NeedSendCrypto,
    /// A potentially blocking task (certificate validation, ...) must run
    NeedTask,
    /// Waiting for handshake bytes from the peer
    NeedRecvCrypto,
    /// The handshake finished and 1-RTT keys are installed
    Complete,
}

/// A TLS session driving the handshake of one connection
pub trait Session: Send {
    fn state(&self) -> HandshakeState;

    /// Derives the Initial keys from the client's first destination connection ID
    fn derive_initial_keys(&mut self, version: u32, destination: &connection::Id);

    /// Returns true if packets of `space` can be sealed and opened
    fn has_keys(&self, space: KeySpace) -> bool;

    /// Discards the keys of `space`; they are never derived again
    fn discard_keys(&mut self, space: KeySpace);

    /// The encoded transport parameters carried in our handshake
    fn set_local_transport_parameters(&mut self, parameters: Bytes);

    /// The peer's encoded transport parameters once received
    fn peer_transport_parameters(&self) -> Option<Bytes>;

    /// Takes the next chunk of handshake bytes and the space it is sent in
    fn produce_handshake_bytes(&mut self) -> Option<(KeySpace, Bytes)>;

    /// Feeds in-order CRYPTO stream bytes received in `space`
    fn consume_handshake_bytes(&mut self, space: KeySpace, bytes: Bytes) -> Result<(), CryptoError>;

    fn run_delegated_task(&mut self) -> Result<(), CryptoError>;

    /// Starts the handshake over, for a new version after Version Negotiation
    fn restart(&mut self, version: u32);

    /// Bytes the AEAD appends to every payload
    fn tag_len(&self) -> usize;

    /// Encrypts `payload` in place and appends the tag
    fn seal(
        &self,
        space: KeySpace,
        packet_number: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError>;

    /// Authenticates and decrypts `payload` in place, removing the tag
    fn open(
        &self,
        space: KeySpace,
        packet_number: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError>;

    /// Masks the first byte and packet number of a sealed packet
    fn protect_header(&self, space: KeySpace, packet: &mut [u8], pn_offset: usize) -> Result<(), CryptoError>;

    /// Removes the header protection applied by the peer
    fn unprotect_header(&self, space: KeySpace, packet: &mut [u8], pn_offset: usize) -> Result<(), CryptoError>;

    /// Computes the integrity tag of a Retry pseudo-packet
    fn retry_integrity_tag(&self, version: u32, pseudo_packet: &[u8]) -> [u8; INTEGRITY_TAG_LEN];
}
