// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! QUIC version numbers understood by the engine

/// QUIC version 1 (RFC 9000)
pub const QUIC_V1: u32 = 0x0000_0001;

/// QUIC version 2 (RFC 9369)
pub const QUIC_V2: u32 = 0x6b33_43cf;

/// The version field of a Version Negotiation packet
pub const NEGOTIATION: u32 = 0;

/// Returns true if the engine can speak `version`
#[inline]
pub fn is_supported(version: u32) -> bool {
    matches!(version, QUIC_V1 | QUIC_V2)
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-15
//# Versions that follow the pattern 0x?a?a?a?a are reserved for use in
//# forcing version negotiation to be exercised
#[inline]
pub fn is_reserved(version: u32) -> bool {
    version & 0x0f0f_0f0f == 0x0a0a_0a0a
}
