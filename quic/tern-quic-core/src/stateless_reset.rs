// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Defines the Stateless Reset token

use subtle::ConstantTimeEq;

//= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
//# Stateless Reset {
//#   Fixed Bits (2) = 1,
//#   Unpredictable Bits (38..),
//#   Stateless Reset Token (128),
//# }

pub const TOKEN_LEN: usize = 128 / 8;

/// The smallest datagram that can carry a stateless reset: one header byte,
/// four unpredictable bytes and the token.
pub const MIN_PACKET_LEN: usize = 1 + 4 + TOKEN_LEN;

#[derive(Copy, Clone, Debug, Eq, Hash)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    /// A zeroed out stateless reset token
    pub const ZEROED: Self = Self([0; TOKEN_LEN]);

    #[inline]
    pub fn into_inner(self) -> [u8; TOKEN_LEN] {
        self.0
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-10.3.1
//# When comparing a datagram to stateless reset token values, endpoints
//# MUST perform the comparison without leaking information about the
//# value of the token.
impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl From<[u8; TOKEN_LEN]> for Token {
    fn from(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Token {
    type Error = core::array::TryFromSliceError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(bytes.try_into()?))
    }
}

impl AsRef<[u8]> for Token {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Returns the trailing token of a datagram that may be a stateless reset
#[inline]
pub fn trailing_token(datagram: &[u8]) -> Option<Token> {
    if datagram.len() < MIN_PACKET_LEN {
        return None;
    }
    Token::try_from(&datagram[datagram.len() - TOKEN_LEN..]).ok()
}
