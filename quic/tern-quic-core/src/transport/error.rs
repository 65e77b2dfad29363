// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{codec::DecoderError, crypto::CryptoError, varint::VarInt};
use core::fmt;

//= https://www.rfc-editor.org/rfc/rfc9000#section-20.1
//# QUIC transport error codes and application error codes are 62-bit
//# unsigned integers.

/// A transport error code paired with the frame type that triggered it and a static reason.
///
/// This is the value carried to the termination boundary and converted into a
/// CONNECTION_CLOSE frame there.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransportError {
    pub code: VarInt,
    pub frame_type: Option<VarInt>,
    pub reason: &'static str,
}

impl TransportError {
    /// Creates a new `TransportError`
    pub const fn new(code: VarInt) -> Self {
        Self {
            code,
            reason: "",
            frame_type: None,
        }
    }

    /// Updates the `TransportError` with the specified `frame_type`
    pub const fn with_frame_type(mut self, frame_type: VarInt) -> Self {
        self.frame_type = Some(frame_type);
        self
    }

    /// Updates the `TransportError` with the specified `reason`
    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-20.1
    //# CRYPTO_ERROR (0x0100-0x01ff):  The cryptographic handshake failed.  A
    //#    range of 256 values is reserved for carrying error codes specific
    //#    to the cryptographic handshake that is used.
    pub const fn crypto_error(alert: u8) -> Self {
        Self::new(VarInt::from_u16(0x100 | alert as u16))
    }

    /// Returns true if the code is in the TLS alert range
    pub fn is_crypto_error(&self) -> bool {
        (0x100..=0x1ff).contains(&self.code.as_u64())
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.reason.is_empty() {
            self.reason.fmt(f)
        } else if let Some(description) = self.description() {
            description.fmt(f)
        } else {
            write!(f, "TransportError({})", self.code)
        }
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("TransportError");
        d.field("code", &self.code);
        if let Some(description) = self.description() {
            d.field("description", &description);
        }
        if !self.reason.is_empty() {
            d.field("reason", &self.reason);
        }
        if let Some(frame_type) = self.frame_type {
            d.field("frame_type", &frame_type);
        }
        d.finish()
    }
}

impl std::error::Error for TransportError {}

macro_rules! impl_errors {
    ($($(#[doc = $doc:expr])* $name:ident = $code:literal),* $(,)?) => {
        impl TransportError {
            $(
                $(#[doc = $doc])*
                pub const $name: Self = Self::new(VarInt::from_u32($code));
            )*

            pub fn description(&self) -> Option<&'static str> {
                match self.code.as_u64() {
                    $(
                        $code => Some(stringify!($name)),
                    )*
                    0x100..=0x1ff => Some("CRYPTO_ERROR"),
                    _ => None
                }
            }
        }

        #[test]
        fn description_test() {
            $(
                assert_eq!(&TransportError::$name.to_string(), stringify!($name));
            )*
            assert_eq!(&TransportError::crypto_error(40).to_string(), "CRYPTO_ERROR");
        }
    };
}

impl_errors! {
    /// The connection is being closed abruptly in the absence of any error
    NO_ERROR = 0x0,
    /// The endpoint encountered an internal error and cannot continue with the connection
    INTERNAL_ERROR = 0x1,
    /// The server refused to accept a new connection
    CONNECTION_REFUSED = 0x2,
    /// The peer sent more data than permitted by its advertised flow-control limits
    FLOW_CONTROL_ERROR = 0x3,
    /// A frame opened a stream beyond the advertised stream limit
    STREAM_LIMIT_ERROR = 0x4,
    /// A frame was received for a stream that was not in a state permitting it
    STREAM_STATE_ERROR = 0x5,
    /// A final size conflicts with data already received
    FINAL_SIZE_ERROR = 0x6,
    /// A frame was badly formatted
    FRAME_ENCODING_ERROR = 0x7,
    /// Transport parameters were badly formatted, invalid or absent
    TRANSPORT_PARAMETER_ERROR = 0x8,
    /// The peer provided more connection IDs than the advertised limit
    CONNECTION_ID_LIMIT_ERROR = 0x9,
    /// A protocol compliance error was detected
    PROTOCOL_VIOLATION = 0xA,
    /// A server received a client Initial with an invalid token
    INVALID_TOKEN = 0xB,
    /// The application or application protocol caused the connection to be closed
    APPLICATION_ERROR = 0xC,
    /// More data was received in CRYPTO frames than can be buffered
    CRYPTO_BUFFER_EXCEEDED = 0xD,
    /// An error in key updates was detected
    KEY_UPDATE_ERROR = 0xE,
    /// The endpoint reached the confidentiality or integrity limit for the AEAD
    AEAD_LIMIT_REACHED = 0xF,
    /// No viable network path exists
    NO_VIABLE_PATH = 0x10,
    /// Version negotiation failed or was tampered with
    VERSION_NEGOTIATION_ERROR = 0x11,
}

/// Implements conversion from decoder errors
impl From<DecoderError> for TransportError {
    fn from(decoder_error: DecoderError) -> Self {
        match decoder_error {
            DecoderError::InvariantViolation(reason) => {
                Self::FRAME_ENCODING_ERROR.with_reason(reason)
            }
            _ => Self::FRAME_ENCODING_ERROR.with_reason("malformed frame"),
        }
    }
}

impl From<CryptoError> for TransportError {
    fn from(error: CryptoError) -> Self {
        match error {
            CryptoError::KeysUnavailable(_) | CryptoError::KeysDiscarded(_) => {
                Self::INTERNAL_ERROR.with_reason("packet protection keys not available")
            }
            CryptoError::DecryptError => {
                Self::PROTOCOL_VIOLATION.with_reason("packet authentication failed")
            }
            CryptoError::Alert(alert) => Self::crypto_error(alert),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_snapshot() {
        let error = TransportError::PROTOCOL_VIOLATION
            .with_reason("ack of a never-sent packet")
            .with_frame_type(VarInt::from_u8(0x02));
        insta::assert_snapshot!(format!("{error:?}"), @r###"TransportError { code: VarInt(10), description: "PROTOCOL_VIOLATION", reason: "ack of a never-sent packet", frame_type: VarInt(2) }"###);
        assert_eq!(error.to_string(), "ack of a never-sent packet");
    }

    #[test]
    fn crypto_range() {
        let error = TransportError::crypto_error(0x28);
        assert_eq!(error.code.as_u64(), 0x128);
        assert!(error.is_crypto_error());
        assert!(!TransportError::NO_ERROR.is_crypto_error());
    }

    #[test]
    fn decoder_errors_are_encoding_errors() {
        let error: TransportError = DecoderError::UnexpectedEof(3).into();
        assert_eq!(error.code, TransportError::FRAME_ENCODING_ERROR.code);
    }
}
