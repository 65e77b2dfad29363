// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use tern_quic_core::{frame::ConnectionClose, transport::TransportError};

/// Why a connection ended.
///
/// The handshake future, pings and streams are all completed with this value.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TerminationCause {
    /// A protocol error detected locally, including TLS alerts
    #[error("transport error: {0}")]
    Transport(TransportError),
    /// The peer sent CONNECTION_CLOSE
    #[error("closed by peer with code {error_code:#x}")]
    PeerClosed { error_code: u64, application: bool },
    /// The client never heard back from the server
    #[error("connect timeout: {0}")]
    ConnectTimeout(&'static str),
    /// The handshake stopped making progress
    #[error("handshake failed: {0}")]
    HandshakeFailure(&'static str),
    #[error("I/O failure: {0}")]
    Io(&'static str),
    #[error("idle timeout")]
    IdleTimeout,
    #[error("stateless reset")]
    StatelessReset,
    /// Version Negotiation offered nothing we support
    #[error("no compatible version offered by peer")]
    NoCompatibleVersion,
    /// Closed by the local application
    #[error("application close with code {0:#x}")]
    ApplicationClose(u64),
}

impl TerminationCause {
    /// The CONNECTION_CLOSE frame sent for this cause, or `None` to drain silently
    pub fn close_frame(&self) -> Option<ConnectionClose> {
        let error = match self {
            Self::Transport(error) => *error,
            Self::ApplicationClose(error_code) => {
                return Some(ConnectionClose {
                    error_code: *error_code,
                    frame_type: None,
                    reason: Bytes::new(),
                })
            }
            Self::ConnectTimeout(reason) | Self::HandshakeFailure(reason) => {
                TransportError::NO_ERROR.with_reason(reason)
            }
            Self::Io(reason) => TransportError::INTERNAL_ERROR.with_reason(reason),
            Self::PeerClosed { .. }
            | Self::IdleTimeout
            | Self::StatelessReset
            | Self::NoCompatibleVersion => return None,
        };
        Some(ConnectionClose::from_transport_error(&error))
    }
}

impl From<TransportError> for TerminationCause {
    fn from(error: TransportError) -> Self {
        Self::Transport(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let causes = [
            TerminationCause::Transport(TransportError::PROTOCOL_VIOLATION),
            TerminationCause::PeerClosed {
                error_code: 0xa,
                application: false,
            },
            TerminationCause::ConnectTimeout("No response from peer for 30 seconds"),
            TerminationCause::IdleTimeout,
            TerminationCause::ApplicationClose(7),
        ];
        let lines: Vec<_> = causes.iter().map(ToString::to_string).collect();
        insta::assert_debug_snapshot!(lines, @r###"
        [
            "transport error: PROTOCOL_VIOLATION",
            "closed by peer with code 0xa",
            "connect timeout: No response from peer for 30 seconds",
            "idle timeout",
            "application close with code 0x7",
        ]
        "###);
    }

    #[test]
    fn silent_causes() {
        assert!(TerminationCause::IdleTimeout.close_frame().is_none());
        assert!(TerminationCause::StatelessReset.close_frame().is_none());

        let close = TerminationCause::Io("socket closed").close_frame().unwrap();
        assert_eq!(close.error_code, TransportError::INTERNAL_ERROR.code.as_u64());
        assert!(!close.is_application());

        let close = TerminationCause::ApplicationClose(3).close_frame().unwrap();
        assert!(close.is_application());
    }
}
