// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The connection state machine and the pieces it is built from

pub mod buffer_pool;
mod connection_impl;
pub(crate) mod crypto_stream;
mod error;
pub(crate) mod flow_control;
mod handshake;
pub(crate) mod id_registry;
mod limits;
pub mod link;
pub(crate) mod transport_parameters;

pub use connection_impl::{Connection, Parameters};
pub use error::TerminationCause;
pub use handshake::HandshakeFuture;
pub use limits::{Limits, ValidationError};
pub use link::{ClosedConnection, Datagram, EndpointLink};
/// re-export core
pub use tern_quic_core::connection::*;

bitflags::bitflags! {
    /// Connection lifecycle flags. An empty set is a new connection.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct State: u8 {
        /// The first Initial packet is about to be or was sent
        const HELLO_SENT = 1;
        const HANDSHAKE_COMPLETE = 1 << 1;
        const CLOSING = 1 << 2;
        const DRAINING = 1 << 3;
        const CLOSED = 1 << 4;
    }
}

impl State {
    const NOT_OPEN: Self = Self::CLOSING.union(Self::DRAINING).union(Self::CLOSED);

    #[inline]
    pub const fn is_new(&self) -> bool {
        self.is_empty()
    }

    #[inline]
    pub const fn is_open(&self) -> bool {
        !self.intersects(Self::NOT_OPEN)
    }

    #[inline]
    pub const fn is_handshake_complete(&self) -> bool {
        self.contains(Self::HANDSHAKE_COMPLETE)
    }
}
