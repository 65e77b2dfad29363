// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! What a connection needs from the endpoint it lives on

use super::buffer_pool::BufferPermit;
use bytes::Bytes;
use core::time::Duration;
use std::net::SocketAddr;
use tern_quic_core::{connection, stateless_reset};

/// An encrypted datagram on its way to the socket
#[derive(Debug)]
pub struct Datagram {
    pub peer: SocketAddr,
    pub payload: Bytes,
    /// Returned to the connection's pool once the datagram is sent or dropped
    pub permit: Option<BufferPermit>,
}

/// Left in the routing table once a connection tears down
#[derive(Debug)]
pub struct ClosedConnection {
    pub peer: SocketAddr,
    pub ids: Vec<connection::Id>,
    pub reset_tokens: Vec<stateless_reset::Token>,
    /// CONNECTION_CLOSE datagrams repeated to the peer; empty while draining
    pub close_datagrams: Vec<Bytes>,
    /// How long the placeholder stays routable
    pub timeout: Duration,
}

impl ClosedConnection {
    #[inline]
    pub fn is_draining(&self) -> bool {
        self.close_datagrams.is_empty()
    }
}

/// The endpoint side of one connection
pub trait EndpointLink: Send + Sync {
    fn max_datagram_size(&self) -> usize;

    /// Length of the connection IDs the endpoint issues
    fn local_id_len(&self) -> usize;

    /// Queues a datagram for the socket
    fn push_datagram(&self, datagram: Datagram);

    /// Generates a fresh connection ID and its stateless reset token
    fn generate_id(&self) -> (connection::Id, stateless_reset::Token);

    /// Routes datagrams addressed to `id` to this connection
    fn register_id(&self, id: connection::Id);

    fn retire_id(&self, id: &connection::Id);

    /// Matches stateless resets carrying `token` to this connection
    fn register_reset_token(&self, token: stateless_reset::Token);

    fn unregister_reset_token(&self, token: &stateless_reset::Token);

    /// Replaces the connection with a closing or draining placeholder
    fn on_closed(&self, closed: ClosedConnection);
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tern_quic_core::packet::MIN_INITIAL_DATAGRAM_LEN;

    /// Records everything the connection asks of the endpoint
    #[derive(Debug, Default)]
    pub struct Link {
        pub datagrams: Mutex<VecDeque<Datagram>>,
        pub ids: Mutex<Vec<connection::Id>>,
        pub reset_tokens: Mutex<Vec<stateless_reset::Token>>,
        pub closed: Mutex<Option<ClosedConnection>>,
        next_id: Mutex<u8>,
        id_prefix: u8,
    }

    impl Link {
        /// IDs generated by this link start with `id_prefix`
        pub fn new(id_prefix: u8) -> Self {
            Self {
                id_prefix,
                ..Default::default()
            }
        }

        /// Takes the queued payloads, returning their buffers to the connection
        pub fn take_datagrams(&self) -> Vec<Bytes> {
            // permits are released outside the lock since returning one may send more
            let datagrams: Vec<Datagram> = self.datagrams.lock().drain(..).collect();
            datagrams
                .into_iter()
                .map(|datagram| datagram.payload)
                .collect()
        }
    }

    impl EndpointLink for Link {
        fn max_datagram_size(&self) -> usize {
            MIN_INITIAL_DATAGRAM_LEN
        }

        fn local_id_len(&self) -> usize {
            8
        }

        fn push_datagram(&self, datagram: Datagram) {
            self.datagrams.lock().push_back(datagram);
        }

        fn generate_id(&self) -> (connection::Id, stateless_reset::Token) {
            let mut next = self.next_id.lock();
            *next += 1;
            let mut bytes = [*next; 8];
            bytes[0] = self.id_prefix;
            let id = connection::Id::try_from_bytes(&bytes).unwrap_or(connection::Id::EMPTY);
            let token = [*next ^ self.id_prefix; stateless_reset::TOKEN_LEN].into();
            (id, token)
        }

        fn register_id(&self, id: connection::Id) {
            self.ids.lock().push(id);
        }

        fn retire_id(&self, id: &connection::Id) {
            self.ids.lock().retain(|registered| registered != id);
        }

        fn register_reset_token(&self, token: stateless_reset::Token) {
            self.reset_tokens.lock().push(token);
        }

        fn unregister_reset_token(&self, token: &stateless_reset::Token) {
            self.reset_tokens.lock().retain(|registered| registered != token);
        }

        fn on_closed(&self, closed: ClosedConnection) {
            for id in &closed.ids {
                self.retire_id(id);
            }
            *self.closed.lock() = Some(closed);
        }
    }
}
