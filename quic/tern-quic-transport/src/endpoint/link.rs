// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{Endpoint, IdFactory, Source};
use crate::connection::{ClosedConnection, Connection, Datagram, EndpointLink};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tern_quic_core::{connection, packet::MIN_INITIAL_DATAGRAM_LEN, stateless_reset};

#[derive(Debug, Default)]
struct State {
    connection: Option<Weak<Connection>>,
    ids: Vec<connection::Id>,
    tokens: Vec<stateless_reset::Token>,
    /// Set once the connection closed or failed to attach; nothing is routed afterwards
    detached: bool,
}

/// Connects one connection to its endpoint.
///
/// The connection registers IDs while it is being built, before the endpoint can route
/// to it, so the link records them and the endpoint routes them all on attach.
#[derive(Debug)]
pub(super) struct Link {
    endpoint: Weak<Endpoint>,
    factory: Arc<IdFactory>,
    local_id_len: usize,
    state: Mutex<State>,
}

impl Link {
    pub fn new(endpoint: Weak<Endpoint>, factory: Arc<IdFactory>, local_id_len: usize) -> Self {
        Self {
            endpoint,
            factory,
            local_id_len,
            state: Mutex::new(State::default()),
        }
    }

    /// Records an ID routed to the connection without it asking
    pub fn record_id(&self, id: connection::Id) {
        let mut state = self.state.lock();
        if !state.ids.contains(&id) {
            state.ids.push(id);
        }
    }

    /// Binds the connection and returns what it registered so far
    pub fn attach(
        &self,
        connection: &Arc<Connection>,
    ) -> (Vec<connection::Id>, Vec<stateless_reset::Token>) {
        let mut state = self.state.lock();
        state.connection = Some(Arc::downgrade(connection));
        (state.ids.clone(), state.tokens.clone())
    }

    pub fn detach(&self) {
        let mut state = self.state.lock();
        state.connection = None;
        state.detached = true;
    }

    /// The connection and endpoint, while both are alive and attached
    fn target(&self) -> Option<(Arc<Endpoint>, Arc<Connection>)> {
        let connection = {
            let state = self.state.lock();
            if state.detached {
                return None;
            }
            state.connection.as_ref()?.upgrade()?
        };
        Some((self.endpoint.upgrade()?, connection))
    }
}

impl EndpointLink for Link {
    fn max_datagram_size(&self) -> usize {
        MIN_INITIAL_DATAGRAM_LEN
    }

    fn local_id_len(&self) -> usize {
        self.local_id_len
    }

    fn push_datagram(&self, datagram: Datagram) {
        let Some(endpoint) = self.endpoint.upgrade() else {
            return;
        };
        let source = match &self.state.lock().connection {
            Some(connection) => Source::Connection(connection.clone()),
            None => Source::Endpoint,
        };
        endpoint.send(datagram, source);
    }

    fn generate_id(&self) -> (connection::Id, stateless_reset::Token) {
        match self.endpoint.upgrade() {
            Some(endpoint) => endpoint.generate_id(),
            None => self.factory.generate(),
        }
    }

    fn register_id(&self, id: connection::Id) {
        self.record_id(id);
        if let Some((endpoint, connection)) = self.target() {
            endpoint.route_id(id, connection);
        }
    }

    fn retire_id(&self, id: &connection::Id) {
        self.state.lock().ids.retain(|registered| registered != id);
        if let Some((endpoint, connection)) = self.target() {
            endpoint.unroute_id(id, &connection);
        }
    }

    fn register_reset_token(&self, token: stateless_reset::Token) {
        {
            let mut state = self.state.lock();
            if !state.tokens.contains(&token) {
                state.tokens.push(token);
            }
        }
        if let Some((endpoint, connection)) = self.target() {
            endpoint.route_token(token, connection);
        }
    }

    fn unregister_reset_token(&self, token: &stateless_reset::Token) {
        self.state.lock().tokens.retain(|registered| registered != token);
        if let Some((endpoint, connection)) = self.target() {
            endpoint.unroute_token(token, &connection);
        }
    }

    fn on_closed(&self, mut closed: ClosedConnection) {
        let (connection, mut ids, tokens) = {
            let mut state = self.state.lock();
            if state.detached {
                return;
            }
            state.detached = true;
            (
                state.connection.take(),
                core::mem::take(&mut state.ids),
                core::mem::take(&mut state.tokens),
            )
        };
        // never attached, so never counted or routed
        let Some(connection) = connection else {
            return;
        };
        let Some(endpoint) = self.endpoint.upgrade() else {
            return;
        };

        for id in closed.ids.drain(..) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        for token in tokens {
            if !closed.reset_tokens.contains(&token) {
                closed.reset_tokens.push(token);
            }
        }

        let tag = connection
            .upgrade()
            .map(|connection| connection.tag().to_owned())
            .unwrap_or_default();
        endpoint.on_connection_closed(&tag, ids, closed);
    }
}
