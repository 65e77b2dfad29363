// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Accepting connections: Version Negotiation, Retry and handing new connections to the
//! application

use super::{Accept, Endpoint};
use crate::{
    connection::{Connection, TerminationCause},
    stream::Streams,
    tls,
};
use bytes::Bytes;
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use dashmap::DashMap;
use futures_channel::mpsc;
use futures_core::Stream;
use std::{net::SocketAddr, sync::Arc};
use tern_quic_core::{
    connection,
    packet::{
        self, retry, version_negotiation, PacketType, ProtectedPacket, MIN_INITIAL_DATAGRAM_LEN,
    },
    time::Timestamp,
    transport::TransportError,
    version,
};
use tracing::{debug, trace, warn};

const RETRY_TOKEN_LEN: usize = 16;

/// How long a client has to answer a Retry
const RETRY_TOKEN_LIFETIME: Duration = Duration::from_secs(10);

/// Outstanding Retry tokens kept before new Initials go unanswered
const MAX_PENDING_RETRIES: usize = 4096;

/// Shortest destination ID a client may pick for its first Initial
const MIN_INITIAL_DESTINATION_LEN: usize = 8;

/// Handles long header datagrams that no connection or placeholder claims
pub trait Acceptor: Send + Sync + 'static {
    fn on_unmatched(&self, endpoint: &Endpoint, peer: SocketAddr, datagram: Bytes);
}

/// Creates the per-connection state of accepted connections
pub trait SessionProvider: Send + Sync + 'static {
    fn new_session(&self) -> Box<dyn tls::Session>;

    fn new_streams(&self) -> Arc<dyn Streams>;

    /// Computes the integrity tag of a Retry packet
    fn retry_integrity_tag(
        &self,
        version: u32,
        pseudo_packet: &[u8],
    ) -> [u8; retry::INTEGRITY_TAG_LEN] {
        self.new_session().retry_integrity_tag(version, pseudo_packet)
    }
}

#[derive(Debug)]
struct PendingRetry {
    peer: SocketAddr,
    original_destination: connection::Id,
    retry_source: connection::Id,
    expires: Timestamp,
}

/// The default [`Acceptor`]: answers Initials and queues the connections on [`Incoming`]
pub struct Server {
    provider: Arc<dyn SessionProvider>,
    sender: mpsc::UnboundedSender<Arc<Connection>>,
    retries: DashMap<[u8; RETRY_TOKEN_LEN], PendingRetry>,
}

impl core::fmt::Debug for Server {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Server")
            .field("pending_retries", &self.retries.len())
            .finish()
    }
}

impl Server {
    pub fn new(provider: Arc<dyn SessionProvider>) -> (Arc<Self>, Incoming) {
        let (sender, receiver) = mpsc::unbounded();
        let server = Arc::new(Self {
            provider,
            sender,
            retries: DashMap::new(),
        });
        (server, Incoming { receiver })
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-6.1
    //# If the version selected by the client is not acceptable to the
    //# server, the server responds with a Version Negotiation packet
    fn negotiate_version(&self, endpoint: &Endpoint, peer: SocketAddr, datagram: &[u8]) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-6.1
        //# A server MUST NOT send a Version Negotiation packet in response to
        //# a datagram that is smaller than 1200 bytes
        if datagram.len() < MIN_INITIAL_DATAGRAM_LEN {
            trace!(endpoint = %endpoint.name(), %peer, "short datagram with unknown version dropped");
            return;
        }
        let (Some(destination), Some(source)) = (
            packet::peek_destination_id(datagram, endpoint.id_factory().id_len()),
            packet::peek_source_id(datagram),
        ) else {
            return;
        };

        let packet = version_negotiation::encode(
            rand::random(),
            &source,
            &destination,
            endpoint.config().enabled_versions(),
        );
        debug!(endpoint = %endpoint.name(), %peer, "sending version negotiation");
        endpoint.send_datagram(peer, packet.freeze());
    }

    fn send_retry(&self, endpoint: &Endpoint, peer: SocketAddr, version: u32, initial: &ProtectedPacket) {
        let Some(client_source) = initial.source else {
            return;
        };
        let now = endpoint.clock().get_time();
        if self.retries.len() >= MAX_PENDING_RETRIES {
            self.retries.retain(|_, pending| pending.expires > now);
            if self.retries.len() >= MAX_PENDING_RETRIES {
                warn!(endpoint = %endpoint.name(), %peer, "too many pending retries; Initial dropped");
                return;
            }
        }

        let (retry_source, _) = endpoint.id_factory().generate();
        let token: [u8; RETRY_TOKEN_LEN] = rand::random();
        self.retries.insert(
            token,
            PendingRetry {
                peer,
                original_destination: initial.destination,
                retry_source,
                expires: now + RETRY_TOKEN_LIFETIME,
            },
        );

        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5.1
        //# A server MAY send Retry packets in response to Initial and 0-RTT
        //# packets.
        let mut packet = retry::encode_without_tag(version, &client_source, &retry_source, &token);
        let pseudo_packet = retry::pseudo_packet(&initial.destination, &packet);
        let tag = self.provider.retry_integrity_tag(version, &pseudo_packet);
        packet.extend_from_slice(&tag);

        debug!(endpoint = %endpoint.name(), %peer, cid = %retry_source, "sending retry");
        endpoint.send_datagram(peer, packet.freeze());
    }

    /// Returns the original destination ID if `token` answers a Retry sent to `peer`
    fn redeem(
        &self,
        token: &[u8],
        peer: SocketAddr,
        destination: &connection::Id,
        now: Timestamp,
    ) -> Option<connection::Id> {
        let key: [u8; RETRY_TOKEN_LEN] = token.try_into().ok()?;
        let (_, pending) = self.retries.remove(&key)?;
        let valid = pending.peer == peer
            && pending.retry_source == *destination
            && pending.expires > now;
        valid.then_some(pending.original_destination)
    }
}

impl Acceptor for Server {
    fn on_unmatched(&self, endpoint: &Endpoint, peer: SocketAddr, datagram: Bytes) {
        let Some(version) = packet::peek_version(&datagram) else {
            return;
        };
        if version == version::NEGOTIATION {
            return;
        }
        if !endpoint.config().enabled_versions().contains(&version) {
            self.negotiate_version(endpoint, peer, &datagram);
            return;
        }

        if packet::peek_packet_type(&datagram) != Some(PacketType::Initial) {
            trace!(endpoint = %endpoint.name(), %peer, "unmatched non-Initial dropped");
            return;
        }
        //= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
        //# A server MUST discard an Initial packet that is carried in a UDP
        //# datagram with a payload that is smaller than the smallest allowed
        //# maximum datagram size of 1200 bytes.
        if datagram.len() < MIN_INITIAL_DATAGRAM_LEN {
            trace!(endpoint = %endpoint.name(), %peer, len = datagram.len(), "undersized Initial dropped");
            return;
        }
        let Ok((initial, _)) = ProtectedPacket::decode(datagram.clone(), endpoint.id_factory().id_len())
        else {
            trace!(endpoint = %endpoint.name(), %peer, "malformed Initial dropped");
            return;
        };
        let Some(peer_id) = initial.source else {
            return;
        };
        if initial.destination.len() < MIN_INITIAL_DESTINATION_LEN {
            trace!(endpoint = %endpoint.name(), %peer, "Initial destination ID too short");
            return;
        }

        let (original_destination, retry_source) = if endpoint.config().retry() {
            if initial.token.is_empty() {
                self.send_retry(endpoint, peer, version, &initial);
                return;
            }
            let now = endpoint.clock().get_time();
            match self.redeem(&initial.token, peer, &initial.destination, now) {
                Some(original_destination) => (original_destination, Some(initial.destination)),
                None => {
                    debug!(endpoint = %endpoint.name(), %peer, "invalid retry token");
                    return;
                }
            }
        } else {
            (initial.destination, None)
        };

        let accept = Accept {
            peer,
            version,
            peer_id,
            destination: initial.destination,
            original_destination,
            retry_source,
            tls: self.provider.new_session(),
            streams: self.provider.new_streams(),
        };
        let connection = match endpoint.accept(accept) {
            Ok(connection) => connection,
            Err(error) => {
                warn!(endpoint = %endpoint.name(), %peer, %error, "failed to accept connection");
                return;
            }
        };
        debug!(endpoint = %endpoint.name(), tag = connection.tag(), %peer, "connection accepted");

        connection.on_datagram(datagram);
        if self.sender.unbounded_send(connection.clone()).is_err() {
            connection.terminate(TerminationCause::Transport(
                TransportError::CONNECTION_REFUSED.with_reason("not accepting connections"),
            ));
        }
    }
}

/// Connections accepted by a [`Server`]. Ends once the endpoint closes.
#[derive(Debug)]
pub struct Incoming {
    receiver: mpsc::UnboundedReceiver<Arc<Connection>>,
}

impl Incoming {
    pub fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Option<Arc<Connection>>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }

    pub fn accept(&mut self) -> impl Future<Output = Option<Arc<Connection>>> + '_ {
        core::future::poll_fn(move |cx| self.poll_accept(cx))
    }
}

impl Stream for Incoming {
    type Item = Arc<Connection>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.poll_accept(cx)
    }
}
