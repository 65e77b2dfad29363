// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Routes datagrams between one socket and the connections sharing it

use crate::{
    connection::{
        self, ClosedConnection, Connection, Datagram, Parameters, Role, TerminationCause,
    },
    stream::Streams,
    sync::{Executor, SequentialScheduler},
    timer::TimerQueue,
    tls,
};
use bytes::Bytes;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use crossbeam_queue::SegQueue;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::{Arc, Weak},
};
use tern_quic_core::{
    packet::{self, HeaderType, MIN_INITIAL_DATAGRAM_LEN},
    recovery::NewReno,
    stateless_reset::{self as reset, MIN_PACKET_LEN},
    time::Clock,
    transport::TransportError,
};
use tracing::{debug, error, trace, warn};

mod config;
mod link;
mod placeholder;
mod pool;
mod server;
mod socket;
pub mod stateless_reset;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use pool::Pool;
pub use server::{Acceptor, Incoming, Server, SessionProvider};
pub use socket::Socket;
pub use stateless_reset::IdFactory;

use link::Link;
use placeholder::{Placeholder, Reply};
use stateless_reset::ResetTokenTable;

/// Attempts at drawing a connection ID nobody on this endpoint uses
const MAX_ID_ATTEMPTS: usize = 8;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the endpoint is closed")]
    Closed,
    #[error("connection ID {0} is already routed")]
    DuplicateConnectionId(connection::Id),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// A static description, used as the termination reason of aborted connections
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Closed => "endpoint closed",
            Self::DuplicateConnectionId(_) => "duplicate connection ID",
            Self::InvalidConfig(reason) => *reason,
            Self::Io(_) => "socket error",
        }
    }
}

/// Shared services of the endpoint and its connections
#[derive(Clone)]
pub struct Context {
    pub clock: Arc<dyn Clock>,
    pub timers: Arc<TimerQueue>,
    /// Runs the read and write loops. Must not run tasks on the caller's stack.
    pub executor: Arc<dyn Executor>,
}

/// Where datagrams addressed to a connection ID or matching a reset token go
#[derive(Clone, Debug)]
enum Route {
    Connection(Arc<Connection>),
    Closed(Arc<Placeholder>),
}

impl Route {
    #[inline]
    fn is_connection(&self, connection: &Connection) -> bool {
        matches!(self, Self::Connection(c) if core::ptr::eq(Arc::as_ptr(c), connection))
    }

    #[inline]
    fn is_placeholder(&self, placeholder: &Placeholder) -> bool {
        matches!(self, Self::Closed(p) if core::ptr::eq(Arc::as_ptr(p), placeholder))
    }
}

/// Who to tell when a datagram cannot be sent
#[derive(Debug)]
enum Source {
    Endpoint,
    Connection(Weak<Connection>),
    Placeholder(Weak<Placeholder>),
}

#[derive(Debug)]
struct Outgoing {
    datagram: Datagram,
    source: Source,
}

/// Everything needed to create the server side of a connection
pub(crate) struct Accept {
    pub peer: SocketAddr,
    pub version: u32,
    /// Source ID of the client's Initial
    pub peer_id: connection::Id,
    /// Destination ID of the Initial being accepted
    pub destination: connection::Id,
    /// Destination ID of the client's very first Initial
    pub original_destination: connection::Id,
    pub retry_source: Option<connection::Id>,
    pub tls: Box<dyn tls::Session>,
    pub streams: Arc<dyn Streams>,
}

pub struct Endpoint {
    config: Config,
    this: Weak<Self>,
    socket: Arc<dyn Socket>,
    clock: Arc<dyn Clock>,
    timers: Arc<TimerQueue>,
    executor: Arc<dyn Executor>,
    ids: Arc<IdFactory>,
    routes: DashMap<connection::Id, Route>,
    reset_tokens: ResetTokenTable<Route>,
    acceptor: RwLock<Option<Arc<dyn Acceptor>>>,
    connections: AtomicUsize,
    read_queue: SegQueue<(SocketAddr, Bytes)>,
    reader: Arc<SequentialScheduler>,
    write_queue: Mutex<VecDeque<Outgoing>>,
    writer: Arc<SequentialScheduler>,
    /// Bytes received but not dispatched yet
    buffered: AtomicUsize,
    reading_paused: AtomicBool,
    state: AtomicU8,
}

impl core::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", self.config.name())
            .field("role", &self.config.role())
            .field("connections", &self.connection_count())
            .field("routes", &self.routes.len())
            .field("buffered", &self.buffered.load(Ordering::Relaxed))
            .finish()
    }
}

impl Endpoint {
    pub fn new(config: Config, socket: Arc<dyn Socket>, context: Context) -> Arc<Self> {
        let Context {
            clock,
            timers,
            executor,
        } = context;
        let ids = Arc::new(IdFactory::new(config.local_id_len()));

        let endpoint = Arc::new_cyclic(|this| Self {
            config,
            this: this.clone(),
            socket,
            clock,
            timers,
            executor,
            ids,
            routes: DashMap::new(),
            reset_tokens: ResetTokenTable::new(),
            acceptor: RwLock::new(None),
            connections: AtomicUsize::new(0),
            read_queue: SegQueue::new(),
            reader: Arc::new(SequentialScheduler::new()),
            write_queue: Mutex::new(VecDeque::new()),
            writer: Arc::new(SequentialScheduler::new()),
            buffered: AtomicUsize::new(0),
            reading_paused: AtomicBool::new(false),
            state: AtomicU8::new(OPEN),
        });

        debug!(
            endpoint = %endpoint.name(),
            role = ?endpoint.config.role(),
            address = ?endpoint.socket.local_addr().ok(),
            "endpoint created"
        );
        endpoint
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.config.name()
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Number of connections that are neither closing nor draining
    #[inline]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    /// The factory issuing this endpoint's connection IDs
    #[inline]
    pub fn id_factory(&self) -> &IdFactory {
        &self.ids
    }

    #[inline]
    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Installs the handler of long header datagrams no connection claims
    pub fn set_acceptor(&self, acceptor: Arc<dyn Acceptor>) -> Result<(), Error> {
        if self.config.role().is_client() {
            return Err(Error::InvalidConfig("clients do not accept connections"));
        }
        if !self.is_open() {
            return Err(Error::Closed);
        }
        *self.acceptor.write() = Some(acceptor);
        Ok(())
    }

    /// Accepts incoming connections, creating their TLS sessions and streams with `provider`
    pub fn listen(&self, provider: Arc<dyn SessionProvider>) -> Result<Incoming, Error> {
        let (server, incoming) = Server::new(provider);
        self.set_acceptor(server)?;
        Ok(incoming)
    }

    /// Opens a client connection to `peer` and starts its handshake
    pub fn connect(
        &self,
        peer: SocketAddr,
        tls: Box<dyn tls::Session>,
        streams: Arc<dyn Streams>,
    ) -> Result<Arc<Connection>, Error> {
        if self.config.role().is_server() {
            return Err(Error::InvalidConfig("servers do not initiate connections"));
        }
        if !self.is_open() {
            return Err(Error::Closed);
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-7.2
        //# When an Initial packet is sent by a client that has not previously
        //# received an Initial or Retry packet from the server, the client
        //# populates the Destination Connection ID field with an unpredictable
        //# value.  This Destination Connection ID MUST be at least 8 bytes in
        //# length.
        let destination = connection::Id::try_from_bytes(&rand::random::<[u8; 8]>())
            .map_err(|_| Error::InvalidConfig("invalid destination ID"))?;
        let version = self
            .config
            .enabled_versions()
            .first()
            .copied()
            .ok_or(Error::InvalidConfig("no version is enabled"))?;

        let link = self.new_link();
        let connection = Connection::new(Parameters {
            role: Role::Client,
            version,
            enabled_versions: self.config.enabled_versions().to_vec(),
            limits: self.config.limits(),
            peer_address: peer,
            peer_id: destination,
            original_destination: None,
            retry_source: None,
            clock: self.clock.clone(),
            timers: self.timers.clone(),
            link: link.clone(),
            tls,
            streams,
            congestion_controller: Box::new(NewReno::new(MIN_INITIAL_DATAGRAM_LEN)),
        });
        self.attach(&link, &connection)?;
        // callers await `Connection::handshake` for the outcome
        let _ = connection.connect();
        Ok(connection)
    }

    /// Creates the server side of a connection for a client's Initial
    pub(crate) fn accept(&self, accept: Accept) -> Result<Arc<Connection>, Error> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        let Accept {
            peer,
            version,
            peer_id,
            destination,
            original_destination,
            retry_source,
            tls,
            streams,
        } = accept;

        let link = self.new_link();
        let connection = Connection::new(Parameters {
            role: Role::Server,
            version,
            enabled_versions: vec![version],
            limits: self.config.limits(),
            peer_address: peer,
            peer_id,
            original_destination: Some(original_destination),
            retry_source,
            clock: self.clock.clone(),
            timers: self.timers.clone(),
            link: link.clone(),
            tls,
            streams,
            congestion_controller: Box::new(NewReno::new(MIN_INITIAL_DATAGRAM_LEN)),
        });
        // retransmitted Initials still carry the ID the client chose after a Retry
        link.record_id(destination);
        self.attach(&link, &connection)?;
        Ok(connection)
    }

    fn new_link(&self) -> Arc<Link> {
        Arc::new(Link::new(
            self.this.clone(),
            self.ids.clone(),
            self.config.local_id_len(),
        ))
    }

    /// Routes every ID and token the connection registered so far
    fn attach(&self, link: &Arc<Link>, connection: &Arc<Connection>) -> Result<(), Error> {
        let (ids, tokens) = link.attach(connection);
        let route = Route::Connection(connection.clone());

        let mut routed = Vec::with_capacity(ids.len());
        for id in ids {
            // the entry guard is released before cleaning up so no shard is locked twice
            let vacant = match self.routes.entry(id) {
                Entry::Occupied(_) => false,
                Entry::Vacant(entry) => {
                    entry.insert(route.clone());
                    true
                }
            };
            if !vacant {
                for id in &routed {
                    self.routes.remove(id);
                }
                link.detach();
                warn!(endpoint = %self.name(), cid = %id, "connection ID already routed");
                return Err(Error::DuplicateConnectionId(id));
            }
            routed.push(id);
        }
        for token in tokens {
            self.reset_tokens.insert(token, route.clone());
        }

        self.connections.fetch_add(1, Ordering::AcqRel);
        trace!(endpoint = %self.name(), tag = connection.tag(), "connection attached");
        Ok(())
    }

    /// Draws a connection ID no route uses yet
    fn generate_id(&self) -> (connection::Id, reset::Token) {
        let mut candidate = self.ids.generate();
        for _ in 1..MAX_ID_ATTEMPTS {
            if !self.routes.contains_key(&candidate.0) {
                break;
            }
            candidate = self.ids.generate();
        }
        candidate
    }

    fn route_id(&self, id: connection::Id, connection: Arc<Connection>) {
        if self.is_open() {
            self.routes.insert(id, Route::Connection(connection));
        }
    }

    fn unroute_id(&self, id: &connection::Id, connection: &Connection) {
        self.routes
            .remove_if(id, |_, route| route.is_connection(connection));
    }

    fn route_token(&self, token: reset::Token, connection: Arc<Connection>) {
        if self.is_open() {
            self.reset_tokens
                .insert(token, Route::Connection(connection));
        }
    }

    fn unroute_token(&self, token: &reset::Token, connection: &Connection) {
        self.reset_tokens
            .remove_if(token, |route| route.is_connection(connection));
    }

    /// Replaces the routes of a connection that tore down with a placeholder
    fn on_connection_closed(
        &self,
        tag: &str,
        ids: Vec<connection::Id>,
        closed: ClosedConnection,
    ) {
        self.connections.fetch_sub(1, Ordering::AcqRel);

        if !self.is_open() {
            for id in &ids {
                self.routes.remove(id);
            }
            for token in &closed.reset_tokens {
                self.reset_tokens.remove(token);
            }
            return;
        }

        let placeholder = Placeholder::new(tag, self.this.clone(), self.timers.clone(), ids, closed);
        let route = Route::Closed(placeholder.clone());
        for id in &placeholder.ids {
            self.routes.insert(*id, route.clone());
        }
        for token in &placeholder.reset_tokens {
            self.reset_tokens.insert(*token, route.clone());
        }
        placeholder.start(self.clock.get_time());
        debug!(
            endpoint = %self.name(),
            tag = placeholder.tag(),
            ids = placeholder.ids.len(),
            "connection replaced by placeholder"
        );
    }

    /// Forgets a closing or draining connection
    pub(crate) fn remove_placeholder(&self, placeholder: &Placeholder) {
        placeholder.stop();
        for id in &placeholder.ids {
            self.routes
                .remove_if(id, |_, route| route.is_placeholder(placeholder));
        }
        for token in &placeholder.reset_tokens {
            self.reset_tokens
                .remove_if(token, |route| route.is_placeholder(placeholder));
        }
        trace!(endpoint = %self.name(), tag = placeholder.tag(), "placeholder removed");
    }

    /// Queues a datagram read from the socket
    pub fn on_received(&self, peer: SocketAddr, payload: Bytes) {
        if !self.is_open() {
            return;
        }

        let len = payload.len();
        let buffered = self.buffered.fetch_add(len, Ordering::AcqRel) + len;
        self.read_queue.push((peer, payload));

        if buffered >= self.config.high_watermark() && !self.reading_paused.swap(true, Ordering::AcqRel) {
            debug!(endpoint = %self.name(), buffered, "pausing reads");
            self.socket.pause_reading();
        }

        let this = self.this.clone();
        self.reader.run_on(self.executor.as_ref(), move || {
            if let Some(endpoint) = this.upgrade() {
                endpoint.drain_reads();
            }
        });
    }

    fn drain_reads(&self) {
        while let Some((peer, payload)) = self.read_queue.pop() {
            let len = payload.len();
            let buffered = self.buffered.fetch_sub(len, Ordering::AcqRel).saturating_sub(len);
            if buffered <= self.config.low_watermark() && self.reading_paused.swap(false, Ordering::AcqRel) {
                debug!(endpoint = %self.name(), buffered, "resuming reads");
                self.socket.resume_reading();
            }
            if self.is_open() {
                self.dispatch(peer, payload);
            }
        }
    }

    fn dispatch(&self, peer: SocketAddr, payload: Bytes) {
        let Some(header_type) = packet::peek_header_type(&payload) else {
            return;
        };
        if header_type == HeaderType::Short && payload.len() < MIN_PACKET_LEN {
            trace!(endpoint = %self.name(), len = payload.len(), "short datagram dropped");
            return;
        }
        let Some(destination) = packet::peek_destination_id(&payload, self.ids.id_len()) else {
            trace!(endpoint = %self.name(), %peer, "datagram without destination ID dropped");
            return;
        };

        // clone the route out so no map shard is locked while the connection runs
        let route = self.routes.get(&destination).map(|route| route.value().clone());
        match route {
            Some(Route::Connection(connection)) => connection.on_datagram(payload),
            Some(Route::Closed(placeholder)) => self.reply_closed(&placeholder),
            None if header_type == HeaderType::Short => {
                self.on_unmatched_short(peer, destination, payload)
            }
            None => self.on_unmatched_long(peer, payload),
        }
    }

    fn reply_closed(&self, placeholder: &Arc<Placeholder>) {
        let now = self.clock.get_time();
        let (reply, datagrams) = placeholder.on_packet(now);
        if reply == Reply::Drop {
            return;
        }
        for payload in datagrams {
            let peer = placeholder.peer();
            self.send(
                Datagram {
                    peer,
                    payload: payload.clone(),
                    permit: None,
                },
                Source::Placeholder(Arc::downgrade(placeholder)),
            );
        }
        if reply == Reply::SendAndRemove {
            self.remove_placeholder(placeholder);
        }
    }

    fn on_unmatched_short(&self, peer: SocketAddr, destination: connection::Id, payload: Bytes) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3.1
        //# An endpoint detects a potential Stateless Reset using the trailing 16
        //# bytes of the UDP datagram.
        match self.reset_tokens.match_datagram(&payload) {
            Some(Route::Connection(connection)) => {
                debug!(endpoint = %self.name(), tag = connection.tag(), "stateless reset received");
                connection.on_stateless_reset();
                return;
            }
            Some(Route::Closed(placeholder)) => {
                debug!(endpoint = %self.name(), tag = placeholder.tag(), "stateless reset for closed connection");
                self.remove_placeholder(&placeholder);
                return;
            }
            None => {}
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
        //# An endpoint MUST NOT send a Stateless Reset that is three times or
        //# more larger than the packet it receives to avoid being used for
        //# amplification.
        let Some(token) = self.ids.reset_token(&destination) else {
            trace!(endpoint = %self.name(), cid = %destination, "unknown connection ID");
            return;
        };
        let Some(len) = packet::stateless_reset::packet_len(payload.len(), MIN_INITIAL_DATAGRAM_LEN)
        else {
            trace!(endpoint = %self.name(), len = payload.len(), "too short to answer with a reset");
            return;
        };

        let mut unpredictable = vec![0u8; len - reset::TOKEN_LEN];
        rand::rng().fill(&mut unpredictable[..]);
        let reset = packet::stateless_reset::encode(&unpredictable, &token);
        debug!(endpoint = %self.name(), cid = %destination, len, "sending stateless reset");
        self.send(
            Datagram {
                peer,
                payload: reset.freeze(),
                permit: None,
            },
            Source::Endpoint,
        );
    }

    fn on_unmatched_long(&self, peer: SocketAddr, payload: Bytes) {
        let acceptor = self.acceptor.read().clone();
        match acceptor {
            Some(acceptor) if self.config.role().is_server() => {
                acceptor.on_unmatched(self, peer, payload)
            }
            _ => trace!(endpoint = %self.name(), %peer, "unmatched long header datagram dropped"),
        }
    }

    /// Queues a datagram built by the endpoint itself, such as a Retry
    pub(crate) fn send_datagram(&self, peer: SocketAddr, payload: Bytes) {
        self.send(
            Datagram {
                peer,
                payload,
                permit: None,
            },
            Source::Endpoint,
        );
    }

    fn send(&self, datagram: Datagram, source: Source) {
        if self.is_closed() {
            trace!(endpoint = %self.name(), peer = %datagram.peer, "endpoint closed; datagram dropped");
            return;
        }
        self.write_queue
            .lock()
            .push_back(Outgoing { datagram, source });
        self.schedule_writes();
    }

    fn schedule_writes(&self) {
        let this = self.this.clone();
        self.writer.run_on(self.executor.as_ref(), move || {
            if let Some(endpoint) = this.upgrade() {
                endpoint.drain_writes();
            }
        });
    }

    /// Called by the socket driver once a blocked socket can send again
    pub fn on_writable(&self) {
        if !self.is_closed() {
            self.schedule_writes();
        }
    }

    fn drain_writes(&self) {
        loop {
            let Some(outgoing) = self.write_queue.lock().pop_front() else {
                return;
            };
            let Outgoing { datagram, source } = outgoing;
            match self.socket.try_send_to(&datagram.payload, datagram.peer) {
                Ok(_) => {
                    trace!(endpoint = %self.name(), peer = %datagram.peer, len = datagram.payload.len(), "sent");
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    self.write_queue
                        .lock()
                        .push_front(Outgoing { datagram, source });
                    self.socket.notify_writable();
                    return;
                }
                Err(error) => {
                    drop(datagram);
                    self.on_send_error(source, error);
                }
            }
        }
    }

    fn on_send_error(&self, source: Source, error: io::Error) {
        warn!(endpoint = %self.name(), %error, "failed to send datagram");
        match source {
            Source::Connection(connection) => {
                if let Some(connection) = connection.upgrade() {
                    // the connection may be the one sending, so it is terminated on its own task
                    self.executor.execute(Box::new(move || {
                        connection.terminate(TerminationCause::Io("failed to send datagram"))
                    }));
                }
            }
            Source::Placeholder(placeholder) => {
                if let Some(placeholder) = placeholder.upgrade() {
                    self.remove_placeholder(&placeholder);
                }
            }
            Source::Endpoint => {}
        }

        if !self.socket.is_open() {
            self.abort(Error::Io(error));
        }
    }

    /// Closes every connection with NO_ERROR, sends what is queued and closes the socket
    pub fn close(&self) {
        if !self.begin_close() {
            return;
        }
        debug!(endpoint = %self.name(), "closing endpoint");
        self.terminate_connections(
            TransportError::NO_ERROR
                .with_reason("endpoint closed")
                .into(),
        );
        // the CONNECTION_CLOSE datagrams get one chance to leave before the socket closes
        self.drain_writes();
        self.shutdown();
    }

    /// Terminates every connection with `error` and closes the socket, dropping queued writes
    pub fn abort(&self, error: Error) {
        if !self.begin_close() {
            return;
        }
        error!(endpoint = %self.name(), %error, "endpoint aborted");
        self.state.store(CLOSED, Ordering::Release);
        self.drop_writes();
        self.terminate_connections(TerminationCause::Io(error.reason()));
        self.shutdown();
    }

    fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn terminate_connections(&self, cause: TerminationCause) {
        let mut connections: Vec<Arc<Connection>> = self
            .routes
            .iter()
            .filter_map(|entry| match entry.value() {
                Route::Connection(connection) => Some(connection.clone()),
                Route::Closed(_) => None,
            })
            .collect();
        connections.sort_by_key(|connection| Arc::as_ptr(connection) as usize);
        connections.dedup_by(|a, b| Arc::ptr_eq(a, b));

        for connection in connections {
            connection.terminate(cause.clone());
        }
    }

    fn drop_writes(&self) {
        let dropped: Vec<Outgoing> = self.write_queue.lock().drain(..).collect();
        if !dropped.is_empty() {
            debug!(endpoint = %self.name(), count = dropped.len(), "queued datagrams dropped");
        }
        // buffer permits return to their connections outside the queue lock
        drop(dropped);
    }

    fn shutdown(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.reader.stop();
        self.writer.stop();
        while self.read_queue.pop().is_some() {}
        self.buffered.store(0, Ordering::Release);
        self.drop_writes();

        let placeholders: Vec<Arc<Placeholder>> = self
            .routes
            .iter()
            .filter_map(|entry| match entry.value() {
                Route::Closed(placeholder) => Some(placeholder.clone()),
                Route::Connection(_) => None,
            })
            .collect();
        for placeholder in placeholders {
            placeholder.stop();
        }
        self.routes.clear();
        self.reset_tokens.clear();
        self.acceptor.write().take();

        self.socket.close();
        debug!(endpoint = %self.name(), "endpoint closed");
    }
}
