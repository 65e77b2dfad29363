// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{testing, *};
use crate::{
    connection::State,
    stream::testing::Streams as TestStreams,
    testing::init_tracing,
    tls::testing::Session,
};
use core::{task::Poll, time::Duration};
use futures_test::task::noop_context;
use tern_quic_core::{stateless_reset::Token, time::testing::Clock as TestClock, version};

fn client_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 50000))
}

fn server_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4433))
}

struct Provider;

impl SessionProvider for Provider {
    fn new_session(&self) -> Box<dyn tls::Session> {
        Box::new(Session::server())
    }

    fn new_streams(&self) -> Arc<dyn Streams> {
        Arc::new(TestStreams::new(Role::Server))
    }
}

struct Side {
    endpoint: Arc<Endpoint>,
    socket: Arc<testing::Socket>,
}

impl Side {
    fn new(config: Config, address: SocketAddr, context: &Context) -> Self {
        let socket = Arc::new(testing::Socket::new(address));
        let endpoint = Endpoint::new(config, socket.clone(), context.clone());
        Self { endpoint, socket }
    }
}

struct Network {
    clock: TestClock,
    timers: Arc<TimerQueue>,
    executor: Arc<testing::Executor>,
    context: Context,
    client: Side,
    server: Side,
    incoming: Incoming,
}

impl Network {
    fn new() -> Self {
        Self::with(Config::client(), Config::server())
    }

    fn with(client: Config, server: Config) -> Self {
        init_tracing();
        let clock = TestClock::default();
        let timers = TimerQueue::new();
        let executor = Arc::new(testing::Executor::default());
        let context = Context {
            clock: Arc::new(clock.clone()),
            timers: timers.clone(),
            executor: executor.clone(),
        };
        let client = Side::new(client, client_address(), &context);
        let server = Side::new(server, server_address(), &context);
        let incoming = server.endpoint.listen(Arc::new(Provider)).unwrap();
        Self {
            clock,
            timers,
            executor,
            context,
            client,
            server,
            incoming,
        }
    }

    fn connect(&self) -> Arc<Connection> {
        self.client
            .endpoint
            .connect(
                server_address(),
                Box::new(Session::client()),
                Arc::new(TestStreams::new(Role::Client)),
            )
            .unwrap()
    }

    /// Runs both endpoints and moves datagrams between them until everything is quiet
    fn pump(&self) {
        for _ in 0..100 {
            let mut progressed = self.executor.run_all() > 0;
            for (from, to) in [(&self.client, &self.server), (&self.server, &self.client)] {
                for (peer, payload) in from.socket.take_sent() {
                    assert_eq!(peer, to.socket.address());
                    to.endpoint.on_received(from.socket.address(), payload);
                    progressed = true;
                }
            }
            if !progressed {
                return;
            }
        }
        panic!("the endpoints never went quiet");
    }

    fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
        self.timers.process_events(self.clock.get_time());
        self.pump();
    }

    fn accepted(&mut self) -> Arc<Connection> {
        match self.incoming.poll_accept(&mut noop_context()) {
            Poll::Ready(Some(connection)) => connection,
            other => panic!("no accepted connection: {other:?}"),
        }
    }

    /// A handshake completed through both endpoints
    fn connected() -> (Self, Arc<Connection>, Arc<Connection>) {
        let mut network = Self::new();
        let client = network.connect();
        network.pump();
        let server = network.accepted();
        assert!(client.state().is_handshake_complete());
        assert!(server.state().is_handshake_complete());
        (network, client, server)
    }
}

/// A short header datagram of `len` bytes addressed to `id`
fn short_datagram(id: &connection::Id, len: usize) -> Bytes {
    let mut datagram = vec![0x41; len];
    datagram[1..1 + id.len()].copy_from_slice(id.as_bytes());
    Bytes::from(datagram)
}

#[test]
fn handshake_through_endpoints() {
    let (network, client, server) = Network::connected();
    assert_eq!(network.client.endpoint.connection_count(), 1);
    assert_eq!(network.server.endpoint.connection_count(), 1);

    // every issued ID routes to its connection
    for id in client.local_ids() {
        assert!(matches!(
            network.client.endpoint.routes.get(&id).as_deref(),
            Some(Route::Connection(c)) if Arc::ptr_eq(c, &client)
        ));
    }
    for id in server.local_ids() {
        assert!(network.server.endpoint.routes.contains_key(&id));
    }
    // the client's first destination stays routed on the server
    assert_eq!(network.server.endpoint.routes.len(), server.local_ids().len() + 1);
    assert_eq!(network.client.endpoint.reset_tokens.len(), 2);
}

#[test]
fn application_close_leaves_placeholders() {
    let (network, client, server) = Network::connected();
    client.close(0x10);
    assert!(client.state().contains(State::CLOSED));
    assert_eq!(network.client.endpoint.connection_count(), 0);
    assert!(network
        .client
        .endpoint
        .routes
        .iter()
        .all(|route| matches!(route.value(), Route::Closed(_))));

    network.pump();
    assert_eq!(
        server.termination_cause(),
        Some(TerminationCause::PeerClosed {
            error_code: 0x10,
            application: true
        })
    );
    assert_eq!(network.server.endpoint.connection_count(), 0);

    // both placeholders expire
    network.advance(Duration::from_secs(5));
    assert!(network.client.endpoint.routes.is_empty());
    assert!(network.server.endpoint.routes.is_empty());
    assert_eq!(network.client.endpoint.reset_tokens.len(), 0);
}

#[test]
fn closing_connection_replies_at_decreasing_frequency() {
    let (network, client, _server) = Network::connected();
    let id = client.local_ids()[0];
    client.close(0x10);
    network.executor.run_all();
    let close = network.client.socket.take_sent();
    assert_eq!(close.len(), 1);

    let mut replies = Vec::new();
    for packet in 1..=40 {
        network
            .client
            .endpoint
            .on_received(server_address(), short_datagram(&id, 30));
        network.executor.run_all();
        for (peer, payload) in network.client.socket.take_sent() {
            assert_eq!(peer, server_address());
            assert_eq!(payload, close[0].1);
            replies.push(packet);
        }
    }
    assert_eq!(replies, [1, 3, 7, 15, 31]);
    // the fifth reply was the last
    assert!(!network.client.endpoint.routes.contains_key(&id));
}

#[test]
fn stateless_reset_is_delivered() {
    let (network, client, server) = Network::connected();
    let server_id = server.local_ids()[0];
    let token = network
        .server
        .endpoint
        .id_factory()
        .reset_token(&server_id)
        .unwrap();

    let reset = packet::stateless_reset::encode(&[0x17; 30], &token).freeze();
    network.client.endpoint.on_received(server_address(), reset);
    network.executor.run_all();

    assert_eq!(
        client.termination_cause(),
        Some(TerminationCause::StatelessReset)
    );
    assert!(client.state().contains(State::DRAINING));
    // draining sends nothing
    assert!(network.client.socket.take_sent().is_empty());
    assert_eq!(network.client.endpoint.connection_count(), 0);

    // the placeholder goes away when the peer's reset arrives again
    let reset = packet::stateless_reset::encode(&[0x17; 30], &token).freeze();
    network.client.endpoint.on_received(server_address(), reset);
    network.executor.run_all();
    assert!(network.client.endpoint.routes.is_empty());
}

#[test]
fn unknown_ids_are_answered_with_resets() {
    let network = Network::new();
    let server = &network.server;
    let (unknown, _) = server.endpoint.id_factory().generate();
    let token = server.endpoint.id_factory().reset_token(&unknown).unwrap();

    server
        .endpoint
        .on_received(client_address(), short_datagram(&unknown, 50));
    network.executor.run_all();
    let sent = server.socket.take_sent();
    assert_eq!(sent.len(), 1);
    let (peer, reset) = &sent[0];
    assert_eq!(*peer, client_address());
    assert_eq!(reset.len(), 49);
    assert_eq!(reset::trailing_token(reset), Some(token));
    assert_eq!(packet::peek_header_type(reset), Some(HeaderType::Short));

    // too short to be answered without risking a reset loop
    server
        .endpoint
        .on_received(client_address(), short_datagram(&unknown, 43));
    // too short to be a packet at all
    server
        .endpoint
        .on_received(client_address(), short_datagram(&unknown, 20));
    network.executor.run_all();
    assert!(server.socket.take_sent().is_empty());
}

#[test]
fn unregistered_tokens_do_not_reset() {
    let (network, client, _server) = Network::connected();
    let token = Token::from([0x33; reset::TOKEN_LEN]);
    let stray = packet::stateless_reset::encode(&[0x17; 20], &token).freeze();
    network.client.endpoint.on_received(server_address(), stray);
    network.executor.run_all();
    assert!(client.state().is_open());
    // too short to be answered with a reset of our own
    assert!(network.client.socket.take_sent().is_empty());
}

#[test]
fn version_negotiation_through_endpoints() {
    let client = Config::client()
        .with_enabled_versions(&[version::QUIC_V1, version::QUIC_V2])
        .unwrap();
    let server = Config::server()
        .with_enabled_versions(&[version::QUIC_V2])
        .unwrap();
    let mut network = Network::with(client, server);
    let connection = network.connect();
    assert_eq!(connection.version(), version::QUIC_V1);

    network.pump();
    assert_eq!(connection.version(), version::QUIC_V2);
    assert!(connection.state().is_handshake_complete());
    assert_eq!(network.accepted().version(), version::QUIC_V2);
}

#[test]
fn no_common_version() {
    let client = Config::client()
        .with_enabled_versions(&[version::QUIC_V1])
        .unwrap();
    let server = Config::server()
        .with_enabled_versions(&[version::QUIC_V2])
        .unwrap();
    let network = Network::with(client, server);
    let connection = network.connect();
    network.pump();
    assert_eq!(
        connection.termination_cause(),
        Some(TerminationCause::NoCompatibleVersion)
    );
    assert_eq!(network.server.endpoint.connection_count(), 0);
}

#[test]
fn retry_through_endpoints() {
    let server = Config::server().with_retry(true).unwrap();
    let mut network = Network::with(Config::client(), server);
    let connection = network.connect();
    let original_peer = connection.peer_id();

    // the Initial is answered with a Retry and nothing is accepted yet
    network.executor.run_all();
    let initial = network.client.socket.take_sent();
    network
        .server
        .endpoint
        .on_received(client_address(), initial[0].1.clone());
    network.executor.run_all();
    assert_eq!(network.server.endpoint.connection_count(), 0);
    let retry = network.server.socket.take_sent();
    assert_eq!(retry.len(), 1);
    assert_eq!(
        packet::peek_packet_type(&retry[0].1),
        Some(packet::PacketType::Retry)
    );

    network
        .client
        .endpoint
        .on_received(server_address(), retry[0].1.clone());
    network.pump();

    assert!(connection.state().is_handshake_complete());
    assert_ne!(connection.peer_id(), original_peer);
    let server = network.accepted();
    assert!(server.state().is_handshake_complete());
    assert_eq!(network.server.endpoint.connection_count(), 1);
}

#[test]
fn undersized_initials_are_dropped() {
    let network = Network::new();
    let connection = network.connect();
    network.executor.run_all();
    let initial = network.client.socket.take_sent();
    let truncated = initial[0].1.slice(..1000);
    network
        .server
        .endpoint
        .on_received(client_address(), truncated);
    network.executor.run_all();
    assert!(network.server.socket.take_sent().is_empty());
    assert_eq!(network.server.endpoint.connection_count(), 0);
    assert!(connection.state().is_open());
}

#[test]
fn reading_pauses_between_watermarks() {
    let client = Config::client()
        .with_watermarks(128 * 1024, 64 * 1024)
        .unwrap();
    let network = Network::with(client, Config::server());
    let endpoint = &network.client.endpoint;
    // unroutable long headers: the destination ID length is out of range
    let junk = Bytes::from(vec![0xc0; 1200]);

    for _ in 0..109 {
        endpoint.on_received(server_address(), junk.clone());
    }
    assert!(!network.client.socket.is_paused());
    endpoint.on_received(server_address(), junk.clone());
    assert!(network.client.socket.is_paused());

    network.executor.run_all();
    assert!(!network.client.socket.is_paused());
    assert_eq!(endpoint.buffered.load(Ordering::Acquire), 0);
    assert!(network.client.socket.take_sent().is_empty());
}

#[test]
fn blocked_socket_waits_for_writability() {
    let network = Network::new();
    network.client.socket.blocked.store(true, Ordering::SeqCst);
    let connection = network.connect();
    network.executor.run_all();
    assert!(network.client.socket.take_sent().is_empty());
    assert_eq!(network.client.socket.writable_requests.load(Ordering::SeqCst), 1);

    network.client.socket.blocked.store(false, Ordering::SeqCst);
    network.client.endpoint.on_writable();
    network.pump();
    assert!(connection.state().is_handshake_complete());
}

#[test]
fn send_failure_terminates_connection() {
    let network = Network::new();
    *network.client.socket.fail_next.lock() = Some(io::ErrorKind::ConnectionRefused);
    let connection = network.connect();
    network.executor.run_all();

    assert_eq!(
        connection.termination_cause(),
        Some(TerminationCause::Io("failed to send datagram"))
    );
    assert!(network.client.endpoint.is_open());
    assert_eq!(network.client.endpoint.connection_count(), 0);
    // the CONNECTION_CLOSE made it out
    assert_eq!(network.client.socket.take_sent().len(), 1);
}

#[test]
fn closed_socket_aborts_endpoint() {
    let network = Network::new();
    let connection = network.connect();
    Socket::close(network.client.socket.as_ref());
    network.executor.run_all();

    assert!(network.client.endpoint.is_closed());
    assert_eq!(
        connection.termination_cause(),
        Some(TerminationCause::Io("socket error"))
    );
    assert!(network.client.endpoint.routes.is_empty());
}

#[test]
fn close_sends_connection_close_and_stops() {
    let (mut network, client, server) = Network::connected();
    network.server.endpoint.close();
    assert!(network.server.endpoint.is_closed());
    assert!(!Socket::is_open(network.server.socket.as_ref()));

    match server.termination_cause() {
        Some(TerminationCause::Transport(error)) => {
            assert_eq!(error.code, TransportError::NO_ERROR.code)
        }
        other => panic!("unexpected cause {other:?}"),
    }

    // the close was flushed before the socket closed
    let sent = network.server.socket.take_sent();
    assert_eq!(sent.len(), 1);
    network
        .client
        .endpoint
        .on_received(server_address(), sent[0].1.clone());
    network.executor.run_all();
    assert!(matches!(
        client.termination_cause(),
        Some(TerminationCause::PeerClosed { application: false, .. })
    ));

    // no more connections are accepted
    assert!(matches!(
        network.incoming.poll_accept(&mut noop_context()),
        Poll::Ready(None)
    ));
    assert!(matches!(
        network.server.endpoint.set_acceptor(Server::new(Arc::new(Provider)).0),
        Err(Error::Closed)
    ));
}

#[test]
fn abort_drops_queued_writes() {
    let network = Network::new();
    network.client.socket.blocked.store(true, Ordering::SeqCst);
    let connection = network.connect();
    network.executor.run_all();

    network.client.endpoint.abort(Error::Closed);
    network.client.socket.blocked.store(false, Ordering::SeqCst);
    network.client.endpoint.on_writable();
    network.executor.run_all();

    assert!(network.client.socket.take_sent().is_empty());
    assert_eq!(
        connection.termination_cause(),
        Some(TerminationCause::Io("endpoint closed"))
    );
    assert!(matches!(
        network.client.endpoint.connect(
            server_address(),
            Box::new(Session::client()),
            Arc::new(TestStreams::new(Role::Client)),
        ),
        Err(Error::Closed)
    ));
}

#[test]
fn roles_are_enforced() {
    let network = Network::new();
    assert!(matches!(
        network.server.endpoint.connect(
            client_address(),
            Box::new(Session::client()),
            Arc::new(TestStreams::new(Role::Client)),
        ),
        Err(Error::InvalidConfig(_))
    ));
    assert!(matches!(
        network.client.endpoint.listen(Arc::new(Provider)),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn pool_picks_least_loaded_endpoint() {
    let network = Network::new();
    let spare = Side::new(
        Config::client().with_name("spare").unwrap(),
        SocketAddr::from(([127, 0, 0, 1], 50001)),
        &network.context,
    );

    let pool = Pool::new();
    assert!(pool.select().is_none());
    pool.push(network.client.endpoint.clone());
    pool.push(spare.endpoint.clone());
    assert_eq!(pool.len(), 2);

    let _connection = network.connect();
    let selected = pool.select().unwrap();
    assert_eq!(selected.name(), "spare");

    pool.close();
    assert!(pool.is_empty());
    assert!(network.client.endpoint.is_closed());
    assert!(spare.endpoint.is_closed());
}

#[test]
fn error_display() {
    insta::assert_snapshot!(
        Error::InvalidConfig("no version is enabled").to_string(),
        @"invalid configuration: no version is enabled"
    );
    assert_eq!(Error::Closed.reason(), "endpoint closed");
}
