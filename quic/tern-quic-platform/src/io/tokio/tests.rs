// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use core::time::Duration;
use tern_quic_core::time::Clock as _;
use tern_quic_transport::{
    connection::Role,
    endpoint::{Config, SessionProvider, Socket as _},
    stream::{testing::Streams as TestStreams, Streams},
    testing::init_tracing,
    tls::{self, testing::Session},
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn localhost() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
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

#[tokio::test]
async fn missing_address_is_rejected() {
    let error = Io::builder().build().unwrap().start(Config::client()).unwrap_err();
    assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
}

#[test]
fn start_requires_a_runtime() {
    let io = Io::new(localhost()).unwrap();
    assert!(io.start(Config::client()).is_err());
}

#[tokio::test(start_paused = true)]
async fn clock_follows_tokio_time() {
    let clock = Clock::new();
    let start = clock.get_time();
    tokio::time::advance(Duration::from_millis(250)).await;
    assert_eq!(
        clock.get_time().saturating_duration_since(start),
        Duration::from_millis(250)
    );
}

#[tokio::test(start_paused = true)]
async fn timer_sleeps_until_reset_target() {
    let clock = Clock::new();
    let mut timer = clock.timer();
    assert!(!timer.is_armed());

    // a cancelled timer never fires
    assert!(timeout(Duration::from_secs(1), &mut timer).await.is_err());

    let target = clock.get_time() + Duration::from_millis(10);
    timer.reset(target);
    assert!(timer.is_armed());
    (&mut timer).await;
    assert!(clock.get_time() >= target);
    assert!(!timer.is_armed());
}

#[tokio::test]
async fn socket_tracks_read_state() {
    let udp = tokio::net::UdpSocket::bind(localhost()).await.unwrap();
    let socket = Socket::new(udp, Handle::current());

    assert!(socket.is_open());
    assert!(!socket.is_paused());

    socket.pause_reading();
    assert!(socket.is_paused());
    socket.resume_reading();
    assert!(!socket.is_paused());

    socket.close();
    assert!(!socket.is_open());
    // closing wins over later resume requests
    socket.resume_reading();
    assert!(!socket.is_open());

    let error = socket
        .try_send_to(&[0; 8], SocketAddr::from(([127, 0, 0, 1], 9)))
        .unwrap_err();
    assert_eq!(error.kind(), io::ErrorKind::NotConnected);
}

#[tokio::test]
async fn unknown_ids_are_answered_with_resets() {
    init_tracing();
    let (endpoint, task) = Io::builder()
        .with_receive_address(localhost())
        .unwrap()
        .with_recv_buffer_size(1 << 16)
        .unwrap()
        .build()
        .unwrap()
        .start(Config::server())
        .unwrap();
    let address = endpoint.local_addr().unwrap();

    let peer = tokio::net::UdpSocket::bind(localhost()).await.unwrap();
    let mut datagram = vec![0x41; 50];
    datagram[1..9].copy_from_slice(&[7; 8]);
    peer.send_to(&datagram, address).await.unwrap();

    let mut buffer = [0u8; 1500];
    let (len, from) = timeout(WAIT, peer.recv_from(&mut buffer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, address);
    assert_eq!(len, 49);
    // short header form with the fixed bit set
    assert_eq!(buffer[0] & 0xc0, 0x40);

    endpoint.close();
    timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn handshake_over_udp() {
    init_tracing();
    let (server, server_task) = Io::new(localhost())
        .unwrap()
        .start(Config::server())
        .unwrap();
    let mut incoming = server.listen(Arc::new(Provider)).unwrap();

    let (client, client_task) = Io::new(localhost())
        .unwrap()
        .start(Config::client())
        .unwrap();

    let connection = client
        .connect(
            server.local_addr().unwrap(),
            Box::new(Session::client()),
            Arc::new(TestStreams::new(Role::Client)),
        )
        .unwrap();

    timeout(WAIT, connection.handshake())
        .await
        .unwrap()
        .unwrap();
    let accepted = timeout(WAIT, incoming.accept()).await.unwrap().unwrap();
    timeout(WAIT, accepted.handshake()).await.unwrap().unwrap();

    assert_eq!(client.connection_count(), 1);
    assert_eq!(server.connection_count(), 1);

    client.close();
    server.close();
    timeout(WAIT, client_task).await.unwrap().unwrap();
    timeout(WAIT, server_task).await.unwrap().unwrap();
    assert!(client.is_closed());
    assert!(server.is_closed());
    assert_eq!(client.connection_count(), 0);
}

#[tokio::test]
async fn close_stops_the_driver() {
    let (endpoint, task) = Io::new(localhost())
        .unwrap()
        .start(Config::client())
        .unwrap();
    assert!(endpoint.is_open());

    endpoint.close();
    timeout(WAIT, task).await.unwrap().unwrap();
    assert!(endpoint.is_closed());
}
