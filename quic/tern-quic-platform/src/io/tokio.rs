// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Drives an [`Endpoint`] with a tokio UDP socket.
//!
//! [`Io::start`] binds the socket and spawns two tasks: one reading datagrams into the
//! endpoint while it is not paused, and one firing the shared [`TimerQueue`]. The
//! endpoint's drain loops run as tokio tasks through [`Executor`]. Both tasks end once the
//! endpoint closes its socket.

use socket2::{Domain, Protocol, Type};
use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
};
use tern_quic_transport::{
    endpoint::{self, Endpoint},
    timer::TimerQueue,
};
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::debug;

mod builder;
mod clock;
mod socket;
mod task;
#[cfg(test)]
mod tests;

pub use builder::Builder;
pub use clock::{Clock, Timer};
pub use socket::Socket;
pub use task::Executor;

#[derive(Debug, Default)]
pub struct Io {
    builder: Builder,
}

impl Io {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn new<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let address = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "missing bind address")
        })?;
        let builder = Builder::default().with_receive_address(address)?;
        Ok(Self { builder })
    }

    /// Binds the socket, creates the endpoint and spawns its driver tasks.
    ///
    /// The returned handle completes once the endpoint is closed or aborted.
    pub fn start(self, config: endpoint::Config) -> io::Result<(Arc<Endpoint>, JoinHandle<()>)> {
        let Builder {
            handle,
            socket,
            recv_addr,
            recv_buffer_size,
            send_buffer_size,
            reuse_address,
        } = self.builder;

        let handle = if let Some(handle) = handle {
            handle
        } else {
            Handle::try_current().map_err(io::Error::other)?
        };

        let _guard = handle.enter();

        let socket = if let Some(socket) = socket {
            socket.set_nonblocking(true)?;
            socket
        } else if let Some(recv_addr) = recv_addr {
            bind_udp(recv_addr, reuse_address)?
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "missing bind address",
            ));
        };

        if let Some(size) = send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }

        if let Some(size) = recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }

        let socket: std::net::UdpSocket = socket.into();
        let socket = Socket::new(tokio::net::UdpSocket::from_std(socket)?, handle.clone());

        let clock = Clock::new();
        let timers = TimerQueue::new();
        let context = endpoint::Context {
            clock: Arc::new(clock),
            timers: timers.clone(),
            executor: Arc::new(Executor::new(handle.clone())),
        };
        let max_datagram_size = config.max_datagram_size();
        let endpoint = Endpoint::new(config, socket.clone(), context);
        socket.bind_endpoint(&endpoint);

        debug!(
            endpoint = %endpoint.name(),
            local_addr = ?endpoint.local_addr().ok(),
            "endpoint started"
        );

        let receive = task::receive(socket.clone(), max_datagram_size);
        let timers = task::drive_timers(timers, clock, socket);
        let task = handle.spawn(async move {
            tokio::join!(receive, timers);
        });

        Ok((endpoint, task))
    }
}

fn bind_udp(addr: SocketAddr, reuse_address: bool) -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    if reuse_address {
        socket.set_reuse_address(true)?;
    }
    socket.bind(&addr.into())?;
    Ok(socket)
}
