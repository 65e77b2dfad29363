// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicBool, Ordering};
use std::{
    io,
    net::SocketAddr,
    sync::{Arc, OnceLock, Weak},
};
use tern_quic_transport::endpoint::{self, Endpoint};
use tokio::{net::UdpSocket, runtime::Handle, sync::watch};
use tracing::{debug, trace};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReadState {
    Reading,
    Paused,
    Closed,
}

/// A tokio UDP socket driven by an [`Endpoint`]
#[derive(Debug)]
pub struct Socket {
    this: Weak<Self>,
    socket: UdpSocket,
    handle: Handle,
    endpoint: OnceLock<Weak<Endpoint>>,
    state: watch::Sender<ReadState>,
    writable_requested: AtomicBool,
}

impl Socket {
    pub(crate) fn new(socket: UdpSocket, handle: Handle) -> Arc<Self> {
        let (state, _) = watch::channel(ReadState::Reading);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            socket,
            handle,
            endpoint: OnceLock::new(),
            state,
            writable_requested: AtomicBool::new(false),
        })
    }

    pub(crate) fn bind_endpoint(&self, endpoint: &Arc<Endpoint>) {
        let _ = self.endpoint.set(Arc::downgrade(endpoint));
    }

    pub(crate) fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.endpoint.get()?.upgrade()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ReadState> {
        self.state.subscribe()
    }

    pub(crate) async fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buffer).await
    }

    pub fn is_paused(&self) -> bool {
        *self.state.borrow() == ReadState::Paused
    }

    fn transition(&self, from: ReadState, to: ReadState) {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
    }
}

impl endpoint::Socket for Socket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn try_send_to(&self, payload: &[u8], peer: SocketAddr) -> io::Result<usize> {
        if !self.is_open() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.socket.try_send_to(payload, peer)
    }

    fn notify_writable(&self) {
        if self.writable_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        let (Some(socket), Some(endpoint)) = (self.this.upgrade(), self.endpoint.get().cloned())
        else {
            self.writable_requested.store(false, Ordering::Release);
            return;
        };

        self.handle.spawn(async move {
            let result = socket.socket.writable().await;
            socket.writable_requested.store(false, Ordering::Release);
            let Some(endpoint) = endpoint.upgrade() else {
                return;
            };
            match result {
                Ok(()) => endpoint.on_writable(),
                Err(error) => endpoint.abort(endpoint::Error::Io(error)),
            }
        });
    }

    fn pause_reading(&self) {
        trace!("socket reads paused");
        self.transition(ReadState::Reading, ReadState::Paused);
    }

    fn resume_reading(&self) {
        trace!("socket reads resumed");
        self.transition(ReadState::Paused, ReadState::Reading);
    }

    fn is_open(&self) -> bool {
        *self.state.borrow() != ReadState::Closed
    }

    fn close(&self) {
        if self.state.send_replace(ReadState::Closed) != ReadState::Closed {
            debug!(local_addr = ?self.socket.local_addr().ok(), "socket closed");
        }
    }
}
