// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{
    clock::Clock,
    socket::{ReadState, Socket},
};
use bytes::Bytes;
use futures::future::poll_fn;
use std::{io, sync::Arc};
use tern_quic_core::time::Clock as _;
use tern_quic_transport::{
    endpoint,
    sync::{self, Task},
    timer::TimerQueue,
};
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, trace, warn};

/// Runs endpoint drain loops as tokio tasks
#[derive(Clone, Debug)]
pub struct Executor {
    handle: Handle,
}

impl Executor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl sync::Executor for Executor {
    fn execute(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }
}

/// Errors a UDP socket reports for an earlier send that do not affect receiving
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::WouldBlock
    )
}

/// Waits until the socket is not paused. Returns `false` once it closed.
async fn wait_readable(state: &mut watch::Receiver<ReadState>) -> bool {
    match state.wait_for(|state| *state != ReadState::Paused).await {
        Ok(state) => *state == ReadState::Reading,
        Err(_) => false,
    }
}

/// Reads datagrams into the endpoint until the socket closes
pub(crate) async fn receive(socket: Arc<Socket>, max_datagram_size: usize) {
    let mut state = socket.subscribe();
    let mut buffer = vec![0u8; max_datagram_size];

    while wait_readable(&mut state).await {
        let result = tokio::select! {
            result = socket.recv_from(&mut buffer) => result,
            // paused or closed while waiting for a datagram
            _ = state.wait_for(|state| *state != ReadState::Reading) => continue,
        };

        let Some(endpoint) = socket.endpoint() else {
            break;
        };
        match result {
            Ok((len, peer)) => {
                trace!(%peer, len, "datagram received");
                endpoint.on_received(peer, Bytes::copy_from_slice(&buffer[..len]));
            }
            Err(error) if is_transient(&error) => {
                debug!(%error, "transient receive error");
            }
            Err(error) => {
                warn!(%error, "receive failed");
                endpoint.abort(endpoint::Error::Io(error));
                break;
            }
        }
    }
}

/// Fires timers as their deadlines pass until the socket closes
pub(crate) async fn drive_timers(timers: Arc<TimerQueue>, clock: Clock, socket: Arc<Socket>) {
    let mut state = socket.subscribe();
    let mut timer = clock.timer();

    loop {
        match timers.process_events(clock.get_time()) {
            Some(deadline) => timer.reset(deadline),
            None => timer.cancel(),
        }

        tokio::select! {
            _ = &mut timer => {}
            _ = poll_fn(|cx| timers.poll_deadline_changed(cx)) => {}
            _ = state.wait_for(|state| *state == ReadState::Closed) => break,
        }
    }
}
