// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{io, net::SocketAddr};

/// The datagram socket an [`Endpoint`](super::Endpoint) sends through.
///
/// The receive side pushes datagrams into [`Endpoint::on_received`](super::Endpoint::on_received)
/// and honors the pause and resume requests the endpoint makes when its read queue fills up.
pub trait Socket: Send + Sync + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Sends one datagram without blocking.
    ///
    /// Returns [`io::ErrorKind::WouldBlock`] when the socket cannot take it right now. The
    /// endpoint then calls [`notify_writable`](Self::notify_writable) and waits for
    /// [`Endpoint::on_writable`](super::Endpoint::on_writable).
    fn try_send_to(&self, payload: &[u8], peer: SocketAddr) -> io::Result<usize>;

    /// Asks to be told through [`Endpoint::on_writable`](super::Endpoint::on_writable) once
    /// sending may succeed again
    fn notify_writable(&self);

    /// Stops delivering received datagrams until [`resume_reading`](Self::resume_reading)
    fn pause_reading(&self);

    fn resume_reading(&self);

    fn is_open(&self) -> bool;

    fn close(&self);
}
