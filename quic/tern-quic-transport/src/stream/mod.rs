// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The seam to stream multiplexing.
//!
//! Streams own their buffers and per-stream flow control. The connection only hands them
//! stream-related frames, asks for frames to send within the connection credit and reports
//! what the peer acknowledged.

use crate::connection::TerminationCause;
use tern_quic_core::{frame::Frame, transport::{parameters::TransportParameters, TransportError}};

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub trait Streams: Send + Sync {
    /// Applies the limits the peer advertised in its transport parameters
    fn on_peer_parameters(&self, parameters: &TransportParameters);

    /// Returns true if some stream has frames to send
    fn has_pending(&self) -> bool;

    /// Appends frames whose encodings fit in `max_len` bytes.
    ///
    /// Returns the number of new stream bytes produced, which never exceeds `credit`.
    fn produce_frames(&self, max_len: usize, credit: u64, frames: &mut Vec<Frame>) -> u64;

    /// Handles a stream frame from the peer.
    ///
    /// Returns the number of bytes that newly count against the connection receive window.
    fn on_frame(&self, frame: &Frame) -> Result<u64, TransportError>;

    fn on_frame_acknowledged(&self, frame: &Frame);

    /// Takes the number of received bytes the application consumed since the last call
    fn take_processed(&self) -> u64;

    fn on_connection_closed(&self, cause: &TerminationCause);
}
