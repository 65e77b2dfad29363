// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The seam between the loss detection engines and whoever builds packets for them.

use tern_quic_core::{
    crypto::CryptoError,
    frame::{Ack, Frame},
    packet::{number::PacketNumberSpace, PacketType},
};

/// An ack-eliciting packet handed to a loss detection engine after it was sent
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentPacket {
    pub packet_type: PacketType,
    pub packet_number: u64,
    pub frames: Vec<Frame>,
    /// Bytes counted against the congestion window
    pub size: usize,
    /// Largest packet number acknowledged by an ACK frame in this packet
    pub largest_acknowledged: Option<u64>,
}

impl SentPacket {
    pub fn new(packet_type: PacketType, packet_number: u64, frames: Vec<Frame>, size: usize) -> Self {
        let largest_acknowledged = frames.iter().find_map(|frame| match frame {
            Frame::Ack(ack) => Some(ack.largest_acknowledged()),
            _ => None,
        });
        Self {
            packet_type,
            packet_number,
            frames,
            size,
            largest_acknowledged,
        }
    }

    #[inline]
    pub fn is_ack_eliciting(&self) -> bool {
        self.frames.iter().any(Frame::is_ack_eliciting)
    }

    #[inline]
    pub fn contains_ping(&self) -> bool {
        self.frames.iter().any(|frame| matches!(frame, Frame::Ping))
    }

    /// The frames that carry over into a retransmission
    pub fn retransmittable_frames(&self) -> impl Iterator<Item = &Frame> + '_ {
        self.frames.iter().filter(|frame| frame.is_retransmittable())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransmitError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("connection is not open")]
    Closed,
    /// No send buffer is available; the caller is woken when one is returned
    #[error("send buffers exhausted")]
    Blocked,
}

impl TransmitError {
    #[inline]
    pub fn is_key_unavailable(&self) -> bool {
        matches!(self, Self::Crypto(error) if error.is_key_unavailable())
    }
}

/// Implemented by the connection; called by the loss detection engine of each space.
///
/// Implementations must not call back into the same engine's handle loop.
pub trait PacketEmitter: Send + Sync {
    /// Sends the retransmittable frames of `packet` in a packet with a new number.
    ///
    /// The new packet must be registered with
    /// [`Manager::packet_sent`](crate::recovery::Manager::packet_sent) naming the number
    /// it replaces.
    fn retransmit(&self, space: PacketNumberSpace, packet: &SentPacket) -> Result<(), TransmitError>;

    /// Sends a packet carrying `ack`, with a PING when `ping` is set.
    ///
    /// Returns the number of the packet if one was sent.
    fn emit_ack_packet(
        &self,
        space: PacketNumberSpace,
        ack: Ack,
        ping: bool,
    ) -> Result<Option<u64>, TransmitError>;

    /// Sends an ack-eliciting probe when the PTO fires with nothing to retransmit
    fn send_probe(&self, space: PacketNumberSpace) -> Result<(), TransmitError>;

    /// Sends new data queued for `space`
    fn send_data(&self, space: PacketNumberSpace) -> Result<(), TransmitError>;

    /// Called once for every packet the peer acknowledged
    fn acknowledged(&self, space: PacketNumberSpace, packet: &SentPacket);

    /// The PTO backed off past its limit in `space`
    fn on_pto_exhausted(&self, space: PacketNumberSpace);

    /// A transmission requested by the engine failed
    fn on_transmit_error(&self, space: PacketNumberSpace, error: TransmitError);

    fn is_open(&self) -> bool;

    /// True while a client has Initial keys but no Handshake keys yet, which arms the
    /// Handshake PTO without any packets in flight
    fn is_awaiting_handshake_keys(&self) -> bool;
}
