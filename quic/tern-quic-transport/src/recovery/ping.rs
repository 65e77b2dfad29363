// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use futures_channel::oneshot;
use tern_quic_core::{packet::number::PacketNumberSpace, time::Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PingError {
    #[error("Not sending ping because {0} packet space is being closed")]
    SpaceClosed(PacketNumberSpace),
}

/// Resolves with the round trip time of a PING once the peer acknowledges it
#[must_use = "futures do nothing unless polled"]
pub struct PingFuture {
    space: PacketNumberSpace,
    receiver: oneshot::Receiver<Result<Duration, PingError>>,
}

impl Future for PingFuture {
    type Output = Result<Duration, PingError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let space = self.space;
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // the sender was dropped with the engine
            Poll::Ready(Err(_)) => Poll::Ready(Err(PingError::SpaceClosed(space))),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct PendingPing {
    /// Set once a packet carrying the PING is sent
    sent: Option<(u64, Timestamp)>,
    sender: oneshot::Sender<Result<Duration, PingError>>,
}

/// PINGs requested by the application and not acknowledged yet
#[derive(Default)]
pub(crate) struct Pings {
    pending: Vec<PendingPing>,
}

impl Pings {
    pub fn push(&mut self, space: PacketNumberSpace) -> PingFuture {
        let (sender, receiver) = oneshot::channel();
        self.pending.push(PendingPing { sent: None, sender });
        PingFuture { space, receiver }
    }

    /// Returns true if a requested PING has not been put in a packet yet
    pub fn has_unsent(&self) -> bool {
        self.pending.iter().any(|ping| ping.sent.is_none())
    }

    /// A packet carrying a PING frame was sent
    pub fn on_packet_sent(&mut self, packet_number: u64, now: Timestamp) {
        for ping in self.pending.iter_mut().filter(|ping| ping.sent.is_none()) {
            ping.sent = Some((packet_number, now));
        }
    }

    /// Resolves every PING sent at or below `largest_acknowledged`
    pub fn on_ack(&mut self, largest_acknowledged: u64, now: Timestamp) {
        let mut index = 0;
        while index < self.pending.len() {
            match self.pending[index].sent {
                Some((packet_number, sent)) if packet_number <= largest_acknowledged => {
                    let ping = self.pending.swap_remove(index);
                    let _ = ping.sender.send(Ok(now.saturating_duration_since(sent)));
                }
                _ => index += 1,
            }
        }
    }

    pub fn close(&mut self, space: PacketNumberSpace) {
        for ping in self.pending.drain(..) {
            let _ = ping.sender.send(Err(PingError::SpaceClosed(space)));
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_test::task::noop_context;

    #[test]
    fn resolves_once_acknowledged() {
        let mut pings = Pings::default();
        let mut future = pings.push(PacketNumberSpace::ApplicationData);
        let mut cx = noop_context();
        assert!(Pin::new(&mut future).poll(&mut cx).is_pending());
        assert!(pings.has_unsent());

        let sent = Timestamp::from_micros(1_000);
        pings.on_packet_sent(7, sent);
        assert!(!pings.has_unsent());

        // an ACK below the PING leaves it pending
        pings.on_ack(6, sent + Duration::from_millis(5));
        assert_eq!(pings.len(), 1);

        pings.on_ack(9, sent + Duration::from_millis(20));
        assert_eq!(pings.len(), 0);
        assert_eq!(
            Pin::new(&mut future).poll(&mut cx),
            Poll::Ready(Ok(Duration::from_millis(20)))
        );
    }

    #[test]
    fn close_fails_pending() {
        let mut pings = Pings::default();
        let mut future = pings.push(PacketNumberSpace::Handshake);
        pings.close(PacketNumberSpace::Handshake);
        let mut cx = noop_context();
        let Poll::Ready(Err(error)) = Pin::new(&mut future).poll(&mut cx) else {
            panic!("ping should fail");
        };
        assert_eq!(
            error.to_string(),
            "Not sending ping because HANDSHAKE packet space is being closed"
        );
    }
}
