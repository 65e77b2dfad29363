// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The network path a connection sends on: peer address, RTT estimate and congestion
//! controller, shared by the three packet number spaces.

use core::{
    sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
    time::Duration,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use tern_quic_core::{
    recovery::{CongestionController, NewReno, RttEstimator},
    transport::parameters::{DEFAULT_ACK_DELAY_EXPONENT, DEFAULT_MAX_ACK_DELAY},
};

pub struct Path {
    peer_address: Mutex<SocketAddr>,
    rtt_estimator: Mutex<RttEstimator>,
    congestion_controller: Mutex<Box<dyn CongestionController>>,
    peer_max_ack_delay_micros: AtomicU64,
    peer_ack_delay_exponent: AtomicU8,
    handshake_confirmed: AtomicBool,
}

impl core::fmt::Debug for Path {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Path")
            .field("peer_address", &*self.peer_address.lock())
            .field("rtt_estimator", &*self.rtt_estimator.lock())
            .field("peer_max_ack_delay", &self.peer_max_ack_delay())
            .finish()
    }
}

impl Path {
    pub fn new(
        peer_address: SocketAddr,
        rtt_estimator: RttEstimator,
        congestion_controller: Box<dyn CongestionController>,
    ) -> Self {
        Self {
            peer_address: Mutex::new(peer_address),
            rtt_estimator: Mutex::new(rtt_estimator),
            congestion_controller: Mutex::new(congestion_controller),
            peer_max_ack_delay_micros: AtomicU64::new(DEFAULT_MAX_ACK_DELAY.as_micros() as u64),
            peer_ack_delay_exponent: AtomicU8::new(DEFAULT_ACK_DELAY_EXPONENT),
            handshake_confirmed: AtomicBool::new(false),
        }
    }

    /// A path using [`NewReno`] sized for `max_datagram_size`
    pub fn with_new_reno(peer_address: SocketAddr, max_datagram_size: usize) -> Self {
        Self::new(
            peer_address,
            RttEstimator::default(),
            Box::new(NewReno::new(max_datagram_size)),
        )
    }

    #[inline]
    pub fn peer_address(&self) -> SocketAddr {
        *self.peer_address.lock()
    }

    pub fn set_peer_address(&self, address: SocketAddr) {
        *self.peer_address.lock() = address;
    }

    /// Runs `f` with the RTT estimator locked
    #[inline]
    pub fn with_rtt<R>(&self, f: impl FnOnce(&mut RttEstimator) -> R) -> R {
        f(&mut self.rtt_estimator.lock())
    }

    /// Runs `f` with the congestion controller locked
    #[inline]
    pub fn with_congestion_controller<R>(
        &self,
        f: impl FnOnce(&mut dyn CongestionController) -> R,
    ) -> R {
        let mut cc = self.congestion_controller.lock();
        f(cc.as_mut())
    }

    #[inline]
    pub fn rtt(&self) -> RttEstimator {
        *self.rtt_estimator.lock()
    }

    #[inline]
    pub fn can_send_packet(&self) -> bool {
        self.congestion_controller.lock().can_send_packet()
    }

    #[inline]
    pub fn peer_max_ack_delay(&self) -> Duration {
        Duration::from_micros(self.peer_max_ack_delay_micros.load(Ordering::Acquire))
    }

    #[inline]
    pub fn peer_ack_delay_exponent(&self) -> u8 {
        self.peer_ack_delay_exponent.load(Ordering::Acquire)
    }

    /// Applies the peer's `max_ack_delay` and `ack_delay_exponent` transport parameters
    pub fn on_peer_ack_settings(&self, max_ack_delay: Duration, ack_delay_exponent: u8) {
        self.peer_max_ack_delay_micros
            .store(max_ack_delay.as_micros() as u64, Ordering::Release);
        self.peer_ack_delay_exponent
            .store(ack_delay_exponent, Ordering::Release);
    }

    #[inline]
    pub fn is_handshake_confirmed(&self) -> bool {
        self.handshake_confirmed.load(Ordering::Acquire)
    }

    pub fn on_handshake_confirmed(&self) {
        self.handshake_confirmed.store(true, Ordering::Release);
    }

    /// Converts the encoded ACK Delay field of a peer's Application ACK into a duration
    pub fn decode_ack_delay(&self, encoded: u64) -> Duration {
        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# an endpoint MUST use the lesser of the acknowledgment delay and
        //# the peer's max_ack_delay after the handshake is confirmed
        let exponent = self.peer_ack_delay_exponent() as u32;
        let micros = encoded.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay = Duration::from_micros(micros);
        if self.is_handshake_confirmed() {
            delay.min(self.peer_max_ack_delay())
        } else {
            delay
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use tern_quic_core::recovery::congestion_controller::testing::MockCongestionController;

    pub fn peer_address() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4433))
    }

    /// A path with an unlimited mock congestion controller
    pub fn path() -> Path {
        Path::new(
            peer_address(),
            RttEstimator::default(),
            Box::new(MockCongestionController::default()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_delay_is_capped_after_confirmation() {
        let path = testing::path();
        path.on_peer_ack_settings(Duration::from_millis(10), 3);

        // 4000 << 3 = 32ms
        assert_eq!(path.decode_ack_delay(4000), Duration::from_millis(32));
        path.on_handshake_confirmed();
        assert_eq!(path.decode_ack_delay(4000), Duration::from_millis(10));
    }

    #[test]
    fn defaults() {
        let path = testing::path();
        assert_eq!(path.peer_max_ack_delay(), DEFAULT_MAX_ACK_DELAY);
        assert_eq!(path.peer_ack_delay_exponent(), 3);
        assert!(path.can_send_packet());
    }
}
