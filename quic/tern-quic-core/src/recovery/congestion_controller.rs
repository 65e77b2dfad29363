// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::time::Timestamp;

/// Window-based congestion control as seen by the loss detection engine.
///
/// All byte counts are packet sizes as registered with `on_packet_sent`.
pub trait CongestionController: Send + 'static {
    /// Returns true while the window has room for another packet
    fn can_send_packet(&self) -> bool;

    fn on_packet_sent(&mut self, bytes: usize);

    fn on_packet_acked(&mut self, bytes: usize, time_sent: Timestamp);

    /// A batch of packets was declared lost.
    ///
    /// `largest_time_sent` is the send time of the most recently sent lost packet.
    fn on_packets_lost(
        &mut self,
        bytes: usize,
        largest_time_sent: Timestamp,
        persistent_congestion: bool,
        now: Timestamp,
    );

    /// Packets were removed from flight without being acknowledged or lost, e.g. when a
    /// packet number space is discarded or a packet is rewritten for retransmission
    fn on_packets_discarded(&mut self, bytes: usize);

    fn bytes_in_flight(&self) -> usize;

    fn congestion_window(&self) -> usize;

    fn update_max_datagram_size(&mut self, max_datagram_size: usize);
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;

    /// Records calls and lets tests open or close the window
    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct MockCongestionController {
        pub blocked: bool,
        pub bytes_in_flight: usize,
        pub sent: usize,
        pub acked: usize,
        pub lost: usize,
        pub discarded: usize,
        pub persistent_congestion: usize,
    }

    impl CongestionController for MockCongestionController {
        fn can_send_packet(&self) -> bool {
            !self.blocked
        }

        fn on_packet_sent(&mut self, bytes: usize) {
            self.sent += 1;
            self.bytes_in_flight += bytes;
        }

        fn on_packet_acked(&mut self, bytes: usize, _time_sent: Timestamp) {
            self.acked += 1;
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        }

        fn on_packets_lost(
            &mut self,
            bytes: usize,
            _largest_time_sent: Timestamp,
            persistent_congestion: bool,
            _now: Timestamp,
        ) {
            self.lost += 1;
            if persistent_congestion {
                self.persistent_congestion += 1;
            }
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        }

        fn on_packets_discarded(&mut self, bytes: usize) {
            self.discarded += 1;
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        }

        fn bytes_in_flight(&self) -> usize {
            self.bytes_in_flight
        }

        fn congestion_window(&self) -> usize {
            usize::MAX
        }

        fn update_max_datagram_size(&mut self, _max_datagram_size: usize) {}
    }
}
