// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::CongestionController;
use crate::time::Timestamp;
use core::cmp::max;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.2
//# Endpoints SHOULD use an initial congestion
//# window of ten times the maximum datagram size (max_datagram_size),
//# while limiting the window to the larger of 14,720 bytes or twice the
//# maximum datagram size.
fn initial_window(max_datagram_size: usize) -> usize {
    (10 * max_datagram_size).min(max(14_720, 2 * max_datagram_size))
}

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.2
//# The RECOMMENDED value is 2 * max_datagram_size.
fn minimum_window(max_datagram_size: usize) -> usize {
    2 * max_datagram_size
}

/// The RFC 9002 reference congestion controller
#[derive(Clone, Debug)]
pub struct NewReno {
    max_datagram_size: usize,
    congestion_window: usize,
    bytes_in_flight: usize,
    ssthresh: usize,
    congestion_recovery_start_time: Option<Timestamp>,
}

impl NewReno {
    pub fn new(max_datagram_size: usize) -> Self {
        Self {
            max_datagram_size,
            congestion_window: initial_window(max_datagram_size),
            bytes_in_flight: 0,
            ssthresh: usize::MAX,
            congestion_recovery_start_time: None,
        }
    }

    #[inline]
    fn in_congestion_recovery(&self, time_sent: Timestamp) -> bool {
        self.congestion_recovery_start_time
            .is_some_and(|start| time_sent <= start)
    }

    #[inline]
    pub fn is_slow_start(&self) -> bool {
        self.congestion_window < self.ssthresh
    }
}

impl CongestionController for NewReno {
    #[inline]
    fn can_send_packet(&self) -> bool {
        self.bytes_in_flight < self.congestion_window
    }

    fn on_packet_sent(&mut self, bytes: usize) {
        self.bytes_in_flight += bytes;
    }

    fn on_packet_acked(&mut self, bytes: usize, time_sent: Timestamp) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.2
        //# The recovery period
        //# aims to limit congestion window reduction to once per round trip.
        if self.in_congestion_recovery(time_sent) {
            return;
        }

        if self.is_slow_start() {
            self.congestion_window += bytes;
        } else {
            //= https://www.rfc-editor.org/rfc/rfc9002#appendix-B.5
            //# congestion_window +=
            //#   max_datagram_size * acked_packet.sent_bytes
            //#   / congestion_window
            self.congestion_window += self.max_datagram_size * bytes / self.congestion_window;
        }
    }

    fn on_packets_lost(
        &mut self,
        bytes: usize,
        largest_time_sent: Timestamp,
        persistent_congestion: bool,
        now: Timestamp,
    ) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);

        if !self.in_congestion_recovery(largest_time_sent) {
            self.congestion_recovery_start_time = Some(now);
            //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.2
            //# The RECOMMENDED value is 0.5.
            self.ssthresh = max(
                self.congestion_window / 2,
                minimum_window(self.max_datagram_size),
            );
            self.congestion_window = self.ssthresh;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.6.2
        //# When persistent congestion is declared, the sender's congestion
        //# window MUST be reduced to the minimum congestion window
        //# (kMinimumWindow), similar to a TCP sender's response on an RTO
        if persistent_congestion {
            self.congestion_window = minimum_window(self.max_datagram_size);
            self.congestion_recovery_start_time = None;
        }
    }

    fn on_packets_discarded(&mut self, bytes: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }

    fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    fn congestion_window(&self) -> usize {
        self.congestion_window
    }

    fn update_max_datagram_size(&mut self, max_datagram_size: usize) {
        self.max_datagram_size = max_datagram_size;
        if self.congestion_recovery_start_time.is_none() && self.bytes_in_flight == 0 {
            self.congestion_window = initial_window(max_datagram_size);
        }
    }
}
