// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::ranges::AckRanges;
use core::time::Duration;
use tern_quic_core::{frame, time::Timestamp, transport::parameters::DEFAULT_ACK_DELAY_EXPONENT};

/// ACK frames growing past this size shed their lowest ranges
pub const MAX_ACK_FRAME_SIZE: usize = 1100;

/// The ACK frame a packet number space will send next.
///
/// Values are immutable; every change produces a new frame that replaces the old one
/// atomically. Once a frame is marked sent it is never handed out again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NextAckFrame {
    ranges: AckRanges,
    /// When the frame must go out; `None` until an ack-eliciting packet is covered
    deadline: Option<Timestamp>,
    /// When the largest acknowledged packet number was last raised
    largest_updated: Timestamp,
    sent: Option<Timestamp>,
    ack_eliciting_pending: u32,
}

impl NextAckFrame {
    /// Builds the frame that also covers `packet_number`.
    ///
    /// Returns `None` if `previous` already covers it and has not been sent.
    pub fn with_packet(
        previous: Option<&Self>,
        packet_number: u64,
        is_ack_eliciting: bool,
        now: Timestamp,
        max_ack_delay: Duration,
    ) -> Option<Self> {
        let mut next = match previous {
            Some(previous) if previous.sent.is_none() => {
                if previous.ranges.contains(packet_number) {
                    return None;
                }
                previous.clone()
            }
            // a sent frame keeps its ranges but starts a new round of acknowledgements
            Some(previous) => Self {
                ranges: previous.ranges.clone(),
                deadline: None,
                largest_updated: previous.largest_updated,
                sent: None,
                ack_eliciting_pending: 0,
            },
            None => Self {
                ranges: AckRanges::default(),
                deadline: None,
                largest_updated: now,
                sent: None,
                ack_eliciting_pending: 0,
            },
        };

        let largest = next.ranges.max_value();
        let out_of_order = largest.is_some_and(|largest| packet_number < largest);
        let gap = next.ranges.is_gap(packet_number);

        // shedding the lowest range when full is acceptable
        let _ = next.ranges.insert_packet_number(packet_number);

        if largest.map_or(true, |largest| packet_number > largest) {
            next.largest_updated = now;
        }

        if is_ack_eliciting {
            next.ack_eliciting_pending += 1;
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.1
        //# An endpoint SHOULD generate and send an ACK frame without delay when
        //# it receives an ack-eliciting packet either:
        //#
        //# *  when the received packet has a packet number less than another
        //#    ack-eliciting packet that has been received, or
        //#
        //# *  when the packet has a packet number larger than the highest-
        //#    numbered ack-eliciting packet that has been received and there are
        //#    missing packets between that packet and this packet.

        //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.2
        //# A receiver SHOULD send an ACK frame after receiving at least two
        //# ack-eliciting packets.
        let immediate = next.ack_eliciting_pending >= 2
            || (is_ack_eliciting && (out_of_order || gap));

        if immediate {
            next.deadline = Some(now);
        } else if is_ack_eliciting {
            let delayed = now + max_ack_delay;
            next.deadline = Some(next.deadline.map_or(delayed, |d| d.min(delayed)));
        }

        Some(next)
    }

    /// Returns a copy with every packet number at or below `packet_number` removed.
    ///
    /// Returns `None` if nothing changed; `Some(None)` if nothing is left to acknowledge.
    pub fn without_packets_up_to(&self, packet_number: u64) -> Option<Option<Self>> {
        let mut next = self.clone();
        if !next.ranges.remove_up_to(packet_number) {
            return None;
        }
        if next.ranges.is_empty() {
            return Some(None);
        }
        Some(Some(next))
    }

    /// Returns a copy marked as sent at `now`
    pub fn mark_sent(&self, now: Timestamp) -> Self {
        let mut next = self.clone();
        next.sent = Some(now);
        next
    }

    #[inline]
    pub fn is_sent(&self) -> bool {
        self.sent.is_some()
    }

    #[inline]
    pub fn deadline(&self) -> Option<Timestamp> {
        if self.is_sent() {
            None
        } else {
            self.deadline
        }
    }

    /// Returns true once an unsent frame's deadline has passed
    #[inline]
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.deadline().is_some_and(|deadline| deadline <= now)
    }

    #[inline]
    pub fn ranges(&self) -> &AckRanges {
        &self.ranges
    }

    /// Builds the wire frame, shedding low ranges if it would be too large
    pub fn to_frame(&self, now: Timestamp) -> frame::Ack {
        let delay = now.saturating_duration_since(self.largest_updated);
        let ack_delay = (delay.as_micros() as u64) >> DEFAULT_ACK_DELAY_EXPONENT;
        let mut ack = frame::Ack {
            ack_delay,
            ranges: self.ranges.iter().cloned().collect(),
            ecn_counts: None,
        };

        if ack.encoding_size() > MAX_ACK_FRAME_SIZE {
            let keep = (ack.ranges.len() / 3).max(1);
            ack.ranges.truncate(keep);
        }

        ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(9);

    fn now() -> Timestamp {
        Timestamp::from_micros(1_000_000)
    }

    #[test]
    fn in_order_packets_wait_for_delay() {
        let first = NextAckFrame::with_packet(None, 0, true, now(), DELAY).unwrap();
        assert_eq!(first.deadline(), Some(now() + DELAY));
        assert!(!first.is_due(now()));

        // covered packets do not rebuild the frame
        assert!(NextAckFrame::with_packet(Some(&first), 0, true, now(), DELAY).is_none());

        // the second ack-eliciting packet forces an immediate ACK
        let second = NextAckFrame::with_packet(Some(&first), 1, true, now(), DELAY).unwrap();
        assert_eq!(second.deadline(), Some(now()));
    }

    #[test]
    fn out_of_order_and_gaps_are_immediate() {
        let first = NextAckFrame::with_packet(None, 5, false, now(), DELAY).unwrap();
        assert_eq!(first.deadline(), None);

        let gap = NextAckFrame::with_packet(Some(&first), 7, true, now(), DELAY).unwrap();
        assert!(gap.is_due(now()));

        let reordered = NextAckFrame::with_packet(Some(&first), 3, true, now(), DELAY).unwrap();
        assert!(reordered.is_due(now()));
    }

    #[test]
    fn sent_frames_are_not_due() {
        let first = NextAckFrame::with_packet(None, 0, true, now(), Duration::ZERO).unwrap();
        assert!(first.is_due(now()));
        let sent = first.mark_sent(now());
        assert!(!sent.is_due(now()));

        // a new packet starts a new round but keeps the older ranges
        let next = NextAckFrame::with_packet(Some(&sent), 1, true, now(), DELAY).unwrap();
        assert_eq!(next.deadline(), Some(now() + DELAY));
        assert!(next.ranges().contains(0));
    }

    #[test]
    fn ack_delay_is_scaled() {
        let frame = NextAckFrame::with_packet(None, 0, true, now(), DELAY).unwrap();
        let ack = frame.to_frame(now() + Duration::from_micros(800));
        assert_eq!(ack.ack_delay, 100);
        assert_eq!(ack.ranges, vec![0..=0]);
    }

    #[test]
    fn oversized_frames_shed_ranges() {
        // wide gaps take four bytes each to encode
        let mut frame = NextAckFrame::with_packet(None, 0, false, now(), DELAY).unwrap();
        for i in 1..300u64 {
            frame =
                NextAckFrame::with_packet(Some(&frame), i * 100_000, false, now(), DELAY).unwrap();
        }
        let ack = frame.to_frame(now());
        assert_eq!(ack.ranges.len(), frame.ranges().interval_len() / 3);
        assert!(ack.encoding_size() <= MAX_ACK_FRAME_SIZE);
        assert_eq!(ack.largest_acknowledged(), 299 * 100_000);
    }

    #[test]
    fn trimming() {
        let mut frame = NextAckFrame::with_packet(None, 0, false, now(), DELAY).unwrap();
        frame = NextAckFrame::with_packet(Some(&frame), 4, false, now(), DELAY).unwrap();
        let trimmed = frame.without_packets_up_to(2).unwrap().unwrap();
        assert!(!trimmed.ranges().contains(0));
        assert!(trimmed.without_packets_up_to(2).is_none());
        assert_eq!(trimmed.without_packets_up_to(4), Some(None));
    }
}
