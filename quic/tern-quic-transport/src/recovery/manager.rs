// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::ping::{PingFuture, Pings};
use crate::{
    ack::{self, NextAckFrame},
    path::Path,
    sync::{AtomicSnapshot, SequentialScheduler},
    timer::{EventId, TimedEvent, TimerQueue},
    transmission::{PacketEmitter, SentPacket, TransmitError},
};
use core::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};
use tern_quic_core::{
    counter::MonotonicCounter,
    frame::Ack,
    packet::{number::PacketNumberSpace, PacketType},
    recovery::K_PACKET_THRESHOLD,
    time::{earliest, Clock, Timestamp},
    transport::TransportError,
    varint::VarInt,
};
use tracing::{debug, trace};

/// Ranges in the next ACK frame above which a PING is piggybacked
const PING_RANGE_THRESHOLD: usize = 10;

/// An ack-eliciting packet waiting for its acknowledgement
#[derive(Clone, Debug)]
struct PendingAck {
    packet: Arc<SentPacket>,
    sent: Timestamp,
    /// Numbers of the packets this one replaced, oldest first
    chain: SmallVec<[u64; 2]>,
    /// False once the congestion controller stopped counting the bytes
    in_flight: bool,
}

impl PendingAck {
    #[inline]
    fn packet_number(&self) -> u64 {
        self.packet.packet_number
    }
}

/// Everything guarded by the transfer lock.
///
/// An entry lives in exactly one of `pending`, `lost` and `probes`.
#[derive(Debug, Default)]
struct Transfer {
    /// Sent and not acknowledged
    pending: BTreeMap<u64, PendingAck>,
    /// Declared lost and waiting for congestion window to be resent
    lost: BTreeMap<u64, PendingAck>,
    /// Picked by the PTO to be resent regardless of the congestion window
    probes: BTreeMap<u64, PendingAck>,
    /// Maps every replaced packet number to the number of the packet that now carries it
    replaced: BTreeMap<u64, u64>,
    loss_time: Option<Timestamp>,
    last_ack_eliciting_sent: Option<Timestamp>,
    /// Base of the Handshake PTO armed before any Handshake packet is in flight
    anti_deadlock_since: Option<Timestamp>,
}

impl Transfer {
    /// Removes the entry currently carrying `packet_number`, following the replacement chain
    fn remove(&mut self, packet_number: u64) -> Option<PendingAck> {
        let current = self
            .replaced
            .get(&packet_number)
            .copied()
            .unwrap_or(packet_number);
        let entry = self
            .pending
            .remove(&current)
            .or_else(|| self.lost.remove(&current))
            .or_else(|| self.probes.remove(&current))?;
        for prior in &entry.chain {
            self.replaced.remove(prior);
        }
        Some(entry)
    }

    fn clear(&mut self) -> usize {
        let in_flight = self
            .pending
            .values()
            .chain(self.lost.values())
            .chain(self.probes.values())
            .filter(|entry| entry.in_flight)
            .map(|entry| entry.packet.size)
            .sum();
        self.pending.clear();
        self.lost.clear();
        self.probes.clear();
        self.replaced.clear();
        self.loss_time = None;
        self.anti_deadlock_since = None;
        in_flight
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.lost.is_empty() && self.probes.is_empty()
    }
}

/// Packets declared lost by one pass of loss detection
#[derive(Debug, Default)]
struct LostBatch {
    bytes: usize,
    count: usize,
    earliest_sent: Option<Timestamp>,
    latest_sent: Option<Timestamp>,
}

/// Acknowledgement, loss detection and retransmission for one packet number space.
///
/// The engine is a deadline machine: every mutation recomputes the next time it needs to
/// run (loss timer, probe timeout or ACK delay) and registers it with the shared
/// [`TimerQueue`]. Work is done in a single-flight handle loop that calls back into the
/// connection through [`PacketEmitter`].
pub struct Manager {
    space: PacketNumberSpace,
    log_tag: Arc<str>,
    clock: Arc<dyn Clock>,
    path: Arc<Path>,
    timers: Arc<TimerQueue>,
    event_id: EventId,
    this: Weak<Manager>,
    emitter: Weak<dyn PacketEmitter>,
    next_packet_number: AtomicU64,
    /// Largest packet number received from the peer
    largest_processed: MonotonicCounter,
    /// Largest of our packet numbers the peer acknowledged
    largest_acknowledged: MonotonicCounter,
    /// Received packet numbers at or below this are no longer acknowledged or accepted
    ignore_before: MonotonicCounter,
    next_ack: AtomicSnapshot<NextAckFrame>,
    transfer: Mutex<Transfer>,
    pings: Mutex<Pings>,
    scheduler: SequentialScheduler,
    closed: AtomicBool,
    transmit_now: AtomicBool,
    /// Set when the emitter ran out of send buffers
    blocked: AtomicBool,
}

impl core::fmt::Debug for Manager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Manager")
            .field("space", &self.space)
            .field("log_tag", &self.log_tag)
            .field("closed", &self.is_closed())
            .field("transfer", &*self.transfer.lock())
            .finish()
    }
}

impl Manager {
    pub fn new(
        space: PacketNumberSpace,
        log_tag: Arc<str>,
        clock: Arc<dyn Clock>,
        path: Arc<Path>,
        timers: Arc<TimerQueue>,
        emitter: Weak<dyn PacketEmitter>,
    ) -> Arc<Self> {
        let event_id = timers.new_event_id();
        Arc::new_cyclic(|this| Self {
            space,
            log_tag,
            clock,
            path,
            timers,
            event_id,
            this: this.clone(),
            emitter,
            next_packet_number: AtomicU64::new(0),
            largest_processed: MonotonicCounter::new(),
            largest_acknowledged: MonotonicCounter::new(),
            ignore_before: MonotonicCounter::new(),
            next_ack: AtomicSnapshot::default(),
            transfer: Mutex::new(Transfer::default()),
            pings: Mutex::new(Pings::default()),
            scheduler: SequentialScheduler::new(),
            closed: AtomicBool::new(false),
            transmit_now: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn space(&self) -> PacketNumberSpace {
        self.space
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Allocates the number of the next packet sent in this space
    #[inline]
    pub fn allocate_packet_number(&self) -> u64 {
        self.next_packet_number.fetch_add(1, Ordering::AcqRel)
    }

    /// The number the next allocated packet will get
    #[inline]
    pub fn next_packet_number(&self) -> u64 {
        self.next_packet_number.load(Ordering::Acquire)
    }

    /// Largest packet number received, used to expand truncated packet numbers
    #[inline]
    pub fn largest_processed(&self) -> Option<u64> {
        self.largest_processed.get()
    }

    #[inline]
    pub fn largest_acknowledged(&self) -> Option<u64> {
        self.largest_acknowledged.get()
    }

    /// Returns true if a packet with this number must be dropped as a duplicate or as
    /// too old to acknowledge
    pub fn is_duplicate(&self, packet_number: u64) -> bool {
        self.ignore_before.covers(packet_number)
            || self
                .next_ack
                .load()
                .is_some_and(|ack| ack.ranges().contains(packet_number))
    }

    /// Registers a sent packet.
    ///
    /// Packets that are not ack-eliciting are only inspected for PING frames. When
    /// `replaced` is set the packet is a retransmission and takes over the acknowledgement
    /// of that number and everything it had replaced itself.
    pub fn packet_sent(&self, packet: SentPacket, replaced: Option<u64>) {
        let now = self.clock.get_time();
        let packet_number = packet.packet_number;

        if packet.contains_ping() {
            self.pings.lock().on_packet_sent(packet_number, now);
        }

        if !packet.is_ack_eliciting() || self.is_closed() {
            self.reschedule();
            return;
        }

        self.path
            .with_congestion_controller(|cc| cc.on_packet_sent(packet.size));

        let mut discarded = 0;
        {
            let mut transfer = self.transfer.lock();
            let mut chain = SmallVec::new();

            if let Some(replaced) = replaced {
                if let Some(previous) = transfer.remove(replaced) {
                    if previous.in_flight {
                        discarded = previous.packet.size;
                    }
                    chain = previous.chain.clone();
                    chain.push(previous.packet_number());
                }
                for prior in &chain {
                    transfer.replaced.insert(*prior, packet_number);
                }
            }

            transfer.pending.insert(
                packet_number,
                PendingAck {
                    packet: Arc::new(packet),
                    sent: now,
                    chain,
                    in_flight: true,
                },
            );
            transfer.last_ack_eliciting_sent = Some(now);
        }

        if discarded > 0 {
            self.path
                .with_congestion_controller(|cc| cc.on_packets_discarded(discarded));
        }

        trace!(tag = %self.log_tag, space = ?self.space, pn = packet_number, ?replaced, "packet sent");
        self.reschedule();
    }

    /// Records a received packet so it is acknowledged
    pub fn packet_received(&self, packet_type: PacketType, packet_number: u64, is_ack_eliciting: bool) {
        debug_assert_eq!(packet_type.packet_number_space(), Some(self.space));

        self.largest_processed.advance_to(packet_number);
        if self.ignore_before.covers(packet_number) || self.is_closed() {
            return;
        }

        let now = self.clock.get_time();
        let max_delay = ack::max_ack_delay(self.space);
        loop {
            let current = self.next_ack.load();
            let Some(next) = NextAckFrame::with_packet(
                current.as_deref(),
                packet_number,
                is_ack_eliciting,
                now,
                max_delay,
            ) else {
                return;
            };
            if self.next_ack.compare_and_set(&current, Some(Arc::new(next))) {
                break;
            }
        }

        trace!(tag = %self.log_tag, space = ?self.space, pn = packet_number, is_ack_eliciting, "packet received");
        self.reschedule();
    }

    /// Claims the pending ACK frame if it is due (or unconditionally when `only_if_overdue`
    /// is false) and fits in `max_size`.
    ///
    /// Exactly one caller gets a given frame.
    pub fn get_next_ack_frame(&self, only_if_overdue: bool, max_size: usize) -> Option<Ack> {
        let now = self.clock.get_time();
        loop {
            let current = self.next_ack.load();
            let frame = current.as_deref()?;
            if frame.is_sent() || (only_if_overdue && !frame.is_due(now)) {
                return None;
            }

            let ack = frame.to_frame(now);
            if ack.encoding_size() > max_size.saturating_sub(3) {
                return None;
            }

            let sent = Arc::new(frame.mark_sent(now));
            if self.next_ack.compare_and_set(&current, Some(sent)) {
                return Some(ack);
            }
        }
    }

    /// Returns true when the ACK frame has grown large and nothing ack-eliciting was sent
    /// for a base PTO, so the peer has no reason to acknowledge our ACKs
    pub fn should_send_ping(&self) -> bool {
        let Some(ack) = self.next_ack.load() else {
            return false;
        };
        if ack.ranges().interval_len() <= PING_RANGE_THRESHOLD {
            return false;
        }

        let now = self.clock.get_time();
        let base_pto = self.path.rtt().base_pto();
        match self.transfer.lock().last_ack_eliciting_sent {
            Some(sent) => now.saturating_duration_since(sent) > base_pto,
            None => true,
        }
    }

    /// Processes an ACK frame from the peer
    pub fn process_ack_frame(&self, frame: &Ack) -> Result<(), TransportError> {
        let now = self.clock.get_time();
        let largest = frame.largest_acknowledged();

        //= https://www.rfc-editor.org/rfc/rfc9000#section-13.1
        //# An endpoint SHOULD treat receipt of an acknowledgment for a packet it
        //# did not send as a connection error of type PROTOCOL_VIOLATION
        if largest >= self.next_packet_number() {
            return Err(TransportError::PROTOCOL_VIOLATION
                .with_reason("ack of a never-sent packet")
                .with_frame_type(VarInt::from_u8(frame.tag())));
        }

        if self.is_closed() {
            return Ok(());
        }

        self.largest_acknowledged.advance_to(largest);

        let mut acknowledged = Vec::new();
        let mut rtt_sample = None;
        let lost = {
            let mut transfer = self.transfer.lock();

            for range in &frame.ranges {
                let mut numbers: SmallVec<[u64; 16]> = SmallVec::new();
                numbers.extend(transfer.pending.range(range.clone()).map(|(pn, _)| *pn));
                numbers.extend(transfer.lost.range(range.clone()).map(|(pn, _)| *pn));
                numbers.extend(transfer.probes.range(range.clone()).map(|(pn, _)| *pn));
                numbers.extend(transfer.replaced.range(range.clone()).map(|(pn, _)| *pn));

                for packet_number in numbers {
                    if let Some(entry) = transfer.remove(packet_number) {
                        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.1
                        //# the largest acknowledged packet number is newly acknowledged
                        if entry.packet_number() == largest {
                            rtt_sample = Some(now.saturating_duration_since(entry.sent));
                        }
                        acknowledged.push(entry);
                    }
                }
            }

            if !acknowledged.is_empty() {
                transfer.anti_deadlock_since = None;
            }

            if let Some(rtt_sample) = rtt_sample {
                let ack_delay = if self.space.is_application_data() {
                    self.path.decode_ack_delay(frame.ack_delay)
                } else {
                    Duration::ZERO
                };
                self.path
                    .with_rtt(|rtt| rtt.update_rtt(ack_delay, rtt_sample, now));
            }

            self.detect_lost_packets(&mut transfer, now)
        };

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
        //# The PTO backoff factor is reset when an acknowledgment is received,
        //# except in the following case.  A server might take longer to respond
        //# to packets during the handshake than otherwise.  To protect such a
        //# server from repeated client probes, the PTO backoff is not reset at a
        //# client that is not yet certain that the server has finished
        //# validating the client's address.
        if !acknowledged.is_empty() && !self.space.is_initial() {
            self.path.with_rtt(|rtt| rtt.reset_pto_backoff());
        }

        self.path.with_congestion_controller(|cc| {
            for entry in acknowledged.iter().filter(|entry| entry.in_flight) {
                cc.on_packet_acked(entry.packet.size, entry.sent);
            }
        });

        self.on_lost(lost, now);

        let mut ignore_up_to = None;
        if let Some(emitter) = self.emitter.upgrade() {
            for entry in &acknowledged {
                ignore_up_to = ignore_up_to.max(entry.packet.largest_acknowledged);
                emitter.acknowledged(self.space, &entry.packet);
            }
        }

        self.pings.lock().on_ack(largest, now);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.4
        //# When a packet containing an ACK frame is acknowledged, the receiver can stop
        //# acknowledging packets less than or equal to the Largest Acknowledged
        //# field in the sent ACK frame.
        if let Some(ignore_up_to) = ignore_up_to {
            self.ignore_packets_up_to(ignore_up_to);
        }

        debug!(
            tag = %self.log_tag,
            space = ?self.space,
            largest,
            acknowledged = acknowledged.len(),
            "ack processed"
        );

        self.run();
        Ok(())
    }

    /// Stops acknowledging packet numbers at or below `packet_number`.
    ///
    /// The watermark may be above anything received so far.
    fn ignore_packets_up_to(&self, packet_number: u64) {
        if !self.ignore_before.advance_to(packet_number) {
            return;
        }
        loop {
            let current = self.next_ack.load();
            let Some(frame) = current.as_deref() else {
                return;
            };
            let Some(next) = frame.without_packets_up_to(packet_number) else {
                return;
            };
            if self.next_ack.compare_and_set(&current, next.map(Arc::new)) {
                return;
            }
        }
    }

    fn detect_lost_packets(&self, transfer: &mut Transfer, now: Timestamp) -> LostBatch {
        transfer.loss_time = None;
        let mut batch = LostBatch::default();
        let Some(largest) = self.largest_acknowledged.get() else {
            return batch;
        };

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.1
        //# A packet is declared lost if it meets all of the following
        //# conditions:
        //#
        //# *  The packet is unacknowledged, in flight, and was sent prior to an
        //#    acknowledged packet.
        //#
        //# *  The packet was sent kPacketThreshold packets before an
        //#    acknowledged packet (Section 6.1.1), or it was sent long enough in
        //#    the past (Section 6.1.2).
        let threshold = self.path.rtt().loss_time_threshold();
        let lost_send_time = now.checked_sub(threshold);
        let mut lost_numbers: SmallVec<[u64; 16]> = SmallVec::new();

        for (packet_number, entry) in transfer.pending.range(..largest) {
            let by_count = packet_number + K_PACKET_THRESHOLD < largest;
            let by_time = lost_send_time.is_some_and(|lost| entry.sent <= lost);
            if by_count || by_time {
                lost_numbers.push(*packet_number);
            } else {
                transfer.loss_time = earliest(transfer.loss_time, Some(entry.sent + threshold));
            }
        }

        for packet_number in lost_numbers {
            if let Some(mut entry) = transfer.pending.remove(&packet_number) {
                batch.count += 1;
                batch.bytes += entry.packet.size;
                batch.earliest_sent = earliest(batch.earliest_sent, Some(entry.sent));
                batch.latest_sent = batch.latest_sent.max(Some(entry.sent));
                entry.in_flight = false;
                transfer.lost.insert(packet_number, entry);
            }
        }

        batch
    }

    fn on_lost(&self, batch: LostBatch, now: Timestamp) {
        let (Some(earliest_sent), Some(latest_sent)) = (batch.earliest_sent, batch.latest_sent)
        else {
            return;
        };

        // a batch spanning the threshold is enough, even without an ack in between or an RTT sample
        let rtt = self.path.rtt();
        let persistent_congestion = batch.count > 1
            && latest_sent.saturating_duration_since(earliest_sent)
                > rtt.persistent_congestion_duration(self.path.peer_max_ack_delay());

        self.path.with_congestion_controller(|cc| {
            cc.on_packets_lost(batch.bytes, latest_sent, persistent_congestion, now)
        });
        if persistent_congestion {
            self.path.with_rtt(|rtt| rtt.on_persistent_congestion());
        }

        debug!(
            tag = %self.log_tag,
            space = ?self.space,
            lost = batch.count,
            persistent_congestion,
            "packets lost"
        );
    }

    fn pto_deadline(&self, transfer: &Transfer) -> Option<Timestamp> {
        let pto = self.path.rtt().pto_period(self.path.peer_max_ack_delay());
        if !transfer.pending.is_empty() {
            return transfer.last_ack_eliciting_sent.map(|sent| sent + pto);
        }
        transfer.anti_deadlock_since.map(|since| since + pto)
    }

    /// Returns the next time the handle loop needs to run, `None` for never
    pub fn compute_next_deadline(&self) -> Option<Timestamp> {
        if self.is_closed() {
            return None;
        }

        let now = self.clock.get_time();
        let blocked = self.blocked.load(Ordering::Acquire);
        if !blocked && (self.transmit_now.load(Ordering::Acquire) || self.pings.lock().has_unsent())
        {
            return Some(now);
        }

        let (loss_time, pto) = {
            let transfer = self.transfer.lock();
            if !blocked
                && (!transfer.probes.is_empty()
                    || (!transfer.lost.is_empty() && self.path.can_send_packet()))
            {
                return Some(now);
            }
            (transfer.loss_time, self.pto_deadline(&transfer))
        };

        let ack = self.next_ack.load().and_then(|ack| ack.deadline());
        earliest(earliest(loss_time, pto), ack)
    }

    /// Re-registers the engine with the timer queue at its current deadline
    pub fn reschedule(&self) {
        let deadline = self.compute_next_deadline();
        let this: Weak<dyn TimedEvent> = self.this.clone();
        self.timers.reschedule(self.event_id, this, deadline);
    }

    /// Asks the handle loop to send new data queued for this space
    pub fn request_transmit(&self) {
        self.transmit_now.store(true, Ordering::Release);
        self.run();
    }

    /// Sends a PING and resolves with its round trip time
    pub fn request_send_ping(&self) -> PingFuture {
        let future = self.pings.lock().push(self.space);
        if self.is_closed() {
            self.pings.lock().close(self.space);
        } else {
            self.run();
        }
        future
    }

    /// A send buffer was returned after the emitter reported [`TransmitError::Blocked`]
    pub fn on_buffer_available(&self) {
        if self.blocked.swap(false, Ordering::AcqRel) {
            self.run();
        }
    }

    /// Discards all state; the space is never used again
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.stop();
        self.timers.cancel(self.event_id);

        let discarded = self.transfer.lock().clear();
        if discarded > 0 {
            self.path
                .with_congestion_controller(|cc| cc.on_packets_discarded(discarded));
        }
        self.next_ack.take();
        self.pings.lock().close(self.space);
        debug!(tag = %self.log_tag, space = ?self.space, "packet space closed");
    }

    /// Forgets every packet in flight without closing the space.
    ///
    /// Used when a Retry or Version Negotiation packet restarts the handshake; the
    /// crypto data is replayed in packets with new numbers.
    pub fn reset(&self) {
        let discarded = self.transfer.lock().clear();
        if discarded > 0 {
            self.path
                .with_congestion_controller(|cc| cc.on_packets_discarded(discarded));
        }
        self.reschedule();
    }

    /// Runs the handle loop on the calling thread unless it is already running
    pub fn run(&self) {
        self.scheduler.run(|| self.handle_loop());
        if !self.scheduler.is_stopped() {
            self.reschedule();
        }
    }

    fn handle_loop(&self) {
        if self.is_closed() {
            return;
        }
        let Some(emitter) = self.emitter.upgrade() else {
            return;
        };
        if !emitter.is_open() {
            return;
        }

        let now = self.clock.get_time();

        let (loss_due, pto_due) = {
            let mut transfer = self.transfer.lock();
            if self.space.is_handshake()
                && transfer.pending.is_empty()
                && emitter.is_awaiting_handshake_keys()
            {
                //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.2.1
                //# the client MUST set the probe timer if the client has not received an
                //# acknowledgment for any of its Handshake packets and the handshake is
                //# not confirmed
                transfer.anti_deadlock_since.get_or_insert(now);
            } else {
                transfer.anti_deadlock_since = None;
            }
            (
                transfer.loss_time.is_some_and(|time| time <= now),
                self.pto_deadline(&transfer).is_some_and(|time| time <= now),
            )
        };

        if loss_due {
            let lost = self.detect_lost_packets(&mut self.transfer.lock(), now);
            self.on_lost(lost, now);
        }

        if pto_due && !self.on_pto_expired(emitter.as_ref(), now) {
            return;
        }

        self.retransmit(emitter.as_ref());

        if !self.blocked.load(Ordering::Acquire) && self.transmit_now.swap(false, Ordering::AcqRel)
        {
            if let Err(error) = emitter.send_data(self.space) {
                if matches!(error, TransmitError::Blocked) {
                    // picked up again once a buffer is returned
                    self.transmit_now.store(true, Ordering::Release);
                }
                self.on_error(emitter.as_ref(), error);
            }
        }

        if self.pings.lock().has_unsent() && !self.blocked.load(Ordering::Acquire) {
            if let Err(error) = emitter.send_probe(self.space) {
                self.on_error(emitter.as_ref(), error);
            }
        }

        if let Some(ack) = self.get_next_ack_frame(true, usize::MAX) {
            let ping = self.should_send_ping();
            if let Err(error) = emitter.emit_ack_packet(self.space, ack, ping) {
                self.on_error(emitter.as_ref(), error);
            }
        }
    }

    /// Returns false if the connection is being aborted
    fn on_pto_expired(&self, emitter: &dyn PacketEmitter, now: Timestamp) -> bool {
        let backoff = self.path.with_rtt(|rtt| rtt.increase_pto_backoff());
        debug!(tag = %self.log_tag, space = ?self.space, backoff, "probe timeout");

        if self.path.rtt().is_pto_backoff_exceeded() {
            emitter.on_pto_exhausted(self.space);
            return false;
        }

        let probed = {
            let mut transfer = self.transfer.lock();
            let oldest = transfer.pending.keys().next().copied();
            match oldest.and_then(|pn| transfer.pending.remove(&pn)) {
                Some(entry) => {
                    transfer.probes.insert(entry.packet_number(), entry);
                    true
                }
                None => {
                    if transfer.anti_deadlock_since.is_some() {
                        transfer.anti_deadlock_since = Some(now);
                    }
                    false
                }
            }
        };

        if !probed {
            if let Err(error) = emitter.send_probe(self.space) {
                self.on_error(emitter, error);
            }
        }
        true
    }

    /// Resends lost packets the congestion window allows and every PTO probe
    fn retransmit(&self, emitter: &dyn PacketEmitter) {
        loop {
            if self.blocked.load(Ordering::Acquire) {
                return;
            }

            let next = {
                let transfer = self.transfer.lock();
                let probe = transfer.probes.values().next();
                let lost = || {
                    transfer
                        .lost
                        .values()
                        .next()
                        .filter(|_| self.path.can_send_packet())
                };
                probe.or_else(lost).map(|entry| entry.packet.clone())
            };
            let Some(packet) = next else {
                return;
            };

            if let Err(error) = emitter.retransmit(self.space, &packet) {
                self.on_error(emitter, error);
                return;
            }

            // the emitter had nothing to resend
            let pn = packet.packet_number;
            let dropped = {
                let mut transfer = self.transfer.lock();
                let entry = transfer.probes.remove(&pn).or_else(|| transfer.lost.remove(&pn));
                if let Some(entry) = &entry {
                    for prior in &entry.chain {
                        transfer.replaced.remove(prior);
                    }
                }
                entry
            };
            if let Some(entry) = dropped {
                if entry.in_flight {
                    self.path
                        .with_congestion_controller(|cc| cc.on_packets_discarded(entry.packet.size));
                }
                trace!(tag = %self.log_tag, space = ?self.space, pn, "retransmission dropped");
            }
        }
    }

    fn on_error(&self, emitter: &dyn PacketEmitter, error: TransmitError) {
        match error {
            TransmitError::Blocked => self.blocked.store(true, Ordering::Release),
            error => emitter.on_transmit_error(self.space, error),
        }
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn pending_packet_numbers(&self) -> Vec<u64> {
        self.transfer.lock().pending.keys().copied().collect()
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn lost_packet_numbers(&self) -> Vec<u64> {
        self.transfer.lock().lost.keys().copied().collect()
    }

    /// Returns true if nothing is waiting for an acknowledgement or a retransmission
    pub fn is_idle(&self) -> bool {
        self.transfer.lock().is_empty()
    }
}

impl TimedEvent for Manager {
    fn refresh_deadline(&self) -> Option<Timestamp> {
        self.compute_next_deadline()
    }

    fn handle(&self, _now: Timestamp) -> Option<Timestamp> {
        self.scheduler.run(|| self.handle_loop());
        self.compute_next_deadline()
    }
}

#[cfg(test)]
mod tests;
