// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::path;
use bytes::Bytes;
use core::{future::Future, ops::RangeInclusive, pin::Pin, sync::atomic::AtomicUsize, task::Poll};
use futures_test::task::noop_context;
use tern_quic_core::{
    frame::{Crypto, Frame},
    recovery::{
        congestion_controller::{testing::MockCongestionController, CongestionController},
        RttEstimator,
    },
    time::testing,
};

const PACKET_SIZE: usize = 100;

#[derive(Default)]
struct Emitter {
    manager: Mutex<Weak<Manager>>,
    retransmitted: Mutex<Vec<(u64, u64)>>,
    acknowledged: Mutex<Vec<u64>>,
    acks_sent: Mutex<Vec<(Ack, bool)>>,
    probes: AtomicUsize,
    exhausted: AtomicBool,
    awaiting_handshake_keys: AtomicBool,
}

impl Emitter {
    fn manager(&self) -> Arc<Manager> {
        self.manager.lock().upgrade().unwrap()
    }

    fn send(&self, space: PacketNumberSpace, frames: Vec<Frame>, replaced: Option<u64>) -> u64 {
        let manager = self.manager();
        let packet_number = manager.allocate_packet_number();
        manager.packet_sent(
            SentPacket::new(packet_type(space), packet_number, frames, PACKET_SIZE),
            replaced,
        );
        packet_number
    }
}

impl PacketEmitter for Emitter {
    fn retransmit(&self, space: PacketNumberSpace, packet: &SentPacket) -> Result<(), TransmitError> {
        let frames = packet.retransmittable_frames().cloned().collect();
        let packet_number = self.send(space, frames, Some(packet.packet_number));
        self.retransmitted
            .lock()
            .push((packet.packet_number, packet_number));
        Ok(())
    }

    fn emit_ack_packet(
        &self,
        space: PacketNumberSpace,
        ack: Ack,
        ping: bool,
    ) -> Result<Option<u64>, TransmitError> {
        self.acks_sent.lock().push((ack.clone(), ping));
        let mut frames = vec![Frame::Ack(ack)];
        if ping {
            frames.push(Frame::Ping);
        }
        Ok(Some(self.send(space, frames, None)))
    }

    fn send_probe(&self, space: PacketNumberSpace) -> Result<(), TransmitError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.send(space, vec![Frame::Ping], None);
        Ok(())
    }

    fn send_data(&self, _space: PacketNumberSpace) -> Result<(), TransmitError> {
        Ok(())
    }

    fn acknowledged(&self, _space: PacketNumberSpace, packet: &SentPacket) {
        self.acknowledged.lock().push(packet.packet_number);
    }

    fn on_pto_exhausted(&self, _space: PacketNumberSpace) {
        self.exhausted.store(true, Ordering::SeqCst);
    }

    fn on_transmit_error(&self, _space: PacketNumberSpace, error: TransmitError) {
        panic!("unexpected transmit error: {error}");
    }

    fn is_open(&self) -> bool {
        true
    }

    fn is_awaiting_handshake_keys(&self) -> bool {
        self.awaiting_handshake_keys.load(Ordering::SeqCst)
    }
}

fn packet_type(space: PacketNumberSpace) -> PacketType {
    match space {
        PacketNumberSpace::Initial => PacketType::Initial,
        PacketNumberSpace::Handshake => PacketType::Handshake,
        PacketNumberSpace::ApplicationData => PacketType::OneRtt,
    }
}

struct Fixture {
    clock: testing::Clock,
    path: Arc<Path>,
    timers: Arc<TimerQueue>,
    emitter: Arc<Emitter>,
    manager: Arc<Manager>,
}

impl Fixture {
    fn new(space: PacketNumberSpace) -> Self {
        Self::with_path(space, path::testing::path())
    }

    fn with_path(space: PacketNumberSpace, path: Path) -> Self {
        let clock = testing::Clock::default();
        let path = Arc::new(path);
        let timers = TimerQueue::new();
        let emitter = Arc::new(Emitter::default());
        let weak = Arc::downgrade(&emitter) as Weak<dyn PacketEmitter>;
        let manager = Manager::new(
            space,
            "test".into(),
            Arc::new(clock.clone()),
            path.clone(),
            timers.clone(),
            weak,
        );
        *emitter.manager.lock() = Arc::downgrade(&manager);
        Self {
            clock,
            path,
            timers,
            emitter,
            manager,
        }
    }

    fn space(&self) -> PacketNumberSpace {
        self.manager.space()
    }

    /// Sends an ack-eliciting packet carrying crypto data
    fn send(&self) -> u64 {
        let frame = Frame::Crypto(Crypto {
            offset: 0,
            data: Bytes::from_static(b"data"),
        });
        self.emitter.send(self.space(), vec![frame], None)
    }

    /// Sends a packet carrying only an ACK, which is never ack-eliciting
    fn send_ack_only(&self) -> u64 {
        let frame = Frame::Ack(Ack {
            ack_delay: 0,
            ranges: vec![0..=0],
            ecn_counts: None,
        });
        self.emitter.send(self.space(), vec![frame], None)
    }

    fn ack(&self, ranges: &[RangeInclusive<u64>]) -> Result<(), TransportError> {
        let mut ranges = ranges.to_vec();
        ranges.sort_by(|a, b| b.start().cmp(a.start()));
        self.manager.process_ack_frame(&Ack {
            ack_delay: 0,
            ranges,
            ecn_counts: None,
        })
    }

    fn fire_timers(&self) {
        self.timers.process_events(self.clock.get_time());
    }

    fn bytes_in_flight(&self) -> usize {
        self.path
            .with_congestion_controller(|cc| cc.bytes_in_flight())
    }
}

/// Lets a test inspect the mock controller the path owns
#[derive(Clone, Default)]
struct SharedController(Arc<Mutex<MockCongestionController>>);

impl SharedController {
    fn path(&self) -> Path {
        Path::new(
            path::testing::peer_address(),
            RttEstimator::default(),
            Box::new(self.clone()),
        )
    }

    fn persistent_congestion(&self) -> usize {
        self.0.lock().persistent_congestion
    }

    fn lost(&self) -> usize {
        self.0.lock().lost
    }
}

impl CongestionController for SharedController {
    fn can_send_packet(&self) -> bool {
        self.0.lock().can_send_packet()
    }

    fn on_packet_sent(&mut self, bytes: usize) {
        self.0.lock().on_packet_sent(bytes)
    }

    fn on_packet_acked(&mut self, bytes: usize, time_sent: Timestamp) {
        self.0.lock().on_packet_acked(bytes, time_sent)
    }

    fn on_packets_lost(
        &mut self,
        bytes: usize,
        largest_time_sent: Timestamp,
        persistent_congestion: bool,
        now: Timestamp,
    ) {
        self.0
            .lock()
            .on_packets_lost(bytes, largest_time_sent, persistent_congestion, now)
    }

    fn on_packets_discarded(&mut self, bytes: usize) {
        self.0.lock().on_packets_discarded(bytes)
    }

    fn bytes_in_flight(&self) -> usize {
        self.0.lock().bytes_in_flight()
    }

    fn congestion_window(&self) -> usize {
        self.0.lock().congestion_window()
    }

    fn update_max_datagram_size(&mut self, max_datagram_size: usize) {
        self.0.lock().update_max_datagram_size(max_datagram_size)
    }
}

#[test]
fn packet_threshold_loss() {
    let fixture = Fixture::new(PacketNumberSpace::ApplicationData);
    // packet 0 is never sent
    fixture.manager.allocate_packet_number();
    for _ in 1..=10 {
        fixture.send();
    }

    fixture.clock.advance(Duration::from_millis(10));
    fixture.ack(&[10..=10]).unwrap();

    let originals: Vec<_> = fixture
        .emitter
        .retransmitted
        .lock()
        .iter()
        .map(|(original, _)| *original)
        .collect();
    assert_eq!(originals, vec![1, 2, 3, 4, 5, 6]);

    let pending = fixture.manager.pending_packet_numbers();
    for packet_number in 7..=9 {
        assert!(pending.contains(&packet_number));
    }
    assert!(fixture.manager.lost_packet_numbers().is_empty());

    // 10 sent, 1 acked, 6 lost and resent
    assert_eq!(fixture.bytes_in_flight(), 9 * PACKET_SIZE);
    assert_eq!(fixture.path.rtt().latest_rtt(), Duration::from_millis(10));
}

#[test]
fn time_threshold_loss() {
    let fixture = Fixture::new(PacketNumberSpace::ApplicationData);
    let first = fixture.send();
    fixture.clock.advance(Duration::from_millis(1));
    let second = fixture.send();
    fixture.clock.advance(Duration::from_millis(10));
    fixture.ack(&[second..=second]).unwrap();

    // not lost yet; the loss timer is armed instead
    assert!(fixture.emitter.retransmitted.lock().is_empty());
    let loss_time = fixture.manager.compute_next_deadline().unwrap();

    fixture.clock.set(loss_time);
    fixture.fire_timers();
    assert_eq!(fixture.emitter.retransmitted.lock()[0].0, first);
}

#[test]
fn retransmission_chain_is_acknowledged_once() {
    let fixture = Fixture::new(PacketNumberSpace::ApplicationData);
    for _ in 0..5 {
        fixture.send();
    }
    fixture.ack(&[4..=4]).unwrap();
    assert_eq!(*fixture.emitter.retransmitted.lock(), vec![(0, 5)]);

    // an ACK for the original number resolves the retransmission
    fixture.ack(&[0..=0]).unwrap();
    assert_eq!(*fixture.emitter.acknowledged.lock(), vec![4, 5]);
    assert!(!fixture.manager.pending_packet_numbers().contains(&5));

    // and a repeated ACK does not acknowledge it twice
    fixture.ack(&[0..=0]).unwrap();
    assert_eq!(*fixture.emitter.acknowledged.lock(), vec![4, 5]);
    assert_eq!(fixture.emitter.retransmitted.lock().len(), 1);
    assert_eq!(fixture.manager.pending_packet_numbers(), vec![1, 2, 3]);
}

#[test]
fn ack_of_unsent_packet_is_a_protocol_violation() {
    let fixture = Fixture::new(PacketNumberSpace::Handshake);
    fixture.send();
    let error = fixture.ack(&[1..=1]).unwrap_err();
    assert_eq!(error.code, TransportError::PROTOCOL_VIOLATION.code);
    assert_eq!(error.reason, "ack of a never-sent packet");
}

#[test]
fn initial_ack_samples_rtt_and_clears_deadline() {
    let fixture = Fixture::new(PacketNumberSpace::Initial);
    let packet_number = fixture.send();
    assert!(fixture.manager.compute_next_deadline().is_some());

    fixture.clock.advance(Duration::from_millis(50));
    fixture.ack(&[packet_number..=packet_number]).unwrap();

    assert!(fixture.manager.is_idle());
    assert_eq!(fixture.path.rtt().latest_rtt(), Duration::from_millis(50));
    assert_eq!(fixture.manager.compute_next_deadline(), None);
    assert!(fixture.timers.is_empty());
}

#[test]
fn pto_backoff_doubles_and_resets() {
    let fixture = Fixture::new(PacketNumberSpace::Handshake);
    fixture.send();

    fixture.clock.advance(Duration::from_secs(2));
    fixture.fire_timers();
    assert_eq!(fixture.path.rtt().pto_backoff(), 2);
    assert_eq!(*fixture.emitter.retransmitted.lock(), vec![(0, 1)]);

    fixture.clock.advance(Duration::from_secs(4));
    fixture.fire_timers();
    assert_eq!(fixture.path.rtt().pto_backoff(), 4);
    assert_eq!(fixture.emitter.retransmitted.lock()[1], (1, 2));

    fixture.ack(&[2..=2]).unwrap();
    assert_eq!(fixture.path.rtt().pto_backoff(), 1);
    // the original number resolved through the chain
    assert_eq!(*fixture.emitter.acknowledged.lock(), vec![2]);
}

#[test]
fn initial_ack_keeps_backoff() {
    let fixture = Fixture::new(PacketNumberSpace::Initial);
    fixture.send();
    fixture.clock.advance(Duration::from_secs(2));
    fixture.fire_timers();
    assert_eq!(fixture.path.rtt().pto_backoff(), 2);

    fixture.ack(&[1..=1]).unwrap();
    assert_eq!(fixture.path.rtt().pto_backoff(), 2);
}

#[test]
fn pto_exhaustion_aborts() {
    let fixture = Fixture::new(PacketNumberSpace::ApplicationData);
    fixture.send();
    for _ in 0..10 {
        if fixture.emitter.exhausted.load(Ordering::SeqCst) {
            break;
        }
        fixture.clock.advance(Duration::from_secs(300));
        fixture.fire_timers();
    }
    assert!(fixture.emitter.exhausted.load(Ordering::SeqCst));
    assert_eq!(fixture.path.rtt().pto_backoff(), 64);
}

#[test]
fn anti_deadlock_probe() {
    let fixture = Fixture::new(PacketNumberSpace::Handshake);
    assert_eq!(fixture.manager.compute_next_deadline(), None);

    fixture
        .emitter
        .awaiting_handshake_keys
        .store(true, Ordering::SeqCst);
    fixture.manager.run();
    assert!(fixture.manager.compute_next_deadline().is_some());

    fixture.clock.advance(Duration::from_secs(2));
    fixture.fire_timers();
    assert_eq!(fixture.emitter.probes.load(Ordering::SeqCst), 1);
}

#[test]
fn ack_frame_is_claimed_once() {
    let fixture = Fixture::new(PacketNumberSpace::Initial);
    fixture
        .manager
        .packet_received(PacketType::Initial, 0, true);

    let manager = fixture.manager.clone();
    let claimed: usize = (0..4)
        .map(|_| {
            let manager = manager.clone();
            std::thread::spawn(move || manager.get_next_ack_frame(false, 1200).is_some())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap() as usize)
        .sum();
    assert_eq!(claimed, 1);
    assert!(fixture.manager.get_next_ack_frame(false, 1200).is_none());
    assert!(fixture.manager.is_duplicate(0));
}

#[test]
fn due_ack_is_emitted_by_timer() {
    let fixture = Fixture::new(PacketNumberSpace::ApplicationData);
    fixture
        .manager
        .packet_received(PacketType::OneRtt, 0, true);
    assert_eq!(
        fixture.timers.next_deadline(),
        Some(fixture.clock.get_time() + ack::APPLICATION_ACK_DELAY)
    );

    fixture.clock.advance(ack::APPLICATION_ACK_DELAY);
    fixture.fire_timers();
    let acks = fixture.emitter.acks_sent.lock();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].0.ranges, vec![0..=0]);
    assert!(!acks[0].1);
}

#[test]
fn many_ranges_request_ping() {
    let fixture = Fixture::new(PacketNumberSpace::ApplicationData);
    for packet_number in (0..=22).step_by(2) {
        fixture
            .manager
            .packet_received(PacketType::OneRtt, packet_number, false);
    }
    assert!(fixture.manager.should_send_ping());

    fixture.send();
    assert!(!fixture.manager.should_send_ping());

    fixture.clock.advance(fixture.path.rtt().base_pto() + Duration::from_millis(1));
    assert!(fixture.manager.should_send_ping());
}

#[test]
fn acked_ack_frames_stop_ranges() {
    let fixture = Fixture::new(PacketNumberSpace::ApplicationData);
    for packet_number in 0..=5 {
        fixture
            .manager
            .packet_received(PacketType::OneRtt, packet_number, false);
    }
    let ack = fixture.manager.get_next_ack_frame(false, 1200).unwrap();
    let sent = fixture
        .emitter
        .send(PacketNumberSpace::ApplicationData, vec![Frame::Ack(ack), Frame::Ping], None);
    fixture
        .manager
        .packet_received(PacketType::OneRtt, 6, false);

    fixture.ack(&[sent..=sent]).unwrap();
    assert!(fixture.manager.is_duplicate(3));
    let ack = fixture.manager.get_next_ack_frame(false, 1200).unwrap();
    assert_eq!(ack.ranges, vec![6..=6]);
}

#[test]
fn ping_round_trip() {
    let fixture = Fixture::new(PacketNumberSpace::ApplicationData);
    let mut ping = fixture.manager.request_send_ping();
    assert_eq!(fixture.emitter.probes.load(Ordering::SeqCst), 1);

    let mut cx = noop_context();
    assert!(Pin::new(&mut ping).poll(&mut cx).is_pending());

    fixture.clock.advance(Duration::from_millis(30));
    fixture.ack(&[0..=0]).unwrap();
    assert_eq!(
        Pin::new(&mut ping).poll(&mut cx),
        Poll::Ready(Ok(Duration::from_millis(30)))
    );
}

#[test]
fn close_discards_everything() {
    let fixture = Fixture::new(PacketNumberSpace::Handshake);
    fixture.send();
    let mut ping = fixture.manager.request_send_ping();
    assert!(fixture.bytes_in_flight() > 0);

    fixture.manager.close();
    assert!(fixture.manager.is_closed());
    assert!(fixture.manager.is_idle());
    assert_eq!(fixture.bytes_in_flight(), 0);
    assert!(fixture.timers.is_empty());
    assert_eq!(fixture.manager.compute_next_deadline(), None);

    let mut cx = noop_context();
    assert_eq!(
        Pin::new(&mut ping).poll(&mut cx),
        Poll::Ready(Err(super::super::PingError::SpaceClosed(
            PacketNumberSpace::Handshake
        )))
    );

    // a closed space ignores late acknowledgements
    assert!(fixture.ack(&[0..=0]).is_ok());
}

#[test]
fn persistent_congestion_without_rtt_sample() {
    let controller = SharedController::default();
    let fixture = Fixture::with_path(PacketNumberSpace::ApplicationData, controller.path());

    fixture.send();
    fixture.clock.advance(Duration::from_secs(5));
    for _ in 1..=4 {
        fixture.send();
    }
    // the largest acknowledged packet is not ack-eliciting, so no RTT sample is taken
    let ack_only = fixture.send_ack_only();
    fixture.ack(&[ack_only..=ack_only]).unwrap();

    assert!(fixture.path.rtt().first_rtt_sample().is_none());
    let originals: Vec<_> = fixture
        .emitter
        .retransmitted
        .lock()
        .iter()
        .map(|(original, _)| *original)
        .collect();
    assert_eq!(originals, vec![0, 1]);
    // 0 and 1 span 5 s, well past 3 * (base PTO + max ack delay) for the initial RTT
    assert_eq!(controller.lost(), 1);
    assert_eq!(controller.persistent_congestion(), 1);
}

#[test]
fn short_loss_span_is_not_persistent() {
    let controller = SharedController::default();
    let fixture = Fixture::with_path(PacketNumberSpace::ApplicationData, controller.path());

    fixture.send();
    fixture.clock.advance(Duration::from_secs(1));
    for _ in 1..=4 {
        fixture.send();
    }
    let ack_only = fixture.send_ack_only();
    fixture.ack(&[ack_only..=ack_only]).unwrap();

    assert_eq!(fixture.emitter.retransmitted.lock().len(), 2);
    assert_eq!(controller.lost(), 1);
    assert_eq!(controller.persistent_congestion(), 0);
}

#[test]
fn persistent_congestion_resets_rtt_sample() {
    let controller = SharedController::default();
    let fixture = Fixture::with_path(PacketNumberSpace::ApplicationData, controller.path());

    let first = fixture.send();
    fixture.clock.advance(Duration::from_millis(100));
    fixture.ack(&[first..=first]).unwrap();
    assert!(fixture.path.rtt().first_rtt_sample().is_some());

    fixture.send();
    fixture.clock.advance(Duration::from_secs(2));
    let mut largest = 0;
    for _ in 0..5 {
        largest = fixture.send();
    }
    fixture.clock.advance(Duration::from_millis(100));
    fixture.ack(&[largest..=largest]).unwrap();

    // the two oldest packets span 2 s against a threshold under 1 s for a 100 ms RTT
    assert_eq!(fixture.emitter.retransmitted.lock().len(), 2);
    assert_eq!(controller.persistent_congestion(), 1);
    assert!(fixture.path.rtt().first_rtt_sample().is_none());
}
