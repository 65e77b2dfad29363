// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The connection state machine.
//!
//! A [`Connection`] owns the TLS session, the three loss detection engines and the
//! connection-level flow control. Datagrams from the endpoint are split into packets,
//! unprotected and dispatched frame by frame; the engines call back through
//! [`PacketEmitter`] whenever something has to be sent.
//!
//! Locks are taken in a fixed order: the TLS session before any crypto stream. Every other
//! lock is a leaf and is never held while calling into an engine or the endpoint link.

use super::{
    buffer_pool::{BufferListener, BufferPermit, BufferPool, DEFAULT_BUFFERS},
    crypto_stream::{ReceiveBuffer, SendQueue},
    flow_control::{ReceiveWindow, SendCredit},
    handshake::{HandshakeFuture, HandshakeSignal},
    id_registry::{LocalIdRegistry, PeerIdRegistry},
    link::{ClosedConnection, Datagram, EndpointLink},
    transport_parameters::{self, HandshakeIds},
    Limits, State, TerminationCause,
};
use crate::{
    path::Path,
    recovery::{Manager, PingFuture},
    stream::Streams,
    sync::SequentialScheduler,
    timer::{EventId, TimedEvent, TimerQueue},
    tls::{self, HandshakeState},
    transmission::{PacketEmitter, SentPacket, TransmitError},
};
use bytes::{Bytes, BytesMut};
use core::{
    sync::atomic::{AtomicU32, AtomicU8, Ordering},
    time::Duration,
};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Weak},
};
use tern_quic_core::{
    connection::{self, Role},
    crypto::{CryptoError, KeySpace},
    frame::{self, ConnectionClose, Frame, NewConnectionId},
    packet::{
        header::read_truncated_packet_number,
        number::{self as packet_number, PacketNumberSpace},
        retry, version_negotiation, Header, PacketType, ProtectedPacket,
        MIN_INITIAL_DATAGRAM_LEN,
    },
    recovery::{CongestionController, RttEstimator},
    time::{earliest, Clock, Timestamp},
    transport::{parameters::TransportParameters, TransportError},
    varint::VarInt,
};
use tracing::{debug, error, trace, warn};

/// PATH_RESPONSE frames kept for sending; older challenges are answered first and dropped
/// first
const MAX_PATH_RESPONSES: usize = 3;

/// Room left after stream data for an ACK and the connection flow control frames
const TAIL_RESERVE: usize = 40;

/// Upper bound on the connection IDs we keep issued at once
const MAX_ISSUED_IDS: u64 = 8;

/// Closing period used before any RTT sample exists
const CLOSED_FALLBACK_TIMEOUT: Duration = Duration::from_secs(2);

const KEY_SPACES: [KeySpace; 4] = [
    KeySpace::Initial,
    KeySpace::Handshake,
    KeySpace::ZeroRtt,
    KeySpace::OneRtt,
];

/// Everything needed to build a [`Connection`]
pub struct Parameters {
    pub role: Role,
    /// Version of the first Initial packet
    pub version: u32,
    /// Versions a client may switch to after Version Negotiation
    pub enabled_versions: Vec<u32>,
    pub limits: Limits,
    pub peer_address: SocketAddr,
    /// Client: the randomly chosen first destination ID. Server: the client's source ID.
    pub peer_id: connection::Id,
    /// Server only: destination ID of the client's first Initial
    pub original_destination: Option<connection::Id>,
    /// Server only: source ID of the Retry the client answered
    pub retry_source: Option<connection::Id>,
    pub clock: Arc<dyn Clock>,
    pub timers: Arc<TimerQueue>,
    pub link: Arc<dyn EndpointLink>,
    pub tls: Box<dyn tls::Session>,
    pub streams: Arc<dyn Streams>,
    pub congestion_controller: Box<dyn CongestionController>,
}

struct Ids {
    local: LocalIdRegistry,
    peer: PeerIdRegistry,
    /// Source ID of our long header packets
    local_initial: connection::Id,
    local_reset_token: tern_quic_core::stateless_reset::Token,
    /// Destination ID of the client's first Initial. Initial keys are derived from it and
    /// the server keeps routing it until the connection ends.
    original_destination: connection::Id,
    handshake: HandshakeIds,
    /// Client: token from a Retry, echoed in every Initial
    retry_token: Bytes,
    retry_processed: bool,
    version_negotiated: bool,
    /// A packet from the peer was processed
    peer_responded: bool,
}

#[derive(Default)]
struct CryptoSpace {
    send: SendQueue,
    receive: ReceiveBuffer,
}

impl CryptoSpace {
    fn clear(&mut self) {
        self.send.clear();
        self.receive.clear();
    }
}

/// Application space frames waiting to be sent
#[derive(Default)]
struct Control {
    frames: VecDeque<Frame>,
    path_responses: VecDeque<[u8; 8]>,
    max_data: Option<u64>,
    /// The send limit a DATA_BLOCKED frame was last sent for
    data_blocked_at: Option<u64>,
}

impl Control {
    fn has_pending(&self) -> bool {
        !self.frames.is_empty() || !self.path_responses.is_empty() || self.max_data.is_some()
    }
}

#[derive(Default)]
struct Deadlines {
    idle_timeout: Duration,
    idle: Option<Timestamp>,
    /// Client: the handshake must hear from the server before this
    initial: Option<Timestamp>,
    /// An ack-eliciting packet was sent since the last packet was received
    sent_since_receive: bool,
}

/// Where a packet sits in its datagram
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Position {
    Single,
    Coalesced,
    Last,
}

impl Position {
    fn of(index: usize, count: usize) -> Self {
        if count == 1 {
            Self::Single
        } else if index + 1 == count {
            Self::Last
        } else {
            Self::Coalesced
        }
    }
}

struct PacketPlan {
    space: PacketNumberSpace,
    header: Header,
    frames: Vec<Frame>,
    /// Number of the lost packet these frames were first sent in
    replaces: Option<u64>,
}

impl PacketPlan {
    fn len(&self, tag_len: usize) -> usize {
        let payload = frames_len(&self.frames) + tag_len;
        self.header.encoding_size(payload) + payload
    }
}

/// Packets coalesced into one datagram
struct DatagramPlan {
    max_len: usize,
    len: usize,
    tag_len: usize,
    packets: SmallVec<[PacketPlan; 3]>,
}

impl DatagramPlan {
    fn new(max_len: usize, tag_len: usize) -> Self {
        Self {
            max_len,
            len: 0,
            tag_len,
            packets: SmallVec::new(),
        }
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Bytes of frames that still fit in a packet with `header`
    fn frame_room(&self, header: &Header) -> usize {
        let remaining = self.max_len.saturating_sub(self.len);
        remaining.saturating_sub(header.encoding_size(remaining) + self.tag_len)
    }

    fn push(&mut self, plan: PacketPlan) {
        self.len += plan.len(self.tag_len);
        self.packets.push(plan);
    }

    /// Pads the last packet until the datagram is at least `min_len` bytes
    fn pad_to(&mut self, min_len: usize) {
        let tag_len = self.tag_len;
        let Some(last) = self.packets.last_mut() else {
            return;
        };
        let others = self.len - last.len(tag_len);
        let mut padding = 0;
        loop {
            let payload = frames_len(&last.frames) + padding + tag_len;
            let total = others + last.header.encoding_size(payload) + payload;
            if total >= min_len {
                break;
            }
            // the length field may grow by a byte, so check again
            padding += min_len - total;
        }
        if padding > 0 {
            last.frames.push(Frame::Padding { length: padding });
            self.len = others + last.len(tag_len);
        }
    }
}

fn frames_len(frames: &[Frame]) -> usize {
    frames.iter().map(Frame::encoding_size).sum()
}

/// Appends `frame` if it fits in `remaining`
fn try_push(frames: &mut Vec<Frame>, remaining: &mut usize, frame: Frame) -> bool {
    let size = frame.encoding_size();
    if size > *remaining {
        return false;
    }
    *remaining -= size;
    frames.push(frame);
    true
}

fn is_stream_frame(frame: &Frame) -> bool {
    matches!(
        frame,
        Frame::Stream(_)
            | Frame::ResetStream { .. }
            | Frame::StopSending { .. }
            | Frame::MaxStreamData { .. }
            | Frame::MaxStreams { .. }
            | Frame::StreamDataBlocked { .. }
            | Frame::StreamsBlocked { .. }
    )
}

type Sealed = SmallVec<[(PacketNumberSpace, SentPacket, Option<u64>); 3]>;

pub struct Connection {
    role: Role,
    tag: Arc<str>,
    this: Weak<Self>,
    clock: Arc<dyn Clock>,
    timers: Arc<TimerQueue>,
    timer_id: EventId,
    path: Arc<Path>,
    link: Arc<dyn EndpointLink>,
    limits: Limits,
    enabled_versions: Vec<u32>,
    state: Mutex<State>,
    cause: Mutex<Option<TerminationCause>>,
    version: AtomicU32,
    tls: Mutex<Box<dyn tls::Session>>,
    tag_len: usize,
    /// Bit `n` is set while packet number space `n` has keys. Read without the TLS lock.
    keys: AtomicU8,
    streams: Arc<dyn Streams>,
    managers: [Arc<Manager>; 3],
    crypto: [Mutex<CryptoSpace>; 3],
    ids: Mutex<Ids>,
    peer_parameters: Mutex<Option<TransportParameters>>,
    send_credit: SendCredit,
    receive_window: ReceiveWindow,
    control: Mutex<Control>,
    deadlines: Mutex<Deadlines>,
    handshake: HandshakeSignal,
    handshake_pump: SequentialScheduler,
    incoming: SegQueue<Bytes>,
    receiver: SequentialScheduler,
    buffers: BufferPool,
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("tag", &self.tag)
            .field("role", &self.role)
            .field("version", &self.version())
            .field("state", &self.state())
            .field("path", &self.path)
            .finish()
    }
}

impl Connection {
    pub fn new(parameters: Parameters) -> Arc<Self> {
        let Parameters {
            role,
            version,
            enabled_versions,
            limits,
            peer_address,
            peer_id,
            original_destination,
            retry_source,
            clock,
            timers,
            link,
            tls,
            streams,
            congestion_controller,
        } = parameters;

        let (local_id, local_reset_token) = link.generate_id();
        let tag: Arc<str> = match role {
            Role::Client => format!("client:{local_id}"),
            Role::Server => format!("server:{local_id}"),
        }
        .into();

        let (original_destination, handshake_ids) = match role {
            Role::Client => (
                peer_id,
                HandshakeIds {
                    original_destination: Some(peer_id),
                    ..Default::default()
                },
            ),
            Role::Server => {
                let original_destination = original_destination.unwrap_or(local_id);
                (
                    original_destination,
                    HandshakeIds {
                        peer_initial_source: Some(peer_id),
                        original_destination: Some(original_destination),
                        retry_source,
                    },
                )
            }
        };

        let path = Arc::new(Path::new(
            peer_address,
            RttEstimator::default(),
            congestion_controller,
        ));
        let timer_id = timers.new_event_id();
        let tag_len = tls.tag_len();
        let buffers = BufferPool::new(DEFAULT_BUFFERS);

        let connection = Arc::new_cyclic(|this: &Weak<Self>| {
            let emitter: Weak<dyn PacketEmitter> = this.clone();
            let managers = PacketNumberSpace::ALL.map(|space| {
                Manager::new(
                    space,
                    tag.clone(),
                    clock.clone(),
                    path.clone(),
                    timers.clone(),
                    emitter.clone(),
                )
            });
            let listener: Weak<dyn BufferListener> = this.clone();
            buffers.set_listener(listener);

            Self {
                role,
                tag: tag.clone(),
                this: this.clone(),
                clock: clock.clone(),
                timers: timers.clone(),
                timer_id,
                path: path.clone(),
                link: link.clone(),
                limits,
                enabled_versions,
                state: Mutex::new(State::default()),
                cause: Mutex::new(None),
                version: AtomicU32::new(version),
                tls: Mutex::new(tls),
                tag_len,
                keys: AtomicU8::new(0),
                streams,
                managers,
                crypto: Default::default(),
                ids: Mutex::new(Ids {
                    local: LocalIdRegistry::new(local_id, local_reset_token),
                    peer: PeerIdRegistry::new(peer_id, limits.max_active_connection_ids),
                    local_initial: local_id,
                    local_reset_token,
                    original_destination,
                    handshake: handshake_ids,
                    retry_token: Bytes::new(),
                    retry_processed: false,
                    version_negotiated: false,
                    peer_responded: false,
                }),
                peer_parameters: Mutex::new(None),
                // nothing may be sent before the peer's initial_max_data is known
                send_credit: SendCredit::new(0),
                receive_window: ReceiveWindow::new(limits.data_window),
                control: Mutex::new(Control::default()),
                deadlines: Mutex::new(Deadlines {
                    idle_timeout: limits.max_idle_timeout,
                    ..Default::default()
                }),
                handshake: HandshakeSignal::default(),
                handshake_pump: SequentialScheduler::new(),
                incoming: SegQueue::new(),
                receiver: SequentialScheduler::new(),
                buffers: buffers.clone(),
            }
        });

        link.register_id(local_id);
        if role.is_server() && original_destination != local_id {
            link.register_id(original_destination);
        }

        {
            let encoded = connection.local_parameters(version).encode();
            // after a Retry the client derives Initial keys from the Retry's source ID
            let initial_secret = retry_source.unwrap_or(original_destination);
            let mut tls = connection.tls.lock();
            tls.derive_initial_keys(version, &initial_secret);
            tls.set_local_transport_parameters(encoded);
            connection.refresh_keys(tls.as_ref());
        }
        connection.reset_idle_timer();

        debug!(tag = %connection.tag, version, peer = %peer_address, "connection created");
        connection
    }

    /// Starts the client handshake and returns a future resolving once it completes
    pub fn connect(&self) -> HandshakeFuture {
        if self.role.is_client() && self.state.lock().is_new() {
            self.state.lock().insert(State::HELLO_SENT);

            //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2
            //# Endpoints that have not yet established a connection close it
            //# silently once a handshake deadline passes.
            let deadline = self.clock.get_time() + self.limits.max_initial_timeout;
            self.deadlines.lock().initial = Some(deadline);
            self.reset_idle_timer();
            self.pump_handshake();
        }
        self.handshake.future()
    }

    #[inline]
    pub fn handshake(&self) -> HandshakeFuture {
        self.handshake.future()
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    #[inline]
    pub fn state(&self) -> State {
        *self.state.lock()
    }

    #[inline]
    pub fn path(&self) -> &Arc<Path> {
        &self.path
    }

    pub fn termination_cause(&self) -> Option<TerminationCause> {
        self.cause.lock().clone()
    }

    pub fn peer_parameters(&self) -> Option<TransportParameters> {
        self.peer_parameters.lock().clone()
    }

    /// Connection IDs the peer may currently address us with
    pub fn local_ids(&self) -> Vec<connection::Id> {
        self.ids.lock().local.ids().copied().collect()
    }

    /// The connection ID packets to the peer are addressed to
    pub fn peer_id(&self) -> connection::Id {
        self.ids.lock().peer.active_id()
    }

    /// Queues a datagram addressed to this connection and processes it unless another
    /// thread is already doing so
    pub fn on_datagram(&self, datagram: Bytes) {
        self.incoming.push(datagram);
        self.receiver.run(|| {
            while let Some(datagram) = self.incoming.pop() {
                self.process_datagram(datagram);
            }
        });
    }

    /// A datagram ending with one of the peer's reset tokens arrived
    pub fn on_stateless_reset(&self) {
        debug!(tag = %self.tag, "stateless reset received");
        self.terminate(TerminationCause::StatelessReset);
    }

    /// Closes the connection with an application error code
    pub fn close(&self, error_code: u64) {
        self.terminate(TerminationCause::ApplicationClose(error_code));
    }

    /// Sends a PING in the application space and resolves with the round trip time
    pub fn ping(&self) -> PingFuture {
        self.manager(PacketNumberSpace::ApplicationData)
            .request_send_ping()
    }

    /// Sends stream data and flow control updates the application made available
    pub fn request_transmit(&self) {
        self.manager(PacketNumberSpace::ApplicationData)
            .request_transmit();
    }

    #[inline]
    fn manager(&self, space: PacketNumberSpace) -> &Arc<Manager> {
        &self.managers[space.as_index()]
    }

    #[inline]
    fn max_datagram_size(&self) -> usize {
        self.link.max_datagram_size()
    }

    fn local_parameters(&self, version: u32) -> TransportParameters {
        let ids = self.ids.lock();
        let reset_token = self.role.is_server().then_some(ids.local_reset_token);
        transport_parameters::local(
            self.role,
            &self.limits,
            ids.local_initial,
            &ids.handshake,
            reset_token,
            version,
        )
    }

    fn refresh_keys(&self, tls: &dyn tls::Session) {
        let mut bits = 0;
        for space in PacketNumberSpace::ALL {
            if tls.has_keys(space.into()) {
                bits |= 1 << space.as_index();
            }
        }
        self.keys.store(bits, Ordering::Release);
    }

    #[inline]
    fn has_keys(&self, space: PacketNumberSpace) -> bool {
        self.keys.load(Ordering::Acquire) & (1 << space.as_index()) != 0
    }

    fn header(&self, space: PacketNumberSpace) -> Header {
        let ids = self.ids.lock();
        let destination = ids.peer.active_id();
        match space {
            PacketNumberSpace::ApplicationData => Header::Short {
                destination,
                key_phase: false,
            },
            PacketNumberSpace::Initial => Header::Long {
                packet_type: PacketType::Initial,
                version: self.version(),
                destination,
                source: ids.local_initial,
                token: if self.role.is_client() {
                    ids.retry_token.clone()
                } else {
                    Bytes::new()
                },
            },
            PacketNumberSpace::Handshake => Header::Long {
                packet_type: PacketType::Handshake,
                version: self.version(),
                destination,
                source: ids.local_initial,
                token: Bytes::new(),
            },
        }
    }

    // ----- timers -----

    fn reschedule_timer(&self) {
        let this: Weak<dyn TimedEvent> = self.this.clone();
        self.timers
            .reschedule(self.timer_id, this, self.refresh_deadline());
    }

    fn reset_idle_timer(&self) {
        if !self.is_open() {
            return;
        }
        let now = self.clock.get_time();
        let pto = self.path.rtt().pto_period(self.path.peer_max_ack_delay());
        {
            let mut deadlines = self.deadlines.lock();
            //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
            //# To avoid excessively small idle timeout periods, endpoints MUST
            //# increase the idle timeout period to be at least three times the
            //# current Probe Timeout (PTO).
            deadlines.idle = if deadlines.idle_timeout.is_zero() {
                None
            } else {
                Some(now + deadlines.idle_timeout.max(pto * 3))
            };
        }
        self.reschedule_timer();
    }

    /// Restarts the idle timer for a processed packet
    fn on_peer_activity(&self) {
        self.deadlines.lock().sent_since_receive = false;
        self.reset_idle_timer();
    }

    fn on_ack_eliciting_sent(&self) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
        //# An endpoint also restarts its idle timer when sending an ack-eliciting
        //# packet if no other ack-eliciting packets have been sent since last
        //# receiving and processing a packet.
        let first = !core::mem::replace(&mut self.deadlines.lock().sent_since_receive, true);
        if first {
            self.reset_idle_timer();
        }
    }

    fn cancel_initial_timer(&self) {
        if self.deadlines.lock().initial.take().is_some() {
            self.reschedule_timer();
        }
    }

    // ----- handshake -----

    fn pump_handshake(&self) {
        self.handshake_pump.run(|| {
            if let Err(error) = self.drive_handshake() {
                self.terminate(error.into());
            }
        });
    }

    fn drive_handshake(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Ok(());
        }

        let mut produced: SmallVec<[PacketNumberSpace; 3]> = SmallVec::new();
        let (state, peer_parameters) = {
            let mut tls = self.tls.lock();
            let state = loop {
                match tls.state() {
                    HandshakeState::NeedSendCrypto => {
                        let Some((key_space, bytes)) = tls.produce_handshake_bytes() else {
                            break HandshakeState::NeedRecvCrypto;
                        };
                        let space = key_space.packet_number_space();
                        self.crypto[space.as_index()].lock().send.push(&bytes);
                        if !produced.contains(&space) {
                            produced.push(space);
                        }
                    }
                    HandshakeState::NeedTask => tls.run_delegated_task()?,
                    state => break state,
                }
            };
            self.refresh_keys(tls.as_ref());
            (state, tls.peer_transport_parameters())
        };

        if let Some(encoded) = peer_parameters {
            self.on_peer_parameters(encoded)?;
        }
        for space in produced {
            self.manager(space).request_transmit();
        }
        if state == HandshakeState::Complete {
            self.on_handshake_complete();
        }
        Ok(())
    }

    fn on_peer_parameters(&self, encoded: Bytes) -> Result<(), TransportError> {
        if self.peer_parameters.lock().is_some() {
            return Ok(());
        }
        let handshake_ids = self.ids.lock().handshake.clone();
        let parameters =
            transport_parameters::validate_peer(self.role, encoded, &handshake_ids, self.version())?;

        self.path
            .on_peer_ack_settings(parameters.max_ack_delay(), parameters.ack_delay_exponent());
        self.send_credit
            .set_max_data(parameters.initial_max_data.unwrap_or(0));
        if let Some(token) = transport_parameters::reset_token(&parameters) {
            self.ids.lock().peer.set_initial_token(token);
            self.link.register_reset_token(token);
        }
        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
        //# Each endpoint advertises a max_idle_timeout, but the effective value
        //# at an endpoint is computed as the minimum of the two advertised
        //# values
        if let Some(peer_idle) = parameters.max_idle_timeout() {
            let mut deadlines = self.deadlines.lock();
            if deadlines.idle_timeout.is_zero() || peer_idle < deadlines.idle_timeout {
                deadlines.idle_timeout = peer_idle;
            }
        }
        self.streams.on_peer_parameters(&parameters);

        debug!(
            tag = %self.tag,
            max_data = parameters.initial_max_data.unwrap_or(0),
            active_connection_id_limit = parameters.active_connection_id_limit(),
            "peer transport parameters applied"
        );
        *self.peer_parameters.lock() = Some(parameters);
        self.reset_idle_timer();
        Ok(())
    }

    fn on_handshake_complete(&self) {
        {
            let mut state = self.state.lock();
            if state.is_handshake_complete() || !state.is_open() {
                return;
            }
            state.insert(State::HANDSHAKE_COMPLETE);
        }
        debug!(tag = %self.tag, "handshake complete");
        self.cancel_initial_timer();

        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.1.2
        //# the TLS handshake is considered confirmed at the
        //# server when the handshake completes.
        if self.role.is_server() {
            self.control.lock().frames.push_back(Frame::HandshakeDone);
            self.confirm_handshake();
        }

        self.issue_connection_ids();
        self.handshake.complete(Ok(()));
        self.request_transmit();
    }

    fn confirm_handshake(&self) {
        if self.path.is_handshake_confirmed() {
            return;
        }
        self.path.on_handshake_confirmed();
        self.discard_space(PacketNumberSpace::Initial);
        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9.2
        //# An endpoint MUST discard its Handshake keys when the TLS handshake is
        //# confirmed
        self.discard_space(PacketNumberSpace::Handshake);
        debug!(tag = %self.tag, "handshake confirmed");
    }

    /// Drops the keys and all state of a space; it is never used again
    fn discard_space(&self, space: PacketNumberSpace) {
        let manager = self.manager(space);
        if manager.is_closed() {
            return;
        }
        manager.close();
        {
            let mut tls = self.tls.lock();
            tls.discard_keys(space.into());
            self.crypto[space.as_index()].lock().clear();
            self.refresh_keys(tls.as_ref());
        }
        trace!(tag = %self.tag, ?space, "keys discarded");
    }

    /// Issues connection IDs until the peer's active_connection_id_limit is reached
    fn issue_connection_ids(&self) {
        if self.link.local_id_len() == 0 {
            return;
        }
        let limit = self
            .peer_parameters
            .lock()
            .as_ref()
            .map_or(2, TransportParameters::active_connection_id_limit)
            .min(MAX_ISSUED_IDS) as usize;

        let mut ids = self.ids.lock();
        while ids.local.len() < limit {
            let (id, token) = self.link.generate_id();
            self.link.register_id(id);
            let sequence_number = ids.local.issue(id, token);
            trace!(tag = %self.tag, sequence_number, %id, "connection id issued");
        }
    }

    // ----- receiving -----

    fn process_datagram(&self, datagram: Bytes) {
        let short_id_len = self.link.local_id_len();
        let mut remaining = datagram;
        let mut first_destination = None;

        while !remaining.is_empty() && self.is_open() {
            let (packet, rest) = match ProtectedPacket::decode(remaining, short_id_len) {
                Ok(decoded) => decoded,
                Err(error) => {
                    debug!(tag = %self.tag, ?error, "undecodable packet dropped");
                    return;
                }
            };
            remaining = rest;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-12.2
            //# Receivers SHOULD ignore any subsequent packets with a different
            //# Destination Connection ID than the first packet in the datagram.
            if *first_destination.get_or_insert(packet.destination) != packet.destination {
                trace!(tag = %self.tag, "coalesced packet for another connection id dropped");
                continue;
            }

            let result = match packet.packet_type {
                PacketType::VersionNegotiation => {
                    self.on_version_negotiation(packet);
                    Ok(())
                }
                PacketType::Retry => {
                    self.on_retry(packet);
                    Ok(())
                }
                PacketType::ZeroRtt => {
                    trace!(tag = %self.tag, "0-RTT packet dropped");
                    Ok(())
                }
                _ => self.on_protected_packet(packet),
            };

            if let Err(error) = result {
                self.terminate(error.into());
                return;
            }
        }
    }

    fn on_protected_packet(&self, packet: ProtectedPacket) -> Result<(), TransportError> {
        let packet_type = packet.packet_type;
        let Some(space) = packet_type.packet_number_space() else {
            return Ok(());
        };
        if packet.version.is_some_and(|version| version != self.version()) {
            trace!(tag = %self.tag, version = ?packet.version, "packet with another version dropped");
            return Ok(());
        }
        let manager = self.manager(space);
        if manager.is_closed() || !self.has_keys(space) {
            trace!(tag = %self.tag, ?space, "packet without keys dropped");
            return Ok(());
        }

        let key_space = KeySpace::from(space);
        let pn_offset = packet.pn_offset;
        let mut bytes = BytesMut::from(&packet.packet[..]);

        let (packet_number, header, payload) = {
            let tls = self.tls.lock();
            if let Err(error) = tls.unprotect_header(key_space, &mut bytes, pn_offset) {
                return self.on_unprotect_error(space, error);
            }
            let pn_len = ProtectedPacket::packet_number_len(bytes[0]);
            let truncated = read_truncated_packet_number(&bytes, pn_offset, pn_len)?;
            let packet_number =
                packet_number::decode(manager.largest_processed(), truncated, (pn_len * 8) as u32);
            if manager.is_duplicate(packet_number) {
                trace!(tag = %self.tag, ?space, packet_number, "duplicate packet dropped");
                return Ok(());
            }

            let mut payload = bytes.split_off(pn_offset + pn_len);
            let header = bytes;
            if let Err(error) = tls.open(key_space, packet_number, &header, &mut payload) {
                return self.on_unprotect_error(space, error);
            }
            (packet_number, header, payload)
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
        //# An endpoint MUST treat receipt of a packet that has a non-zero value
        //# for these bits after removing both packet and header protection as a
        //# connection error of type PROTOCOL_VIOLATION.
        if ProtectedPacket::reserved_bits(header[0], packet_type) != 0 {
            return Err(TransportError::PROTOCOL_VIOLATION.with_reason("reserved bits set"));
        }

        self.on_peer_packet(&packet);

        let frames = frame::decode_all(payload.freeze())?;
        let mut ack_eliciting = false;
        for frame in frames {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
            //# An endpoint MUST treat receipt of a frame in a packet type that is not
            //# permitted as a connection error of type PROTOCOL_VIOLATION.
            if !frame.is_allowed_in(packet_type) {
                return Err(TransportError::PROTOCOL_VIOLATION
                    .with_reason("frame not permitted in packet type")
                    .with_frame_type(VarInt::from_u8(frame.tag())));
            }
            ack_eliciting |= frame.is_ack_eliciting();
            self.on_frame(space, &packet.destination, frame)?;
            if !self.is_open() {
                return Ok(());
            }
        }

        trace!(tag = %self.tag, ?space, packet_number, ack_eliciting, "packet received");
        manager.packet_received(packet_type, packet_number, ack_eliciting);
        self.on_peer_activity();

        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9.1
        //# a server MUST discard Initial keys when it first successfully
        //# processes a Handshake packet.
        if self.role.is_server() && space.is_handshake() {
            self.discard_space(PacketNumberSpace::Initial);
        }
        Ok(())
    }

    fn on_unprotect_error(
        &self,
        space: PacketNumberSpace,
        error: CryptoError,
    ) -> Result<(), TransportError> {
        match error {
            error if error.is_key_unavailable() => {
                trace!(tag = %self.tag, ?space, %error, "packet dropped");
                Ok(())
            }
            //= https://www.rfc-editor.org/rfc/rfc9001#section-5.5
            //# Once an endpoint successfully receives a packet with a given packet
            //# number, it MUST discard all packets in the same packet number space
            //# with higher packet numbers if they cannot be successfully unprotected
            //# with either the same key
            CryptoError::DecryptError => {
                warn!(tag = %self.tag, ?space, "packet failed authentication; dropped");
                Ok(())
            }
            error => Err(error.into()),
        }
    }

    /// Bookkeeping for the first packet processed from the peer
    fn on_peer_packet(&self, packet: &ProtectedPacket) {
        {
            let mut ids = self.ids.lock();
            if ids.peer_responded {
                return;
            }
            ids.peer_responded = true;
            //= https://www.rfc-editor.org/rfc/rfc9000#section-7.2
            //# Upon receiving a packet, each endpoint sets the Destination
            //# Connection ID it sends to match the value of the Source Connection
            //# ID that it receives.
            if let (true, Some(source)) = (self.role.is_client(), packet.source) {
                ids.peer.set_initial_id(source);
                ids.handshake.peer_initial_source = Some(source);
            }
        }
        self.cancel_initial_timer();
    }

    fn on_frame(
        &self,
        space: PacketNumberSpace,
        destination: &connection::Id,
        frame: Frame,
    ) -> Result<(), TransportError> {
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}
            Frame::Ack(ack) => self.manager(space).process_ack_frame(&ack)?,
            Frame::Crypto(crypto) => self.on_crypto_frame(space, &crypto)?,
            Frame::ConnectionClose(close) => {
                debug!(
                    tag = %self.tag,
                    error_code = close.error_code,
                    reason = %String::from_utf8_lossy(&close.reason),
                    "peer closed the connection"
                );
                self.terminate(TerminationCause::PeerClosed {
                    error_code: close.error_code,
                    application: close.is_application(),
                });
            }
            Frame::HandshakeDone => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.20
                //# A server MUST
                //# treat receipt of a HANDSHAKE_DONE frame as a connection error of
                //# type PROTOCOL_VIOLATION.
                if self.role.is_server() {
                    return Err(TransportError::PROTOCOL_VIOLATION
                        .with_reason("HANDSHAKE_DONE sent by client")
                        .with_frame_type(VarInt::from_u8(frame::tag::HANDSHAKE_DONE)));
                }
                self.confirm_handshake();
            }
            Frame::NewToken { .. } => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.7
                //# A server MUST treat receipt
                //# of a NEW_TOKEN frame as a connection error of type
                //# PROTOCOL_VIOLATION.
                if self.role.is_server() {
                    return Err(TransportError::PROTOCOL_VIOLATION
                        .with_reason("NEW_TOKEN sent by client")
                        .with_frame_type(VarInt::from_u8(frame::tag::NEW_TOKEN)));
                }
                trace!(tag = %self.tag, "NEW_TOKEN ignored");
            }
            Frame::MaxData { maximum_data } => {
                if self.send_credit.set_max_data(maximum_data) {
                    trace!(tag = %self.tag, maximum_data, "send credit raised");
                    self.request_transmit();
                }
            }
            Frame::DataBlocked { data_limit } => {
                trace!(tag = %self.tag, data_limit, "peer is blocked by connection flow control");
            }
            Frame::NewConnectionId(new_id) => self.on_new_connection_id(&new_id)?,
            Frame::RetireConnectionId { sequence_number } => {
                self.on_retire_connection_id(sequence_number, destination)?
            }
            Frame::PathChallenge { data } => {
                {
                    let mut control = self.control.lock();
                    control.path_responses.push_back(data);
                    while control.path_responses.len() > MAX_PATH_RESPONSES {
                        control.path_responses.pop_front();
                    }
                }
                self.request_transmit();
            }
            Frame::PathResponse { .. } => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.18
                //# If the content of a PATH_RESPONSE frame does not match the content of
                //# a PATH_CHALLENGE frame previously sent by the endpoint, the endpoint
                //# MAY generate a connection error of type PROTOCOL_VIOLATION.
                return Err(TransportError::PROTOCOL_VIOLATION
                    .with_reason("unsolicited PATH_RESPONSE")
                    .with_frame_type(VarInt::from_u8(frame::tag::PATH_RESPONSE)));
            }
            frame => {
                let received = self.streams.on_frame(&frame)?;
                if received > 0 {
                    self.receive_window.on_received(received)?;
                }
            }
        }
        Ok(())
    }

    fn on_crypto_frame(
        &self,
        space: PacketNumberSpace,
        frame: &frame::Crypto,
    ) -> Result<(), TransportError> {
        let chunks: SmallVec<[Bytes; 2]> = {
            let mut crypto = self.crypto[space.as_index()].lock();
            crypto.receive.insert(frame)?;
            core::iter::from_fn(|| crypto.receive.pop()).collect()
        };
        if chunks.is_empty() {
            return Ok(());
        }
        {
            let mut tls = self.tls.lock();
            for chunk in chunks {
                tls.consume_handshake_bytes(space.into(), chunk)?;
            }
            self.refresh_keys(tls.as_ref());
        }
        self.pump_handshake();
        Ok(())
    }

    fn on_new_connection_id(&self, frame: &NewConnectionId) -> Result<(), TransportError> {
        let update = self.ids.lock().peer.on_new_connection_id(frame)?;
        for token in &update.removed {
            self.link.unregister_reset_token(token);
        }
        if let Some(token) = update.added {
            self.link.register_reset_token(token);
        }
        trace!(
            tag = %self.tag,
            sequence_number = frame.sequence_number,
            retire_prior_to = frame.retire_prior_to,
            "peer connection id received"
        );
        self.request_transmit();
        Ok(())
    }

    fn on_retire_connection_id(
        &self,
        sequence_number: u64,
        destination: &connection::Id,
    ) -> Result<(), TransportError> {
        let retired = self.ids.lock().local.on_retire(sequence_number, destination)?;
        if let Some(id) = retired {
            trace!(tag = %self.tag, sequence_number, %id, "connection id retired");
            self.link.retire_id(&id);
            self.issue_connection_ids();
            self.request_transmit();
        }
        Ok(())
    }

    /// Handles a Version Negotiation packet sent in reply to our first Initial
    fn on_version_negotiation(&self, packet: ProtectedPacket) {
        if self.role.is_server() {
            return;
        }
        let original_destination = {
            let ids = self.ids.lock();
            //= https://www.rfc-editor.org/rfc/rfc9000#section-6.2
            //# A client MUST discard any Version Negotiation packet if it has
            //# received and successfully processed any other packet, including an
            //# earlier Version Negotiation packet.
            if ids.peer_responded || ids.version_negotiated || ids.retry_processed {
                return;
            }
            if packet.destination != ids.local_initial
                || packet.source != Some(ids.original_destination)
            {
                trace!(tag = %self.tag, "version negotiation for other ids dropped");
                return;
            }
            ids.original_destination
        };

        let offered = match version_negotiation::decode_versions(packet.packet) {
            Ok(offered) => offered,
            Err(error) => {
                debug!(tag = %self.tag, ?error, "malformed version negotiation dropped");
                return;
            }
        };
        let current = self.version();
        //= https://www.rfc-editor.org/rfc/rfc9000#section-6.2
        //# A client MUST discard a Version Negotiation packet that lists the
        //# QUIC version selected by the client.
        if offered.contains(&current) {
            return;
        }

        let Some(version) = offered
            .iter()
            .copied()
            .find(|version| *version != current && self.enabled_versions.contains(version))
        else {
            debug!(tag = %self.tag, ?offered, "no compatible version offered");
            self.terminate(TerminationCause::NoCompatibleVersion);
            return;
        };

        self.ids.lock().version_negotiated = true;
        self.version.store(version, Ordering::Release);
        let encoded = self.local_parameters(version).encode();
        {
            let mut tls = self.tls.lock();
            tls.restart(version);
            tls.set_local_transport_parameters(encoded);
            tls.derive_initial_keys(version, &original_destination);
            self.crypto[PacketNumberSpace::Initial.as_index()]
                .lock()
                .clear();
            self.refresh_keys(tls.as_ref());
        }
        self.manager(PacketNumberSpace::Initial).reset();

        debug!(tag = %self.tag, from = current, to = version, "version changed by negotiation");
        self.pump_handshake();
    }

    fn on_retry(&self, packet: ProtectedPacket) {
        if self.role.is_server() {
            return;
        }
        let Some(source) = packet.source else {
            return;
        };
        let version = self.version();
        let original_destination = {
            let ids = self.ids.lock();
            //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5.2
            //# A client MUST accept and process at most one Retry packet for each
            //# connection attempt.  After the client has received and processed an
            //# Initial or Retry packet from the server, it MUST discard any
            //# subsequent Retry packets that it receives.
            //#
            //# A client MUST discard a Retry packet that contains a Source
            //# Connection ID field that is identical to the Destination Connection
            //# ID field of its Initial packet.
            if packet.token.is_empty()
                || ids.retry_processed
                || ids.peer_responded
                || packet.version != Some(version)
                || source == ids.peer.active_id()
            {
                debug!(tag = %self.tag, "retry ignored");
                return;
            }
            ids.original_destination
        };

        let Some((body, tag)) = retry::split_tag(&packet.packet) else {
            return;
        };
        let pseudo_packet = retry::pseudo_packet(&original_destination, body);
        let expected = self.tls.lock().retry_integrity_tag(version, &pseudo_packet);
        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5.2
        //# Clients MUST discard Retry packets that have a Retry Integrity Tag
        //# that cannot be validated
        if expected[..] != *tag {
            debug!(tag = %self.tag, "retry failed integrity check");
            return;
        }

        {
            let mut ids = self.ids.lock();
            ids.retry_token = packet.token.clone();
            ids.retry_processed = true;
            ids.handshake.retry_source = Some(source);
            ids.peer.set_initial_id(source);
        }
        {
            let mut tls = self.tls.lock();
            tls.derive_initial_keys(version, &source);
            self.refresh_keys(tls.as_ref());
        }
        let initial = self.manager(PacketNumberSpace::Initial);
        initial.reset();
        self.crypto[PacketNumberSpace::Initial.as_index()]
            .lock()
            .send
            .replay();

        debug!(tag = %self.tag, %source, token_len = packet.token.len(), "retry processed");
        initial.request_transmit();
    }

    // ----- sending -----

    fn acquire_buffer(&self) -> Result<BufferPermit, TransmitError> {
        self.buffers.acquire().ok_or(TransmitError::Blocked)
    }

    /// Encodes, seals and protects every packet of `datagram`
    fn seal(&self, mut datagram: DatagramPlan) -> Result<(BytesMut, Sealed), TransmitError> {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
        //# A client MUST expand the payload of all UDP datagrams carrying
        //# Initial packets to at least the smallest allowed maximum datagram
        //# size of 1200 bytes
        //#
        //# a server MUST expand the payload of all UDP datagrams carrying ack-
        //# eliciting Initial packets to at least the smallest allowed maximum
        //# datagram size of 1200 bytes.
        let needs_padding = datagram.packets.iter().any(|plan| {
            plan.space.is_initial()
                && (self.role.is_client() || plan.frames.iter().any(Frame::is_ack_eliciting))
        });
        if needs_padding {
            datagram.pad_to(MIN_INITIAL_DATAGRAM_LEN);
        }

        let count = datagram.packets.len();
        let mut buf = BytesMut::with_capacity(datagram.len);
        let mut sealed = Sealed::new();
        let tls = self.tls.lock();
        for (index, plan) in datagram.packets.into_iter().enumerate() {
            let key_space = KeySpace::from(plan.space);
            let packet_number = self.manager(plan.space).allocate_packet_number();
            let start = buf.len();
            let mut payload = frame::encode_all(&plan.frames);
            let pn_offset =
                plan.header
                    .encode(packet_number, payload.len() + self.tag_len, &mut buf)
                    - start;
            tls.seal(key_space, packet_number, &buf[start..], &mut payload)?;
            buf.extend_from_slice(&payload);
            tls.protect_header(key_space, &mut buf[start..], pn_offset)?;

            let size = buf.len() - start;
            trace!(
                tag = %self.tag,
                space = ?plan.space,
                packet_number,
                position = ?Position::of(index, count),
                size,
                "packet sealed"
            );
            let packet = SentPacket::new(plan.header.packet_type(), packet_number, plan.frames, size);
            sealed.push((plan.space, packet, plan.replaces));
        }
        Ok((buf, sealed))
    }

    /// Seals `datagram`, registers its packets and hands it to the endpoint.
    ///
    /// Returns the number of the last packet.
    fn flush(&self, datagram: DatagramPlan, permit: BufferPermit) -> Result<u64, TransmitError> {
        let (buf, sealed) = self.seal(datagram)?;

        let mut last = 0;
        let mut ack_eliciting = false;
        let mut initial_sent = false;
        let mut handshake_sent = false;
        for (space, packet, replaces) in sealed {
            last = packet.packet_number;
            ack_eliciting |= packet.is_ack_eliciting();
            initial_sent |= space.is_initial();
            handshake_sent |= space.is_handshake();
            self.manager(space).packet_sent(packet, replaces);
        }

        if initial_sent {
            self.state.lock().insert(State::HELLO_SENT);
        }
        if ack_eliciting {
            self.on_ack_eliciting_sent();
        }

        self.link.push_datagram(Datagram {
            peer: self.path.peer_address(),
            payload: buf.freeze(),
            permit: Some(permit),
        });

        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9.1
        //# a client MUST discard Initial keys when it first sends a
        //# Handshake packet
        if handshake_sent && self.role.is_client() {
            self.discard_space(PacketNumberSpace::Initial);
        }
        Ok(last)
    }

    /// Returns true if a handshake space at or after `first` has CRYPTO data to send
    fn has_crypto_data(&self, first: PacketNumberSpace) -> bool {
        [PacketNumberSpace::Initial, PacketNumberSpace::Handshake]
            .into_iter()
            .filter(|space| space.as_index() >= first.as_index())
            .any(|space| {
                self.has_keys(space)
                    && !self.manager(space).is_closed()
                    && self.crypto[space.as_index()].lock().send.has_unsent()
            })
    }

    fn crypto_packet(&self, space: PacketNumberSpace, datagram: &DatagramPlan) -> Option<PacketPlan> {
        if !self.has_keys(space) || self.manager(space).is_closed() {
            return None;
        }
        let header = self.header(space);
        let mut remaining = datagram.frame_room(&header);
        let mut frames = Vec::new();

        if let Some(ack) = self.manager(space).get_next_ack_frame(false, remaining) {
            try_push(&mut frames, &mut remaining, Frame::Ack(ack));
        }
        {
            let mut crypto = self.crypto[space.as_index()].lock();
            while let Some(chunk) = crypto.send.next_frame(remaining) {
                try_push(&mut frames, &mut remaining, Frame::Crypto(chunk));
            }
        }

        (!frames.is_empty()).then_some(PacketPlan {
            space,
            header,
            frames,
            replaces: None,
        })
    }

    /// Sends CRYPTO data of `first` and later handshake spaces, coalescing an Initial and a
    /// Handshake packet when both have something to say
    fn send_crypto(&self, first: PacketNumberSpace) -> Result<(), TransmitError> {
        while self.has_crypto_data(first) {
            let permit = self.acquire_buffer()?;
            let mut datagram = DatagramPlan::new(self.max_datagram_size(), self.tag_len);
            for space in [PacketNumberSpace::Initial, PacketNumberSpace::Handshake] {
                if space.as_index() < first.as_index() {
                    continue;
                }
                if let Some(plan) = self.crypto_packet(space, &datagram) {
                    datagram.push(plan);
                }
            }
            if datagram.is_empty() {
                break;
            }
            self.flush(datagram, permit)?;
        }
        Ok(())
    }

    /// Moves bytes the application consumed into the receive window
    fn update_receive_window(&self) {
        let processed = self.streams.take_processed();
        if processed > 0 {
            self.receive_window.on_processed(processed);
        }
        if let Some(max_data) = self.receive_window.take_update() {
            self.control.lock().max_data = Some(max_data);
        }
    }

    fn is_data_blocked(&self, control: &Control) -> bool {
        self.send_credit.credit() == 0
            && self.streams.has_pending()
            && control.data_blocked_at != Some(self.send_credit.max_data())
    }

    fn has_application_data(&self) -> bool {
        {
            let control = self.control.lock();
            if control.has_pending() || self.is_data_blocked(&control) {
                return true;
            }
        }
        {
            let ids = self.ids.lock();
            if ids.local.has_pending() || ids.peer.has_pending() {
                return true;
            }
        }
        if self.streams.has_pending() && self.send_credit.credit() > 0 && self.path.can_send_packet() {
            return true;
        }
        self.crypto[PacketNumberSpace::ApplicationData.as_index()]
            .lock()
            .send
            .has_unsent()
    }

    /// Fills one 1-RTT packet: control frames first, then stream data, then the ACK and
    /// flow control frames
    fn application_frames(&self, room: usize) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut remaining = room;

        {
            let mut control = self.control.lock();
            while let Some(frame) = control.frames.front() {
                if frame.encoding_size() > remaining {
                    break;
                }
                if let Some(frame) = control.frames.pop_front() {
                    try_push(&mut frames, &mut remaining, frame);
                }
            }
            while let Some(data) = control.path_responses.front().copied() {
                if !try_push(&mut frames, &mut remaining, Frame::PathResponse { data }) {
                    break;
                }
                control.path_responses.pop_front();
            }
        }
        {
            let mut ids = self.ids.lock();
            while let Some(frame) = ids.local.next_frame(remaining) {
                try_push(&mut frames, &mut remaining, frame);
            }
            while let Some(frame) = ids.peer.next_frame(remaining) {
                try_push(&mut frames, &mut remaining, frame);
            }
        }

        let credit = self.send_credit.credit();
        if credit > 0 && self.streams.has_pending() && self.path.can_send_packet() {
            let before = frames.len();
            let budget = remaining.saturating_sub(TAIL_RESERVE);
            let produced = self.streams.produce_frames(budget, credit, &mut frames);
            self.send_credit.consume(produced);
            remaining = remaining.saturating_sub(frames_len(&frames[before..]));
        }

        if let Some(ack) = self
            .manager(PacketNumberSpace::ApplicationData)
            .get_next_ack_frame(false, remaining)
        {
            try_push(&mut frames, &mut remaining, Frame::Ack(ack));
        }

        {
            let mut control = self.control.lock();
            //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
            //# A sender SHOULD send a
            //# STREAM_DATA_BLOCKED or DATA_BLOCKED frame to indicate to the receiver
            //# that it has data to write but is blocked by flow control limits.
            if self.is_data_blocked(&control) {
                let data_limit = self.send_credit.max_data();
                if try_push(&mut frames, &mut remaining, Frame::DataBlocked { data_limit }) {
                    control.data_blocked_at = Some(data_limit);
                }
            }
            if let Some(maximum_data) = control.max_data {
                if try_push(&mut frames, &mut remaining, Frame::MaxData { maximum_data }) {
                    control.max_data = None;
                }
            }
        }

        {
            let mut crypto = self.crypto[PacketNumberSpace::ApplicationData.as_index()].lock();
            while let Some(chunk) = crypto.send.next_frame(remaining) {
                try_push(&mut frames, &mut remaining, Frame::Crypto(chunk));
            }
        }

        frames
    }

    fn send_application(&self) -> Result<(), TransmitError> {
        let space = PacketNumberSpace::ApplicationData;
        if !self.has_keys(space) {
            return Ok(());
        }
        self.update_receive_window();

        while self.has_application_data() {
            let permit = self.acquire_buffer()?;
            let mut datagram = DatagramPlan::new(self.max_datagram_size(), self.tag_len);
            let header = self.header(space);
            let frames = self.application_frames(datagram.frame_room(&header));
            if frames.is_empty() {
                break;
            }
            let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
            datagram.push(PacketPlan {
                space,
                header,
                frames,
                replaces: None,
            });
            self.flush(datagram, permit)?;
            if !ack_eliciting {
                break;
            }
        }
        Ok(())
    }

    /// Sends `frames` alone in a packet of `space`
    fn send_frames(
        &self,
        space: PacketNumberSpace,
        frames: Vec<Frame>,
        replaces: Option<u64>,
    ) -> Result<u64, TransmitError> {
        if !self.has_keys(space) {
            return Err(CryptoError::KeysUnavailable(space.into()).into());
        }
        let permit = self.acquire_buffer()?;
        let mut datagram = DatagramPlan::new(self.max_datagram_size(), self.tag_len);
        datagram.push(PacketPlan {
            space,
            header: self.header(space),
            frames,
            replaces,
        });
        self.flush(datagram, permit)
    }

    /// Builds the datagram carrying CONNECTION_CLOSE in every space with keys
    fn close_datagram(&self, close: &ConnectionClose) -> Option<Bytes> {
        let mut datagram = DatagramPlan::new(self.max_datagram_size(), self.tag_len);
        for space in PacketNumberSpace::ALL {
            if !self.has_keys(space) {
                continue;
            }
            //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2.3
            //# When sending a CONNECTION_CLOSE frame in an Initial or Handshake
            //# packet, the endpoint MUST replace a CONNECTION_CLOSE of type 0x1d
            //# with a CONNECTION_CLOSE of type 0x1c with an error code of
            //# APPLICATION_ERROR
            let frame = if close.is_application() && !space.is_application_data() {
                ConnectionClose::from_transport_error(&TransportError::APPLICATION_ERROR)
            } else {
                close.clone()
            };
            let header = self.header(space);
            let frame = Frame::ConnectionClose(frame);
            if frame.encoding_size() > datagram.frame_room(&header) {
                continue;
            }
            datagram.push(PacketPlan {
                space,
                header,
                frames: vec![frame],
                replaces: None,
            });
        }
        if datagram.is_empty() {
            return None;
        }
        match self.seal(datagram) {
            Ok((buf, _)) => Some(buf.freeze()),
            Err(error) => {
                debug!(tag = %self.tag, %error, "close datagram could not be sealed");
                None
            }
        }
    }

    /// Moves the connection to closing or draining, hands it to the endpoint as a
    /// placeholder and releases everything else. Only the first call has an effect.
    pub fn terminate(&self, cause: TerminationCause) {
        let close = cause.close_frame();
        {
            let mut state = self.state.lock();
            if !state.is_open() {
                return;
            }
            state.insert(if close.is_some() {
                State::CLOSING
            } else {
                State::DRAINING
            });
        }
        *self.cause.lock() = Some(cause.clone());
        match &cause {
            TerminationCause::Transport(_) | TerminationCause::Io(_) => {
                error!(tag = %self.tag, %cause, "connection aborted")
            }
            _ => debug!(tag = %self.tag, %cause, "connection terminated"),
        }

        self.timers.cancel(self.timer_id);
        self.handshake_pump.stop();
        self.receiver.stop();

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2.1
        //# An endpoint sends a CONNECTION_CLOSE frame (Section 19.19) to
        //# terminate the connection immediately.
        let close_datagrams: Vec<Bytes> = close
            .and_then(|close| self.close_datagram(&close))
            .into_iter()
            .collect();
        let peer = self.path.peer_address();
        for payload in &close_datagrams {
            self.link.push_datagram(Datagram {
                peer,
                payload: payload.clone(),
                permit: None,
            });
        }

        for manager in &self.managers {
            manager.close();
        }
        {
            let mut tls = self.tls.lock();
            for space in KEY_SPACES {
                tls.discard_keys(space);
            }
            for crypto in &self.crypto {
                crypto.lock().clear();
            }
            self.refresh_keys(tls.as_ref());
        }
        self.streams.on_connection_closed(&cause);
        self.handshake.complete(Err(cause));

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2
        //# The closing and draining connection states exist to ensure that
        //# connections close cleanly and that delayed or reordered packets are
        //# properly discarded.  These states SHOULD persist for at least three
        //# times the current PTO interval
        let rtt = self.path.rtt();
        let timeout = if rtt.first_rtt_sample().is_some() {
            rtt.pto_period(self.path.peer_max_ack_delay()) * 3
        } else {
            CLOSED_FALLBACK_TIMEOUT
        };
        let closed = {
            let ids = self.ids.lock();
            let mut local_ids: Vec<connection::Id> = ids.local.ids().copied().collect();
            if self.role.is_server() && !local_ids.contains(&ids.original_destination) {
                local_ids.push(ids.original_destination);
            }
            ClosedConnection {
                peer,
                ids: local_ids,
                reset_tokens: ids.peer.tokens().collect(),
                close_datagrams,
                timeout,
            }
        };
        self.link.on_closed(closed);
        self.state.lock().insert(State::CLOSED);
    }
}

impl PacketEmitter for Connection {
    fn retransmit(&self, space: PacketNumberSpace, packet: &SentPacket) -> Result<(), TransmitError> {
        let mut frames: Vec<Frame> = packet.retransmittable_frames().cloned().collect();
        if frames.is_empty() {
            return Ok(());
        }
        let room = DatagramPlan::new(self.max_datagram_size(), self.tag_len)
            .frame_room(&self.header(space))
            .saturating_sub(frames_len(&frames));
        if let Some(ack) = self.manager(space).get_next_ack_frame(false, room) {
            frames.insert(0, Frame::Ack(ack));
        }
        trace!(tag = %self.tag, ?space, lost = packet.packet_number, "retransmitting");
        self.send_frames(space, frames, Some(packet.packet_number))
            .map(|_| ())
    }

    fn emit_ack_packet(
        &self,
        space: PacketNumberSpace,
        ack: frame::Ack,
        ping: bool,
    ) -> Result<Option<u64>, TransmitError> {
        let mut frames = vec![Frame::Ack(ack)];
        if ping {
            frames.push(Frame::Ping);
        }
        self.send_frames(space, frames, None).map(Some)
    }

    fn send_probe(&self, space: PacketNumberSpace) -> Result<(), TransmitError> {
        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.4
        //# When there is no data to send, the sender SHOULD send
        //# a PING or other ack-eliciting frame in a single packet
        let space = if space.is_handshake() && !self.has_keys(space) {
            PacketNumberSpace::Initial
        } else {
            space
        };
        if !space.is_application_data() && self.has_crypto_data(space) {
            return self.send_crypto(space);
        }
        let mut frames = vec![Frame::Ping];
        if let Some(ack) = self.manager(space).get_next_ack_frame(false, 256) {
            frames.insert(0, Frame::Ack(ack));
        }
        self.send_frames(space, frames, None).map(|_| ())
    }

    fn send_data(&self, space: PacketNumberSpace) -> Result<(), TransmitError> {
        if !self.is_open() {
            return Err(TransmitError::Closed);
        }
        match space {
            PacketNumberSpace::ApplicationData => self.send_application(),
            space => self.send_crypto(space),
        }
    }

    fn acknowledged(&self, _space: PacketNumberSpace, packet: &SentPacket) {
        for frame in packet.frames.iter().filter(|frame| is_stream_frame(frame)) {
            self.streams.on_frame_acknowledged(frame);
        }
    }

    fn on_pto_exhausted(&self, space: PacketNumberSpace) {
        let peer_responded = self.ids.lock().peer_responded;
        let handshake_complete = self.state().is_handshake_complete();
        let cause = if !peer_responded {
            TerminationCause::ConnectTimeout("no response from peer")
        } else if !handshake_complete {
            TerminationCause::HandshakeFailure("handshake timed out")
        } else {
            TerminationCause::Io("peer stopped acknowledging packets")
        };
        warn!(tag = %self.tag, ?space, "probe timeout backed off past its limit");
        self.terminate(cause);
    }

    fn on_transmit_error(&self, space: PacketNumberSpace, error: TransmitError) {
        match error {
            TransmitError::Closed | TransmitError::Blocked => {}
            error if error.is_key_unavailable() && !self.is_open() => {
                trace!(tag = %self.tag, ?space, %error, "transmission skipped");
            }
            error => {
                warn!(tag = %self.tag, ?space, %error, "transmission failed");
                self.terminate(TerminationCause::Io("packet protection failed"));
            }
        }
    }

    #[inline]
    fn is_open(&self) -> bool {
        self.state.lock().is_open()
    }

    fn is_awaiting_handshake_keys(&self) -> bool {
        self.role.is_client()
            && self.has_keys(PacketNumberSpace::Initial)
            && !self.has_keys(PacketNumberSpace::Handshake)
    }
}

impl BufferListener for Connection {
    fn on_buffer_available(&self) {
        for manager in &self.managers {
            manager.on_buffer_available();
        }
    }
}

impl TimedEvent for Connection {
    fn refresh_deadline(&self) -> Option<Timestamp> {
        if !self.is_open() {
            return None;
        }
        let deadlines = self.deadlines.lock();
        earliest(deadlines.idle, deadlines.initial)
    }

    fn handle(&self, now: Timestamp) -> Option<Timestamp> {
        let expired = {
            let mut deadlines = self.deadlines.lock();
            if deadlines.initial.is_some_and(|deadline| deadline.has_elapsed(now)) {
                deadlines.initial = None;
                Some(TerminationCause::ConnectTimeout(
                    "No response from peer for 30 seconds",
                ))
            } else if deadlines.idle.is_some_and(|deadline| deadline.has_elapsed(now)) {
                deadlines.idle = None;
                //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
                //# If a max_idle_timeout is specified by either endpoint in its
                //# transport parameters (Section 18.2), the connection is silently
                //# closed and its state is discarded when it remains idle for longer
                //# than the minimum of the max_idle_timeout value advertised by both
                //# endpoints.
                Some(TerminationCause::IdleTimeout)
            } else {
                None
            }
        };
        if let Some(cause) = expired {
            self.terminate(cause);
        }
        self.refresh_deadline()
    }
}
