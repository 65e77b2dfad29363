// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A session that only exchanges transport parameters.
//!
//! NOTE: this provides no confidentiality or integrity and is only used for testing.
//!
//! The flight structure mirrors TLS 1.3 so the connection sees keys become available in the
//! same order: the ClientHello and ServerHello travel in Initial packets, the server's
//! parameters and Finished in Handshake packets, then the client's Finished.

use super::HandshakeState;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use tern_quic_core::{
    connection::{self, Role},
    crypto::{CryptoError, KeySpace},
    packet::retry::INTEGRITY_TAG_LEN,
};

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const SERVER_FINISHED: u8 = 3;
const CLIENT_FINISHED: u8 = 4;

/// TLS `unexpected_message`
pub const UNEXPECTED_MESSAGE: u8 = 10;

const TAG_LEN: usize = 16;
const MESSAGE_HEADER_LEN: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeyState {
    Unavailable,
    Available,
    Discarded,
}

#[inline]
fn index(space: KeySpace) -> usize {
    match space {
        KeySpace::Initial => 0,
        KeySpace::Handshake => 1,
        KeySpace::ZeroRtt => 2,
        KeySpace::OneRtt => 3,
    }
}

#[derive(Debug)]
pub struct Session {
    role: Role,
    version: u32,
    keys: [KeyState; 4],
    local_parameters: Bytes,
    peer_parameters: Option<Bytes>,
    outgoing: VecDeque<(KeySpace, Bytes)>,
    incoming: [BytesMut; 4],
    hello_queued: bool,
    delegated_task: bool,
    task_pending: bool,
    complete: bool,
    alert: Option<u8>,
}

impl Session {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            version: 0,
            keys: [KeyState::Unavailable; 4],
            local_parameters: Bytes::new(),
            peer_parameters: None,
            outgoing: VecDeque::new(),
            incoming: Default::default(),
            hello_queued: false,
            delegated_task: false,
            task_pending: false,
            complete: false,
            alert: None,
        }
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Requires a delegated task before the session sends its Finished
    pub fn with_delegated_task(mut self) -> Self {
        self.delegated_task = true;
        self
    }

    /// Fails the handshake with `alert` when the first peer message arrives
    pub fn with_alert(mut self, alert: u8) -> Self {
        self.alert = Some(alert);
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    fn key_state(&self, space: KeySpace) -> KeyState {
        self.keys[index(space)]
    }

    fn install(&mut self, space: KeySpace) {
        if self.key_state(space) == KeyState::Unavailable {
            self.keys[index(space)] = KeyState::Available;
        }
    }

    fn check_keys(&self, space: KeySpace) -> Result<(), CryptoError> {
        match self.key_state(space) {
            KeyState::Available => Ok(()),
            KeyState::Unavailable => Err(CryptoError::KeysUnavailable(space)),
            KeyState::Discarded => Err(CryptoError::KeysDiscarded(space)),
        }
    }

    fn queue(&mut self, space: KeySpace, message_type: u8, body: &[u8]) {
        let mut message = BytesMut::with_capacity(MESSAGE_HEADER_LEN + body.len());
        message.put_u8(message_type);
        message.put_u16(body.len() as u16);
        message.put_slice(body);
        self.outgoing.push_back((space, message.freeze()));
    }

    fn send_server_flight(&mut self) {
        self.install(KeySpace::Handshake);
        let parameters = self.local_parameters.clone();
        self.queue(KeySpace::Handshake, SERVER_FINISHED, &parameters);
        self.install(KeySpace::OneRtt);
    }

    fn send_client_finished(&mut self) {
        self.queue(KeySpace::Handshake, CLIENT_FINISHED, &[]);
        self.install(KeySpace::OneRtt);
        self.complete = true;
    }

    fn on_message(&mut self, space: KeySpace, message_type: u8, body: Bytes) -> Result<(), CryptoError> {
        if let Some(alert) = self.alert.take() {
            return Err(CryptoError::Alert(alert));
        }

        match (self.role, space, message_type) {
            (Role::Server, KeySpace::Initial, CLIENT_HELLO) if self.peer_parameters.is_none() => {
                self.peer_parameters = Some(body);
                self.queue(KeySpace::Initial, SERVER_HELLO, &[]);
                if self.delegated_task {
                    self.task_pending = true;
                } else {
                    self.send_server_flight();
                }
            }
            (Role::Client, KeySpace::Initial, SERVER_HELLO) => {
                self.install(KeySpace::Handshake);
            }
            (Role::Client, KeySpace::Handshake, SERVER_FINISHED) if !self.complete => {
                self.peer_parameters = Some(body);
                if self.delegated_task {
                    self.task_pending = true;
                } else {
                    self.send_client_finished();
                }
            }
            (Role::Server, KeySpace::Handshake, CLIENT_FINISHED) => {
                self.complete = true;
            }
            _ => return Err(CryptoError::Alert(UNEXPECTED_MESSAGE)),
        }
        Ok(())
    }
}

impl super::Session for Session {
    fn state(&self) -> HandshakeState {
        if self.role.is_client() && !self.hello_queued && self.has_keys(KeySpace::Initial) {
            return HandshakeState::NeedSendCrypto;
        }
        if !self.outgoing.is_empty() {
            HandshakeState::NeedSendCrypto
        } else if self.task_pending {
            HandshakeState::NeedTask
        } else if self.complete {
            HandshakeState::Complete
        } else {
            HandshakeState::NeedRecvCrypto
        }
    }

    fn derive_initial_keys(&mut self, version: u32, _destination: &connection::Id) {
        self.version = version;
        self.keys[index(KeySpace::Initial)] = KeyState::Available;
    }

    fn has_keys(&self, space: KeySpace) -> bool {
        self.key_state(space) == KeyState::Available
    }

    fn discard_keys(&mut self, space: KeySpace) {
        self.keys[index(space)] = KeyState::Discarded;
    }

    fn set_local_transport_parameters(&mut self, parameters: Bytes) {
        self.local_parameters = parameters;
    }

    fn peer_transport_parameters(&self) -> Option<Bytes> {
        self.peer_parameters.clone()
    }

    fn produce_handshake_bytes(&mut self) -> Option<(KeySpace, Bytes)> {
        if self.role.is_client() && !self.hello_queued && self.has_keys(KeySpace::Initial) {
            self.hello_queued = true;
            let parameters = self.local_parameters.clone();
            self.queue(KeySpace::Initial, CLIENT_HELLO, &parameters);
        }
        self.outgoing.pop_front()
    }

    fn consume_handshake_bytes(&mut self, space: KeySpace, bytes: Bytes) -> Result<(), CryptoError> {
        self.incoming[index(space)].extend_from_slice(&bytes);
        loop {
            let buffer = &mut self.incoming[index(space)];
            if buffer.len() < MESSAGE_HEADER_LEN {
                return Ok(());
            }
            let len = u16::from_be_bytes([buffer[1], buffer[2]]) as usize;
            if buffer.len() < MESSAGE_HEADER_LEN + len {
                return Ok(());
            }
            let message_type = buffer.get_u8();
            buffer.advance(2);
            let body = buffer.split_to(len).freeze();
            self.on_message(space, message_type, body)?;
        }
    }

    fn run_delegated_task(&mut self) -> Result<(), CryptoError> {
        if !core::mem::take(&mut self.task_pending) {
            return Ok(());
        }
        match self.role {
            Role::Client => self.send_client_finished(),
            Role::Server => self.send_server_flight(),
        }
        Ok(())
    }

    fn restart(&mut self, version: u32) {
        let mut restarted = Self::new(self.role);
        restarted.version = version;
        restarted.local_parameters = core::mem::take(&mut self.local_parameters);
        restarted.delegated_task = self.delegated_task;
        restarted.alert = self.alert;
        *self = restarted;
    }

    fn tag_len(&self) -> usize {
        TAG_LEN
    }

    fn seal(
        &self,
        space: KeySpace,
        packet_number: u64,
        _header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError> {
        self.check_keys(space)?;
        payload.put_bytes(tag_byte(space, packet_number), TAG_LEN);
        Ok(())
    }

    fn open(
        &self,
        space: KeySpace,
        packet_number: u64,
        _header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError> {
        self.check_keys(space)?;
        let Some(body_len) = payload.len().checked_sub(TAG_LEN) else {
            return Err(CryptoError::DecryptError);
        };
        let expected = tag_byte(space, packet_number);
        if payload[body_len..].iter().any(|byte| *byte != expected) {
            return Err(CryptoError::DecryptError);
        }
        payload.truncate(body_len);
        Ok(())
    }

    fn protect_header(&self, space: KeySpace, _packet: &mut [u8], _pn_offset: usize) -> Result<(), CryptoError> {
        self.check_keys(space)
    }

    fn unprotect_header(&self, space: KeySpace, _packet: &mut [u8], _pn_offset: usize) -> Result<(), CryptoError> {
        self.check_keys(space)
    }

    fn retry_integrity_tag(&self, version: u32, pseudo_packet: &[u8]) -> [u8; INTEGRITY_TAG_LEN] {
        let mut tag = [0u8; INTEGRITY_TAG_LEN];
        for (i, byte) in version.to_be_bytes().iter().chain(pseudo_packet).enumerate() {
            let slot = &mut tag[i % INTEGRITY_TAG_LEN];
            *slot = slot.wrapping_mul(31).wrapping_add(*byte);
        }
        tag
    }
}

#[inline]
fn tag_byte(space: KeySpace, packet_number: u64) -> u8 {
    (0xa0 | index(space) as u8) ^ (packet_number as u8)
}

#[cfg(test)]
mod tests {
    use super::{super::Session as _, *};
    use tern_quic_core::version;

    fn cid() -> connection::Id {
        connection::Id::try_from_bytes(&[7; 8]).unwrap()
    }

    /// Moves every produced chunk from `from` into `to`
    fn deliver(from: &mut Session, to: &mut Session) {
        while let Some((space, bytes)) = from.produce_handshake_bytes() {
            to.consume_handshake_bytes(space, bytes).unwrap();
        }
    }

    fn handshake(mut client: Session, mut server: Session) -> (Session, Session) {
        client.set_local_transport_parameters(Bytes::from_static(b"client"));
        server.set_local_transport_parameters(Bytes::from_static(b"server"));
        client.derive_initial_keys(version::QUIC_V1, &cid());
        server.derive_initial_keys(version::QUIC_V1, &cid());

        assert_eq!(client.state(), HandshakeState::NeedSendCrypto);
        drive(&mut client, &mut server);
        drive(&mut server, &mut client);
        drive(&mut client, &mut server);
        (client, server)
    }

    /// Sends and runs tasks on `from` until it waits for the peer, like the connection's pump
    fn drive(from: &mut Session, to: &mut Session) {
        loop {
            match from.state() {
                HandshakeState::NeedSendCrypto => deliver(from, to),
                HandshakeState::NeedTask => from.run_delegated_task().unwrap(),
                _ => return,
            }
        }
    }

    #[test]
    fn full_handshake() {
        let (client, server) = handshake(Session::client(), Session::server());
        assert_eq!(client.state(), HandshakeState::Complete);
        assert_eq!(server.state(), HandshakeState::Complete);
        assert_eq!(client.peer_transport_parameters().unwrap(), "server");
        assert_eq!(server.peer_transport_parameters().unwrap(), "client");
        for space in [KeySpace::Initial, KeySpace::Handshake, KeySpace::OneRtt] {
            assert!(client.has_keys(space));
            assert!(server.has_keys(space));
        }
        assert!(!client.has_keys(KeySpace::ZeroRtt));
    }

    #[test]
    fn delegated_tasks() {
        let (client, server) = handshake(
            Session::client().with_delegated_task(),
            Session::server().with_delegated_task(),
        );
        assert_eq!(client.state(), HandshakeState::Complete);
        assert_eq!(server.state(), HandshakeState::Complete);
        assert_eq!(client.peer_transport_parameters().unwrap(), "server");
        assert_eq!(server.peer_transport_parameters().unwrap(), "client");
    }

    #[test]
    fn pending_output_is_reported_before_the_task() {
        let mut client = Session::client();
        let mut server = Session::server().with_delegated_task();
        client.derive_initial_keys(version::QUIC_V1, &cid());
        server.derive_initial_keys(version::QUIC_V1, &cid());

        deliver(&mut client, &mut server);
        // SERVER_HELLO goes out before the task holding back the server's flight
        assert_eq!(server.state(), HandshakeState::NeedSendCrypto);
        deliver(&mut server, &mut client);
        assert_eq!(server.state(), HandshakeState::NeedTask);
        assert!(!server.has_keys(KeySpace::Handshake));
        server.run_delegated_task().unwrap();
        assert!(server.has_keys(KeySpace::Handshake));
        assert_eq!(server.state(), HandshakeState::NeedSendCrypto);
    }

    #[test]
    fn split_messages_are_buffered() {
        let mut client = Session::client();
        let mut server = Session::server();
        client.set_local_transport_parameters(Bytes::from_static(b"parameters"));
        client.derive_initial_keys(version::QUIC_V1, &cid());
        server.derive_initial_keys(version::QUIC_V1, &cid());

        let (space, hello) = client.produce_handshake_bytes().unwrap();
        server
            .consume_handshake_bytes(space, hello.slice(..4))
            .unwrap();
        assert_eq!(server.state(), HandshakeState::NeedRecvCrypto);
        server
            .consume_handshake_bytes(space, hello.slice(4..))
            .unwrap();
        assert_eq!(server.state(), HandshakeState::NeedSendCrypto);
    }

    #[test]
    fn alerts_fail_the_handshake() {
        let mut client = Session::client();
        let mut server = Session::server().with_alert(40);
        client.derive_initial_keys(version::QUIC_V1, &cid());
        server.derive_initial_keys(version::QUIC_V1, &cid());
        let (space, hello) = client.produce_handshake_bytes().unwrap();
        assert_eq!(
            server.consume_handshake_bytes(space, hello),
            Err(CryptoError::Alert(40))
        );
    }

    #[test]
    fn protection() {
        let mut session = Session::client();
        let mut payload = BytesMut::from(&b"payload"[..]);
        assert_eq!(
            session.seal(KeySpace::Initial, 0, &[], &mut payload),
            Err(CryptoError::KeysUnavailable(KeySpace::Initial))
        );

        session.derive_initial_keys(version::QUIC_V1, &cid());
        session
            .seal(KeySpace::Initial, 5, &[], &mut payload)
            .unwrap();
        assert_eq!(payload.len(), 7 + TAG_LEN);

        let mut tampered = payload.clone();
        assert_eq!(
            session.open(KeySpace::Initial, 6, &[], &mut tampered),
            Err(CryptoError::DecryptError)
        );
        session
            .open(KeySpace::Initial, 5, &[], &mut payload)
            .unwrap();
        assert_eq!(&payload[..], b"payload");

        session.discard_keys(KeySpace::Initial);
        assert_eq!(
            session.open(KeySpace::Initial, 5, &[], &mut payload),
            Err(CryptoError::KeysDiscarded(KeySpace::Initial))
        );
    }

    #[test]
    fn restart_replays_client_hello() {
        let mut client = Session::client();
        client.set_local_transport_parameters(Bytes::from_static(b"p"));
        client.derive_initial_keys(version::QUIC_V1, &cid());
        let (_, first) = client.produce_handshake_bytes().unwrap();

        client.restart(version::QUIC_V2);
        assert!(!client.has_keys(KeySpace::Initial));
        client.derive_initial_keys(version::QUIC_V2, &cid());
        let (_, second) = client.produce_handshake_bytes().unwrap();
        assert_eq!(first, second);
        assert_eq!(client.version(), version::QUIC_V2);
    }

    #[test]
    fn retry_tags_depend_on_input() {
        let session = Session::client();
        let tag = session.retry_integrity_tag(version::QUIC_V1, b"pseudo");
        assert_eq!(tag, session.retry_integrity_tag(version::QUIC_V1, b"pseudo"));
        assert_ne!(tag, session.retry_integrity_tag(version::QUIC_V1, b"pseudp"));
        assert_ne!(tag, session.retry_integrity_tag(version::QUIC_V2, b"pseudo"));
    }
}
