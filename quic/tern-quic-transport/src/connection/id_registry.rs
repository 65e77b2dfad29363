// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection IDs issued to the peer and connection IDs the peer issued to us

use std::collections::{BTreeMap, VecDeque};
use tern_quic_core::{
    connection,
    frame::{tag, Frame, NewConnectionId},
    stateless_reset,
    transport::TransportError,
    varint::VarInt,
};

/// IDs we issued; the peer addresses us with any of them
#[derive(Debug)]
pub struct LocalIdRegistry {
    ids: BTreeMap<u64, (connection::Id, stateless_reset::Token)>,
    next_sequence: u64,
    pending: VecDeque<NewConnectionId>,
}

impl LocalIdRegistry {
    pub fn new(initial: connection::Id, token: stateless_reset::Token) -> Self {
        let mut ids = BTreeMap::new();
        ids.insert(0, (initial, token));
        Self {
            ids,
            next_sequence: 1,
            pending: VecDeque::new(),
        }
    }

    /// Issues a new ID and queues the NEW_CONNECTION_ID frame announcing it
    pub fn issue(&mut self, id: connection::Id, token: stateless_reset::Token) -> u64 {
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        self.ids.insert(sequence_number, (id, token));
        self.pending.push_back(NewConnectionId {
            sequence_number,
            retire_prior_to: 0,
            connection_id: id,
            stateless_reset_token: token,
        });
        sequence_number
    }

    /// Handles RETIRE_CONNECTION_ID and returns the ID to stop routing
    pub fn on_retire(
        &mut self,
        sequence_number: u64,
        destination: &connection::Id,
    ) -> Result<Option<connection::Id>, TransportError> {
        let error = TransportError::PROTOCOL_VIOLATION
            .with_frame_type(VarInt::from_u8(tag::RETIRE_CONNECTION_ID));

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.16
        //# Receipt of a RETIRE_CONNECTION_ID frame containing a sequence number
        //# greater than any previously sent to the peer MUST be treated as a
        //# connection error of type PROTOCOL_VIOLATION.
        if sequence_number >= self.next_sequence {
            return Err(error.with_reason("retired a connection ID that was never issued"));
        }

        //# The sequence number specified in a RETIRE_CONNECTION_ID frame MUST NOT
        //# refer to the Destination Connection ID field of the packet in which
        //# the frame is contained.
        if self
            .ids
            .get(&sequence_number)
            .is_some_and(|(id, _)| id == destination)
        {
            return Err(error.with_reason("retired the connection ID in use"));
        }

        Ok(self.ids.remove(&sequence_number).map(|(id, _)| id))
    }

    pub fn ids(&self) -> impl Iterator<Item = &connection::Id> + '_ {
        self.ids.values().map(|(id, _)| id)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &stateless_reset::Token> + '_ {
        self.ids.values().map(|(_, token)| token)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Takes the next NEW_CONNECTION_ID frame that fits in `max_len`
    pub fn next_frame(&mut self, max_len: usize) -> Option<Frame> {
        let frame = Frame::NewConnectionId(self.pending.front()?.clone());
        if frame.encoding_size() > max_len {
            return None;
        }
        self.pending.pop_front();
        Some(frame)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PeerId {
    sequence_number: u64,
    id: connection::Id,
    token: Option<stateless_reset::Token>,
}

/// Reset tokens that stopped or started identifying the peer
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TokenUpdate {
    pub added: Option<stateless_reset::Token>,
    pub removed: Vec<stateless_reset::Token>,
}

/// IDs the peer issued; we address the peer with the active one
#[derive(Debug)]
pub struct PeerIdRegistry {
    active: PeerId,
    available: BTreeMap<u64, PeerId>,
    retire_prior_to: u64,
    pending_retire: VecDeque<u64>,
    /// Our active_connection_id_limit
    limit: u64,
}

impl PeerIdRegistry {
    pub fn new(initial: connection::Id, limit: u64) -> Self {
        Self {
            active: PeerId {
                sequence_number: 0,
                id: initial,
                token: None,
            },
            available: BTreeMap::new(),
            retire_prior_to: 0,
            pending_retire: VecDeque::new(),
            limit,
        }
    }

    #[inline]
    pub fn active_id(&self) -> connection::Id {
        self.active.id
    }

    /// Replaces the ID with sequence number 0, used while the handshake settles on the
    /// ID chosen by the server
    pub fn set_initial_id(&mut self, id: connection::Id) {
        if self.active.sequence_number == 0 {
            self.active.id = id;
        }
    }

    /// Attaches the token from the server's transport parameters to sequence number 0
    pub fn set_initial_token(&mut self, token: stateless_reset::Token) {
        if self.active.sequence_number == 0 {
            self.active.token = Some(token);
        }
    }

    pub fn on_new_connection_id(&mut self, frame: &NewConnectionId) -> Result<TokenUpdate, TransportError> {
        let error = |reason| {
            TransportError::PROTOCOL_VIOLATION
                .with_reason(reason)
                .with_frame_type(VarInt::from_u8(tag::NEW_CONNECTION_ID))
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
        //# An endpoint that is sending packets with a zero-length Destination
        //# Connection ID MUST treat receipt of a NEW_CONNECTION_ID frame as a
        //# connection error of type PROTOCOL_VIOLATION.
        if self.active.id.is_empty() {
            return Err(error("NEW_CONNECTION_ID while using a zero-length connection ID"));
        }

        let mut update = TokenUpdate::default();
        let sequence_number = frame.sequence_number;
        let known = if sequence_number == self.active.sequence_number {
            Some(&self.active)
        } else {
            self.available.get(&sequence_number)
        };
        if let Some(known) = known {
            //# If an endpoint receives a NEW_CONNECTION_ID frame that repeats a
            //# previously issued connection ID with a different Stateless Reset
            //# Token field value or a different Sequence Number field value, or if a
            //# sequence number is used for different connection IDs, the endpoint
            //# MAY treat that receipt as a connection error of type
            //# PROTOCOL_VIOLATION.
            if known.id != frame.connection_id {
                return Err(error("sequence number reused for a different connection ID"));
            }
            return Ok(update);
        }

        //# An endpoint that receives a NEW_CONNECTION_ID frame with a sequence
        //# number smaller than the Retire Prior To field of a previously received
        //# NEW_CONNECTION_ID frame MUST send a corresponding
        //# RETIRE_CONNECTION_ID frame that retires the newly received connection
        //# ID
        if sequence_number < self.retire_prior_to {
            self.pending_retire.push_back(sequence_number);
            return Ok(update);
        }

        self.available.insert(
            sequence_number,
            PeerId {
                sequence_number,
                id: frame.connection_id,
                token: Some(frame.stateless_reset_token),
            },
        );
        update.added = Some(frame.stateless_reset_token);

        if frame.retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = frame.retire_prior_to;
            let retired: Vec<u64> = self
                .available
                .range(..self.retire_prior_to)
                .map(|(sequence_number, _)| *sequence_number)
                .collect();
            for sequence_number in retired {
                if let Some(peer_id) = self.available.remove(&sequence_number) {
                    update.removed.extend(peer_id.token);
                    self.pending_retire.push_back(sequence_number);
                }
            }
            if self.active.sequence_number < self.retire_prior_to {
                if let Some((_, next)) = self.available.pop_first() {
                    update.removed.extend(self.active.token);
                    self.pending_retire.push_back(self.active.sequence_number);
                    self.active = next;
                }
            }
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-5.1.1
        //# After processing a NEW_CONNECTION_ID frame and
        //# adding and retiring active connection IDs, if the number of active
        //# connection IDs exceeds the value advertised in its
        //# active_connection_id_limit transport parameter, an endpoint MUST
        //# close the connection with an error of type CONNECTION_ID_LIMIT_ERROR.
        if 1 + self.available.len() as u64 > self.limit {
            return Err(TransportError::CONNECTION_ID_LIMIT_ERROR
                .with_frame_type(VarInt::from_u8(tag::NEW_CONNECTION_ID)));
        }

        if update.added.is_some_and(|token| update.removed.contains(&token)) {
            update.added = None;
        }
        Ok(update)
    }

    /// Every reset token currently identifying the peer
    pub fn tokens(&self) -> impl Iterator<Item = stateless_reset::Token> + '_ {
        core::iter::once(&self.active)
            .chain(self.available.values())
            .filter_map(|peer_id| peer_id.token)
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.pending_retire.is_empty()
    }

    /// Takes the next RETIRE_CONNECTION_ID frame that fits in `max_len`
    pub fn next_frame(&mut self, max_len: usize) -> Option<Frame> {
        let frame = Frame::RetireConnectionId {
            sequence_number: *self.pending_retire.front()?,
        };
        if frame.encoding_size() > max_len {
            return None;
        }
        self.pending_retire.pop_front();
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> connection::Id {
        connection::Id::try_from_bytes(&[byte; 8]).unwrap()
    }

    fn token(byte: u8) -> stateless_reset::Token {
        [byte; stateless_reset::TOKEN_LEN].into()
    }

    fn new_id(sequence_number: u64, retire_prior_to: u64) -> NewConnectionId {
        NewConnectionId {
            sequence_number,
            retire_prior_to,
            connection_id: id(sequence_number as u8 + 1),
            stateless_reset_token: token(sequence_number as u8 + 1),
        }
    }

    #[test]
    fn local_issue_and_retire() {
        let mut registry = LocalIdRegistry::new(id(0), token(0));
        assert_eq!(registry.issue(id(1), token(1)), 1);
        assert_eq!(registry.ids().count(), 2);
        assert!(matches!(
            registry.next_frame(1200),
            Some(Frame::NewConnectionId(NewConnectionId {
                sequence_number: 1,
                ..
            }))
        ));
        assert!(registry.next_frame(1200).is_none());

        let error = registry.on_retire(1, &id(1)).unwrap_err();
        assert_eq!(error.code, TransportError::PROTOCOL_VIOLATION.code);
        let error = registry.on_retire(2, &id(0)).unwrap_err();
        assert_eq!(error.code, TransportError::PROTOCOL_VIOLATION.code);

        assert_eq!(registry.on_retire(0, &id(1)).unwrap(), Some(id(0)));
        assert_eq!(registry.on_retire(0, &id(1)).unwrap(), None);
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec![&id(1)]);
    }

    #[test]
    fn zero_length_peer_id_rejects_new_ids() {
        let mut registry = PeerIdRegistry::new(connection::Id::EMPTY, 2);
        let error = registry.on_new_connection_id(&new_id(1, 0)).unwrap_err();
        assert_eq!(error.code, TransportError::PROTOCOL_VIOLATION.code);
    }

    #[test]
    fn retire_prior_to_switches_active() {
        let mut registry = PeerIdRegistry::new(id(0), 4);
        registry.set_initial_token(token(0));

        let update = registry.on_new_connection_id(&new_id(1, 0)).unwrap();
        assert_eq!(update.added, Some(token(2)));
        assert_eq!(registry.active_id(), id(0));

        let update = registry.on_new_connection_id(&new_id(2, 1)).unwrap();
        assert_eq!(update.removed, vec![token(0)]);
        assert_eq!(registry.active_id(), id(2));
        assert_eq!(
            registry.next_frame(1200),
            Some(Frame::RetireConnectionId { sequence_number: 0 })
        );
        assert!(registry.next_frame(1200).is_none());

        // below the watermark: retired immediately
        let update = registry.on_new_connection_id(&new_id(0, 0)).unwrap();
        assert_eq!(update, TokenUpdate::default());
        assert_eq!(
            registry.next_frame(1200),
            Some(Frame::RetireConnectionId { sequence_number: 0 })
        );
    }

    #[test]
    fn late_ids_below_watermark_are_retired() {
        let mut registry = PeerIdRegistry::new(id(0), 4);
        registry.on_new_connection_id(&new_id(3, 3)).unwrap();
        assert_eq!(registry.active_id(), id(4));

        let update = registry.on_new_connection_id(&new_id(1, 0)).unwrap();
        assert_eq!(update, TokenUpdate::default());
        let retired: Vec<_> = core::iter::from_fn(|| registry.next_frame(1200)).collect();
        assert_eq!(
            retired,
            vec![
                Frame::RetireConnectionId { sequence_number: 0 },
                Frame::RetireConnectionId { sequence_number: 1 },
            ]
        );
    }

    #[test]
    fn limit_is_enforced() {
        let mut registry = PeerIdRegistry::new(id(0), 2);
        registry.on_new_connection_id(&new_id(1, 0)).unwrap();
        // duplicates are fine
        registry.on_new_connection_id(&new_id(1, 0)).unwrap();
        let error = registry.on_new_connection_id(&new_id(2, 0)).unwrap_err();
        assert_eq!(error.code, TransportError::CONNECTION_ID_LIMIT_ERROR.code);
    }
}
