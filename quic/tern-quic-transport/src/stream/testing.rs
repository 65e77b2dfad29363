// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory streams without per-stream flow control

use crate::connection::TerminationCause;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use tern_quic_core::{
    connection::Role,
    frame::{self, Frame},
    stream::StreamId,
    transport::{parameters::TransportParameters, TransportError},
};

#[derive(Debug)]
struct Chunk {
    stream_id: u64,
    offset: u64,
    data: Bytes,
    is_fin: bool,
}

#[derive(Debug, Default)]
struct Received {
    data: Vec<u8>,
    /// Highest offset seen, which counts against connection flow control
    highest: u64,
    final_size: Option<u64>,
}

#[derive(Debug, Default)]
struct State {
    outgoing: VecDeque<Chunk>,
    next_offsets: BTreeMap<u64, u64>,
    received: BTreeMap<u64, Received>,
    acknowledged: u64,
    processed: u64,
    peer_parameters: Option<TransportParameters>,
    closed: Option<TerminationCause>,
}

#[derive(Debug)]
pub struct Streams {
    role: Role,
    state: Mutex<State>,
}

impl Streams {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: Mutex::new(State::default()),
        }
    }

    /// Queues `data` on `stream_id`
    pub fn send(&self, stream_id: u64, data: impl Into<Bytes>, is_fin: bool) {
        let data = data.into();
        let mut state = self.state.lock();
        let offset = state.next_offsets.entry(stream_id).or_default();
        let chunk = Chunk {
            stream_id,
            offset: *offset,
            is_fin,
            data,
        };
        *offset += chunk.data.len() as u64;
        state.outgoing.push_back(chunk);
    }

    /// Returns the contiguous data received on `stream_id`
    pub fn received(&self, stream_id: u64) -> Bytes {
        self.state
            .lock()
            .received
            .get(&stream_id)
            .map(|received| Bytes::copy_from_slice(&received.data))
            .unwrap_or_default()
    }

    /// Marks `len` received bytes as read by the application
    pub fn consume(&self, len: u64) {
        self.state.lock().processed += len;
    }

    /// Stream bytes the peer acknowledged
    pub fn acknowledged(&self) -> u64 {
        self.state.lock().acknowledged
    }

    pub fn peer_parameters(&self) -> Option<TransportParameters> {
        self.state.lock().peer_parameters.clone()
    }

    pub fn closed(&self) -> Option<TerminationCause> {
        self.state.lock().closed.clone()
    }

    fn check_receivable(&self, stream_id: u64) -> Result<(), TransportError> {
        if StreamId::from_u64(stream_id).is_receivable_by(self.role) {
            Ok(())
        } else {
            Err(TransportError::STREAM_STATE_ERROR.with_reason("frame for a send-only stream"))
        }
    }

    fn check_sendable(&self, stream_id: u64) -> Result<(), TransportError> {
        if StreamId::from_u64(stream_id).is_sendable_by(self.role) {
            Ok(())
        } else {
            Err(TransportError::STREAM_STATE_ERROR.with_reason("frame for a receive-only stream"))
        }
    }
}

impl super::Streams for Streams {
    fn on_peer_parameters(&self, parameters: &TransportParameters) {
        self.state.lock().peer_parameters = Some(parameters.clone());
    }

    fn has_pending(&self) -> bool {
        !self.state.lock().outgoing.is_empty()
    }

    fn produce_frames(&self, max_len: usize, credit: u64, frames: &mut Vec<Frame>) -> u64 {
        let mut state = self.state.lock();
        let mut remaining = max_len;
        let mut produced = 0u64;

        while let Some(chunk) = state.outgoing.front_mut() {
            let header_len = frame::Stream::header_len(chunk.stream_id, chunk.offset, chunk.data.len());
            let Some(room) = remaining.checked_sub(header_len) else {
                break;
            };
            let allowed = (credit - produced).min(room as u64) as usize;
            let len = chunk.data.len().min(allowed);
            if len == 0 && !chunk.data.is_empty() {
                break;
            }

            let data = chunk.data.split_to(len);
            let is_last = chunk.data.is_empty();
            let stream = frame::Stream {
                stream_id: chunk.stream_id,
                offset: chunk.offset,
                data,
                is_fin: is_last && chunk.is_fin,
            };
            chunk.offset += len as u64;
            remaining -= stream.encoding_size().min(remaining);
            produced += len as u64;
            frames.push(Frame::Stream(stream));

            if is_last {
                state.outgoing.pop_front();
            } else {
                break;
            }
        }

        produced
    }

    fn on_frame(&self, frame: &Frame) -> Result<u64, TransportError> {
        match frame {
            Frame::Stream(stream) => {
                self.check_receivable(stream.stream_id)?;
                let mut state = self.state.lock();
                let received = state.received.entry(stream.stream_id).or_default();
                let end = stream.offset + stream.data.len() as u64;

                //= https://www.rfc-editor.org/rfc/rfc9000#section-4.5
                //# Once a final size for a stream is known, it cannot change.  If a
                //# RESET_STREAM or STREAM frame is received indicating a change in the
                //# final size for the stream, an endpoint SHOULD respond with an error
                //# of type FINAL_SIZE_ERROR
                if let Some(final_size) = received.final_size {
                    if end > final_size || (stream.is_fin && end != final_size) {
                        return Err(TransportError::FINAL_SIZE_ERROR);
                    }
                }
                if stream.is_fin {
                    if end < received.highest {
                        return Err(TransportError::FINAL_SIZE_ERROR);
                    }
                    received.final_size = Some(end);
                }

                if received.data.len() < end as usize {
                    received.data.resize(end as usize, 0);
                }
                received.data[stream.offset as usize..end as usize].copy_from_slice(&stream.data);

                let newly = end.saturating_sub(received.highest);
                received.highest = received.highest.max(end);
                Ok(newly)
            }
            Frame::ResetStream {
                stream_id,
                final_size,
                ..
            } => {
                self.check_receivable(*stream_id)?;
                let mut state = self.state.lock();
                let received = state.received.entry(*stream_id).or_default();
                if *final_size < received.highest
                    || received.final_size.is_some_and(|known| known != *final_size)
                {
                    return Err(TransportError::FINAL_SIZE_ERROR);
                }
                received.final_size = Some(*final_size);
                let newly = final_size - received.highest;
                received.highest = *final_size;
                Ok(newly)
            }
            Frame::StreamDataBlocked { stream_id, .. } => {
                self.check_receivable(*stream_id)?;
                Ok(0)
            }
            Frame::StopSending { stream_id, .. } | Frame::MaxStreamData { stream_id, .. } => {
                self.check_sendable(*stream_id)?;
                Ok(0)
            }
            _ => Ok(0),
        }
    }

    fn on_frame_acknowledged(&self, frame: &Frame) {
        if let Frame::Stream(stream) = frame {
            self.state.lock().acknowledged += stream.data.len() as u64;
        }
    }

    fn take_processed(&self) -> u64 {
        core::mem::take(&mut self.state.lock().processed)
    }

    fn on_connection_closed(&self, cause: &TerminationCause) {
        let mut state = self.state.lock();
        state.outgoing.clear();
        state.closed.get_or_insert_with(|| cause.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::{super::Streams as _, *};

    #[test]
    fn frames_respect_credit_and_size() {
        let streams = Streams::new(Role::Client);
        streams.send(0, &b"hello world"[..], true);

        let mut frames = vec![];
        assert_eq!(streams.produce_frames(1200, 5, &mut frames), 5);
        assert!(streams.has_pending());
        assert_eq!(streams.produce_frames(1200, 100, &mut frames), 6);
        assert!(!streams.has_pending());

        let Frame::Stream(last) = &frames[1] else {
            panic!("expected a STREAM frame");
        };
        assert_eq!(last.offset, 5);
        assert!(last.is_fin);
    }

    #[test]
    fn received_bytes_count_once() {
        let streams = Streams::new(Role::Server);
        let frame = Frame::Stream(frame::Stream {
            stream_id: 0,
            offset: 0,
            data: Bytes::from_static(b"abcd"),
            is_fin: false,
        });
        assert_eq!(streams.on_frame(&frame).unwrap(), 4);
        assert_eq!(streams.on_frame(&frame).unwrap(), 0);
        assert_eq!(&streams.received(0)[..], b"abcd");
    }

    #[test]
    fn stream_direction_is_checked() {
        let streams = Streams::new(Role::Server);
        // a server-initiated unidirectional stream
        let frame = Frame::Stream(frame::Stream {
            stream_id: 3,
            offset: 0,
            data: Bytes::from_static(b"x"),
            is_fin: false,
        });
        let error = streams.on_frame(&frame).unwrap_err();
        assert_eq!(error.code, TransportError::STREAM_STATE_ERROR.code);
    }

    #[test]
    fn final_size_cannot_change() {
        let streams = Streams::new(Role::Server);
        let fin = Frame::Stream(frame::Stream {
            stream_id: 0,
            offset: 0,
            data: Bytes::from_static(b"ab"),
            is_fin: true,
        });
        streams.on_frame(&fin).unwrap();
        let reset = Frame::ResetStream {
            stream_id: 0,
            error_code: 0,
            final_size: 3,
        };
        let error = streams.on_frame(&reset).unwrap_err();
        assert_eq!(error.code, TransportError::FINAL_SIZE_ERROR.code);
    }
}
