// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The CRYPTO stream of one packet number space

use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use tern_quic_core::{
    frame::{self, tag},
    transport::TransportError,
    varint::VarInt,
};

//= https://www.rfc-editor.org/rfc/rfc9000#section-7.5
//# Implementations MUST support buffering at least 4096 bytes of data
//# received in out-of-order CRYPTO frames.
/// Out-of-order CRYPTO data buffered beyond this is a connection error
pub const MAX_BUFFERED: u64 = 64 * 1024;

/// Outgoing handshake bytes.
///
/// Everything pushed is kept so the stream can be replayed from offset zero after a Retry.
/// Lost data is resent by retransmitting whole frames.
#[derive(Debug, Default)]
pub struct SendQueue {
    data: BytesMut,
    sent: usize,
}

impl SendQueue {
    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    #[inline]
    pub fn has_unsent(&self) -> bool {
        self.sent < self.data.len()
    }

    /// Takes the next frame whose encoding fits in `max_len`
    pub fn next_frame(&mut self, max_len: usize) -> Option<frame::Crypto> {
        if !self.has_unsent() {
            return None;
        }
        let offset = self.sent as u64;
        let unsent = self.data.len() - self.sent;
        let header_len = frame::Crypto::header_len(offset, unsent);
        let len = unsent.min(max_len.checked_sub(header_len)?);
        if len == 0 {
            return None;
        }
        let data = Bytes::copy_from_slice(&self.data[self.sent..self.sent + len]);
        self.sent += len;
        Some(frame::Crypto { offset, data })
    }

    /// Sends everything again from offset zero
    pub fn replay(&mut self) {
        self.sent = 0;
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.sent = 0;
    }
}

/// Reorders incoming CRYPTO frames into a contiguous byte stream
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    next_offset: u64,
    pending: BTreeMap<u64, Bytes>,
    buffered: u64,
}

impl ReceiveBuffer {
    pub fn insert(&mut self, frame: &frame::Crypto) -> Result<(), TransportError> {
        let end = frame.offset + frame.data.len() as u64;
        if end <= self.next_offset {
            return Ok(());
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-7.5
        //# If an endpoint does not expand its buffer, it MUST close
        //# the connection with a CRYPTO_BUFFER_EXCEEDED error code.
        if end - self.next_offset > MAX_BUFFERED {
            return Err(TransportError::CRYPTO_BUFFER_EXCEEDED
                .with_frame_type(VarInt::from_u8(tag::CRYPTO)));
        }

        let (offset, data) = if frame.offset < self.next_offset {
            let skip = (self.next_offset - frame.offset) as usize;
            (self.next_offset, frame.data.slice(skip..))
        } else {
            (frame.offset, frame.data.clone())
        };

        let len = data.len() as u64;
        match self.pending.get(&offset) {
            Some(existing) if existing.len() as u64 >= len => return Ok(()),
            Some(existing) => self.buffered -= existing.len() as u64,
            None => {}
        }
        self.buffered += len;
        self.pending.insert(offset, data);
        Ok(())
    }

    /// Pops the next contiguous bytes
    pub fn pop(&mut self) -> Option<Bytes> {
        loop {
            let (&offset, data) = self.pending.iter().next()?;
            if offset > self.next_offset {
                return None;
            }
            let data = data.clone();
            self.pending.remove(&offset);
            self.buffered -= data.len() as u64;

            let end = offset + data.len() as u64;
            if end <= self.next_offset {
                continue;
            }
            let skip = (self.next_offset - offset) as usize;
            self.next_offset = end;
            return Some(data.slice(skip..));
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.buffered = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto(offset: u64, data: &'static [u8]) -> frame::Crypto {
        frame::Crypto {
            offset,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn send_and_replay() {
        let mut queue = SendQueue::default();
        queue.push(b"client hello");

        let first = queue.next_frame(9).unwrap();
        assert_eq!(first.offset, 0);
        assert!(first.encoding_size() <= 9);
        let second = queue.next_frame(100).unwrap();
        assert_eq!(second.offset, first.data.len() as u64);
        assert!(!queue.has_unsent());
        assert!(queue.next_frame(100).is_none());

        queue.replay();
        assert_eq!(queue.next_frame(100).unwrap().data, "client hello");
    }

    #[test]
    fn tiny_space_yields_nothing() {
        let mut queue = SendQueue::default();
        queue.push(b"x");
        assert!(queue.next_frame(3).is_none());
        assert!(queue.has_unsent());
    }

    #[test]
    fn reorders() {
        let mut buffer = ReceiveBuffer::default();
        buffer.insert(&crypto(5, b"world")).unwrap();
        assert!(buffer.pop().is_none());

        buffer.insert(&crypto(0, b"hello")).unwrap();
        assert_eq!(buffer.pop().unwrap(), "hello");
        assert_eq!(buffer.pop().unwrap(), "world");
        assert!(buffer.pop().is_none());

        // overlapping retransmission
        buffer.insert(&crypto(8, b"ldwide")).unwrap();
        assert_eq!(buffer.pop().unwrap(), "wide");
    }

    #[test]
    fn buffer_limit() {
        let mut buffer = ReceiveBuffer::default();
        let far = frame::Crypto {
            offset: MAX_BUFFERED,
            data: Bytes::from_static(b"!"),
        };
        let error = buffer.insert(&far).unwrap_err();
        assert_eq!(error.code, TransportError::CRYPTO_BUFFER_EXCEEDED.code);
    }
}
