// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    codec::{DecoderBuffer, DecoderError, DecoderResult},
    connection, decoder_invariant,
    packet::PacketType,
    stateless_reset,
    transport::TransportError,
    varint::{encoding_size, VarInt},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub mod ack;
pub mod stream;

pub use ack::{Ack, EcnCounts};
pub use stream::{Crypto, Stream};

pub mod tag {
    pub const PADDING: u8 = 0x00;
    pub const PING: u8 = 0x01;
    pub const ACK: u8 = 0x02;
    pub const ACK_ECN: u8 = 0x03;
    pub const RESET_STREAM: u8 = 0x04;
    pub const STOP_SENDING: u8 = 0x05;
    pub const CRYPTO: u8 = 0x06;
    pub const NEW_TOKEN: u8 = 0x07;
    pub const STREAM: u8 = 0x08;
    pub const STREAM_MAX: u8 = 0x0f;
    pub const MAX_DATA: u8 = 0x10;
    pub const MAX_STREAM_DATA: u8 = 0x11;
    pub const MAX_STREAMS_BIDI: u8 = 0x12;
    pub const MAX_STREAMS_UNI: u8 = 0x13;
    pub const DATA_BLOCKED: u8 = 0x14;
    pub const STREAM_DATA_BLOCKED: u8 = 0x15;
    pub const STREAMS_BLOCKED_BIDI: u8 = 0x16;
    pub const STREAMS_BLOCKED_UNI: u8 = 0x17;
    pub const NEW_CONNECTION_ID: u8 = 0x18;
    pub const RETIRE_CONNECTION_ID: u8 = 0x19;
    pub const PATH_CHALLENGE: u8 = 0x1a;
    pub const PATH_RESPONSE: u8 = 0x1b;
    pub const CONNECTION_CLOSE: u8 = 0x1c;
    pub const APPLICATION_CLOSE: u8 = 0x1d;
    pub const HANDSHAKE_DONE: u8 = 0x1e;
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.11
//# This value cannot exceed 2^60, as it is not possible to encode stream
//# IDs larger than 2^62-1.
pub const MAX_STREAMS_LIMIT: u64 = 1 << 60;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionClose {
    pub error_code: u64,
    /// `None` for an application close (type 0x1d)
    pub frame_type: Option<u64>,
    pub reason: Bytes,
}

impl ConnectionClose {
    /// Builds the transport close for `error`
    pub fn from_transport_error(error: &TransportError) -> Self {
        Self {
            error_code: error.code.as_u64(),
            frame_type: Some(error.frame_type.map_or(0, |v| v.as_u64())),
            reason: Bytes::from_static(error.reason.as_bytes()),
        }
    }

    #[inline]
    pub fn is_application(&self) -> bool {
        self.frame_type.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewConnectionId {
    pub sequence_number: u64,
    pub retire_prior_to: u64,
    pub connection_id: connection::Id,
    pub stateless_reset_token: stateless_reset::Token,
}

/// A decoded or to-be-encoded QUIC frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Padding {
        length: usize,
    },
    Ping,
    Ack(Ack),
    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    Crypto(Crypto),
    NewToken {
        token: Bytes,
    },
    Stream(Stream),
    MaxData {
        maximum_data: u64,
    },
    MaxStreamData {
        stream_id: u64,
        maximum_stream_data: u64,
    },
    MaxStreams {
        bidirectional: bool,
        maximum_streams: u64,
    },
    DataBlocked {
        data_limit: u64,
    },
    StreamDataBlocked {
        stream_id: u64,
        stream_data_limit: u64,
    },
    StreamsBlocked {
        bidirectional: bool,
        stream_limit: u64,
    },
    NewConnectionId(NewConnectionId),
    RetireConnectionId {
        sequence_number: u64,
    },
    PathChallenge {
        data: [u8; 8],
    },
    PathResponse {
        data: [u8; 8],
    },
    ConnectionClose(ConnectionClose),
    HandshakeDone,
}

fn put_varint<B: BufMut + ?Sized>(buf: &mut B, value: u64) {
    VarInt::new(value).unwrap_or(VarInt::MAX).encode(buf)
}

impl Frame {
    /// Returns the frame type used in error reports
    pub fn tag(&self) -> u8 {
        match self {
            Self::Padding { .. } => tag::PADDING,
            Self::Ping => tag::PING,
            Self::Ack(ack) => ack.tag(),
            Self::ResetStream { .. } => tag::RESET_STREAM,
            Self::StopSending { .. } => tag::STOP_SENDING,
            Self::Crypto(_) => tag::CRYPTO,
            Self::NewToken { .. } => tag::NEW_TOKEN,
            Self::Stream(_) => tag::STREAM,
            Self::MaxData { .. } => tag::MAX_DATA,
            Self::MaxStreamData { .. } => tag::MAX_STREAM_DATA,
            Self::MaxStreams { bidirectional, .. } => {
                if *bidirectional {
                    tag::MAX_STREAMS_BIDI
                } else {
                    tag::MAX_STREAMS_UNI
                }
            }
            Self::DataBlocked { .. } => tag::DATA_BLOCKED,
            Self::StreamDataBlocked { .. } => tag::STREAM_DATA_BLOCKED,
            Self::StreamsBlocked { bidirectional, .. } => {
                if *bidirectional {
                    tag::STREAMS_BLOCKED_BIDI
                } else {
                    tag::STREAMS_BLOCKED_UNI
                }
            }
            Self::NewConnectionId(_) => tag::NEW_CONNECTION_ID,
            Self::RetireConnectionId { .. } => tag::RETIRE_CONNECTION_ID,
            Self::PathChallenge { .. } => tag::PATH_CHALLENGE,
            Self::PathResponse { .. } => tag::PATH_RESPONSE,
            Self::ConnectionClose(close) => {
                if close.is_application() {
                    tag::APPLICATION_CLOSE
                } else {
                    tag::CONNECTION_CLOSE
                }
            }
            Self::HandshakeDone => tag::HANDSHAKE_DONE,
        }
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-2
    //# Ack-eliciting frames:  All frames other than ACK, PADDING, and
    //#    CONNECTION_CLOSE are considered ack-eliciting.
    #[inline]
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Self::Ack(_) | Self::Padding { .. } | Self::ConnectionClose(_)
        )
    }

    /// Returns true if the frame may appear in a packet of `packet_type`
    ///
    /// Initial and Handshake packets only carry PADDING, PING, ACK, CRYPTO and transport
    /// CONNECTION_CLOSE frames (RFC 9000 Table 3).
    pub fn is_allowed_in(&self, packet_type: PacketType) -> bool {
        match packet_type {
            PacketType::Initial | PacketType::Handshake => match self {
                Self::Padding { .. } | Self::Ping | Self::Ack(_) | Self::Crypto(_) => true,
                Self::ConnectionClose(close) => !close.is_application(),
                _ => false,
            },
            PacketType::ZeroRtt => !matches!(
                self,
                Self::Ack(_)
                    | Self::Crypto(_)
                    | Self::HandshakeDone
                    | Self::NewToken { .. }
                    | Self::PathResponse { .. }
                    | Self::RetireConnectionId { .. }
            ),
            PacketType::OneRtt => true,
            PacketType::Retry | PacketType::VersionNegotiation => false,
        }
    }

    /// Frames that are rebuilt rather than copied when a packet is retransmitted
    #[inline]
    pub fn is_retransmittable(&self) -> bool {
        !matches!(
            self,
            Self::Padding { .. }
                | Self::Ack(_)
                | Self::PathChallenge { .. }
                | Self::PathResponse { .. }
        )
    }

    pub fn encoding_size(&self) -> usize {
        match self {
            Self::Padding { length } => *length,
            Self::Ping | Self::HandshakeDone => 1,
            Self::Ack(ack) => ack.encoding_size(),
            Self::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => 1 + encoding_size(*stream_id) + encoding_size(*error_code) + encoding_size(*final_size),
            Self::StopSending {
                stream_id,
                error_code,
            } => 1 + encoding_size(*stream_id) + encoding_size(*error_code),
            Self::Crypto(crypto) => crypto.encoding_size(),
            Self::NewToken { token } => 1 + encoding_size(token.len() as u64) + token.len(),
            Self::Stream(stream) => stream.encoding_size(),
            Self::MaxData { maximum_data } => 1 + encoding_size(*maximum_data),
            Self::MaxStreamData {
                stream_id,
                maximum_stream_data,
            } => 1 + encoding_size(*stream_id) + encoding_size(*maximum_stream_data),
            Self::MaxStreams {
                maximum_streams, ..
            } => 1 + encoding_size(*maximum_streams),
            Self::DataBlocked { data_limit } => 1 + encoding_size(*data_limit),
            Self::StreamDataBlocked {
                stream_id,
                stream_data_limit,
            } => 1 + encoding_size(*stream_id) + encoding_size(*stream_data_limit),
            Self::StreamsBlocked { stream_limit, .. } => 1 + encoding_size(*stream_limit),
            Self::NewConnectionId(frame) => {
                1 + encoding_size(frame.sequence_number)
                    + encoding_size(frame.retire_prior_to)
                    + 1
                    + frame.connection_id.len()
                    + stateless_reset::TOKEN_LEN
            }
            Self::RetireConnectionId { sequence_number } => 1 + encoding_size(*sequence_number),
            Self::PathChallenge { .. } | Self::PathResponse { .. } => 1 + 8,
            Self::ConnectionClose(close) => {
                let mut len = 1 + encoding_size(close.error_code);
                if let Some(frame_type) = close.frame_type {
                    len += encoding_size(frame_type);
                }
                len + encoding_size(close.reason.len() as u64) + close.reason.len()
            }
        }
    }

    pub fn encode<B: BufMut + ?Sized>(&self, buf: &mut B) {
        match self {
            Self::Padding { length } => buf.put_bytes(0, *length),
            Self::Ping | Self::HandshakeDone => buf.put_u8(self.tag()),
            Self::Ack(ack) => ack.encode(buf),
            Self::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                buf.put_u8(tag::RESET_STREAM);
                put_varint(buf, *stream_id);
                put_varint(buf, *error_code);
                put_varint(buf, *final_size);
            }
            Self::StopSending {
                stream_id,
                error_code,
            } => {
                buf.put_u8(tag::STOP_SENDING);
                put_varint(buf, *stream_id);
                put_varint(buf, *error_code);
            }
            Self::Crypto(crypto) => crypto.encode(buf),
            Self::NewToken { token } => {
                buf.put_u8(tag::NEW_TOKEN);
                put_varint(buf, token.len() as u64);
                buf.put_slice(token);
            }
            Self::Stream(stream) => stream.encode(buf),
            Self::MaxData { maximum_data: value }
            | Self::DataBlocked { data_limit: value }
            | Self::MaxStreams {
                maximum_streams: value,
                ..
            }
            | Self::StreamsBlocked {
                stream_limit: value,
                ..
            }
            | Self::RetireConnectionId {
                sequence_number: value,
            } => {
                buf.put_u8(self.tag());
                put_varint(buf, *value);
            }
            Self::MaxStreamData {
                stream_id,
                maximum_stream_data: value,
            }
            | Self::StreamDataBlocked {
                stream_id,
                stream_data_limit: value,
            } => {
                buf.put_u8(self.tag());
                put_varint(buf, *stream_id);
                put_varint(buf, *value);
            }
            Self::NewConnectionId(frame) => {
                buf.put_u8(tag::NEW_CONNECTION_ID);
                put_varint(buf, frame.sequence_number);
                put_varint(buf, frame.retire_prior_to);
                frame.connection_id.encode_len_prefixed(buf);
                buf.put_slice(frame.stateless_reset_token.as_ref());
            }
            Self::PathChallenge { data } | Self::PathResponse { data } => {
                buf.put_u8(self.tag());
                buf.put_slice(data);
            }
            Self::ConnectionClose(close) => {
                buf.put_u8(self.tag());
                put_varint(buf, close.error_code);
                if let Some(frame_type) = close.frame_type {
                    put_varint(buf, frame_type);
                }
                put_varint(buf, close.reason.len() as u64);
                buf.put_slice(&close.reason);
            }
        }
    }

    /// Decodes a single frame from the front of `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Self, TransportError> {
        let frame_type = buf.decode_varint()?;
        Self::decode_body(frame_type, buf).map_err(|error| {
            TransportError::from(error).with_frame_type(frame_type)
        })
    }

    fn decode_body(frame_type: VarInt, buf: &mut Bytes) -> DecoderResult<Self> {
        let Ok(tag) = u8::try_from(frame_type.as_u64()) else {
            return Err(DecoderError::InvariantViolation("unknown frame type"));
        };

        let frame = match tag {
            tag::PADDING => {
                let mut length = 1;
                while buf.first() == Some(&0) {
                    buf.advance(1);
                    length += 1;
                }
                Self::Padding { length }
            }
            tag::PING => Self::Ping,
            tag::ACK | tag::ACK_ECN => Self::Ack(Ack::decode(tag, buf)?),
            tag::RESET_STREAM => Self::ResetStream {
                stream_id: buf.decode_varint()?.as_u64(),
                error_code: buf.decode_varint()?.as_u64(),
                final_size: buf.decode_varint()?.as_u64(),
            },
            tag::STOP_SENDING => Self::StopSending {
                stream_id: buf.decode_varint()?.as_u64(),
                error_code: buf.decode_varint()?.as_u64(),
            },
            tag::CRYPTO => Self::Crypto(Crypto::decode(buf)?),
            tag::NEW_TOKEN => {
                let token = buf.decode_slice_with_len_prefix_varint()?;
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.7
                //# A client MUST treat receipt of a NEW_TOKEN frame with an empty Token
                //# field as a connection error of type FRAME_ENCODING_ERROR.
                decoder_invariant!(!token.is_empty(), "empty NEW_TOKEN");
                Self::NewToken { token }
            }
            tag::STREAM..=tag::STREAM_MAX => Self::Stream(Stream::decode(tag, buf)?),
            tag::MAX_DATA => Self::MaxData {
                maximum_data: buf.decode_varint()?.as_u64(),
            },
            tag::MAX_STREAM_DATA => Self::MaxStreamData {
                stream_id: buf.decode_varint()?.as_u64(),
                maximum_stream_data: buf.decode_varint()?.as_u64(),
            },
            tag::MAX_STREAMS_BIDI | tag::MAX_STREAMS_UNI => {
                let maximum_streams = buf.decode_varint()?.as_u64();
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.11
                //# If a max_streams transport parameter or a MAX_STREAMS frame is
                //# received with a value greater than 2^60, this would allow a maximum
                //# stream ID that cannot be expressed as a variable-length integer; see
                //# Section 16.  If either is received, the connection MUST be closed
                //# immediately with a connection error of type TRANSPORT_PARAMETER_ERROR
                //# if the offending value was received in a transport parameter or of
                //# type FRAME_ENCODING_ERROR if it was received in a frame; see
                //# Section 10.2.
                decoder_invariant!(
                    maximum_streams <= MAX_STREAMS_LIMIT,
                    "MAX_STREAMS exceeds 2^60"
                );
                Self::MaxStreams {
                    bidirectional: tag == tag::MAX_STREAMS_BIDI,
                    maximum_streams,
                }
            }
            tag::DATA_BLOCKED => Self::DataBlocked {
                data_limit: buf.decode_varint()?.as_u64(),
            },
            tag::STREAM_DATA_BLOCKED => Self::StreamDataBlocked {
                stream_id: buf.decode_varint()?.as_u64(),
                stream_data_limit: buf.decode_varint()?.as_u64(),
            },
            tag::STREAMS_BLOCKED_BIDI | tag::STREAMS_BLOCKED_UNI => {
                let stream_limit = buf.decode_varint()?.as_u64();
                decoder_invariant!(
                    stream_limit <= MAX_STREAMS_LIMIT,
                    "STREAMS_BLOCKED exceeds 2^60"
                );
                Self::StreamsBlocked {
                    bidirectional: tag == tag::STREAMS_BLOCKED_BIDI,
                    stream_limit,
                }
            }
            tag::NEW_CONNECTION_ID => {
                let sequence_number = buf.decode_varint()?.as_u64();
                let retire_prior_to = buf.decode_varint()?.as_u64();
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
                //# The value in the Retire Prior To field
                //# MUST be less than or equal to the value in the Sequence Number field.
                decoder_invariant!(
                    retire_prior_to <= sequence_number,
                    "retire_prior_to exceeds sequence number"
                );
                let len = buf.decode_u8()? as usize;
                decoder_invariant!(
                    (1..=connection::MAX_LEN).contains(&len),
                    "invalid connection ID length"
                );
                let connection_id = connection::Id::decode_with_len(buf, len)?;
                let token = buf.decode_slice(stateless_reset::TOKEN_LEN)?;
                let stateless_reset_token = stateless_reset::Token::try_from(&token[..])
                    .map_err(|_| DecoderError::UnexpectedEof(stateless_reset::TOKEN_LEN))?;
                Self::NewConnectionId(NewConnectionId {
                    sequence_number,
                    retire_prior_to,
                    connection_id,
                    stateless_reset_token,
                })
            }
            tag::RETIRE_CONNECTION_ID => Self::RetireConnectionId {
                sequence_number: buf.decode_varint()?.as_u64(),
            },
            tag::PATH_CHALLENGE | tag::PATH_RESPONSE => {
                buf.ensure_len(8)?;
                let mut data = [0u8; 8];
                buf.copy_to_slice(&mut data);
                if tag == tag::PATH_CHALLENGE {
                    Self::PathChallenge { data }
                } else {
                    Self::PathResponse { data }
                }
            }
            tag::CONNECTION_CLOSE | tag::APPLICATION_CLOSE => {
                let error_code = buf.decode_varint()?.as_u64();
                let frame_type = if tag == tag::CONNECTION_CLOSE {
                    Some(buf.decode_varint()?.as_u64())
                } else {
                    None
                };
                let reason = buf.decode_slice_with_len_prefix_varint()?;
                Self::ConnectionClose(ConnectionClose {
                    error_code,
                    frame_type,
                    reason,
                })
            }
            tag::HANDSHAKE_DONE => Self::HandshakeDone,
            _ => return Err(DecoderError::InvariantViolation("unknown frame type")),
        };

        Ok(frame)
    }
}

/// Decodes every frame in a packet payload.
///
//= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
//# An endpoint MUST treat receipt of a packet containing no frames as a
//# connection error of type PROTOCOL_VIOLATION.
pub fn decode_all(payload: Bytes) -> Result<Vec<Frame>, TransportError> {
    if payload.is_empty() {
        return Err(TransportError::PROTOCOL_VIOLATION.with_reason("packet contains no frames"));
    }
    let mut buf = payload;
    let mut frames = Vec::new();
    while buf.has_remaining() {
        frames.push(Frame::decode(&mut buf)?);
    }
    Ok(frames)
}

/// Encodes `frames` back to back into a new buffer
pub fn encode_all(frames: &[Frame]) -> BytesMut {
    let len = frames.iter().map(Frame::encoding_size).sum();
    let mut buf = BytesMut::with_capacity(len);
    for frame in frames {
        frame.encode(&mut buf);
    }
    buf
}
