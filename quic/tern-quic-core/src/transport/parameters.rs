// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport parameters exchanged in the TLS handshake

use crate::{
    codec::{DecoderBuffer, DecoderResult},
    connection,
    frame::MAX_STREAMS_LIMIT,
    transport::TransportError,
    varint::{encoding_size, VarInt},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use core::time::Duration;

//= https://www.rfc-editor.org/rfc/rfc9000#section-18
//# Transport Parameter {
//#   Transport Parameter ID (i),
//#   Transport Parameter Length (i),
//#   Transport Parameter Value (..),
//# }

pub mod id {
    pub const ORIGINAL_DESTINATION_CONNECTION_ID: u64 = 0x00;
    pub const MAX_IDLE_TIMEOUT: u64 = 0x01;
    pub const STATELESS_RESET_TOKEN: u64 = 0x02;
    pub const MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
    pub const INITIAL_MAX_DATA: u64 = 0x04;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
    pub const INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
    pub const INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
    pub const INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
    pub const ACK_DELAY_EXPONENT: u64 = 0x0a;
    pub const MAX_ACK_DELAY: u64 = 0x0b;
    pub const DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
    pub const PREFERRED_ADDRESS: u64 = 0x0d;
    pub const ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
    pub const INITIAL_SOURCE_CONNECTION_ID: u64 = 0x0f;
    pub const RETRY_SOURCE_CONNECTION_ID: u64 = 0x10;
    pub const VERSION_INFORMATION: u64 = 0x11;
}

pub const DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;
pub const DEFAULT_MAX_ACK_DELAY: Duration = Duration::from_millis(25);
pub const DEFAULT_ACTIVE_CONNECTION_ID_LIMIT: u64 = 2;
pub const DEFAULT_MAX_UDP_PAYLOAD_SIZE: u64 = 65527;

//= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
//# Values above 20 are invalid.
pub const MAX_ACK_DELAY_EXPONENT: u8 = 20;

//= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
//# Values of 2^14 or greater are invalid.
pub const MAX_MAX_ACK_DELAY_MS: u64 = (1 << 14) - 1;

//= https://www.rfc-editor.org/rfc/rfc9368#section-3
//# Version Information {
//#   Chosen Version (32),
//#   Available Versions (32) ...,
//# }
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionInformation {
    pub chosen_version: u32,
    pub available_versions: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportParameters {
    pub original_destination_connection_id: Option<connection::Id>,
    /// Milliseconds; zero or absent disables the idle timeout
    pub max_idle_timeout: Option<u64>,
    /// Kept raw so a wrong length can be reported as a parameter error
    pub stateless_reset_token: Option<Bytes>,
    pub max_udp_payload_size: Option<u64>,
    pub initial_max_data: Option<u64>,
    pub initial_max_stream_data_bidi_local: Option<u64>,
    pub initial_max_stream_data_bidi_remote: Option<u64>,
    pub initial_max_stream_data_uni: Option<u64>,
    pub initial_max_streams_bidi: Option<u64>,
    pub initial_max_streams_uni: Option<u64>,
    pub ack_delay_exponent: Option<u8>,
    /// Milliseconds
    pub max_ack_delay: Option<u64>,
    pub disable_active_migration: bool,
    /// Opaque; migration is not supported so the value is only carried
    pub preferred_address: Option<Bytes>,
    pub active_connection_id_limit: Option<u64>,
    pub initial_source_connection_id: Option<connection::Id>,
    pub retry_source_connection_id: Option<connection::Id>,
    pub version_information: Option<VersionInformation>,
}

const PARAMETER_ERROR: TransportError = TransportError::TRANSPORT_PARAMETER_ERROR;

impl TransportParameters {
    #[inline]
    pub fn ack_delay_exponent(&self) -> u8 {
        self.ack_delay_exponent
            .unwrap_or(DEFAULT_ACK_DELAY_EXPONENT)
    }

    #[inline]
    pub fn max_ack_delay(&self) -> Duration {
        self.max_ack_delay
            .map_or(DEFAULT_MAX_ACK_DELAY, Duration::from_millis)
    }

    #[inline]
    pub fn max_idle_timeout(&self) -> Option<Duration> {
        self.max_idle_timeout
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    #[inline]
    pub fn active_connection_id_limit(&self) -> u64 {
        self.active_connection_id_limit
            .unwrap_or(DEFAULT_ACTIVE_CONNECTION_ID_LIMIT)
    }

    #[inline]
    pub fn max_udp_payload_size(&self) -> u64 {
        self.max_udp_payload_size
            .unwrap_or(DEFAULT_MAX_UDP_PAYLOAD_SIZE)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        fn put_param<B: BufMut>(buf: &mut B, id: u64, value: &[u8]) {
            VarInt::new(id).unwrap_or(VarInt::MAX).encode(buf);
            VarInt::new(value.len() as u64)
                .unwrap_or(VarInt::MAX)
                .encode(buf);
            buf.put_slice(value);
        }

        fn put_int<B: BufMut>(buf: &mut B, id: u64, value: Option<u64>) {
            if let Some(value) = value {
                let mut encoded = BytesMut::with_capacity(encoding_size(value));
                VarInt::new(value).unwrap_or(VarInt::MAX).encode(&mut encoded);
                put_param(buf, id, &encoded);
            }
        }

        if let Some(cid) = &self.original_destination_connection_id {
            put_param(&mut buf, id::ORIGINAL_DESTINATION_CONNECTION_ID, cid.as_bytes());
        }
        put_int(&mut buf, id::MAX_IDLE_TIMEOUT, self.max_idle_timeout);
        if let Some(token) = &self.stateless_reset_token {
            put_param(&mut buf, id::STATELESS_RESET_TOKEN, token);
        }
        put_int(&mut buf, id::MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size);
        put_int(&mut buf, id::INITIAL_MAX_DATA, self.initial_max_data);
        put_int(
            &mut buf,
            id::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        put_int(
            &mut buf,
            id::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        put_int(
            &mut buf,
            id::INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
        );
        put_int(&mut buf, id::INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        put_int(&mut buf, id::INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        put_int(
            &mut buf,
            id::ACK_DELAY_EXPONENT,
            self.ack_delay_exponent.map(u64::from),
        );
        put_int(&mut buf, id::MAX_ACK_DELAY, self.max_ack_delay);
        if self.disable_active_migration {
            put_param(&mut buf, id::DISABLE_ACTIVE_MIGRATION, &[]);
        }
        if let Some(address) = &self.preferred_address {
            put_param(&mut buf, id::PREFERRED_ADDRESS, address);
        }
        put_int(
            &mut buf,
            id::ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
        );
        if let Some(cid) = &self.initial_source_connection_id {
            put_param(&mut buf, id::INITIAL_SOURCE_CONNECTION_ID, cid.as_bytes());
        }
        if let Some(cid) = &self.retry_source_connection_id {
            put_param(&mut buf, id::RETRY_SOURCE_CONNECTION_ID, cid.as_bytes());
        }
        if let Some(info) = &self.version_information {
            let mut value = BytesMut::with_capacity(4 + info.available_versions.len() * 4);
            value.put_u32(info.chosen_version);
            for version in &info.available_versions {
                value.put_u32(*version);
            }
            put_param(&mut buf, id::VERSION_INFORMATION, &value);
        }

        buf.freeze()
    }

    /// Decodes and range-checks the parameters.
    ///
    /// Presence and cross-checks against the handshake are left to the connection.
    pub fn decode(bytes: Bytes) -> Result<Self, TransportError> {
        Self::decode_inner(bytes)
            .map_err(|_| PARAMETER_ERROR.with_reason("malformed transport parameters"))?
    }

    fn decode_inner(bytes: Bytes) -> DecoderResult<Result<Self, TransportError>> {
        let mut buf = bytes;
        let mut params = Self::default();
        let mut seen = Vec::new();

        while buf.has_remaining() {
            let param_id = buf.decode_varint()?.as_u64();
            let mut value = buf.decode_slice_with_len_prefix_varint()?;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-7.4
            //# An endpoint MUST NOT send a parameter more than once in a given
            //# transport parameters extension.  An endpoint SHOULD treat receipt of
            //# duplicate transport parameters as a connection error of type
            //# TRANSPORT_PARAMETER_ERROR.
            if seen.contains(&param_id) {
                return Ok(Err(PARAMETER_ERROR.with_reason("duplicate transport parameter")));
            }
            seen.push(param_id);

            let connection_id = |value: &Bytes| {
                connection::Id::try_from_bytes(value)
                    .map_err(|_| PARAMETER_ERROR.with_reason("connection ID too long"))
            };

            let int = |value: &mut Bytes| -> DecoderResult<u64> {
                let v = value.decode_varint()?.as_u64();
                value.ensure_empty()?;
                Ok(v)
            };

            let result: Result<(), TransportError> = match param_id {
                id::ORIGINAL_DESTINATION_CONNECTION_ID => {
                    connection_id(&value).map(|cid| params.original_destination_connection_id = Some(cid))
                }
                id::MAX_IDLE_TIMEOUT => {
                    params.max_idle_timeout = Some(int(&mut value)?);
                    Ok(())
                }
                id::STATELESS_RESET_TOKEN => {
                    params.stateless_reset_token = Some(value);
                    Ok(())
                }
                id::MAX_UDP_PAYLOAD_SIZE => {
                    let size = int(&mut value)?;
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
                    //# Values below 1200 are invalid.
                    if size < 1200 {
                        Err(PARAMETER_ERROR.with_reason("max_udp_payload_size below 1200"))
                    } else {
                        params.max_udp_payload_size = Some(size);
                        Ok(())
                    }
                }
                id::INITIAL_MAX_DATA => {
                    params.initial_max_data = Some(int(&mut value)?);
                    Ok(())
                }
                id::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = Some(int(&mut value)?);
                    Ok(())
                }
                id::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = Some(int(&mut value)?);
                    Ok(())
                }
                id::INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = Some(int(&mut value)?);
                    Ok(())
                }
                id::INITIAL_MAX_STREAMS_BIDI | id::INITIAL_MAX_STREAMS_UNI => {
                    let streams = int(&mut value)?;
                    if streams > MAX_STREAMS_LIMIT {
                        Err(PARAMETER_ERROR.with_reason("initial_max_streams exceeds 2^60"))
                    } else {
                        if param_id == id::INITIAL_MAX_STREAMS_BIDI {
                            params.initial_max_streams_bidi = Some(streams);
                        } else {
                            params.initial_max_streams_uni = Some(streams);
                        }
                        Ok(())
                    }
                }
                id::ACK_DELAY_EXPONENT => {
                    let exponent = int(&mut value)?;
                    if exponent > MAX_ACK_DELAY_EXPONENT as u64 {
                        Err(PARAMETER_ERROR.with_reason("ack_delay_exponent above 20"))
                    } else {
                        params.ack_delay_exponent = Some(exponent as u8);
                        Ok(())
                    }
                }
                id::MAX_ACK_DELAY => {
                    let delay = int(&mut value)?;
                    if delay > MAX_MAX_ACK_DELAY_MS {
                        Err(PARAMETER_ERROR.with_reason("max_ack_delay of 2^14 or above"))
                    } else {
                        params.max_ack_delay = Some(delay);
                        Ok(())
                    }
                }
                id::DISABLE_ACTIVE_MIGRATION => {
                    if value.is_empty() {
                        params.disable_active_migration = true;
                        Ok(())
                    } else {
                        Err(PARAMETER_ERROR.with_reason("disable_active_migration has a value"))
                    }
                }
                id::PREFERRED_ADDRESS => {
                    params.preferred_address = Some(value);
                    Ok(())
                }
                id::ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = Some(int(&mut value)?);
                    Ok(())
                }
                id::INITIAL_SOURCE_CONNECTION_ID => {
                    connection_id(&value).map(|cid| params.initial_source_connection_id = Some(cid))
                }
                id::RETRY_SOURCE_CONNECTION_ID => {
                    connection_id(&value).map(|cid| params.retry_source_connection_id = Some(cid))
                }
                id::VERSION_INFORMATION => {
                    if value.is_empty() || value.len() % 4 != 0 {
                        Err(PARAMETER_ERROR.with_reason("malformed version_information"))
                    } else {
                        let chosen_version = value.get_u32();
                        let mut available_versions = Vec::with_capacity(value.len() / 4);
                        while value.has_remaining() {
                            available_versions.push(value.get_u32());
                        }
                        params.version_information = Some(VersionInformation {
                            chosen_version,
                            available_versions,
                        });
                        Ok(())
                    }
                }
                // unknown parameters are ignored
                _ => Ok(()),
            };

            if let Err(error) = result {
                return Ok(Err(error));
            }
        }

        Ok(Ok(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TransportParameters {
        TransportParameters {
            original_destination_connection_id: Some(
                connection::Id::try_from_bytes(&[1; 8]).unwrap(),
            ),
            max_idle_timeout: Some(30_000),
            stateless_reset_token: Some(Bytes::from_static(&[9; 16])),
            max_udp_payload_size: Some(1500),
            initial_max_data: Some(15 << 20),
            initial_max_stream_data_bidi_local: Some(6 << 20),
            initial_max_stream_data_bidi_remote: Some(6 << 20),
            initial_max_stream_data_uni: Some(6 << 20),
            initial_max_streams_bidi: Some(100),
            initial_max_streams_uni: Some(100),
            ack_delay_exponent: Some(3),
            max_ack_delay: Some(25),
            disable_active_migration: true,
            preferred_address: None,
            active_connection_id_limit: Some(2),
            initial_source_connection_id: Some(connection::Id::try_from_bytes(&[2; 8]).unwrap()),
            retry_source_connection_id: None,
            version_information: Some(VersionInformation {
                chosen_version: 1,
                available_versions: vec![1, 0x6b33_43cf],
            }),
        }
    }

    #[test]
    fn round_trip() {
        let params = sample();
        assert_eq!(TransportParameters::decode(params.encode()).unwrap(), params);
    }

    #[test]
    fn defaults_apply_when_absent() {
        let params = TransportParameters::default();
        assert_eq!(params.ack_delay_exponent(), 3);
        assert_eq!(params.max_ack_delay(), Duration::from_millis(25));
        assert_eq!(params.active_connection_id_limit(), 2);
        assert_eq!(params.max_idle_timeout(), None);
    }

    #[test]
    fn invalid_values_are_parameter_errors() {
        let cases = [
            TransportParameters {
                ack_delay_exponent: Some(21),
                ..Default::default()
            },
            TransportParameters {
                max_ack_delay: Some(1 << 14),
                ..Default::default()
            },
            TransportParameters {
                max_udp_payload_size: Some(1199),
                ..Default::default()
            },
            TransportParameters {
                initial_max_streams_uni: Some(MAX_STREAMS_LIMIT + 1),
                ..Default::default()
            },
        ];
        for params in cases {
            let error = TransportParameters::decode(params.encode()).unwrap_err();
            assert_eq!(error.code, TransportError::TRANSPORT_PARAMETER_ERROR.code);
        }
    }

    #[test]
    fn duplicates_are_rejected() {
        let once = TransportParameters {
            initial_max_data: Some(1),
            ..Default::default()
        }
        .encode();
        let mut twice = BytesMut::from(&once[..]);
        twice.extend_from_slice(&once);
        assert!(TransportParameters::decode(twice.freeze()).is_err());
    }

    #[test]
    fn unknown_parameters_are_ignored() {
        let mut buf = BytesMut::new();
        VarInt::from_u32(0x2ab2).encode(&mut buf);
        VarInt::from_u8(2).encode(&mut buf);
        buf.put_slice(&[0xff, 0xff]);
        assert_eq!(
            TransportParameters::decode(buf.freeze()).unwrap(),
            TransportParameters::default()
        );
    }
}
