// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Building our transport parameters and checking the peer's against the handshake

use super::Limits;
use bytes::Bytes;
use tern_quic_core::{
    connection::{self, Role},
    stateless_reset,
    transport::{
        parameters::{TransportParameters, VersionInformation},
        TransportError,
    },
    version,
};

/// Connection IDs the handshake settled on, from our side
#[derive(Clone, Debug, Default)]
pub struct HandshakeIds {
    /// Source ID of the peer's first packet
    pub peer_initial_source: Option<connection::Id>,
    /// Destination ID of the client's first Initial
    pub original_destination: Option<connection::Id>,
    /// Source ID of the Retry packet the client processed
    pub retry_source: Option<connection::Id>,
}

pub fn local(
    role: Role,
    limits: &Limits,
    initial_source: connection::Id,
    ids: &HandshakeIds,
    reset_token: Option<stateless_reset::Token>,
    version: u32,
) -> TransportParameters {
    let mut parameters = TransportParameters {
        max_idle_timeout: Some(limits.max_idle_timeout.as_millis() as u64),
        max_udp_payload_size: Some(limits.max_udp_payload_size),
        initial_max_data: Some(limits.data_window),
        initial_max_stream_data_bidi_local: Some(limits.stream_data_window),
        initial_max_stream_data_bidi_remote: Some(limits.stream_data_window),
        initial_max_stream_data_uni: Some(limits.stream_data_window),
        initial_max_streams_bidi: Some(limits.max_open_bidirectional_streams),
        initial_max_streams_uni: Some(limits.max_open_unidirectional_streams),
        ack_delay_exponent: Some(limits.ack_delay_exponent),
        max_ack_delay: Some(limits.max_ack_delay.as_millis() as u64),
        active_connection_id_limit: Some(limits.max_active_connection_ids),
        initial_source_connection_id: Some(initial_source),
        version_information: Some(VersionInformation {
            chosen_version: version,
            available_versions: vec![version::QUIC_V2, version::QUIC_V1],
        }),
        ..Default::default()
    };

    if role.is_server() {
        parameters.original_destination_connection_id = ids.original_destination;
        parameters.retry_source_connection_id = ids.retry_source;
        parameters.stateless_reset_token =
            reset_token.map(|token| Bytes::copy_from_slice(token.as_ref()));
    }

    parameters
}

/// Decodes the peer's parameters and checks them against what the handshake observed
pub fn validate_peer(
    role: Role,
    encoded: Bytes,
    ids: &HandshakeIds,
    version: u32,
) -> Result<TransportParameters, TransportError> {
    let error = TransportError::TRANSPORT_PARAMETER_ERROR;
    let parameters = TransportParameters::decode(encoded)?;

    //= https://www.rfc-editor.org/rfc/rfc9000#section-7.3
    //# An endpoint MUST treat the absence of the
    //# initial_source_connection_id transport parameter from either endpoint
    //# or the absence of the original_destination_connection_id transport
    //# parameter from the server as a connection error of type
    //# TRANSPORT_PARAMETER_ERROR.
    //#
    //# An endpoint MUST treat the following as a connection error of type
    //# TRANSPORT_PARAMETER_ERROR or PROTOCOL_VIOLATION:
    //#
    //# *  a mismatch between values received from a peer in these transport
    //#    parameters and the value sent in the corresponding Destination or
    //#    Source Connection ID fields of Initial packets.
    match parameters.initial_source_connection_id {
        None => return Err(error.with_reason("missing initial_source_connection_id")),
        Some(id) if Some(id) != ids.peer_initial_source => {
            return Err(error.with_reason("initial_source_connection_id mismatch"))
        }
        _ => {}
    }

    if role.is_client() {
        match parameters.original_destination_connection_id {
            None => return Err(error.with_reason("missing original_destination_connection_id")),
            Some(id) if Some(id) != ids.original_destination => {
                return Err(error.with_reason("original_destination_connection_id mismatch"))
            }
            _ => {}
        }

        //# If the client received and processed a Retry packet, the server MUST
        //# include the retry_source_connection_id transport parameter; otherwise
        //# the server MUST NOT include it.
        if parameters.retry_source_connection_id != ids.retry_source {
            return Err(error.with_reason("retry_source_connection_id mismatch"));
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
        //# This parameter is a sequence of 16 bytes.
        if parameters
            .stateless_reset_token
            .as_ref()
            .is_some_and(|token| token.len() != stateless_reset::TOKEN_LEN)
        {
            return Err(error.with_reason("stateless_reset_token is not 16 bytes"));
        }
    } else {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
        //# A client MUST NOT include any server-only transport parameter:
        //# original_destination_connection_id, preferred_address,
        //# retry_source_connection_id, or stateless_reset_token.  A server MUST
        //# treat receipt of any of these transport parameters as a connection
        //# error of type TRANSPORT_PARAMETER_ERROR.
        if parameters.original_destination_connection_id.is_some()
            || parameters.preferred_address.is_some()
            || parameters.retry_source_connection_id.is_some()
            || parameters.stateless_reset_token.is_some()
        {
            return Err(error.with_reason("client sent a server-only transport parameter"));
        }
    }

    //# The value of the active_connection_id_limit parameter MUST be at least
    //# 2.  An endpoint that receives a value less than 2 MUST close the
    //# connection with an error of type TRANSPORT_PARAMETER_ERROR.
    if parameters.active_connection_id_limit() < 2 {
        return Err(error.with_reason("active_connection_id_limit below 2"));
    }

    //= https://www.rfc-editor.org/rfc/rfc9368#section-4
    //# Clients MUST validate that the server's Chosen Version is equal to the
    //# negotiated version; if they do not match, the client MUST close the
    //# connection with a version negotiation error.
    if let Some(info) = &parameters.version_information {
        if info.chosen_version != version {
            return Err(TransportError::VERSION_NEGOTIATION_ERROR
                .with_reason("chosen version does not match"));
        }
    }

    Ok(parameters)
}

/// Returns the peer's stateless reset token, if it sent one
pub fn reset_token(parameters: &TransportParameters) -> Option<stateless_reset::Token> {
    parameters
        .stateless_reset_token
        .as_deref()
        .and_then(|token| stateless_reset::Token::try_from(token).ok())
}
