// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;
use tern_quic_core::{
    packet::{MAX_IPV6_DATAGRAM_LEN, MIN_INITIAL_DATAGRAM_LEN},
    transport::parameters::{MAX_ACK_DELAY_EXPONENT, MAX_MAX_ACK_DELAY_MS},
    varint::VarInt,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid limit: {0}")]
pub struct ValidationError(&'static str);

/// Per-connection settings advertised to the peer in our transport parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub(crate) max_idle_timeout: Duration,
    pub(crate) data_window: u64,
    pub(crate) stream_data_window: u64,
    pub(crate) max_open_bidirectional_streams: u64,
    pub(crate) max_open_unidirectional_streams: u64,
    pub(crate) max_udp_payload_size: u64,
    pub(crate) max_active_connection_ids: u64,
    pub(crate) ack_delay_exponent: u8,
    pub(crate) max_ack_delay: Duration,
    pub(crate) max_initial_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! setter {
    ($name:ident, $field:ident, $inner:ty, $check:expr, $reason:literal) => {
        pub fn $name(mut self, value: $inner) -> Result<Self, ValidationError> {
            let check: fn(&$inner) -> bool = $check;
            if !check(&value) {
                return Err(ValidationError($reason));
            }
            self.$field = value;
            Ok(self)
        }
    };
}

fn is_varint(value: &u64) -> bool {
    VarInt::try_from(*value).is_ok()
}

impl Limits {
    pub const fn new() -> Self {
        Self {
            max_idle_timeout: Duration::from_secs(30),
            data_window: 15 * 1024 * 1024,
            stream_data_window: 6 * 1024 * 1024,
            max_open_bidirectional_streams: 100,
            max_open_unidirectional_streams: 100,
            max_udp_payload_size: MAX_IPV6_DATAGRAM_LEN as u64,
            max_active_connection_ids: 2,
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(25),
            max_initial_timeout: Duration::from_secs(30),
        }
    }

    setter!(
        with_max_idle_timeout,
        max_idle_timeout,
        Duration,
        |value| value.as_millis() < (1 << 62),
        "max_idle_timeout out of range"
    );
    setter!(
        with_data_window,
        data_window,
        u64,
        is_varint,
        "data window out of range"
    );
    setter!(
        with_stream_data_window,
        stream_data_window,
        u64,
        is_varint,
        "stream data window out of range"
    );
    setter!(
        with_max_open_bidirectional_streams,
        max_open_bidirectional_streams,
        u64,
        |value| *value <= 1 << 60,
        "stream count above 2^60"
    );
    setter!(
        with_max_open_unidirectional_streams,
        max_open_unidirectional_streams,
        u64,
        |value| *value <= 1 << 60,
        "stream count above 2^60"
    );
    setter!(
        with_max_udp_payload_size,
        max_udp_payload_size,
        u64,
        |value| (MIN_INITIAL_DATAGRAM_LEN as u64..=MAX_IPV6_DATAGRAM_LEN as u64).contains(value),
        "max_udp_payload_size must be within 1200..=65527"
    );
    setter!(
        with_max_active_connection_ids,
        max_active_connection_ids,
        u64,
        |value| *value >= 2 && is_varint(value),
        "active_connection_id_limit must be at least 2"
    );
    setter!(
        with_ack_delay_exponent,
        ack_delay_exponent,
        u8,
        |value| *value <= MAX_ACK_DELAY_EXPONENT,
        "ack_delay_exponent above 20"
    );
    setter!(
        with_max_ack_delay,
        max_ack_delay,
        Duration,
        |value| value.as_millis() <= MAX_MAX_ACK_DELAY_MS as u128,
        "max_ack_delay must be below 2^14 ms"
    );
    setter!(
        with_max_initial_timeout,
        max_initial_timeout,
        Duration,
        |value| !value.is_zero(),
        "max_initial_timeout must be positive"
    );

    #[inline]
    pub fn max_idle_timeout(&self) -> Duration {
        self.max_idle_timeout
    }

    #[inline]
    pub fn data_window(&self) -> u64 {
        self.data_window
    }

    #[inline]
    pub fn stream_data_window(&self) -> u64 {
        self.stream_data_window
    }

    #[inline]
    pub fn max_active_connection_ids(&self) -> u64 {
        self.max_active_connection_ids
    }

    #[inline]
    pub fn max_initial_timeout(&self) -> Duration {
        self.max_initial_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let limits = Limits::default();
        assert_eq!(limits.max_idle_timeout(), Duration::from_secs(30));
        assert_eq!(limits.data_window(), 15 << 20);
        assert_eq!(limits.stream_data_window(), 6 << 20);
        assert_eq!(limits.max_udp_payload_size, 65527);
        assert_eq!(limits.max_active_connection_ids(), 2);
        assert_eq!(limits.max_initial_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn setters_validate() {
        assert!(Limits::new().with_max_active_connection_ids(1).is_err());
        assert!(Limits::new().with_max_udp_payload_size(1199).is_err());
        assert!(Limits::new().with_ack_delay_exponent(21).is_err());
        assert!(Limits::new()
            .with_max_ack_delay(Duration::from_secs(17))
            .is_err());

        let limits = Limits::new()
            .with_data_window(1 << 20)
            .and_then(|limits| limits.with_max_open_bidirectional_streams(1 << 60))
            .unwrap();
        assert_eq!(limits.data_window(), 1 << 20);
        assert_eq!(limits.max_open_bidirectional_streams, 1 << 60);
    }
}
