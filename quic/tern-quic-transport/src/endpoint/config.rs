// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Configuration parameters for `Endpoint`s

use super::Error;
use crate::connection::{Limits, Role};
use std::sync::Arc;
use tern_quic_core::{
    connection,
    packet::{MAX_IPV6_DATAGRAM_LEN, MIN_INITIAL_DATAGRAM_LEN},
    version,
};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Bounds of the buffered-bytes watermarks
const HIGH_WATERMARK_RANGE: (usize, usize) = (128 * KIB, 6 * MIB);
const LOW_WATERMARK_RANGE: (usize, usize) = (64 * KIB, 6 * MIB);

/// Shortest connection ID the endpoint issues. Routing short header packets relies on IDs
/// being hard to guess.
const MIN_LOCAL_ID_LEN: usize = 4;

#[derive(Clone, Debug)]
pub struct Config {
    name: Arc<str>,
    role: Role,
    local_id_len: usize,
    max_datagram_size: usize,
    high_watermark: usize,
    low_watermark: usize,
    enabled_versions: Vec<u32>,
    limits: Limits,
    retry: bool,
}

impl Config {
    pub fn new(role: Role) -> Self {
        Self {
            name: match role {
                Role::Client => "client".into(),
                Role::Server => "server".into(),
            },
            role,
            local_id_len: 8,
            max_datagram_size: MIN_INITIAL_DATAGRAM_LEN,
            high_watermark: 512 * KIB,
            low_watermark: 384 * KIB,
            enabled_versions: vec![version::QUIC_V1, version::QUIC_V2],
            limits: Limits::default(),
            retry: false,
        }
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Sets the name used in logs
    pub fn with_name(mut self, name: &str) -> Result<Self, Error> {
        if name.is_empty() {
            return Err(Error::InvalidConfig("the endpoint name is empty"));
        }
        self.name = name.into();
        Ok(self)
    }

    /// Sets the length of the connection IDs the endpoint issues
    pub fn with_local_id_len(mut self, len: usize) -> Result<Self, Error> {
        if !(MIN_LOCAL_ID_LEN..=connection::MAX_LEN).contains(&len) {
            return Err(Error::InvalidConfig(
                "local connection IDs must be 4 to 20 bytes long",
            ));
        }
        self.local_id_len = len;
        Ok(self)
    }

    /// Sets the largest datagram read from the socket, clamped to 1200..=65527
    pub fn with_max_datagram_size(mut self, size: usize) -> Result<Self, Error> {
        self.max_datagram_size = size.clamp(MIN_INITIAL_DATAGRAM_LEN, MAX_IPV6_DATAGRAM_LEN);
        Ok(self)
    }

    /// Sets the buffered byte counts at which reading pauses and resumes.
    ///
    /// Both are clamped to their ranges. A low watermark that is not below the high one is
    /// replaced by half the high watermark.
    pub fn with_watermarks(mut self, high: usize, low: usize) -> Result<Self, Error> {
        let high = high.clamp(HIGH_WATERMARK_RANGE.0, HIGH_WATERMARK_RANGE.1);
        let mut low = low.clamp(LOW_WATERMARK_RANGE.0, LOW_WATERMARK_RANGE.1);
        if low >= high {
            low = high / 2;
        }
        self.high_watermark = high;
        self.low_watermark = low;
        Ok(self)
    }

    /// Sets the versions in order of preference
    pub fn with_enabled_versions(mut self, versions: &[u32]) -> Result<Self, Error> {
        if versions.is_empty() {
            return Err(Error::InvalidConfig("no version is enabled"));
        }
        if let Some(unsupported) = versions.iter().find(|v| !version::is_supported(**v)) {
            tracing::debug!(version = unsupported, "rejecting unsupported version");
            return Err(Error::InvalidConfig("enabled versions must be QUIC v1 or v2"));
        }
        self.enabled_versions = versions.to_vec();
        Ok(self)
    }

    pub fn with_limits(mut self, limits: Limits) -> Result<Self, Error> {
        self.limits = limits;
        Ok(self)
    }

    /// Servers answer Initials without a token with a Retry when enabled
    pub fn with_retry(mut self, enabled: bool) -> Result<Self, Error> {
        if enabled && self.role.is_client() {
            return Err(Error::InvalidConfig("only servers send Retry packets"));
        }
        self.retry = enabled;
        Ok(self)
    }

    #[inline]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn local_id_len(&self) -> usize {
        self.local_id_len
    }

    #[inline]
    pub fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }

    #[inline]
    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }

    #[inline]
    pub fn low_watermark(&self) -> usize {
        self.low_watermark
    }

    #[inline]
    pub fn enabled_versions(&self) -> &[u32] {
        &self.enabled_versions
    }

    #[inline]
    pub fn limits(&self) -> Limits {
        self.limits
    }

    #[inline]
    pub fn retry(&self) -> bool {
        self.retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::server();
        assert_eq!(&**config.name(), "server");
        assert_eq!(config.local_id_len(), 8);
        assert_eq!(config.max_datagram_size(), 1200);
        assert_eq!(config.high_watermark(), 512 * KIB);
        assert_eq!(config.low_watermark(), 384 * KIB);
        assert_eq!(config.enabled_versions(), &[version::QUIC_V1, version::QUIC_V2]);
        assert!(!config.retry());
    }

    #[test]
    fn sizes_are_clamped() {
        let config = Config::client().with_max_datagram_size(100).unwrap();
        assert_eq!(config.max_datagram_size(), MIN_INITIAL_DATAGRAM_LEN);
        let config = config.with_max_datagram_size(1 << 20).unwrap();
        assert_eq!(config.max_datagram_size(), MAX_IPV6_DATAGRAM_LEN);

        let config = config.with_watermarks(1, 1).unwrap();
        assert_eq!(config.high_watermark(), 128 * KIB);
        assert_eq!(config.low_watermark(), 64 * KIB);

        let config = config.with_watermarks(64 * MIB, 64 * MIB).unwrap();
        assert_eq!(config.high_watermark(), 6 * MIB);
        assert_eq!(config.low_watermark(), 3 * MIB);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(Config::client().with_local_id_len(3).is_err());
        assert!(Config::client().with_local_id_len(21).is_err());
        assert!(Config::client().with_name("").is_err());
        assert!(Config::client().with_enabled_versions(&[]).is_err());
        assert!(Config::client().with_enabled_versions(&[0x0a0a_0a0a]).is_err());
        assert!(Config::client().with_retry(true).is_err());

        let config = Config::server()
            .with_retry(true)
            .and_then(|config| config.with_enabled_versions(&[version::QUIC_V2]))
            .unwrap();
        assert!(config.retry());
        assert_eq!(config.enabled_versions(), &[version::QUIC_V2]);
    }
}
