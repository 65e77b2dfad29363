// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection-level flow control (RFC 9000 section 4.1)

use core::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use tern_quic_core::{frame::tag, transport::TransportError, varint::VarInt};

/// How much stream data we may still send
#[derive(Debug, Default)]
pub struct SendCredit {
    max_data: AtomicU64,
    processed: AtomicU64,
}

impl SendCredit {
    pub fn new(max_data: u64) -> Self {
        Self {
            max_data: AtomicU64::new(max_data),
            processed: AtomicU64::new(0),
        }
    }

    /// Raises the limit from a MAX_DATA frame or the peer's transport parameters.
    ///
    /// Returns true if sending was blocked and now is not.
    pub fn set_max_data(&self, max_data: u64) -> bool {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
        //# A receiver MUST ignore any MAX_STREAM_DATA or MAX_DATA frames that do
        //# not increase flow control limits.
        let previous = self.max_data.fetch_max(max_data, Ordering::AcqRel);
        let processed = self.processed.load(Ordering::Acquire);
        previous <= processed && max_data > processed
    }

    #[inline]
    pub fn max_data(&self) -> u64 {
        self.max_data.load(Ordering::Acquire)
    }

    #[inline]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn credit(&self) -> u64 {
        self.max_data().saturating_sub(self.processed())
    }

    /// Records stream bytes handed to a packet; callers stay within [`Self::credit`]
    pub fn consume(&self, len: u64) {
        debug_assert!(len <= self.credit());
        self.processed.fetch_add(len, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct Window {
    max_data: u64,
    received: u64,
    processed: u64,
    /// The last limit put in a MAX_DATA frame
    advertised: u64,
}

/// How much stream data the peer may still send us
#[derive(Debug)]
pub struct ReceiveWindow {
    desired: u64,
    window: Mutex<Window>,
}

impl ReceiveWindow {
    pub fn new(initial_max_data: u64) -> Self {
        Self {
            desired: initial_max_data,
            window: Mutex::new(Window {
                max_data: initial_max_data,
                received: 0,
                processed: 0,
                advertised: initial_max_data,
            }),
        }
    }

    /// Accounts for `len` newly received bytes
    pub fn on_received(&self, len: u64) -> Result<(), TransportError> {
        let mut window = self.window.lock();
        let received = window.received.saturating_add(len);
        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
        //# A receiver MUST close the connection with an error of type
        //# FLOW_CONTROL_ERROR if the sender violates the advertised connection or
        //# stream data limits
        if received > window.max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR
                .with_reason("connection max data exceeded")
                .with_frame_type(VarInt::from_u8(tag::STREAM)));
        }
        window.received = received;
        Ok(())
    }

    /// Accounts for bytes the application consumed and returns a new limit to advertise,
    /// if the window should grow
    pub fn on_processed(&self, len: u64) -> Option<u64> {
        let mut window = self.window.lock();
        window.processed = window.processed.saturating_add(len);

        if window.max_data.saturating_sub(window.processed) >= self.desired / 2 {
            return None;
        }
        let max_data = window.processed.saturating_add(self.desired);
        if max_data.saturating_sub(window.max_data) < self.desired / 5 {
            return None;
        }
        window.max_data = max_data;
        Some(max_data)
    }

    /// Returns the limit for a MAX_DATA frame if it was raised since the last call
    pub fn take_update(&self) -> Option<u64> {
        let mut window = self.window.lock();
        if window.max_data > window.advertised {
            window.advertised = window.max_data;
            Some(window.max_data)
        } else {
            None
        }
    }

    #[inline]
    pub fn max_data(&self) -> u64 {
        self.window.lock().max_data
    }
}
