// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

mod next_ack;
mod ranges;

pub use next_ack::NextAckFrame;

use core::time::Duration;
use tern_quic_core::packet::number::PacketNumberSpace;

//= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.1
//# An endpoint MUST acknowledge all ack-eliciting Initial and Handshake
//# packets immediately
/// The advertised `max_ack_delay` minus the expected timer latency
pub const APPLICATION_ACK_DELAY: Duration = Duration::from_millis(25 - 16);

/// The longest an ack-eliciting packet waits for its acknowledgement in `space`
#[inline]
pub fn max_ack_delay(space: PacketNumberSpace) -> Duration {
    if space.is_application_data() {
        APPLICATION_ACK_DELAY
    } else {
        Duration::ZERO
    }
}
