// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod congestion_controller;
mod new_reno;
mod rtt_estimator;

pub use congestion_controller::CongestionController;
pub use new_reno::NewReno;
pub use rtt_estimator::*;

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.1
//# The RECOMMENDED initial value for the packet reordering threshold
//# (kPacketThreshold) is 3, based on best practices for TCP loss
//# detection [RFC5681] [RFC6675].
pub const K_PACKET_THRESHOLD: u64 = 3;
