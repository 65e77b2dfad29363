// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Loss detection, the connection state machine and endpoint dispatch for QUIC v1 and v2.

#![deny(unused_must_use)]

mod ack;
mod transmission;

pub mod connection;
pub mod endpoint;
pub mod path;
pub mod recovery;
pub mod stream;
pub mod sync;
pub mod timer;
pub mod tls;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
