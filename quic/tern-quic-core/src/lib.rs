// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod codec;
pub mod connection;
pub mod counter;
pub mod crypto;
pub mod frame;
pub mod packet;
pub mod recovery;
pub mod stateless_reset;
pub mod stream;
pub mod time;
pub mod transport;
pub mod varint;
pub mod version;
