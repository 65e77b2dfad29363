// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

mod manager;
mod ping;

pub use manager::Manager;
pub use ping::{PingError, PingFuture};
