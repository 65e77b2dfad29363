// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lock-light building blocks shared by the engines, connections and endpoints

mod executor;
mod sequential;
mod snapshot;

pub use executor::{Executor, Inline, Task};
pub use sequential::SequentialScheduler;
pub use snapshot::AtomicSnapshot;
