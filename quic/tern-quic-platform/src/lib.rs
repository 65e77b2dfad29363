// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runs tern-quic endpoints on real UDP sockets

pub mod io;
