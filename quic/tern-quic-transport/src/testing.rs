// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the tests of this crate and its dependents

/// Installs a global `tracing` subscriber writing to the test output.
///
/// The level defaults to DEBUG and can be changed with `TERN_LOG`, e.g.
/// `TERN_LOG=tern_quic_transport=trace`.
pub fn init_tracing() {
    use std::sync::Once;

    static TRACING: Once = Once::new();

    // make sure this only gets initialized once
    TRACING.call_once(|| {
        let default_level = if std::env::var("CI").is_ok() {
            tracing::Level::INFO
        } else {
            tracing::Level::DEBUG
        };

        let Ok(env_filter) = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(default_level.into())
            .with_env_var("TERN_LOG")
            .from_env()
        else {
            return;
        };

        let format = tracing_subscriber::fmt::format().compact();

        // another harness may already own the global subscriber
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .event_format(format)
            .with_test_writer()
            .try_init();
    });
}
