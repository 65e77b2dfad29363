// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::time::Timestamp;
use core::time::Duration;
use std::time::Instant;

/// A `Clock` is a source of [`Timestamp`]s.
///
/// Clocks are shared between the network read path, the application write path and timer
/// threads, so implementations must be thread-safe.
pub trait Clock: Send + Sync {
    /// Returns the current [`Timestamp`]
    fn get_time(&self) -> Timestamp;
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    #[inline]
    fn get_time(&self) -> Timestamp {
        (**self).get_time()
    }
}

impl Clock for Timestamp {
    #[inline]
    fn get_time(&self) -> Timestamp {
        *self
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StdClock {
    epoch: Instant,
}

impl Default for StdClock {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl StdClock {
    /// Creates a new `StdClock` with the given epoch
    pub const fn new(epoch: Instant) -> Self {
        Self { epoch }
    }

    /// Converts a timestamp from this clock back into an `Instant`
    pub fn instant(&self, timestamp: Timestamp) -> Instant {
        self.epoch + timestamp.as_duration()
    }
}

impl Clock for StdClock {
    fn get_time(&self) -> Timestamp {
        Timestamp::from_duration(self.epoch.elapsed())
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// A manually advanced clock shared by every clone
    #[derive(Clone, Debug)]
    pub struct Clock(Arc<AtomicU64>);

    impl Default for Clock {
        fn default() -> Self {
            // start away from zero so subtractions in tests never saturate by accident
            Self(Arc::new(AtomicU64::new(1_000_000)))
        }
    }

    impl Clock {
        pub fn advance(&self, duration: Duration) {
            self.0
                .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
        }

        pub fn set(&self, timestamp: Timestamp) {
            self.0.store(timestamp.as_micros(), Ordering::SeqCst);
        }
    }

    impl super::Clock for Clock {
        fn get_time(&self) -> Timestamp {
            Timestamp::from_micros(self.0.load(Ordering::SeqCst))
        }
    }
}
