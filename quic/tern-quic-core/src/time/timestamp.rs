// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::{fmt, ops, time::Duration};

/// An absolute point in time, measured from the epoch of the [`Clock`](super::Clock) that
/// produced it.
///
/// Timestamps from different clocks must not be compared.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Duration);

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({:?})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0.as_secs(), self.0.subsec_micros())
    }
}

impl Timestamp {
    #[inline]
    pub const fn from_duration(duration: Duration) -> Self {
        Self(duration)
    }

    #[inline]
    pub const fn from_micros(micros: u64) -> Self {
        Self(Duration::from_micros(micros))
    }

    /// Returns the duration since the clock epoch
    #[inline]
    pub const fn as_duration(self) -> Duration {
        self.0
    }

    #[inline]
    pub fn as_micros(self) -> u64 {
        self.0.as_micros() as u64
    }

    /// Returns the time elapsed from `earlier` to `self`, or zero if `earlier` is later
    #[inline]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    #[inline]
    pub fn checked_add(self, duration: Duration) -> Option<Self> {
        self.0.checked_add(duration).map(Self)
    }

    #[inline]
    pub fn checked_sub(self, duration: Duration) -> Option<Self> {
        self.0.checked_sub(duration).map(Self)
    }

    /// Returns true if `now` is at or after this timestamp
    #[inline]
    pub fn has_elapsed(self, now: Self) -> bool {
        self <= now
    }
}

impl ops::Add<Duration> for Timestamp {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Duration) -> Self {
        Self(self.0.saturating_add(rhs))
    }
}

impl ops::AddAssign<Duration> for Timestamp {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl ops::Sub<Duration> for Timestamp {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Duration) -> Self {
        Self(self.0.saturating_sub(rhs))
    }
}

impl ops::Sub for Timestamp {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Self) -> Duration {
        self.saturating_duration_since(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_saturates() {
        let a = Timestamp::from_micros(10);
        let b = a + Duration::from_micros(5);
        assert_eq!(b - a, Duration::from_micros(5));
        assert_eq!(a - b, Duration::ZERO);
        assert_eq!(a - Duration::from_secs(1), Timestamp::default());
        assert!(a.has_elapsed(b));
        assert!(!b.has_elapsed(a));
    }
}
