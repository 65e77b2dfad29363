// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicU64, Ordering};

/// A packet-number watermark that only moves forward.
///
/// The counter starts unset. `advance_to` is a compare-and-swap loop so concurrent readers
/// and writers never observe the value moving backwards.
#[derive(Debug)]
pub struct MonotonicCounter(AtomicU64);

const UNSET: u64 = u64::MAX;

impl Default for MonotonicCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicCounter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(UNSET))
    }

    pub const fn with_value(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Returns the current value, or `None` if nothing was ever recorded
    #[inline]
    pub fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::Acquire) {
            UNSET => None,
            value => Some(value),
        }
    }

    /// Returns the current value as a signed number, `-1` when unset
    #[inline]
    pub fn get_or_negative(&self) -> i64 {
        self.get().map_or(-1, |v| v as i64)
    }

    /// Returns true if `value` is at or below the current watermark
    #[inline]
    pub fn covers(&self, value: u64) -> bool {
        self.get().is_some_and(|current| value <= current)
    }

    /// Raises the counter to `value`, returning true if it moved
    #[inline]
    pub fn advance_to(&self, value: u64) -> bool {
        self.fetch_advance(value).is_some()
    }

    /// Raises the counter to `value`, returning the previous value if it moved.
    ///
    /// The previous value is `None` inside the `Some` when the counter was unset.
    #[inline]
    pub fn fetch_advance(&self, value: u64) -> Option<Option<u64>> {
        debug_assert_ne!(value, UNSET);
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current != UNSET && current >= value {
                return None;
            }
            match self.0.compare_exchange_weak(
                current,
                value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return Some((previous != UNSET).then_some(previous)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Clears the counter back to unset
    #[inline]
    pub fn reset(&self) {
        self.0.store(UNSET, Ordering::Release);
    }
}
