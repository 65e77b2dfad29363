// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::time::Timestamp;
use core::{
    cmp::{max, min},
    time::Duration,
};

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.2
//# When no previous RTT is available, the initial RTT
//# SHOULD be set to 333 milliseconds.
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(333);

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
//# The RECOMMENDED value of the
//# timer granularity (kGranularity) is 1 millisecond.
pub const K_GRANULARITY: Duration = Duration::from_millis(1);

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
//# The RECOMMENDED time threshold (kTimeThreshold), expressed as an
//# RTT multiplier, is 9/8.
const K_TIME_THRESHOLD_NUMERATOR: u32 = 9;
const K_TIME_THRESHOLD_DENOMINATOR: u32 = 8;

/// The backoff multiplier beyond which repeated probe timeouts may abort the connection
pub const MAX_PTO_BACKOFF: u32 = 32;

/// The backed-off probe timeout has to reach this before the connection is aborted
pub const MIN_PTO_BACKOFF_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound of a single backed-off probe timeout
pub const MAX_PTO_BACKOFF_TIMEOUT: Duration = Duration::from_secs(240);

/// RTT statistics and the probe timeout backoff shared by all packet number spaces of a
/// connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RttEstimator {
    /// Latest RTT sample
    latest_rtt: Duration,
    /// The minimum value observed over the lifetime of the connection
    min_rtt: Duration,
    /// An exponentially-weighted moving average
    smoothed_rtt: Duration,
    /// The variance in the observed RTT samples
    rttvar: Duration,
    /// The time that the first RTT sample was obtained
    first_rtt_sample: Option<Timestamp>,
    /// Multiplier applied to the probe timeout; doubles on each firing
    pto_backoff: u32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_RTT)
    }
}

impl RttEstimator {
    //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
    //# smoothed_rtt = kInitialRtt
    //# rttvar = kInitialRtt / 2
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            latest_rtt: Duration::ZERO,
            min_rtt: Duration::ZERO,
            smoothed_rtt: initial_rtt,
            rttvar: initial_rtt / 2,
            first_rtt_sample: None,
            pto_backoff: 1,
        }
    }

    #[inline]
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    #[inline]
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    #[inline]
    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    #[inline]
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    #[inline]
    pub fn first_rtt_sample(&self) -> Option<Timestamp> {
        self.first_rtt_sample
    }

    /// Folds a new sample into the estimate.
    ///
    /// `ack_delay` must already be zeroed for the Initial and Handshake spaces and capped by
    /// the peer's max_ack_delay once the handshake is confirmed.
    pub fn update_rtt(&mut self, ack_delay: Duration, rtt_sample: Duration, timestamp: Timestamp) {
        self.latest_rtt = rtt_sample.max(K_GRANULARITY);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# min_rtt = latest_rtt
        //# smoothed_rtt = latest_rtt
        //# rttvar = latest_rtt / 2
        if self.first_rtt_sample.is_none() {
            self.first_rtt_sample = Some(timestamp);
            self.min_rtt = self.latest_rtt;
            self.smoothed_rtt = self.latest_rtt;
            self.rttvar = self.latest_rtt / 2;
            return;
        }

        self.min_rtt = min(self.min_rtt, self.latest_rtt);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# adjusted_rtt = latest_rtt
        //# if (latest_rtt >= min_rtt + ack_delay):
        //#   adjusted_rtt = latest_rtt - ack_delay
        let mut adjusted_rtt = self.latest_rtt;
        if self.latest_rtt >= self.min_rtt + ack_delay {
            adjusted_rtt -= ack_delay;
        }

        //# smoothed_rtt = 7/8 * smoothed_rtt + 1/8 * adjusted_rtt
        //# rttvar_sample = abs(smoothed_rtt - adjusted_rtt)
        //# rttvar = 3/4 * rttvar + 1/4 * rttvar_sample
        let rttvar_sample = abs_difference(self.smoothed_rtt, adjusted_rtt);
        self.smoothed_rtt = 7 * self.smoothed_rtt / 8 + adjusted_rtt / 8;
        self.rttvar = 3 * self.rttvar / 4 + rttvar_sample / 4;
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
    //# PTO = smoothed_rtt + max(4*rttvar, kGranularity) + max_ack_delay
    /// The probe timeout without the peer's max_ack_delay and without backoff
    #[inline]
    pub fn base_pto(&self) -> Duration {
        self.smoothed_rtt + max(4 * self.rttvar, K_GRANULARITY)
    }

    /// The backed-off probe timeout including the peer's `max_ack_delay`
    #[inline]
    pub fn pto_period(&self, max_ack_delay: Duration) -> Duration {
        let period = (self.base_pto() + max_ack_delay).saturating_mul(self.pto_backoff);
        min(period, MAX_PTO_BACKOFF_TIMEOUT)
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
    //# max(kTimeThreshold * max(smoothed_rtt, latest_rtt), kGranularity)
    /// How long a packet sent before a later acknowledged one may stay unacknowledged before
    /// it is declared lost
    #[inline]
    pub fn loss_time_threshold(&self) -> Duration {
        let rtt = max(self.smoothed_rtt, self.latest_rtt);
        max(
            rtt * K_TIME_THRESHOLD_NUMERATOR / K_TIME_THRESHOLD_DENOMINATOR,
            K_GRANULARITY,
        )
    }

    /// Persistent congestion is declared when lost packets span more than this.
    ///
    /// The threshold is computed from the base PTO rather than the full PTO; lost batches
    /// crossing it collapse the window early.
    #[inline]
    pub fn persistent_congestion_duration(&self, max_ack_delay: Duration) -> Duration {
        (self.base_pto() + max_ack_delay) * 3
    }

    /// Allows min_rtt and smoothed_rtt to be overwritten on the next RTT sample
    /// after persistent congestion is established.
    #[inline]
    pub fn on_persistent_congestion(&mut self) {
        self.first_rtt_sample = None;
    }

    #[inline]
    pub fn pto_backoff(&self) -> u32 {
        self.pto_backoff
    }

    /// Doubles the backoff and returns the new value
    #[inline]
    pub fn increase_pto_backoff(&mut self) -> u32 {
        self.pto_backoff = self.pto_backoff.saturating_mul(2);
        self.pto_backoff
    }

    #[inline]
    pub fn reset_pto_backoff(&mut self) {
        self.pto_backoff = 1;
    }

    /// Returns true once probing has backed off far and long enough to give up
    #[inline]
    pub fn is_pto_backoff_exceeded(&self) -> bool {
        self.pto_backoff > MAX_PTO_BACKOFF
            && self.base_pto().saturating_mul(self.pto_backoff) >= MIN_PTO_BACKOFF_TIMEOUT
    }
}

fn abs_difference(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Timestamp {
        Timestamp::from_micros(1)
    }

    #[test]
    fn initial_rtt() {
        let rtt_estimator = RttEstimator::default();
        assert_eq!(rtt_estimator.min_rtt(), Duration::ZERO);
        assert_eq!(rtt_estimator.latest_rtt(), Duration::ZERO);
        assert_eq!(rtt_estimator.smoothed_rtt(), DEFAULT_INITIAL_RTT);
        assert_eq!(rtt_estimator.rttvar(), DEFAULT_INITIAL_RTT / 2);
        assert_eq!(
            rtt_estimator.base_pto(),
            DEFAULT_INITIAL_RTT + 2 * DEFAULT_INITIAL_RTT
        );
    }

    /// A zero RTT value is treated as 1 ms
    #[test]
    fn zero_rtt_sample() {
        let mut rtt_estimator = RttEstimator::default();
        rtt_estimator.update_rtt(Duration::from_millis(10), Duration::ZERO, now());
        assert_eq!(rtt_estimator.min_rtt(), K_GRANULARITY);
        assert_eq!(rtt_estimator.latest_rtt(), K_GRANULARITY);
        assert_eq!(rtt_estimator.first_rtt_sample(), Some(now()));
    }

    #[test]
    fn update_rtt() {
        let mut rtt_estimator = RttEstimator::default();
        let rtt_sample = Duration::from_millis(500);
        rtt_estimator.update_rtt(Duration::from_millis(10), rtt_sample, now());

        assert_eq!(rtt_estimator.min_rtt(), rtt_sample);
        assert_eq!(rtt_estimator.smoothed_rtt(), rtt_sample);
        assert_eq!(rtt_estimator.rttvar(), rtt_sample / 2);

        let prev_smoothed_rtt = rtt_estimator.smoothed_rtt();
        let rtt_sample = Duration::from_millis(800);
        let ack_delay = Duration::from_millis(10);
        rtt_estimator.update_rtt(ack_delay, rtt_sample, now() + Duration::from_secs(1));

        let adjusted_rtt = rtt_sample - ack_delay;
        assert_eq!(rtt_estimator.min_rtt(), prev_smoothed_rtt);
        assert_eq!(rtt_estimator.latest_rtt(), rtt_sample);
        assert_eq!(
            rtt_estimator.smoothed_rtt(),
            7 * prev_smoothed_rtt / 8 + adjusted_rtt / 8
        );
        assert_eq!(rtt_estimator.first_rtt_sample(), Some(now()));

        // a new minimum is not adjusted by the ack delay
        let prev_smoothed_rtt = rtt_estimator.smoothed_rtt();
        let rtt_sample = Duration::from_millis(200);
        rtt_estimator.update_rtt(ack_delay, rtt_sample, now() + Duration::from_secs(2));
        assert_eq!(rtt_estimator.min_rtt(), rtt_sample);
        assert_eq!(
            rtt_estimator.smoothed_rtt(),
            7 * prev_smoothed_rtt / 8 + rtt_sample / 8
        );
    }

    #[test]
    fn loss_time_threshold_uses_larger_rtt() {
        let mut rtt_estimator = RttEstimator::default();
        rtt_estimator.update_rtt(Duration::ZERO, Duration::from_millis(80), now());
        assert_eq!(rtt_estimator.loss_time_threshold(), Duration::from_millis(90));
        rtt_estimator.update_rtt(Duration::ZERO, Duration::from_millis(160), now());
        assert_eq!(rtt_estimator.loss_time_threshold(), Duration::from_millis(180));
    }

    #[test]
    fn pto_backoff() {
        let mut rtt_estimator = RttEstimator::default();
        rtt_estimator.update_rtt(Duration::ZERO, Duration::from_millis(100), now());
        let base = rtt_estimator.base_pto();
        assert_eq!(base, Duration::from_millis(300));
        let max_ack_delay = Duration::from_millis(25);
        assert_eq!(rtt_estimator.pto_period(max_ack_delay), base + max_ack_delay);

        assert_eq!(rtt_estimator.increase_pto_backoff(), 2);
        assert_eq!(rtt_estimator.increase_pto_backoff(), 4);
        assert_eq!(
            rtt_estimator.pto_period(max_ack_delay),
            (base + max_ack_delay) * 4
        );

        for _ in 0..10 {
            rtt_estimator.increase_pto_backoff();
        }
        assert_eq!(rtt_estimator.pto_period(max_ack_delay), MAX_PTO_BACKOFF_TIMEOUT);
        assert!(rtt_estimator.is_pto_backoff_exceeded());

        rtt_estimator.reset_pto_backoff();
        assert_eq!(rtt_estimator.pto_backoff(), 1);
        assert!(!rtt_estimator.is_pto_backoff_exceeded());
    }

    #[test]
    fn backoff_needs_minimum_timeout_to_abort() {
        let mut rtt_estimator = RttEstimator::default();
        rtt_estimator.update_rtt(Duration::ZERO, Duration::from_micros(100), now());
        for _ in 0..6 {
            rtt_estimator.increase_pto_backoff();
        }
        assert_eq!(rtt_estimator.pto_backoff(), 64);
        // 64 * ~1ms is far below the minimum abort timeout
        assert!(!rtt_estimator.is_pto_backoff_exceeded());
    }

    #[test]
    fn persistent_congestion_uses_base_pto() {
        let mut rtt_estimator = RttEstimator::default();
        rtt_estimator.update_rtt(Duration::ZERO, Duration::from_millis(100), now());
        assert_eq!(
            rtt_estimator.persistent_congestion_duration(Duration::from_millis(25)),
            Duration::from_millis(975)
        );
    }
}
