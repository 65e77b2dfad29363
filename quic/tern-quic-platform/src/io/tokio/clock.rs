// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tern_quic_core::time::{Clock as ClockTrait, Timestamp};
use tokio::time::{sleep_until, Instant, Sleep};

/// A clock following tokio's time source, so paused test runtimes control it too
#[derive(Clone, Copy, Debug)]
pub struct Clock(Instant);

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self(Instant::now())
    }

    pub fn instant(&self, timestamp: Timestamp) -> Instant {
        self.0 + timestamp.as_duration()
    }

    pub fn timer(&self) -> Timer {
        Timer::new(*self)
    }
}

impl ClockTrait for Clock {
    fn get_time(&self) -> Timestamp {
        Timestamp::from_duration(self.0.elapsed())
    }
}

/// Sleeps until the timestamp it was last reset to. Pending forever while cancelled.
#[derive(Debug)]
pub struct Timer {
    clock: Clock,
    target: Option<Instant>,
    sleep: Pin<Box<Sleep>>,
}

impl Timer {
    fn new(clock: Clock) -> Self {
        Self {
            clock,
            target: None,
            sleep: Box::pin(sleep_until(clock.0)),
        }
    }

    pub fn reset(&mut self, timestamp: Timestamp) {
        let next_time = self.clock.instant(timestamp);
        if Some(next_time) == self.target {
            return;
        }
        self.sleep.as_mut().reset(next_time);
        self.target = Some(next_time);
    }

    pub fn cancel(&mut self) {
        self.target = None;
    }

    pub fn is_armed(&self) -> bool {
        self.target.is_some()
    }
}

impl Future for Timer {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.target.is_none() {
            return Poll::Pending;
        }

        let ready = self.sleep.as_mut().poll(cx);
        if ready.is_ready() {
            self.target = None;
        }
        ready
    }
}
