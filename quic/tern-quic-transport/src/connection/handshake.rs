// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::TerminationCause;
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct State {
    result: Option<Result<(), TerminationCause>>,
    wakers: Vec<Waker>,
}

/// Completion side of the handshake, owned by the connection
#[derive(Debug, Default)]
pub(crate) struct HandshakeSignal {
    state: Arc<Mutex<State>>,
}

impl HandshakeSignal {
    pub fn future(&self) -> HandshakeFuture {
        HandshakeFuture {
            state: self.state.clone(),
        }
    }

    /// Completes every future once; later calls are ignored
    pub fn complete(&self, result: Result<(), TerminationCause>) -> bool {
        let wakers = {
            let mut state = self.state.lock();
            if state.result.is_some() {
                return false;
            }
            state.result = Some(result);
            core::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().result.is_some()
    }
}

/// Resolves when the handshake completes or the connection terminates first
#[derive(Clone, Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct HandshakeFuture {
    state: Arc<Mutex<State>>,
}

impl Future for HandshakeFuture {
    type Output = Result<(), TerminationCause>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        if let Some(result) = &state.result {
            return Poll::Ready(result.clone());
        }
        if !state.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_test::task::{new_count_waker, noop_context};

    #[test]
    fn wakes_every_waiter_once() {
        let signal = HandshakeSignal::default();
        let mut first = signal.future();
        let mut second = first.clone();

        let (waker, count) = new_count_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut first).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut first).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut second).poll(&mut cx).is_pending());

        assert!(signal.complete(Ok(())));
        assert_eq!(count.get(), 1);
        assert!(!signal.complete(Err(TerminationCause::IdleTimeout)));

        assert_eq!(Pin::new(&mut first).poll(&mut cx), Poll::Ready(Ok(())));
        assert_eq!(Pin::new(&mut second).poll(&mut cx), Poll::Ready(Ok(())));
    }

    #[test]
    fn late_futures_see_the_failure() {
        let signal = HandshakeSignal::default();
        signal.complete(Err(TerminationCause::StatelessReset));
        let mut future = signal.future();
        assert_eq!(
            Pin::new(&mut future).poll(&mut noop_context()),
            Poll::Ready(Err(TerminationCause::StatelessReset))
        );
        assert!(signal.is_complete());
    }
}
