// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! What is left of a connection in the routing table once it starts tearing down

use super::Endpoint;
use crate::{
    connection::ClosedConnection,
    timer::{EventId, TimedEvent, TimerQueue},
};
use bytes::Bytes;
use core::time::Duration;
use parking_lot::Mutex;
use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};
use tern_quic_core::{connection, stateless_reset, time::Timestamp};
use tracing::trace;

/// Replies stop after this many packets were answered
const MAX_REPLIES: u32 = 5;

/// What to do with a packet addressed to a closing or draining connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Reply {
    Drop,
    Send,
    /// Send one last time, then forget the connection
    SendAndRemove,
}

/// Answers the 1st, 3rd, 7th, 15th... packet so a peer that keeps sending gets replies at a
/// decreasing frequency
#[derive(Debug, Default)]
pub(crate) struct ReplySchedule {
    received: u32,
    replies: u32,
}

impl ReplySchedule {
    pub fn on_packet(&mut self) -> Reply {
        self.received = self.received.saturating_add(1);
        if !(self.received + 1).is_power_of_two() {
            return Reply::Drop;
        }
        self.replies += 1;
        if self.replies >= MAX_REPLIES {
            Reply::SendAndRemove
        } else {
            Reply::Send
        }
    }
}

#[derive(Debug)]
struct State {
    schedule: ReplySchedule,
    deadline: Option<Timestamp>,
}

/// A closing (replays its CONNECTION_CLOSE datagrams) or draining (stays silent) connection
#[derive(Debug)]
pub(crate) struct Placeholder {
    tag: Arc<str>,
    this: Weak<Self>,
    endpoint: Weak<Endpoint>,
    timers: Arc<TimerQueue>,
    timer_id: EventId,
    peer: SocketAddr,
    pub(super) ids: Vec<connection::Id>,
    pub(super) reset_tokens: Vec<stateless_reset::Token>,
    close_datagrams: Vec<Bytes>,
    timeout: Duration,
    state: Mutex<State>,
}

impl Placeholder {
    pub fn new(
        tag: &str,
        endpoint: Weak<Endpoint>,
        timers: Arc<TimerQueue>,
        ids: Vec<connection::Id>,
        closed: ClosedConnection,
    ) -> Arc<Self> {
        let kind = if closed.is_draining() {
            "draining"
        } else {
            "closing"
        };
        let timer_id = timers.new_event_id();
        Arc::new_cyclic(|this| Self {
            tag: format!("{tag}:{kind}").into(),
            this: this.clone(),
            endpoint,
            timers,
            timer_id,
            peer: closed.peer,
            ids,
            reset_tokens: closed.reset_tokens,
            close_datagrams: closed.close_datagrams,
            timeout: closed.timeout,
            state: Mutex::new(State {
                schedule: ReplySchedule::default(),
                deadline: None,
            }),
        })
    }

    #[inline]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn is_draining(&self) -> bool {
        self.close_datagrams.is_empty()
    }

    /// Arms the idle deadline
    pub fn start(&self, now: Timestamp) {
        let deadline = now + self.timeout;
        self.state.lock().deadline = Some(deadline);
        self.reschedule(Some(deadline));
    }

    /// Handles an incoming packet and returns the datagrams to answer it with
    pub fn on_packet(&self, now: Timestamp) -> (Reply, &[Bytes]) {
        let reply = {
            let mut state = self.state.lock();
            let reply = state.schedule.on_packet();
            if reply == Reply::Send {
                state.deadline = Some(now + self.timeout);
            }
            reply
        };
        trace!(tag = %self.tag, ?reply, "packet for closed connection");
        if self.is_draining() {
            return (reply, &[]);
        }
        (reply, self.close_datagrams.as_slice())
    }

    /// Stops the timer; the endpoint removes the routes
    pub fn stop(&self) {
        self.state.lock().deadline = None;
        self.timers.cancel(self.timer_id);
    }

    fn reschedule(&self, deadline: Option<Timestamp>) {
        let event: Weak<dyn TimedEvent> = self.this.clone();
        self.timers.reschedule(self.timer_id, event, deadline);
    }
}

impl TimedEvent for Placeholder {
    fn refresh_deadline(&self) -> Option<Timestamp> {
        self.state.lock().deadline
    }

    fn handle(&self, _now: Timestamp) -> Option<Timestamp> {
        trace!(tag = %self.tag, "closed connection expired");
        self.state.lock().deadline = None;
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.remove_placeholder(self);
        }
        None
    }
}
