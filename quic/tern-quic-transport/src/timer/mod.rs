// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A deadline-ordered queue of cancellable timed events.
//!
//! Every component that needs to wake up later (the per-space loss detection engines,
//! connection idle and handshake timers, closing placeholders) registers itself here under
//! an [`EventId`]. A single driver calls [`TimerQueue::process_events`] when the earliest
//! deadline passes; events re-arm themselves by returning their next deadline.

use atomic_waker::AtomicWaker;
use core::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    task::{Context, Poll},
};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};
use tern_quic_core::time::Timestamp;

pub type EventId = u64;

/// A component the queue can fire
pub trait TimedEvent: Send + Sync {
    /// Returns the current deadline of the event.
    ///
    /// Called right before firing, since the deadline that was registered may be stale.
    fn refresh_deadline(&self) -> Option<Timestamp>;

    /// Fires the event and returns the next deadline, if any
    fn handle(&self, now: Timestamp) -> Option<Timestamp>;
}

#[derive(Default)]
struct State {
    by_deadline: BTreeMap<(Timestamp, EventId), Weak<dyn TimedEvent>>,
    deadlines: HashMap<EventId, Timestamp>,
}

impl State {
    fn remove(&mut self, id: EventId) -> Option<Weak<dyn TimedEvent>> {
        let deadline = self.deadlines.remove(&id)?;
        self.by_deadline.remove(&(deadline, id))
    }

    fn insert(&mut self, id: EventId, deadline: Timestamp, event: Weak<dyn TimedEvent>) {
        self.deadlines.insert(id, deadline);
        self.by_deadline.insert((deadline, id), event);
    }

    fn head(&self) -> Option<Timestamp> {
        self.by_deadline.keys().next().map(|(deadline, _)| *deadline)
    }
}

#[derive(Default)]
pub struct TimerQueue {
    next_id: AtomicU64,
    state: Mutex<State>,
    changed: AtomicBool,
    waker: AtomicWaker,
}

impl core::fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimerQueue")
            .field("len", &self.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}

impl TimerQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocates an id for a new event
    pub fn new_event_id(&self) -> EventId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Moves the event to `deadline`, or removes it when `deadline` is `None`
    pub fn reschedule(&self, id: EventId, event: Weak<dyn TimedEvent>, deadline: Option<Timestamp>) {
        let wake = {
            let mut state = self.state.lock();
            let previous_head = state.head();
            state.remove(id);
            if let Some(deadline) = deadline {
                state.insert(id, deadline, event);
            }
            match (previous_head, state.head()) {
                (None, Some(_)) => true,
                (Some(previous), Some(head)) => head < previous,
                _ => false,
            }
        };

        if wake {
            self.changed.store(true, Ordering::Release);
            self.waker.wake();
        }
    }

    pub fn cancel(&self, id: EventId) {
        self.state.lock().remove(id);
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.state.lock().head()
    }

    pub fn len(&self) -> usize {
        self.state.lock().deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `id` is currently armed
    pub fn is_armed(&self, id: EventId) -> bool {
        self.state.lock().deadlines.contains_key(&id)
    }

    /// Returns the deadline registered for `id`
    pub fn deadline(&self, id: EventId) -> Option<Timestamp> {
        self.state.lock().deadlines.get(&id).copied()
    }

    /// Fires every event due at `now` and returns the next deadline.
    ///
    /// Each due event fires at most once per call; an event that immediately re-arms
    /// for a time at or before `now` is picked up by the next call.
    pub fn process_events(&self, now: Timestamp) -> Option<Timestamp> {
        let due = {
            let mut state = self.state.lock();
            let mut due = Vec::new();
            while let Some(entry) = state.by_deadline.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                let ((_, id), event) = entry.remove_entry();
                state.deadlines.remove(&id);
                due.push((id, event));
            }
            due
        };

        for (id, weak) in due {
            let Some(event) = weak.upgrade() else {
                continue;
            };

            let next = match event.refresh_deadline() {
                Some(deadline) if deadline > now => Some(deadline),
                None => None,
                Some(_) => event.handle(now),
            };

            // the returned deadline supersedes anything registered while firing
            let mut state = self.state.lock();
            state.remove(id);
            if let Some(next) = next {
                state.insert(id, next, weak);
            }
        }

        self.next_deadline()
    }

    /// Resolves once the earliest deadline moved earlier since the last poll
    pub fn poll_deadline_changed(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.changed.swap(false, Ordering::AcqRel) {
            return Poll::Ready(());
        }
        self.waker.register(cx.waker());
        if self.changed.swap(false, Ordering::AcqRel) {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use futures_test::task::new_count_waker;

    struct Event {
        deadline: Mutex<Option<Timestamp>>,
        fired: AtomicU64,
        rearm: Option<Duration>,
    }

    impl Event {
        fn new(deadline: Timestamp, rearm: Option<Duration>) -> Arc<Self> {
            Arc::new(Self {
                deadline: Mutex::new(Some(deadline)),
                fired: AtomicU64::new(0),
                rearm,
            })
        }
    }

    impl TimedEvent for Event {
        fn refresh_deadline(&self) -> Option<Timestamp> {
            *self.deadline.lock()
        }

        fn handle(&self, now: Timestamp) -> Option<Timestamp> {
            self.fired.fetch_add(1, Ordering::SeqCst);
            let next = self.rearm.map(|delay| now + delay);
            *self.deadline.lock() = next;
            next
        }
    }

    fn weak(event: &Arc<Event>) -> Weak<dyn TimedEvent> {
        let event: Arc<dyn TimedEvent> = event.clone();
        Arc::downgrade(&event)
    }

    #[test]
    fn fires_in_deadline_order_and_rearms() {
        let queue = TimerQueue::default();
        let start = Timestamp::from_micros(1_000);
        let a = Event::new(start + Duration::from_millis(5), None);
        let b = Event::new(start + Duration::from_millis(1), Some(Duration::from_millis(10)));
        let (id_a, id_b) = (queue.new_event_id(), queue.new_event_id());
        queue.reschedule(id_a, weak(&a), a.refresh_deadline());
        queue.reschedule(id_b, weak(&b), b.refresh_deadline());

        assert_eq!(queue.next_deadline(), b.refresh_deadline());

        let now = start + Duration::from_millis(2);
        assert_eq!(queue.process_events(now), a.refresh_deadline());
        assert_eq!(b.fired.load(Ordering::SeqCst), 1);
        assert_eq!(a.fired.load(Ordering::SeqCst), 0);
        assert_eq!(queue.deadline(id_b), Some(now + Duration::from_millis(10)));

        let now = start + Duration::from_millis(6);
        queue.process_events(now);
        assert_eq!(a.fired.load(Ordering::SeqCst), 1);
        assert!(!queue.is_armed(id_a));
        assert!(queue.is_armed(id_b));
    }

    #[test]
    fn stale_deadline_is_refreshed_before_firing() {
        let queue = TimerQueue::default();
        let start = Timestamp::from_micros(1_000);
        let event = Event::new(start, None);
        let id = queue.new_event_id();
        queue.reschedule(id, weak(&event), Some(start));

        // the component moved its deadline without telling the queue
        let later = start + Duration::from_secs(1);
        *event.deadline.lock() = Some(later);

        assert_eq!(queue.process_events(start), Some(later));
        assert_eq!(event.fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropped_events_are_skipped() {
        let queue = TimerQueue::default();
        let start = Timestamp::from_micros(1_000);
        let event = Event::new(start, None);
        let id = queue.new_event_id();
        queue.reschedule(id, weak(&event), Some(start));
        drop(event);
        assert_eq!(queue.process_events(start), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn earlier_deadline_wakes_driver() {
        let queue = TimerQueue::default();
        let (waker, count) = new_count_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(queue.poll_deadline_changed(&mut cx).is_pending());

        let start = Timestamp::from_micros(1_000);
        let event = Event::new(start, None);
        let id = queue.new_event_id();
        queue.reschedule(id, weak(&event), Some(start + Duration::from_secs(1)));
        assert_eq!(count.get(), 1);
        assert!(queue.poll_deadline_changed(&mut cx).is_ready());

        // a later deadline does not wake
        queue.reschedule(id, weak(&event), Some(start + Duration::from_secs(2)));
        assert_eq!(count.get(), 1);
        queue.cancel(id);
        assert!(queue.is_empty());
    }
}
