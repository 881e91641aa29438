//! FIFO event mailbox.

use parking_lot::{Condvar, Mutex};
use statecraft_core::Event;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct QueueState {
    events: VecDeque<Event>,
    /// Bumped by `interrupt`; blocked dequeues compare against their start value.
    interrupts: u64,
}

#[derive(Default)]
struct Inner {
    state: Mutex<QueueState>,
    available: Condvar,
}

/// A thread-safe FIFO of events.
///
/// Clones share the same queue.
#[derive(Clone, Default)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue").field("len", &self.len()).finish()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event and wakes one waiter.
    pub fn enqueue(&self, event: Event) {
        let mut state = self.inner.state.lock();
        tracing::trace!(event = %event.name, depth = state.events.len() + 1, "enqueue");
        state.events.push_back(event);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Puts an event back at the head of the queue.
    pub fn requeue_front(&self, event: Event) {
        let mut state = self.inner.state.lock();
        state.events.push_front(event);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Removes the head of the queue.
    ///
    /// Returns immediately if an event is available. Otherwise blocks for up
    /// to `timeout` (`Some(Duration::ZERO)` polls, `None` waits forever) and
    /// returns `None` if nothing arrived or the queue was interrupted.
    pub fn dequeue(&self, timeout: Option<Duration>) -> Option<Event> {
        self.dequeue_inner(None, timeout)
    }

    /// Current interrupt generation, for [`dequeue_since`](Self::dequeue_since).
    pub fn interrupt_token(&self) -> u64 {
        self.inner.state.lock().interrupts
    }

    /// Like [`dequeue`](Self::dequeue), but an interrupt that happened after
    /// `token` was taken also ends the wait, even if it came before the call.
    pub fn dequeue_since(&self, token: u64, timeout: Option<Duration>) -> Option<Event> {
        self.dequeue_inner(Some(token), timeout)
    }

    fn dequeue_inner(&self, token: Option<u64>, timeout: Option<Duration>) -> Option<Event> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let forever = timeout.is_none() || deadline.is_none();

        let mut state = self.inner.state.lock();
        let generation = token.unwrap_or(state.interrupts);
        loop {
            if let Some(event) = state.events.pop_front() {
                tracing::trace!(event = %event.name, "dequeue");
                return Some(event);
            }
            if state.interrupts != generation {
                return None;
            }
            if forever {
                self.inner.available.wait(&mut state);
                continue;
            }
            let Some(deadline) = deadline else {
                return None;
            };
            if Instant::now() >= deadline {
                return None;
            }
            self.inner.available.wait_until(&mut state, deadline);
        }
    }

    /// Non-blocking dequeue.
    pub fn try_dequeue(&self) -> Option<Event> {
        self.dequeue(Some(Duration::ZERO))
    }

    /// Wakes every blocked `dequeue`, which then returns `None`.
    pub fn interrupt(&self) {
        let mut state = self.inner.state.lock();
        state.interrupts = state.interrupts.wrapping_add(1);
        drop(state);
        self.inner.available.notify_all();
    }

    /// Drops all queued events without waking anyone.
    pub fn reset(&self) {
        self.inner.state.lock().events.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().events.is_empty()
    }

    /// Copies the queued events in order.
    pub fn serialize(&self) -> Vec<Event> {
        self.inner.state.lock().events.iter().cloned().collect()
    }

    /// Replaces the queued events.
    pub fn deserialize(&self, events: Vec<Event>) {
        let mut state = self.inner.state.lock();
        state.events = events.into();
        let waiting = !state.events.is_empty();
        drop(state);
        if waiting {
            self.inner.available.notify_all();
        }
    }

    /// Returns true if both handles refer to the same queue.
    pub fn same_queue(&self, other: &EventQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
