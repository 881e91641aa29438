//! Delayed event delivery.
//!
//! A single timer thread sleeps until the earliest deadline, or indefinitely
//! while nothing is scheduled, and is woken whenever the schedule changes.
//! Expired entries are enqueued into their target [`EventQueue`].

use crate::error::QueueError;
use crate::queue::EventQueue;
use parking_lot::{Condvar, Mutex};
use statecraft_core::Event;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Stale heap entries tolerated beyond the number of live ones before the
/// heap is rebuilt.
const STALE_SLACK: usize = 64;

/// Heap entry. Entries whose `seq` no longer matches the pending record are
/// stale (cancelled or replaced) and are skipped.
#[derive(Debug)]
struct Deadline {
    at: Instant,
    seq: u64,
    id: String,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

struct Scheduled {
    seq: u64,
    at: Instant,
    event: Event,
    target: EventQueue,
    notify: Option<EventQueue>,
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<Deadline>>,
    pending: HashMap<String, Scheduled>,
    next_seq: u64,
    running: bool,
}

impl TimerState {
    /// Drops stale heap entries once they outnumber the live ones.
    fn compact(&mut self) {
        if self.heap.len() <= 2 * self.pending.len() + STALE_SLACK {
            return;
        }
        let before = self.heap.len();
        self.heap = self
            .pending
            .iter()
            .map(|(id, s)| {
                Reverse(Deadline {
                    at: s.at,
                    seq: s.seq,
                    id: id.clone(),
                })
            })
            .collect();
        tracing::trace!(before, after = self.heap.len(), "compacted timer heap");
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// A scheduled event as reported by [`DelayedEventQueue::pending`].
#[derive(Debug, Clone)]
pub struct PendingDelayed {
    pub id: String,
    pub event: Event,
    /// Time left until delivery.
    pub remaining: Duration,
    pub target: EventQueue,
}

/// Cancellable per-id timers.
pub struct DelayedEventQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for DelayedEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayedEventQueue {
    /// Creates a stopped queue. Entries scheduled before [`start`](Self::start)
    /// fire once the timer runs.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            worker: Mutex::new(None),
        }
    }

    /// Starts the timer thread. Starting a running queue does nothing.
    pub fn start(&self) -> Result<(), QueueError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        self.shared.state.lock().running = true;
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("statecraft-timer".to_string())
            .spawn(move || run_timer(shared));

        match handle {
            Ok(handle) => {
                *worker = Some(handle);
                tracing::debug!("delayed event queue started");
                Ok(())
            }
            Err(e) => {
                self.shared.state.lock().running = false;
                Err(QueueError::Spawn(e))
            }
        }
    }

    /// Cancels every entry and joins the timer thread. Stopping a stopped
    /// queue does nothing.
    pub fn stop(&self) {
        let mut worker = self.worker.lock();
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            state.pending.clear();
            state.heap.clear();
        }
        self.shared.wake.notify_all();

        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                tracing::error!("timer thread panicked");
            }
            tracing::debug!("delayed event queue stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Schedules `event` for delivery into `target` after `delay`.
    /// A pending entry with the same id is replaced.
    pub fn enqueue_delayed(
        &self,
        id: impl Into<String>,
        event: Event,
        delay: Duration,
        target: &EventQueue,
    ) {
        self.schedule(id.into(), event, delay, target, None);
    }

    /// Like [`enqueue_delayed`](Self::enqueue_delayed), and interrupts the
    /// waiters of `notify` once the event has been delivered.
    pub fn enqueue_delayed_notify(
        &self,
        id: impl Into<String>,
        event: Event,
        delay: Duration,
        target: &EventQueue,
        notify: &EventQueue,
    ) {
        self.schedule(id.into(), event, delay, target, Some(notify.clone()));
    }

    fn schedule(
        &self,
        id: String,
        event: Event,
        delay: Duration,
        target: &EventQueue,
        notify: Option<EventQueue>,
    ) {
        let now = Instant::now();
        let at = now.checked_add(delay).unwrap_or(now + Duration::from_secs(86_400 * 365));

        let mut state = self.shared.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        tracing::trace!(id = %id, event = %event.name, delay_ms = delay.as_millis() as u64, "schedule");
        let replaced = state.pending.insert(
            id.clone(),
            Scheduled {
                seq,
                at,
                event,
                target: target.clone(),
                notify,
            },
        );
        if replaced.is_some() {
            tracing::trace!(id = %id, "replaced pending entry");
        }
        state.heap.push(Reverse(Deadline { at, seq, id }));
        state.compact();
        drop(state);
        self.shared.wake.notify_all();
    }

    /// Removes a pending entry. Unknown or already fired ids are ignored.
    pub fn cancel_delayed(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.shared.state.lock();
            let removed = state.pending.remove(id).is_some();
            state.compact();
            removed
        };
        if removed {
            tracing::trace!(id = %id, "cancel");
            self.shared.wake.notify_all();
        }
        removed
    }

    /// Removes every pending entry.
    pub fn cancel_all_delayed(&self) {
        let mut state = self.shared.state.lock();
        state.pending.clear();
        state.heap.clear();
        drop(state);
        self.shared.wake.notify_all();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shared.state.lock().pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().pending.is_empty()
    }

    /// Pending entries ordered by deadline.
    pub fn pending(&self) -> Vec<PendingDelayed> {
        let state = self.shared.state.lock();
        let now = Instant::now();
        let mut entries: Vec<(&String, &Scheduled)> = state.pending.iter().collect();
        entries.sort_by_key(|(_, s)| (s.at, s.seq));
        entries
            .into_iter()
            .map(|(id, s)| PendingDelayed {
                id: id.clone(),
                event: s.event.clone(),
                remaining: s.at.saturating_duration_since(now),
                target: s.target.clone(),
            })
            .collect()
    }
}

impl Drop for DelayedEventQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_timer(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    while state.running {
        let now = Instant::now();
        while let Some(Reverse(top)) = state.heap.peek() {
            if top.at > now {
                break;
            }
            let Some(Reverse(due)) = state.heap.pop() else {
                break;
            };
            let live = state
                .pending
                .get(&due.id)
                .is_some_and(|s| s.seq == due.seq);
            if !live {
                continue;
            }
            if let Some(entry) = state.pending.remove(&due.id) {
                tracing::trace!(id = %due.id, event = %entry.event.name, "fire");
                entry.target.enqueue(entry.event);
                if let Some(notify) = entry.notify {
                    notify.interrupt();
                }
            }
        }

        let next = state.heap.peek().map(|Reverse(top)| top.at);
        match next {
            Some(at) => {
                shared.wake.wait_until(&mut state, at);
            }
            None => shared.wake.wait(&mut state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> DelayedEventQueue {
        let timers = DelayedEventQueue::new();
        timers.start().unwrap();
        timers
    }

    #[test]
    fn test_fires_after_delay() {
        let timers = started();
        let target = EventQueue::new();
        let start = Instant::now();
        timers.enqueue_delayed("t1", Event::external("tick"), Duration::from_millis(30), &target);

        let event = target.dequeue(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(event.name, "tick");
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(timers.is_empty());
    }

    #[test]
    fn test_deadline_order() {
        let timers = started();
        let target = EventQueue::new();
        timers.enqueue_delayed("late", Event::external("late"), Duration::from_millis(60), &target);
        timers.enqueue_delayed("early", Event::external("early"), Duration::from_millis(10), &target);

        let first = target.dequeue(Some(Duration::from_secs(2))).unwrap();
        let second = target.dequeue(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(first.name, "early");
        assert_eq!(second.name, "late");
    }

    #[test]
    fn test_cancel_prevents_delivery() {
        let timers = started();
        let target = EventQueue::new();
        timers.enqueue_delayed("t1", Event::external("tick"), Duration::from_millis(40), &target);
        assert!(timers.contains("t1"));
        assert!(timers.cancel_delayed("t1"));
        assert!(!timers.cancel_delayed("t1"));
        assert!(!timers.cancel_delayed("never-scheduled"));

        assert!(target.dequeue(Some(Duration::from_millis(120))).is_none());
    }

    #[test]
    fn test_replace_on_reuse() {
        let timers = started();
        let target = EventQueue::new();
        timers.enqueue_delayed("t", Event::external("first"), Duration::from_millis(20), &target);
        timers.enqueue_delayed("t", Event::external("second"), Duration::from_millis(60), &target);
        assert_eq!(timers.len(), 1);

        let event = target.dequeue(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(event.name, "second");
        assert!(target.dequeue(Some(Duration::from_millis(80))).is_none());
    }

    #[test]
    fn test_rearming_does_not_grow_heap() {
        let timers = started();
        let target = EventQueue::new();
        let hour = Duration::from_secs(3600);
        for _ in 0..10_000 {
            timers.enqueue_delayed("t", Event::external("tick"), hour, &target);
        }
        for i in 0..10_000 {
            let id = format!("once.{}", i);
            timers.enqueue_delayed(id.clone(), Event::external("tick"), hour, &target);
            assert!(timers.cancel_delayed(&id));
        }

        assert_eq!(timers.len(), 1);
        let heap = timers.shared.state.lock().heap.len();
        assert!(heap <= 2 + STALE_SLACK, "heap holds {} entries", heap);

        // The surviving entry still fires after a replace.
        timers.enqueue_delayed("t", Event::external("tock"), Duration::from_millis(5), &target);
        let event = target.dequeue(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(event.name, "tock");
    }

    #[test]
    fn test_cancel_all() {
        let timers = started();
        let target = EventQueue::new();
        for i in 0..5 {
            timers.enqueue_delayed(
                format!("t{}", i),
                Event::external("tick"),
                Duration::from_millis(30),
                &target,
            );
        }
        timers.cancel_all_delayed();
        assert!(timers.is_empty());
        assert!(target.dequeue(Some(Duration::from_millis(100))).is_none());
    }

    #[test]
    fn test_pending_snapshot() {
        let timers = DelayedEventQueue::new();
        let target = EventQueue::new();
        timers.enqueue_delayed("b", Event::external("b"), Duration::from_secs(20), &target);
        timers.enqueue_delayed("a", Event::external("a"), Duration::from_secs(10), &target);

        let pending = timers.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, "a");
        assert!(pending[0].remaining <= Duration::from_secs(10));
        assert!(pending[1].target.same_queue(&target));
    }

    #[test]
    fn test_scheduled_before_start_fires_after_start() {
        let timers = DelayedEventQueue::new();
        let target = EventQueue::new();
        timers.enqueue_delayed("t", Event::external("tick"), Duration::from_millis(10), &target);
        assert!(target.dequeue(Some(Duration::from_millis(40))).is_none());

        timers.start().unwrap();
        assert!(target.dequeue(Some(Duration::from_secs(2))).is_some());
    }

    #[test]
    fn test_notify_interrupts_waiter() {
        let timers = started();
        let outbox = EventQueue::new();
        let external = EventQueue::new();
        timers.enqueue_delayed_notify(
            "t",
            Event::external("routed"),
            Duration::from_millis(20),
            &outbox,
            &external,
        );

        let start = Instant::now();
        assert!(external.dequeue(Some(Duration::from_secs(5))).is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(outbox.try_dequeue().unwrap().name, "routed");
    }

    #[test]
    fn test_start_stop_idempotent() {
        let timers = DelayedEventQueue::new();
        timers.start().unwrap();
        timers.start().unwrap();
        assert!(timers.is_running());

        let target = EventQueue::new();
        timers.enqueue_delayed("t", Event::external("tick"), Duration::from_millis(20), &target);
        timers.stop();
        timers.stop();
        assert!(!timers.is_running());
        assert!(timers.is_empty());
        assert!(target.dequeue(Some(Duration::from_millis(60))).is_none());

        timers.start().unwrap();
        timers.enqueue_delayed("t", Event::external("again"), Duration::from_millis(5), &target);
        assert_eq!(target.dequeue(Some(Duration::from_secs(2))).unwrap().name, "again");
    }
}
