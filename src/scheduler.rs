//! Fires deadline events for in-flight calls.
//!
//! A [`TimeoutScheduler`] keeps every armed timer in a single min-heap ordered by deadline, driven by one background
//! task. Arming a timer costs a heap push, no task or thread is created per call.
//!
//! Each correlation id has at most one armed timer. Re-scheduling an id replaces its timer and cancelling removes
//! it. Heap entries are invalidated lazily: an entry only fires if it still holds the id's current arming token, so a
//! cancelled or replaced timer can never fire, and a timer that fired is disarmed before its event is emitted, so it
//! can never fire twice.
//!
//! Fired timers are emitted as [`Expired`] events on an unbounded channel, which keeps the driver from ever blocking
//! on whoever handles the expiry.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::trace;

use crate::correlation::CorrelationId;

/// What a timer stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// The current attempt's reply deadline.
    ReplyDeadline,
    /// The end of a backoff delay, when the next attempt is due.
    Resend,
}

/// A timer that fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Expired {
    /// The call the timer was armed for.
    pub correlation_id: CorrelationId,
    /// What the timer stands for.
    pub kind: TimerKind,
    /// The attempt the timer was armed for.
    pub attempt: u32,
}

/// A single min-heap timer shared by all calls of a client.
#[derive(Debug)]
pub struct TimeoutScheduler {
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<TimerState>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<Entry>>,
    armed: HashMap<CorrelationId, Armed>,
    next_token: u64,
    closed: bool,
}

#[derive(Clone, Copy, Debug)]
struct Armed {
    token: u64,
    kind: TimerKind,
    attempt: u32,
}

#[derive(Debug)]
struct Entry {
    deadline: Instant,
    token: u64,
    correlation_id: CorrelationId,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Tokens are unique and increasing, so timers sharing a deadline fire in arming order.
        self.deadline
            .cmp(&other.deadline)
            .then(self.token.cmp(&other.token))
    }
}

impl TimeoutScheduler {
    /// Spawns the driver task, emitting fired timers to `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(sink: mpsc::UnboundedSender<Expired>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::default(),
            notify: Notify::new(),
        });
        let driver = tokio::spawn(run(shared.clone(), sink));
        TimeoutScheduler { shared, driver }
    }

    /// Arms a timer for `correlation_id`, replacing any timer already armed for it.
    ///
    /// Returns `false` if the scheduler was shut down.
    pub fn schedule(
        &self,
        correlation_id: CorrelationId,
        deadline: Instant,
        kind: TimerKind,
        attempt: u32,
    ) -> bool {
        let mut state = self.shared.lock();
        if state.closed {
            return false;
        }
        let token = state.next_token;
        state.next_token += 1;
        state.armed.insert(
            correlation_id,
            Armed {
                token,
                kind,
                attempt,
            },
        );
        state.heap.push(Reverse(Entry {
            deadline,
            token,
            correlation_id,
        }));
        state.compact();
        drop(state);

        self.shared.notify.notify_one();
        true
    }

    /// Disarms the timer for `correlation_id`.
    ///
    /// Returns `true` if a timer was armed. Cancelling a timer which already fired is a no-op.
    pub fn cancel(&self, correlation_id: CorrelationId) -> bool {
        self.shared.lock().armed.remove(&correlation_id).is_some()
    }

    /// Returns `true` if a timer is armed for `correlation_id`.
    pub fn is_armed(&self, correlation_id: CorrelationId) -> bool {
        self.shared.lock().armed.contains_key(&correlation_id)
    }

    /// The number of armed timers.
    pub fn len(&self) -> usize {
        self.shared.lock().armed.len()
    }

    /// Returns `true` if no timers are armed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the driver and disarms every timer. Timers armed afterwards are ignored.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            state.closed = true;
            state.heap.clear();
            state.armed.clear();
        }
        self.driver.abort();
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TimerState {
    /// Moves every due and still armed timer into `fired`, returning the next pending deadline.
    fn pop_due(&mut self, now: Instant, fired: &mut Vec<Expired>) -> Option<Instant> {
        loop {
            let deadline = self.heap.peek()?.0.deadline;
            if deadline > now {
                return Some(deadline);
            }
            let Reverse(entry) = self.heap.pop()?;
            let current = self
                .armed
                .get(&entry.correlation_id)
                .is_some_and(|armed| armed.token == entry.token);
            if !current {
                continue;
            }
            if let Some(armed) = self.armed.remove(&entry.correlation_id) {
                fired.push(Expired {
                    correlation_id: entry.correlation_id,
                    kind: armed.kind,
                    attempt: armed.attempt,
                });
            }
        }
    }

    /// Drops stale heap entries once they outnumber the armed timers.
    fn compact(&mut self) {
        if self.heap.len() <= 64 || self.heap.len() <= self.armed.len() * 2 {
            return;
        }
        let armed = &self.armed;
        self.heap.retain(|Reverse(entry)| {
            armed
                .get(&entry.correlation_id)
                .is_some_and(|armed| armed.token == entry.token)
        });
    }
}

async fn run(shared: Arc<Shared>, sink: mpsc::UnboundedSender<Expired>) {
    let mut fired = Vec::new();
    loop {
        let next = {
            let mut state = shared.lock();
            if state.closed {
                return;
            }
            state.pop_due(Instant::now(), &mut fired)
        };

        for expired in fired.drain(..) {
            trace!(correlation_id = %expired.correlation_id, kind = ?expired.kind, "timer fired");
            if sink.send(expired).is_err() {
                return;
            }
        }

        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = time::sleep_until(deadline) => {}
                    _ = shared.notify.notified() => {}
                }
            }
            None => shared.notify.notified().await,
        }
    }
}
