//! Registry of in-flight calls keyed by correlation id.
//!
//! The [`PendingRequestTable`] is the only shared mutable state of a client. Every mutation goes through one of its
//! atomic operations, so the reply path and the timeout path can race on the same correlation id without external
//! locking: whichever removes the entry first is authoritative and the other becomes a no-op.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::{
    correlation::CorrelationId,
    error::{RegisterError, RequestError},
    message::{unix_millis_after, OutboundMessage, ATTEMPT_HEADER, DEADLINE_HEADER},
    reply::{Completion, Outcome},
    retry::{deadline_after, Decision, RetryPolicy},
    stats::StatsRecorder,
};

/// Where an in-flight call is in its current attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptState {
    /// Published and waiting for a reply.
    AwaitingReply,
    /// Waiting for the backoff delay to elapse before re-publishing.
    BackingOff {
        /// When the next publish is due.
        resend_at: Instant,
    },
}

/// An in-flight call.
///
/// Owned by the [`PendingRequestTable`] from registration until it is completed or finally failed.
pub struct PendingRequest {
    correlation_id: CorrelationId,
    destination: String,
    request: OutboundMessage,
    reply_topic: String,
    created_at: Instant,
    deadline: Instant,
    attempt: u32,
    attempts_left: u32,
    state: AttemptState,
    policy: Arc<RetryPolicy>,
    completion: Completion,
}

impl PendingRequest {
    /// Creates a pending request for its first attempt, starting now.
    pub fn new(
        correlation_id: CorrelationId,
        destination: impl Into<String>,
        request: OutboundMessage,
        reply_topic: impl Into<String>,
        policy: Arc<RetryPolicy>,
        completion: Completion,
    ) -> Self {
        let now = Instant::now();
        PendingRequest {
            correlation_id,
            destination: destination.into(),
            request,
            reply_topic: reply_topic.into(),
            created_at: now,
            deadline: deadline_after(now, policy.per_attempt_timeout()),
            attempt: 1,
            attempts_left: policy.max_attempts() - 1,
            state: AttemptState::AwaitingReply,
            policy,
            completion,
        }
    }

    /// The call's correlation id.
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// The topic requests are published to.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The topic replies are expected on.
    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    /// The request as registered, before per-attempt headers are added.
    pub fn request(&self) -> &OutboundMessage {
        &self.request
    }

    /// When the call was registered.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// The deadline of the current (or, while backing off, the next) attempt.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The 1-based number of the current attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Retries remaining after the current attempt.
    pub fn attempts_left(&self) -> u32 {
        self.attempts_left
    }

    /// The current attempt state.
    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// The retry policy of the call.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The message to publish for the current attempt, with attempt and deadline hint headers.
    pub fn attempt_message(&self) -> OutboundMessage {
        let mut msg = self.request.clone();
        msg.headers.set(ATTEMPT_HEADER, self.attempt.to_string());
        msg.headers.set(
            DEADLINE_HEADER,
            unix_millis_after(self.deadline.saturating_duration_since(Instant::now())).to_string(),
        );
        msg
    }

    pub(crate) fn begin_backoff(&mut self, resend_at: Instant, deadline: Instant) {
        self.attempts_left -= 1;
        self.state = AttemptState::BackingOff { resend_at };
        self.deadline = deadline;
    }

    fn begin_attempt(&mut self, now: Instant) {
        self.attempt += 1;
        self.state = AttemptState::AwaitingReply;
        self.deadline = deadline_after(now, self.policy.per_attempt_timeout());
    }

    /// Delivers the terminal outcome to the caller.
    ///
    /// Returns `false` if the caller no longer observes the call.
    pub fn resolve(self, outcome: Outcome) -> bool {
        self.completion.resolve(outcome)
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("correlation_id", &self.correlation_id)
            .field("destination", &self.destination)
            .field("reply_topic", &self.reply_topic)
            .field("attempt", &self.attempt)
            .field("attempts_left", &self.attempts_left)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// What happened when an attempt failure was applied to the table.
#[derive(Debug)]
pub enum ExpireOutcome {
    /// The entry was already completed, or has since moved on to another attempt.
    Stale,
    /// The entry stays registered and will be re-published at `resend_at`.
    Retry {
        /// When the next publish is due.
        resend_at: Instant,
        /// The attempt that failed.
        failed_attempt: u32,
        /// Total attempts allowed by the call's policy.
        max_attempts: u32,
    },
    /// The entry was removed and resolved with the final error.
    Exhausted {
        /// Total publish attempts made.
        attempts: u32,
    },
}

/// A publish due for a call coming out of its backoff phase.
#[derive(Debug)]
pub struct Resend {
    /// The topic to publish to.
    pub destination: String,
    /// The message for this attempt.
    pub message: OutboundMessage,
    /// The 1-based attempt number.
    pub attempt: u32,
    /// Deadline for this attempt.
    pub deadline: Instant,
}

/// Concurrent registry of in-flight calls.
#[derive(Debug, Default)]
pub struct PendingRequestTable {
    entries: Mutex<HashMap<CorrelationId, PendingRequest>>,
    stats: Arc<StatsRecorder>,
}

impl PendingRequestTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        PendingRequestTable::default()
    }

    pub(crate) fn with_stats(stats: Arc<StatsRecorder>) -> Self {
        PendingRequestTable {
            entries: Mutex::default(),
            stats,
        }
    }

    /// Registers a new in-flight call.
    ///
    /// On error the entry is handed back untouched so the caller can resolve it.
    pub fn register(&self, entry: PendingRequest) -> Result<(), (RegisterError, PendingRequest)> {
        let mut entries = self.lock();
        let id = entry.correlation_id;
        if entries.contains_key(&id) {
            return Err((RegisterError::DuplicateCorrelationId(id), entry));
        }
        entries.insert(id, entry);
        Ok(())
    }

    /// Removes the entry and resolves it with `outcome`.
    ///
    /// Returns `true` iff an entry existed. Completing an id that is absent or already completed is a no-op, which
    /// makes late and duplicate replies harmless.
    pub fn complete(&self, id: CorrelationId, outcome: Outcome) -> bool {
        let Some(entry) = self.lock().remove(&id) else {
            return false;
        };
        self.finish(entry, outcome);
        true
    }

    /// Atomically removes and returns the entry, or `None` if it was already completed.
    pub fn expire(&self, id: CorrelationId) -> Option<PendingRequest> {
        self.lock().remove(&id)
    }

    /// Applies the failure of `attempt` to the entry.
    ///
    /// `decide` runs under the table lock. If it returns [`Decision::Retry`] the entry stays registered, so a late reply
    /// to an earlier attempt still completes the call. If it returns [`Decision::Fail`] the entry is removed and
    /// resolved with the error. Failures for an attempt that is no longer awaiting a reply are ignored.
    pub fn expire_attempt<F>(&self, id: CorrelationId, attempt: u32, decide: F) -> ExpireOutcome
    where
        F: FnOnce(&mut PendingRequest) -> Decision,
    {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&id) else {
            return ExpireOutcome::Stale;
        };
        if entry.attempt != attempt || entry.state != AttemptState::AwaitingReply {
            return ExpireOutcome::Stale;
        }

        match decide(entry) {
            Decision::Retry { resend_at, .. } => ExpireOutcome::Retry {
                resend_at,
                failed_attempt: attempt,
                max_attempts: entry.policy.max_attempts(),
            },
            Decision::Fail(err) => {
                let Some(entry) = entries.remove(&id) else {
                    return ExpireOutcome::Stale;
                };
                drop(entries);
                let attempts = entry.attempt;
                self.finish(entry, Err(err));
                ExpireOutcome::Exhausted { attempts }
            }
        }
    }

    /// Moves the entry out of its backoff phase into its next attempt.
    ///
    /// Returns `None` if the entry was completed while backing off, or is not backing off after `attempt`.
    pub fn begin_resend(&self, id: CorrelationId, attempt: u32) -> Option<Resend> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&id)?;
        if entry.attempt != attempt || !matches!(entry.state, AttemptState::BackingOff { .. }) {
            return None;
        }
        entry.begin_attempt(Instant::now());
        Some(Resend {
            destination: entry.destination.clone(),
            message: entry.attempt_message(),
            attempt: entry.attempt,
            deadline: entry.deadline,
        })
    }

    /// Removes every entry, resolving each with [`RequestError::Shutdown`].
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            self.finish(entry, Err(RequestError::Shutdown));
        }
        count
    }

    /// Returns `true` if a call with this id is in flight.
    pub fn contains(&self, id: CorrelationId) -> bool {
        self.lock().contains_key(&id)
    }

    /// The number of in-flight calls.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no calls are in flight.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn finish(&self, entry: PendingRequest, outcome: Outcome) {
        let id = entry.correlation_id;
        let attempts = entry.attempt;
        match &outcome {
            Ok(_) => {
                self.stats.succeeded(attempts);
                if attempts > 1 {
                    info!(%id, attempts, "request succeeded after {} retry attempts", attempts - 1);
                }
            }
            Err(RequestError::Shutdown) => {
                self.stats.failed();
                debug!(%id, attempts, "request abandoned on shutdown");
            }
            Err(err) => {
                self.stats.failed();
                error!(%id, attempts, %err, "request failed");
            }
        }
        entry.resolve(outcome);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingRequest>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
