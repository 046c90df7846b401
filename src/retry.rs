//! Retry policy and the decision taken when an attempt fails.
//!
//! A [`RetryPolicy`] is immutable and shared read-only between calls. When an attempt times out or its publish
//! fails, the [`RetryCoordinator`] decides whether the call is re-published under the same correlation id after a
//! backoff delay, or finalized with an error.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use lib_reply::retry::{Backoff, RetryPolicy};
//!
//! let policy = RetryPolicy::new(3, Duration::from_millis(100))
//!     .with_backoff(Backoff::exponential(Duration::from_millis(50), Duration::from_secs(1)));
//!
//! assert_eq!(policy.backoff().delay(0), Duration::from_millis(50));
//! assert_eq!(policy.backoff().delay(1), Duration::from_millis(100));
//! assert_eq!(policy.backoff().delay(10), Duration::from_secs(1));
//! ```

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::{
    error::{RequestError, TransportError},
    pending::PendingRequest,
};

/// Maps a retry index to the delay before the next publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay before every retry.
    Fixed(Duration),
    /// `base * 2^n` for the `n`th retry (0-based), capped at `cap`.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Upper bound for any delay.
        cap: Duration,
    },
}

impl Backoff {
    /// Creates an exponential backoff.
    pub fn exponential(base: Duration, cap: Duration) -> Self {
        Backoff::Exponential {
            base,
            cap: cap.max(base),
        }
    }

    /// Returns the un-jittered delay before the `n`th retry (0-based).
    pub fn delay(&self, n: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, cap } => 1u32
                .checked_shl(n)
                .and_then(|factor| base.checked_mul(factor))
                .unwrap_or(cap)
                .min(cap),
        }
    }

    /// The largest delay this backoff can produce.
    pub fn ceiling(&self) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { cap, .. } => cap,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(Duration::from_secs(2))
    }
}

/// How many times a call is published and how long each attempt waits for a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    per_attempt_timeout: Duration,
    backoff: Backoff,
    jitter: bool,
}

impl RetryPolicy {
    /// Creates a policy with a fixed 2 second backoff and no jitter.
    ///
    /// `max_attempts` counts every publish including the first, and is raised to 1 if 0 is given.
    pub fn new(max_attempts: u32, per_attempt_timeout: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            per_attempt_timeout,
            backoff: Backoff::default(),
            jitter: false,
        }
    }

    /// A policy which publishes once and never retries.
    pub fn no_retry(timeout: Duration) -> Self {
        RetryPolicy::new(1, timeout)
    }

    /// Sets the backoff strategy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enables or disables random jitter on backoff delays.
    ///
    /// Jittered delays are scaled by a random factor in `[0.5, 1.0]`, so they never exceed the un-jittered delay.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total number of publish attempts.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// How long each attempt waits for a reply.
    pub fn per_attempt_timeout(&self) -> Duration {
        self.per_attempt_timeout
    }

    /// The backoff strategy.
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Whether jitter is applied.
    pub fn jitter(&self) -> bool {
        self.jitter
    }

    /// The delay before the `n`th retry (0-based), with jitter applied if enabled.
    pub fn retry_delay(&self, n: u32) -> Duration {
        let delay = self.backoff.delay(n);
        if self.jitter && !delay.is_zero() {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
                .unwrap_or(delay)
                .min(delay)
        } else {
            delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3, Duration::from_secs(30))
    }
}

/// Roughly 30 years, used in place of deadlines which would overflow an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Returns `now + after`, saturating to a far-future instant for durations such as [`Duration::MAX`].
pub(crate) fn deadline_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Why an attempt failed.
#[derive(Debug)]
pub enum FailureCause {
    /// No reply arrived before the attempt's deadline.
    Timeout,
    /// The transport rejected the publish.
    Transport(TransportError),
}

/// The outcome of [`RetryCoordinator::on_expire`].
#[derive(Debug)]
pub enum Decision {
    /// Re-publish at `resend_at` under the same correlation id.
    Retry {
        /// When the next publish is due.
        resend_at: Instant,
        /// The backoff delay that was applied.
        delay: Duration,
    },
    /// Finalize the call with an error.
    Fail(RequestError),
}

/// Decides whether failed attempts are retried.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryCoordinator;

impl RetryCoordinator {
    /// Creates a coordinator.
    pub fn new() -> Self {
        RetryCoordinator
    }

    /// Decides what happens to a request whose current attempt failed.
    ///
    /// On [`Decision::Retry`] the request is mutated in place: `attempts_left` is decremented, it moves into its
    /// backoff phase, and its deadline is refreshed to the end of the next attempt. On [`Decision::Fail`] the request
    /// is left untouched and must be removed and resolved by the caller.
    pub fn on_expire(
        &self,
        request: &mut PendingRequest,
        now: Instant,
        cause: FailureCause,
    ) -> Decision {
        if request.attempts_left() == 0 {
            return Decision::Fail(match cause {
                FailureCause::Timeout => RequestError::TimeoutExhausted {
                    attempts: request.attempt(),
                },
                FailureCause::Transport(err) => RequestError::Transport(err),
            });
        }

        let policy = request.policy();
        let delay = policy.retry_delay(request.attempt() - 1);
        let timeout = policy.per_attempt_timeout();
        let resend_at = deadline_after(now, delay);
        request.begin_backoff(resend_at, deadline_after(resend_at, timeout));

        Decision::Retry { resend_at, delay }
    }
}
