//! Counters describing a client's request traffic.

use std::sync::atomic::{AtomicU64, Ordering};

/// A point-in-time snapshot of a client's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Publish attempts accepted by the transport, including retries.
    pub published: u64,
    /// Retries scheduled after a timeout or transport failure.
    pub retries: u64,
    /// Calls resolved with a reply.
    pub succeeded: u64,
    /// Calls resolved with a reply after at least one retry.
    pub succeeded_after_retry: u64,
    /// Calls resolved with an error.
    pub failed: u64,
    /// Replies discarded because no matching call was pending.
    pub discarded_replies: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    published: AtomicU64,
    retries: AtomicU64,
    succeeded: AtomicU64,
    succeeded_after_retry: AtomicU64,
    failed: AtomicU64,
    discarded_replies: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn succeeded(&self, attempts: u32) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        if attempts > 1 {
            self.succeeded_after_retry.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn discarded(&self) {
        self.discarded_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ClientStats {
        ClientStats {
            published: self.published.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            succeeded_after_retry: self.succeeded_after_retry.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded_replies: self.discarded_replies.load(Ordering::Relaxed),
        }
    }
}
