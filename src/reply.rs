//! The completion handle returned for every request-reply call.
//!
//! Exactly one terminal outcome is delivered through a [`ReplyHandle`]: the matching reply, or a [`RequestError`].
//! Callers choose per call how to observe it:
//!
//! - **await** the handle, it implements [`Future`];
//! - **block** with [`ReplyHandle::blocking_recv`] or [`ReplyHandle::blocking_recv_timeout`] from a thread outside the
//!   async runtime;
//! - **callback** with [`ReplyHandle::on_complete`].
//!
//! Dropping a handle, or giving up on a blocking wait, does not retract the request. The call keeps running in the
//! background and its outcome is simply discarded.

use std::{
    future::Future,
    pin::Pin,
    task::{self, ready, Poll},
    time::Duration,
};

use futures::FutureExt;
use serde::de::DeserializeOwned;
use tokio::{runtime, sync::oneshot, task::JoinHandle};

use crate::{
    codec::Codec,
    correlation::CorrelationId,
    error::RequestError,
    message::ReplyEnvelope,
};

/// The terminal outcome of a call.
pub type Outcome = Result<ReplyEnvelope, RequestError>;

/// Sending half of a [`ReplyHandle`], owned by the pending request.
///
/// Consumed on use, so a call can never be resolved twice.
#[derive(Debug)]
#[must_use = "the caller expects an outcome to be sent"]
pub struct Completion {
    tx: oneshot::Sender<Outcome>,
}

impl Completion {
    /// Resolves the call. Returns `false` if the handle was already dropped.
    pub fn resolve(self, outcome: Outcome) -> bool {
        self.tx.send(outcome).is_ok()
    }

    /// Returns `true` if the caller dropped its handle.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Creates a linked completion and handle for a call.
///
/// Must be called from within a tokio runtime.
pub fn completion(correlation_id: CorrelationId) -> (Completion, ReplyHandle) {
    let (tx, rx) = oneshot::channel();
    (
        Completion { tx },
        ReplyHandle {
            correlation_id,
            rx,
            taken: false,
            runtime: runtime::Handle::current(),
        },
    )
}

/// A handle resolving to the reply of an in-flight call.
#[derive(Debug)]
#[must_use = "the reply won't be observed without awaiting or receiving from the handle"]
pub struct ReplyHandle {
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<Outcome>,
    /// Set once the outcome was handed out, after which the handle yields nothing.
    taken: bool,
    runtime: runtime::Handle,
}

impl ReplyHandle {
    /// The correlation id of the call.
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Returns `true` once the outcome was returned by [`try_recv`](Self::try_recv) or
    /// [`blocking_recv_timeout`](Self::blocking_recv_timeout).
    pub fn is_taken(&self) -> bool {
        self.taken
    }

    /// Returns the outcome if the call has already resolved.
    ///
    /// The outcome is returned once. Later calls return `None`.
    pub fn try_recv(&mut self) -> Option<Outcome> {
        if self.taken {
            return None;
        }
        let outcome = match self.rx.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(RequestError::Shutdown),
        };
        self.taken = true;
        Some(outcome)
    }

    /// Blocks the current thread until the call resolves.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context, or if the outcome was already taken (see
    /// [`is_taken`](Self::is_taken)). The same holds for awaiting the handle.
    pub fn blocking_recv(self) -> Outcome {
        self.rx.blocking_recv()?
    }

    /// Blocks the current thread until the call resolves or `timeout` elapses.
    ///
    /// Returns `None` if the wait timed out, in which case the call keeps running and the handle can be waited on
    /// again. Once the outcome was returned, later calls return `None` immediately.
    ///
    /// The timer is driven by the runtime the call was sent from, which must be a multi-threaded runtime or one
    /// being driven by another thread.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn blocking_recv_timeout(&mut self, timeout: Duration) -> Option<Outcome> {
        if self.taken {
            return None;
        }
        let rx = &mut self.rx;
        let outcome = self
            .runtime
            .block_on(tokio::time::timeout(timeout, rx))
            .ok()?;
        self.taken = true;
        Some(outcome.unwrap_or_else(|err| Err(err.into())))
    }

    /// Calls `f` with the outcome once the call resolves.
    ///
    /// The callback runs on the runtime the call was sent from.
    pub fn on_complete<F>(self, f: F) -> JoinHandle<()>
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        let runtime = self.runtime.clone();
        runtime.spawn(async move { f(self.await) })
    }

    /// Waits for the reply and decodes its payload.
    pub async fn recv_as<T, C>(self, codec: &C) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
        C: Codec,
    {
        let reply = self.await?;
        Ok(codec.decode(&reply.payload)?)
    }
}

impl Future for ReplyHandle {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let outcome = ready!(self.rx.poll_unpin(cx));
        self.taken = true;
        Poll::Ready(outcome.unwrap_or_else(|err| Err(err.into())))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::time::Instant;

    use super::*;
    use crate::{codec::JsonCodec, message::Headers};

    fn envelope(id: CorrelationId, payload: &'static [u8]) -> ReplyEnvelope {
        ReplyEnvelope {
            correlation_id: id,
            payload: Bytes::from_static(payload),
            headers: Headers::new(),
            received_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn resolves_once() -> Result<(), Box<dyn std::error::Error>> {
        let id = CorrelationId::random();
        let (completion, handle) = completion(id);

        assert!(completion.resolve(Ok(envelope(id, b"1"))));
        let reply = handle.await?;
        assert_eq!(reply.correlation_id, id);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_completion_surfaces_as_shutdown() {
        let (completion, handle) = completion(CorrelationId::random());
        drop(completion);
        assert!(matches!(handle.await, Err(RequestError::Shutdown)));
    }

    #[tokio::test]
    async fn abandoned_handle_is_detected() {
        let (completion, handle) = completion(CorrelationId::random());
        drop(handle);
        assert!(completion.is_abandoned());
        assert!(!completion.resolve(Err(RequestError::Shutdown)));
    }

    #[tokio::test]
    async fn try_recv_reports_pending() {
        let id = CorrelationId::random();
        let (completion, mut handle) = completion(id);
        assert!(handle.try_recv().is_none());
        let _ = completion.resolve(Ok(envelope(id, b"1")));
        assert!(matches!(handle.try_recv(), Some(Ok(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_wait_times_out_without_consuming_the_handle() {
        let id = CorrelationId::random();
        let (completion, mut handle) = completion(id);

        let handle = tokio::task::spawn_blocking(move || {
            assert!(handle
                .blocking_recv_timeout(Duration::from_millis(20))
                .is_none());
            handle
        })
        .await
        .unwrap();

        let _ = completion.resolve(Ok(envelope(id, b"late")));
        let outcome = tokio::task::spawn_blocking(move || handle.blocking_recv())
            .await
            .unwrap();
        assert_eq!(&outcome.unwrap().payload[..], b"late");
    }

    #[tokio::test]
    async fn on_complete_invokes_callback() {
        let id = CorrelationId::random();
        let (completion, handle) = completion(id);
        let (tx, rx) = oneshot::channel();

        let _task = handle.on_complete(move |outcome| {
            let _ = tx.send(outcome.is_ok());
        });
        let _ = completion.resolve(Ok(envelope(id, b"1")));

        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn recv_as_decodes_payload() -> Result<(), Box<dyn std::error::Error>> {
        let id = CorrelationId::random();
        let (completion, handle) = completion(id);
        let _ = completion.resolve(Ok(envelope(id, b"[1,2,3]")));

        let values: Vec<u32> = handle.recv_as(&JsonCodec).await?;
        assert_eq!(values, vec![1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn recv_as_reports_decode_failure() {
        let id = CorrelationId::random();
        let (completion, handle) = completion(id);
        let _ = completion.resolve(Ok(envelope(id, b"not json")));

        let res: Result<Vec<u32>, _> = handle.recv_as(&JsonCodec).await;
        assert!(matches!(res, Err(RequestError::Serialization(_))));
    }

    #[tokio::test]
    async fn try_recv_yields_the_outcome_once() {
        let id = CorrelationId::random();
        let (completion, mut handle) = completion(id);
        let _ = completion.resolve(Ok(envelope(id, b"1")));

        assert!(matches!(handle.try_recv(), Some(Ok(_))));
        assert!(handle.is_taken());
        assert!(handle.try_recv().is_none());
        assert!(handle.try_recv().is_none());
    }

    #[tokio::test]
    async fn try_recv_reports_a_dropped_completion_once() {
        let (completion, mut handle) = completion(CorrelationId::random());
        drop(completion);

        assert!(matches!(handle.try_recv(), Some(Err(RequestError::Shutdown))));
        assert!(handle.try_recv().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_wait_after_the_outcome_was_taken_returns_none() {
        let id = CorrelationId::random();
        let (completion, mut handle) = completion(id);
        let _ = completion.resolve(Ok(envelope(id, b"1")));

        let outcomes = tokio::task::spawn_blocking(move || {
            let first = handle.blocking_recv_timeout(Duration::from_millis(20));
            let second = handle.blocking_recv_timeout(Duration::from_millis(20));
            (first.is_some(), second.is_none(), handle.try_recv().is_none())
        })
        .await
        .unwrap();
        assert_eq!(outcomes, (true, true, true));
    }
}
