//! Routes inbound replies to the call they answer.
//!
//! Replies are delivered at least once, and may arrive after their call already resolved or for calls this process
//! never made (for example after a restart, or when several clients share a reply topic). Such replies are expected
//! and are discarded without error.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::{
    error::RequestError,
    message::{InboundMessage, ReplyEnvelope},
    pending::PendingRequestTable,
    scheduler::TimeoutScheduler,
    stats::StatsRecorder,
    transport::MessageStream,
};

/// Consumes a reply stream and completes matching pending calls.
#[derive(Clone, Debug)]
pub struct ReplyDemultiplexer {
    table: Arc<PendingRequestTable>,
    scheduler: Arc<TimeoutScheduler>,
    stats: Arc<StatsRecorder>,
}

impl ReplyDemultiplexer {
    pub(crate) fn new(
        table: Arc<PendingRequestTable>,
        scheduler: Arc<TimeoutScheduler>,
        stats: Arc<StatsRecorder>,
    ) -> Self {
        ReplyDemultiplexer {
            table,
            scheduler,
            stats,
        }
    }

    /// Completes the call matching `envelope`, cancelling its timer.
    ///
    /// Returns `false` if no call was pending for the envelope's correlation id, in which case it is discarded.
    pub fn dispatch(&self, envelope: ReplyEnvelope) -> bool {
        let id = envelope.correlation_id;
        let outcome = match envelope.error_message() {
            Some(message) => Err(RequestError::Remote { message }),
            None => Ok(envelope),
        };

        if self.table.complete(id, outcome) {
            self.scheduler.cancel(id);
            true
        } else {
            debug!(%id, "discarding reply with no pending request");
            self.stats.discarded();
            false
        }
    }

    /// Dispatches a raw inbound message, discarding it if it carries no correlation id.
    pub fn dispatch_message(&self, msg: InboundMessage) -> bool {
        match ReplyEnvelope::from_inbound(msg) {
            Some(envelope) => self.dispatch(envelope),
            None => {
                debug!("discarding reply without correlation id");
                self.stats.discarded();
                false
            }
        }
    }

    /// Dispatches every message of `replies` until the stream ends.
    ///
    /// Transport errors yielded by the stream are logged and skipped.
    pub async fn run(self, mut replies: MessageStream) {
        while let Some(res) = replies.next().await {
            match res {
                Ok(msg) => {
                    self.dispatch_message(msg);
                }
                Err(err) => warn!(%err, "reply stream yielded an error"),
            }
        }
        info!("reply stream ended");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::{sync::mpsc, time::Instant};

    use super::*;
    use crate::{
        correlation::CorrelationId,
        message::{Headers, OutboundMessage, CORRELATION_ID_HEADER, ERROR_HEADER},
        pending::PendingRequest,
        reply::{completion, ReplyHandle},
        retry::RetryPolicy,
        scheduler::TimerKind,
    };

    struct Fixture {
        demux: ReplyDemultiplexer,
        table: Arc<PendingRequestTable>,
        scheduler: Arc<TimeoutScheduler>,
        stats: Arc<StatsRecorder>,
    }

    fn fixture() -> Fixture {
        let stats = Arc::new(StatsRecorder::default());
        let table = Arc::new(PendingRequestTable::with_stats(stats.clone()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(TimeoutScheduler::start(tx));
        Fixture {
            demux: ReplyDemultiplexer::new(table.clone(), scheduler.clone(), stats.clone()),
            table,
            scheduler,
            stats,
        }
    }

    fn register(fixture: &Fixture) -> ReplyHandle {
        let id = CorrelationId::random();
        let (completion, handle) = completion(id);
        let policy = Arc::new(RetryPolicy::no_retry(Duration::from_secs(1)));
        let entry = PendingRequest::new(
            id,
            "requests",
            OutboundMessage::new("ping"),
            "replies",
            policy,
            completion,
        );
        fixture
            .scheduler
            .schedule(id, entry.deadline(), TimerKind::ReplyDeadline, 1);
        fixture.table.register(entry).unwrap();
        handle
    }

    fn reply(id: CorrelationId, payload: &'static [u8]) -> InboundMessage {
        InboundMessage {
            topic: "replies".to_string(),
            key: None,
            payload: Bytes::from_static(payload),
            headers: Headers::new().with(CORRELATION_ID_HEADER, id.to_string()),
        }
    }

    #[tokio::test]
    async fn completes_and_cancels_timer() -> Result<(), Box<dyn std::error::Error>> {
        let fixture = fixture();
        let handle = register(&fixture);
        let id = handle.correlation_id();

        assert!(fixture.demux.dispatch_message(reply(id, b"pong")));
        assert!(!fixture.scheduler.is_armed(id));
        assert!(fixture.table.is_empty());
        assert_eq!(&handle.await?.payload[..], b"pong");
        Ok(())
    }

    #[tokio::test]
    async fn duplicates_and_unknown_ids_are_discarded() -> Result<(), Box<dyn std::error::Error>> {
        let fixture = fixture();
        let handle = register(&fixture);
        let id = handle.correlation_id();

        assert!(fixture.demux.dispatch_message(reply(id, b"first")));
        assert!(!fixture.demux.dispatch_message(reply(id, b"second")));
        assert!(!fixture.demux.dispatch_message(reply(CorrelationId::random(), b"stray")));
        assert_eq!(&handle.await?.payload[..], b"first");
        assert_eq!(fixture.stats.snapshot().discarded_replies, 2);
        Ok(())
    }

    #[tokio::test]
    async fn error_replies_resolve_as_remote_errors() {
        let fixture = fixture();
        let handle = register(&fixture);
        let mut msg = reply(handle.correlation_id(), b"");
        msg.headers.insert(ERROR_HEADER, "no such order");

        assert!(fixture.demux.dispatch_message(msg));
        match handle.await {
            Err(RequestError::Remote { message }) => assert_eq!(message, "no such order"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_skips_errors_and_missing_ids() -> Result<(), Box<dyn std::error::Error>> {
        let fixture = fixture();
        let handle = register(&fixture);
        let id = handle.correlation_id();

        let mut anonymous = reply(id, b"");
        anonymous.headers = Headers::new();
        let replies: MessageStream = futures::stream::iter(vec![
            Err(crate::error::TransportError::Closed),
            Ok(anonymous),
            Ok(reply(id, b"pong")),
        ])
        .boxed();

        fixture.demux.clone().run(replies).await;
        assert_eq!(&handle.await?.payload[..], b"pong");
        assert_eq!(fixture.stats.snapshot().discarded_replies, 1);
        Ok(())
    }

    #[tokio::test]
    async fn record_key_is_used_when_header_is_missing() {
        let fixture = fixture();
        let handle = register(&fixture);
        let id = handle.correlation_id();

        let envelope = ReplyEnvelope {
            correlation_id: id,
            payload: Bytes::from_static(b"pong"),
            headers: Headers::new(),
            received_at: Instant::now(),
        };
        let mut keyed = reply(id, b"pong");
        keyed.headers = Headers::new();
        keyed.key = Some(Bytes::from(id.to_string()));

        assert!(fixture.demux.dispatch_message(keyed));
        assert!(!fixture.demux.dispatch(envelope));
        assert!(handle.await.is_ok());
    }
}
