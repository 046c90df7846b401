//! End-to-end request-reply calls over the in-memory broker.

use std::{collections::HashMap, time::Duration};

use futures::{future, StreamExt};
use lib_reply::message::{InboundMessage, OutboundMessage};
use lib_reply::prelude::*;
use lib_reply::transport::memory::InMemoryBroker;
use tokio::time::Instant;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn echo(req: &InboundMessage) -> Option<OutboundMessage> {
    OutboundMessage::reply_to(req, req.payload.clone())
}

#[tokio::test(start_paused = true)]
async fn reply_before_deadline_resolves_without_retry() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let broker = InMemoryBroker::new();
    let mut requests = broker.subscribe("orders").await?;
    let responder = broker.clone();
    tokio::spawn(async move {
        while let Some(Ok(req)) = requests.next().await {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let reply = OutboundMessage::reply_to(&req, "accepted").unwrap();
            responder
                .publish(req.reply_topic().unwrap(), reply)
                .await
                .unwrap();
        }
    });

    let client = RequestReplyClient::start(broker.clone()).await?;
    let policy = RetryPolicy::new(3, Duration::from_millis(100))
        .with_backoff(Backoff::Fixed(Duration::from_millis(50)));

    let start = Instant::now();
    let reply = client.send("orders", "new order", &policy).await.await?;
    assert_eq!(&reply.payload[..], b"accepted");
    assert_eq!(start.elapsed(), Duration::from_millis(30));

    // Nothing fires afterwards
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.publish_count("orders"), 1);
    assert_eq!(client.pending_count(), 0);

    let stats = client.stats();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.retries, 0);
    assert_eq!(stats.succeeded, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn duplicate_replies_are_discarded() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let broker = InMemoryBroker::new();
    broker.set_duplicate_deliveries(true);
    broker.serve("echo", echo).await?;
    let client = RequestReplyClient::start(broker.clone()).await?;

    let reply = client.request("echo", "once").await?;
    assert_eq!(&reply.payload[..], b"once");

    // The request reached the replier twice and each reply was delivered twice
    tokio::time::sleep(Duration::from_millis(10)).await;
    let stats = client.stats();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.discarded_replies, 3);
    assert_eq!(client.pending_count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_never_cross_resolve() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let broker = InMemoryBroker::new();
    broker.serve("echo", echo).await?;
    let client = RequestReplyClient::start(broker).await?;

    let calls = (0..200).map(|n| {
        let client = client.clone();
        tokio::spawn(async move {
            let payload = format!("request-{n}");
            let reply = client.request("echo", payload.clone()).await?;
            Ok::<_, RequestError>((payload, reply))
        })
    });

    for res in future::join_all(calls).await {
        let (payload, reply) = res??;
        assert_eq!(reply.payload, payload.as_bytes());
    }
    assert_eq!(client.pending_count(), 0);
    Ok(())
}

#[tokio::test]
async fn error_replies_resolve_as_remote_errors() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    broker
        .serve("accounts", |req| OutboundMessage::error_reply_to(req, "account is frozen"))
        .await?;
    let client = RequestReplyClient::start(broker.clone()).await?;

    match client.request("accounts", "withdraw").await {
        Err(RequestError::Remote { message }) => assert_eq!(message, "account is frozen"),
        other => panic!("expected a remote error, got {other:?}"),
    }
    assert_eq!(broker.publish_count("accounts"), 1);
    Ok(())
}

#[tokio::test]
async fn unknown_replies_are_ignored() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    broker.serve("echo", echo).await?;
    let client = RequestReplyClient::start(broker.clone()).await?;

    broker.inject(InboundMessage {
        topic: client.reply_topic().to_string(),
        key: Some(CorrelationId::random().to_string().into()),
        payload: "stray".into(),
        headers: Default::default(),
    });

    let reply = client.request("echo", "hi").await?;
    assert_eq!(&reply.payload[..], b"hi");
    assert_eq!(client.stats().discarded_replies, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_and_callback_styles() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    broker.serve("echo", echo).await?;
    let client = RequestReplyClient::start(broker).await?;

    let blocking = client.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        blocking.blocking_send(
            "echo",
            "blocking",
            &RetryPolicy::no_retry(Duration::from_secs(5)),
            Duration::from_secs(5),
        )
    })
    .await?;
    assert_eq!(&outcome.unwrap()?.payload[..], b"blocking");

    let (tx, rx) = tokio::sync::oneshot::channel();
    let handle = client.request("echo", "callback").send().await;
    let _callback = handle.on_complete(move |outcome| {
        let _ = tx.send(outcome.map(|reply| reply.payload));
    });
    assert_eq!(&rx.await??[..], b"callback");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn fire_and_forget_registers_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let mut audit = broker.subscribe("audit").await?;
    broker.serve("audit", echo).await?;
    let client = RequestReplyClient::start(broker.clone()).await?;

    let id = client.send_without_reply("audit", "user logged in").await?;
    assert_eq!(client.pending_count(), 0);

    let delivered = audit.next().await.unwrap()?;
    assert_eq!(delivered.correlation_id(), Some(id));
    assert_eq!(delivered.reply_topic(), None);

    // The replier skips messages which expect no reply
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(broker.publish_count(client.reply_topic()), 0);
    Ok(())
}

#[tokio::test]
async fn shutdown_resolves_pending_calls() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let client = RequestReplyClient::start(broker).await?;

    let handle = client
        .send("void", "ping", &RetryPolicy::no_retry(Duration::from_secs(60)))
        .await;
    assert_eq!(client.pending_count(), 1);

    client.shutdown();
    assert!(!client.is_running());
    assert!(matches!(handle.await, Err(RequestError::Shutdown)));
    assert_eq!(client.pending_count(), 0);

    let late = client.request("void", "ping").await;
    assert!(matches!(late, Err(RequestError::Shutdown)));

    // Idempotent
    client.shutdown();
    Ok(())
}

#[tokio::test]
async fn typed_calls_report_decode_failures() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    broker
        .serve("prices", |req| OutboundMessage::reply_to(req, "not a number"))
        .await?;
    let client = RequestReplyClient::start(broker).await?;

    let res: Result<f64, _> = client.call("prices", "AAPL").await;
    assert!(matches!(res, Err(RequestError::Serialization(_))));
    Ok(())
}

#[tokio::test]
async fn encode_failures_resolve_without_publishing() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let client = RequestReplyClient::start(broker.clone()).await?;

    // JSON objects only have string keys
    let order = HashMap::from([(vec![1u8, 2], 3)]);
    let policy = RetryPolicy::new(3, Duration::from_millis(50));
    let res = client.send_encoded("orders", &order, &policy).await.await;

    assert!(matches!(res, Err(RequestError::Serialization(_))));
    assert_eq!(broker.publish_count("orders"), 0);
    assert_eq!(client.pending_count(), 0);
    let stats = client.stats();
    assert_eq!(stats.published, 0);
    assert_eq!(stats.retries, 0);
    assert_eq!(stats.failed, 1);
    Ok(())
}

struct FixedIdGenerator(CorrelationId);

impl CorrelationIdGenerator for FixedIdGenerator {
    fn generate(&self) -> CorrelationId {
        self.0
    }
}

#[tokio::test]
async fn repeated_correlation_ids_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let id = CorrelationId::from_u128(7);
    let client = RequestReplyClient::builder(broker.clone())
        .id_generator(FixedIdGenerator(id))
        .start()
        .await?;

    let policy = RetryPolicy::no_retry(Duration::from_secs(60));
    let first = client.send("void", "one", &policy).await;
    let second = client.send("void", "two", &policy).await;

    assert!(matches!(second.await, Err(RequestError::DuplicateCorrelationId(got)) if got == id));
    assert_eq!(broker.publish_count("void"), 1);
    assert_eq!(client.pending_count(), 1);
    assert_eq!(client.stats().failed, 1);

    client.shutdown();
    assert!(matches!(first.await, Err(RequestError::Shutdown)));
    Ok(())
}

#[tokio::test]
async fn unbounded_timeouts_do_not_overflow() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    broker.serve("echo", echo).await?;
    let client = RequestReplyClient::start(broker.clone()).await?;

    let forever = RetryPolicy::no_retry(Duration::MAX);
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.send("echo", "patient", &forever).await.await }
    });
    let reply = call.await??;
    assert_eq!(&reply.payload[..], b"patient");

    // A first attempt which times out, followed by a backoff that never ends
    let policy = RetryPolicy::new(2, Duration::from_millis(10))
        .with_backoff(Backoff::Fixed(Duration::MAX))
        .with_jitter(true);
    let handle = client.send("void", "ping", &policy).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(broker.publish_count("void"), 1);
    assert_eq!(client.pending_count(), 1);
    client.shutdown();
    assert!(matches!(handle.await, Err(RequestError::Shutdown)));
    Ok(())
}
