//! A process-local topic broker.
//!
//! [`InMemoryBroker`] fans every published message out to all current subscribers of the topic and keeps a log of
//! everything published, which makes it convenient for asserting on publish attempts in tests. It can also inject
//! publish failures and duplicate deliveries to exercise retry and at-least-once handling.
//!
//! # Example
//!
//! ```
//! use lib_reply::message::OutboundMessage;
//! use lib_reply::transport::{memory::InMemoryBroker, Transport};
//! use futures::StreamExt;
//!
//! # tokio_test::block_on(async {
//! let broker = InMemoryBroker::new();
//! let mut stream = broker.subscribe("greetings").await?;
//!
//! broker.publish("greetings", OutboundMessage::new("hello")).await?;
//!
//! let msg = stream.next().await.unwrap()?;
//! assert_eq!(&msg.payload[..], b"hello");
//! assert_eq!(broker.publish_count("greetings"), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};

use futures::{future, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use crate::{
    error::TransportError,
    message::{InboundMessage, OutboundMessage},
};

use super::{MessageStream, Transport};

/// An in-memory [`Transport`].
///
/// Cloning is cheap and clones share the same topics.
#[derive(Clone, Debug, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, TopicState>,
    fail_next: usize,
    duplicate_deliveries: bool,
}

#[derive(Debug, Default)]
struct TopicState {
    subscribers: Vec<mpsc::UnboundedSender<InboundMessage>>,
    log: Vec<InboundMessage>,
}

impl InMemoryBroker {
    /// Creates a broker with no topics.
    pub fn new() -> Self {
        InMemoryBroker::default()
    }

    /// Makes the next `n` publishes fail with a [`TransportError::Publish`].
    pub fn fail_next_publishes(&self, n: usize) {
        self.state().fail_next = n;
    }

    /// Delivers every subsequently published message twice to each subscriber.
    pub fn set_duplicate_deliveries(&self, enabled: bool) {
        self.state().duplicate_deliveries = enabled;
    }

    /// Returns every message successfully published to a topic, in order.
    pub fn published(&self, topic: &str) -> Vec<InboundMessage> {
        self.state()
            .topics
            .get(topic)
            .map(|topic| topic.log.clone())
            .unwrap_or_default()
    }

    /// Returns the number of messages successfully published to a topic.
    pub fn publish_count(&self, topic: &str) -> usize {
        self.state()
            .topics
            .get(topic)
            .map(|topic| topic.log.len())
            .unwrap_or_default()
    }

    /// Injects a message into a topic as if a remote producer had published it.
    pub fn inject(&self, msg: InboundMessage) {
        self.state().deliver(msg);
    }

    /// Spawns a task answering requests on `topic`.
    ///
    /// For every request that expects a reply, `handler` is called and its result, if any, is published to the
    /// request's reply topic.
    pub fn serve<F>(
        &self,
        topic: &str,
        mut handler: F,
    ) -> impl Future<Output = Result<JoinHandle<()>, TransportError>> + Send
    where
        F: FnMut(&InboundMessage) -> Option<OutboundMessage> + Send + 'static,
    {
        let broker = self.clone();
        let topic = topic.to_string();
        async move {
            let mut requests = broker.subscribe(&topic).await?;
            Ok(tokio::spawn(async move {
                while let Some(Ok(request)) = requests.next().await {
                    let Some(reply_topic) = request.reply_topic().map(str::to_string) else {
                        continue;
                    };
                    if let Some(reply) = handler(&request) {
                        if let Err(err) = broker.publish(&reply_topic, reply).await {
                            debug!(%err, "in-memory responder failed to reply");
                        }
                    }
                }
            }))
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BrokerState {
    fn deliver(&mut self, msg: InboundMessage) {
        let copies = if self.duplicate_deliveries { 2 } else { 1 };
        let topic = self.topics.entry(msg.topic.clone()).or_default();
        topic
            .subscribers
            .retain(|tx| (0..copies).all(|_| tx.send(msg.clone()).is_ok()));
        topic.log.push(msg);
    }
}

impl Transport for InMemoryBroker {
    fn publish(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let mut state = self.state();
        let res = if state.fail_next > 0 {
            state.fail_next -= 1;
            Err(TransportError::publish(topic, "injected publish failure"))
        } else {
            trace!(topic, "in-memory publish");
            state.deliver(InboundMessage {
                topic: topic.to_string(),
                key: message.key,
                payload: message.payload,
                headers: message.headers,
            });
            Ok(())
        };
        future::ready(res)
    }

    fn subscribe(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<MessageStream, TransportError>> + Send {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state()
            .topics
            .entry(topic.to_string())
            .or_default()
            .subscribers
            .push(tx);
        let stream: MessageStream = UnboundedReceiverStream::new(rx).map(Ok).boxed();
        future::ready(Ok(stream))
    }
}
