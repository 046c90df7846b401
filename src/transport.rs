//! The broker collaborator consumed by the engine.
//!
//! lib-reply does not implement a broker client. Any topic-based publish/subscribe transport (a Kafka producer and
//! consumer pair, an AMQP channel, ...) can be plugged in by implementing [`Transport`].
//!
//! [`memory::InMemoryBroker`] is a process-local implementation used for tests and examples.

use std::future::Future;

use futures::stream::BoxStream;

use crate::{
    error::TransportError,
    message::{InboundMessage, OutboundMessage},
};

pub mod memory;

/// A stream of messages received on a subscribed topic.
///
/// Transports deliver at least once: the same message may be yielded more than once.
pub type MessageStream = BoxStream<'static, Result<InboundMessage, TransportError>>;

/// A topic-based publish/subscribe transport.
pub trait Transport: Send + Sync + 'static {
    /// Publishes a message to a topic.
    ///
    /// Resolves once the broker has accepted the message.
    fn publish(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Subscribes to a topic, returning an unbounded stream of inbound messages.
    fn subscribe(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<MessageStream, TransportError>> + Send;
}

impl<T> Transport for std::sync::Arc<T>
where
    T: Transport,
{
    fn publish(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        (**self).publish(topic, message)
    }

    fn subscribe(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<MessageStream, TransportError>> + Send {
        (**self).subscribe(topic)
    }
}
