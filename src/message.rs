//! Wire-level message types exchanged with a [`Transport`](crate::transport::Transport).
//!
//! Requests and replies are plain byte payloads with Kafka-style headers. The header names used by lib-reply are
//! exported as constants so that repliers can read and echo them.

use std::{borrow::Cow, time::SystemTime};

use bytes::Bytes;
use tokio::time::Instant;

use crate::correlation::CorrelationId;

/// Header carrying the request's correlation id. Replies must echo it.
pub const CORRELATION_ID_HEADER: &str = "correlation_id";
/// Header carrying the topic replies should be published to.
pub const REPLY_TOPIC_HEADER: &str = "reply_topic";
/// Optional header hinting the absolute deadline of the current attempt, in unix milliseconds.
pub const DEADLINE_HEADER: &str = "deadline_ms";
/// Header carrying the 1-based attempt number of the request.
pub const ATTEMPT_HEADER: &str = "attempt";
/// Header marking a fire-and-forget request that expects no reply.
pub const NO_REPLY_HEADER: &str = "no_reply";
/// Header marking a reply as an error reply. The value is the error message.
pub const ERROR_HEADER: &str = "error";

/// A single message header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Header name.
    pub key: Cow<'static, str>,
    /// Raw header value.
    pub value: Bytes,
}

/// An ordered list of message headers.
///
/// Like Kafka record headers, keys may repeat. Lookups return the last value for a key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// Creates an empty header list.
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    /// Appends a header.
    pub fn insert(&mut self, key: impl Into<Cow<'static, str>>, value: impl Into<Bytes>) {
        self.0.push(Header {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Appends a header, returning self.
    pub fn with(mut self, key: impl Into<Cow<'static, str>>, value: impl Into<Bytes>) -> Self {
        self.insert(key, value);
        self
    }

    /// Replaces all headers with the given key by a single new value.
    pub fn set(&mut self, key: impl Into<Cow<'static, str>>, value: impl Into<Bytes>) {
        let key = key.into();
        self.0.retain(|header| header.key != key);
        self.insert(key, value);
    }

    /// Returns the last value for a key.
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.0
            .iter()
            .rev()
            .find(|header| header.key == key)
            .map(|header| &header.value)
    }

    /// Returns the last value for a key as UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    /// Returns `true` if a header with the given key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|header| header.key == key)
    }

    /// The number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over all headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    /// Reads the correlation id header.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.get(CORRELATION_ID_HEADER)
            .and_then(|value| CorrelationId::from_bytes(value))
    }
}

impl Extend<Header> for Headers {
    fn extend<T: IntoIterator<Item = Header>>(&mut self, iter: T) {
        self.0.extend(iter)
    }
}

/// A message handed to [`Transport::publish`](crate::transport::Transport::publish).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Record key. Requests use the correlation id.
    pub key: Option<Bytes>,
    /// Encoded payload.
    pub payload: Bytes,
    /// Message metadata.
    pub headers: Headers,
}

impl OutboundMessage {
    /// Creates a message without key or headers.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        OutboundMessage {
            key: None,
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    /// Builds a reply to `request`, echoing its correlation id.
    ///
    /// Returns `None` if the request carries no correlation id.
    pub fn reply_to(request: &InboundMessage, payload: impl Into<Bytes>) -> Option<Self> {
        let id = request.correlation_id()?;
        let id = Bytes::from(id.to_string());
        Some(OutboundMessage {
            key: Some(id.clone()),
            payload: payload.into(),
            headers: Headers::new().with(CORRELATION_ID_HEADER, id),
        })
    }

    /// Builds an error reply to `request`, echoing its correlation id.
    pub fn error_reply_to(request: &InboundMessage, message: impl Into<String>) -> Option<Self> {
        let mut reply = Self::reply_to(request, Bytes::new())?;
        reply.headers.insert(ERROR_HEADER, message.into());
        Some(reply)
    }
}

/// A message yielded by a [`Transport`](crate::transport::Transport) subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was received on.
    pub topic: String,
    /// Record key.
    pub key: Option<Bytes>,
    /// Raw payload.
    pub payload: Bytes,
    /// Message metadata.
    pub headers: Headers,
}

impl InboundMessage {
    /// Extracts the correlation id, preferring the header and falling back to the record key.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.headers.correlation_id().or_else(|| {
            self.key
                .as_deref()
                .and_then(CorrelationId::from_bytes)
        })
    }

    /// The topic a replier should answer on, if the sender expects a reply.
    pub fn reply_topic(&self) -> Option<&str> {
        if self.headers.get_str(NO_REPLY_HEADER) == Some("true") {
            return None;
        }
        self.headers.get_str(REPLY_TOPIC_HEADER)
    }
}

/// An inbound reply matched to a correlation id.
#[derive(Clone, Debug)]
pub struct ReplyEnvelope {
    /// The correlation id echoed by the replier.
    pub correlation_id: CorrelationId,
    /// Raw reply payload.
    pub payload: Bytes,
    /// Reply metadata.
    pub headers: Headers,
    /// When the reply was taken off the reply stream.
    pub received_at: Instant,
}

impl ReplyEnvelope {
    /// Builds an envelope from an inbound message, or `None` if it carries no correlation id.
    pub fn from_inbound(msg: InboundMessage) -> Option<Self> {
        let correlation_id = msg.correlation_id()?;
        Some(ReplyEnvelope {
            correlation_id,
            payload: msg.payload,
            headers: msg.headers,
            received_at: Instant::now(),
        })
    }

    /// The error message if this is an error reply.
    pub fn error_message(&self) -> Option<String> {
        self.headers
            .get(ERROR_HEADER)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }
}

/// Milliseconds since the unix epoch for a point `after` now, used for the deadline hint.
pub(crate) fn unix_millis_after(after: std::time::Duration) -> u64 {
    SystemTime::now()
        .checked_add(after)
        .and_then(|at| at.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|since| since.as_millis() as u64)
        .unwrap_or_default()
}
