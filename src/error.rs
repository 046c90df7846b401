//! Defines error handling constructs for lib-reply.
//!
//! [`RequestError`] is the single outcome type delivered through a [`ReplyHandle`](crate::reply::ReplyHandle).
//! Collaborator failures are wrapped in [`TransportError`] and [`CodecError`], while [`RegisterError`] is returned
//! by the [`PendingRequestTable`](crate::pending::PendingRequestTable) itself.

use std::{error, fmt};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::correlation::CorrelationId;

/// A dyn boxed error.
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// The terminal failure of a request-reply call.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The generated correlation id was already in flight.
    ///
    /// This indicates a broken [`CorrelationIdGenerator`](crate::correlation::CorrelationIdGenerator).
    #[error("correlation id {0} is already in flight")]
    DuplicateCorrelationId(CorrelationId),
    /// Every attempt elapsed without a matching reply.
    #[error("no reply after {attempts} attempt(s)")]
    TimeoutExhausted {
        /// Number of publish attempts made.
        attempts: u32,
    },
    /// The transport failed on the final attempt.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The request or reply payload could not be encoded or decoded.
    #[error(transparent)]
    Serialization(#[from] CodecError),
    /// The replying service answered with an error reply.
    #[error("remote error: {message}")]
    Remote {
        /// Error message carried by the reply.
        message: String,
    },
    /// The client was shut down before the call resolved.
    #[error("client shut down")]
    Shutdown,
}

impl RequestError {
    /// Returns `true` if this error is a [`RequestError::TimeoutExhausted`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::TimeoutExhausted { .. })
    }
}

impl From<RegisterError> for RequestError {
    fn from(err: RegisterError) -> Self {
        match err {
            RegisterError::DuplicateCorrelationId(id) => RequestError::DuplicateCorrelationId(id),
        }
    }
}

impl From<oneshot::error::RecvError> for RequestError {
    fn from(_err: oneshot::error::RecvError) -> Self {
        RequestError::Shutdown
    }
}

/// Error returned when registering a pending request.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    /// An entry with the same correlation id is already registered.
    #[error("correlation id {0} is already registered")]
    DuplicateCorrelationId(CorrelationId),
}

/// A failure reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Publishing a message failed.
    #[error("failed to publish to topic '{topic}': {source}")]
    Publish {
        /// The destination topic.
        topic: String,
        /// Underlying cause.
        source: BoxError,
    },
    /// Subscribing to a topic failed.
    #[error("failed to subscribe to topic '{topic}': {source}")]
    Subscribe {
        /// The subscribed topic.
        topic: String,
        /// Underlying cause.
        source: BoxError,
    },
    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
    /// Any other transport failure.
    #[error(transparent)]
    Other(BoxError),
}

impl TransportError {
    /// Creates a [`TransportError::Publish`] from any error.
    pub fn publish(topic: impl Into<String>, source: impl Into<BoxError>) -> Self {
        TransportError::Publish {
            topic: topic.into(),
            source: source.into(),
        }
    }

    /// Creates a [`TransportError::Subscribe`] from any error.
    pub fn subscribe(topic: impl Into<String>, source: impl Into<BoxError>) -> Self {
        TransportError::Subscribe {
            topic: topic.into(),
            source: source.into(),
        }
    }
}

/// An encode or decode failure reported by a [`Codec`](crate::codec::Codec).
#[derive(Debug, Error)]
pub enum CodecError {
    /// The value could not be encoded.
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
    /// The bytes could not be decoded.
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Error returned when a configuration value is out of range.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub(crate) String);

impl ConfigError {
    pub(crate) fn new(msg: impl fmt::Display) -> Self {
        ConfigError(msg.to_string())
    }
}
