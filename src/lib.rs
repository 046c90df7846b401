#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod client;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod demux;
pub mod error;
pub mod message;
pub mod pending;
pub mod reply;
pub mod request;
pub mod retry;
pub mod scheduler;
pub mod stats;
pub mod transport;

pub use client::{ClientBuilder, RequestReplyClient};
pub use config::ReplyConfig;
pub use correlation::CorrelationId;
pub use error::RequestError;
pub use reply::ReplyHandle;
pub use retry::{Backoff, RetryPolicy};
pub use transport::Transport;

/// Commonly used types and traits.
pub mod prelude {
    pub use crate::client::{ClientBuilder, RequestReplyClient};
    pub use crate::codec::{Codec, JsonCodec};
    pub use crate::config::ReplyConfig;
    pub use crate::correlation::{CorrelationId, CorrelationIdGenerator};
    pub use crate::error::{RequestError, TransportError};
    pub use crate::message::{InboundMessage, OutboundMessage, ReplyEnvelope};
    pub use crate::reply::ReplyHandle;
    pub use crate::retry::{Backoff, RetryPolicy};
    pub use crate::transport::{MessageStream, Transport};
}
