//! A request being prepared for sending.
//!
//! [`Request`] is returned by [`RequestReplyClient::request`]. Awaiting it sends the request and waits for the reply
//! under the client's default policy. The policy and headers can be customized first, and [`Request::send`] returns
//! the [`ReplyHandle`] instead, for callers that want to block on it or attach a callback.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use lib_reply::client::RequestReplyClient;
//! use lib_reply::message::OutboundMessage;
//! use lib_reply::retry::RetryPolicy;
//! use lib_reply::transport::memory::InMemoryBroker;
//!
//! # tokio_test::block_on(async {
//! let broker = InMemoryBroker::new();
//! broker
//!     .serve("inventory", |req| {
//!         let sku = req.headers.get_str("sku").unwrap_or_default().to_string();
//!         OutboundMessage::reply_to(req, sku)
//!     })
//!     .await?;
//! let client = RequestReplyClient::start(broker).await?;
//!
//! let reply = client
//!     .request("inventory", "{}")
//!     .header("sku", "A-113")
//!     .policy(RetryPolicy::new(2, Duration::from_millis(500)))
//!     .await?;
//!
//! assert_eq!(&reply.payload[..], b"A-113");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

use std::{borrow::Cow, future::IntoFuture, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use serde::de::DeserializeOwned;

use crate::{
    client::RequestReplyClient,
    codec::Codec,
    error::RequestError,
    message::{Headers, OutboundMessage},
    reply::{Outcome, ReplyHandle},
    retry::RetryPolicy,
    transport::Transport,
};

/// A request to a topic, waiting for a reply.
#[allow(missing_debug_implementations)]
#[must_use = "request won't be sent without awaiting, or calling a send method"]
pub struct Request<'a, T, C> {
    client: &'a RequestReplyClient<T, C>,
    topic: String,
    payload: Bytes,
    headers: Headers,
    policy: Option<RetryPolicy>,
}

impl<'a, T, C> Request<'a, T, C>
where
    T: Transport,
    C: Codec,
{
    pub(crate) fn new(client: &'a RequestReplyClient<T, C>, topic: String, payload: Bytes) -> Self {
        Request {
            client,
            topic,
            payload,
            headers: Headers::new(),
            policy: None,
        }
    }

    /// Sets the retry policy of this request, overriding the client's default.
    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Sends the request once, waiting at most `timeout` for the reply.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.policy(RetryPolicy::no_retry(timeout))
    }

    /// Adds a header, forwarded with every attempt.
    ///
    /// Headers used for correlation are overwritten by the client.
    pub fn header(mut self, key: impl Into<Cow<'static, str>>, value: impl Into<Bytes>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Sends the request, returning a handle to its reply.
    pub async fn send(self) -> ReplyHandle {
        let policy = match self.policy {
            Some(policy) => Arc::new(policy),
            None => self.client.shared_default_policy(),
        };
        let message = OutboundMessage {
            key: None,
            payload: self.payload,
            headers: self.headers,
        };
        self.client.dispatch(&self.topic, message, policy).await
    }

    /// Sends the request and decodes the reply with the client's codec.
    pub async fn recv_as<R>(self) -> Result<R, RequestError>
    where
        R: DeserializeOwned,
    {
        let client = self.client;
        self.send().await.recv_as(client.codec()).await
    }
}

impl<'a, T, C> IntoFuture for Request<'a, T, C>
where
    T: Transport,
    C: Codec,
{
    type Output = Outcome;
    type IntoFuture = BoxFuture<'a, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.send().await.await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::InboundMessage, transport::memory::InMemoryBroker};

    #[tokio::test]
    async fn custom_headers_reach_the_replier() -> Result<(), Box<dyn std::error::Error>> {
        let broker = InMemoryBroker::new();
        broker
            .serve("tenants", |req: &InboundMessage| {
                OutboundMessage::reply_to(req, req.headers.get("tenant")?.clone())
            })
            .await?;
        let client = RequestReplyClient::start(broker).await?;

        let reply = client.request("tenants", "").header("tenant", "acme").await?;
        assert_eq!(&reply.payload[..], b"acme");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_sends_once() -> Result<(), Box<dyn std::error::Error>> {
        let broker = InMemoryBroker::new();
        let client = RequestReplyClient::start(broker.clone()).await?;

        let res = client
            .request("void", "ping")
            .timeout(Duration::from_millis(50))
            .await;
        assert!(matches!(res, Err(RequestError::TimeoutExhausted { attempts: 1 })));
        assert_eq!(broker.publish_count("void"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn recv_as_decodes_reply() -> Result<(), Box<dyn std::error::Error>> {
        let broker = InMemoryBroker::new();
        broker
            .serve("version", |req| OutboundMessage::reply_to(req, r#"{"major":1,"minor":4}"#))
            .await?;
        let client = RequestReplyClient::start(broker).await?;

        #[derive(serde::Deserialize)]
        struct Version {
            major: u32,
            minor: u32,
        }

        let version: Version = client.request("version", "").recv_as().await?;
        assert_eq!((version.major, version.minor), (1, 4));
        Ok(())
    }
}
