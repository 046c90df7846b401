//! The request-reply client.
//!
//! A [`RequestReplyClient`] turns a topic-based [`Transport`] into a request-reply channel. Every call is published
//! with a fresh [`CorrelationId`] and the client's reply topic in its headers, registered in the client's
//! [`PendingRequestTable`], and guarded by a deadline in the client's [`TimeoutScheduler`]. The call resolves with
//! the first reply carrying its correlation id, or with an error once its [`RetryPolicy`] is exhausted.
//!
//! Each client runs three background tasks:
//!
//! - the [`ReplyDemultiplexer`], consuming the reply topic;
//! - the scheduler driver, firing deadlines;
//! - the retry worker, turning fired deadlines into retry decisions and re-publishes.
//!
//! Re-publishes are spawned as their own tasks, so a slow broker never stalls timers or other calls.
//!
//! # Example
//!
//! ```
//! use lib_reply::client::RequestReplyClient;
//! use lib_reply::message::OutboundMessage;
//! use lib_reply::transport::memory::InMemoryBroker;
//!
//! # tokio_test::block_on(async {
//! let broker = InMemoryBroker::new();
//!
//! // A service answering on the "greetings" topic
//! broker
//!     .serve("greetings", |req| {
//!         let name = String::from_utf8_lossy(&req.payload);
//!         OutboundMessage::reply_to(req, format!("Hello, {name}!"))
//!     })
//!     .await?;
//!
//! let client = RequestReplyClient::start(broker).await?;
//! let reply = client.request("greetings", "world").await?;
//!
//! assert_eq!(&reply.payload[..], b"Hello, world!");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    runtime,
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    codec::{Codec, JsonCodec},
    config::{ReplyConfig, DEFAULT_REPLY_TOPIC},
    correlation::{CorrelationId, CorrelationIdGenerator, RandomIdGenerator},
    demux::ReplyDemultiplexer,
    error::{ConfigError, RequestError, TransportError},
    message::{OutboundMessage, CORRELATION_ID_HEADER, NO_REPLY_HEADER, REPLY_TOPIC_HEADER},
    pending::{ExpireOutcome, PendingRequest, PendingRequestTable},
    reply::{self, Outcome, ReplyHandle},
    request::Request,
    retry::{FailureCause, RetryCoordinator, RetryPolicy},
    scheduler::{Expired, TimeoutScheduler, TimerKind},
    stats::{ClientStats, StatsRecorder},
    transport::Transport,
};

/// Builds a [`RequestReplyClient`].
///
/// Obtained from [`RequestReplyClient::builder`].
pub struct ClientBuilder<T, C = JsonCodec> {
    transport: T,
    codec: C,
    reply_topic: String,
    default_policy: RetryPolicy,
    id_generator: Box<dyn CorrelationIdGenerator>,
}

impl<T, C> ClientBuilder<T, C>
where
    T: Transport,
    C: Codec,
{
    /// Sets the topic replies are consumed from. Defaults to `response-topic`.
    pub fn reply_topic(mut self, topic: impl Into<String>) -> Self {
        self.reply_topic = topic.into();
        self
    }

    /// Sets the policy used by calls which don't specify their own.
    pub fn default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Sets the correlation id generator. Defaults to random UUIDs.
    pub fn id_generator(mut self, generator: impl CorrelationIdGenerator) -> Self {
        self.id_generator = Box::new(generator);
        self
    }

    /// Applies the reply topic and default policy of a configuration.
    pub fn config(mut self, config: &ReplyConfig) -> Result<Self, ConfigError> {
        self.default_policy = config.retry_policy()?;
        self.reply_topic = config.reply_topic.clone();
        Ok(self)
    }

    /// Sets the codec used by the typed request methods.
    pub fn codec<C2: Codec>(self, codec: C2) -> ClientBuilder<T, C2> {
        ClientBuilder {
            transport: self.transport,
            codec,
            reply_topic: self.reply_topic,
            default_policy: self.default_policy,
            id_generator: self.id_generator,
        }
    }

    /// Subscribes to the reply topic and starts the client's background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(self) -> Result<RequestReplyClient<T, C>, TransportError> {
        let replies = self.transport.subscribe(&self.reply_topic).await?;

        let stats = Arc::new(StatsRecorder::default());
        let table = Arc::new(PendingRequestTable::with_stats(stats.clone()));
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(TimeoutScheduler::start(expired_tx));
        let demux = ReplyDemultiplexer::new(table.clone(), scheduler.clone(), stats.clone());
        let demux_task = tokio::spawn(demux.run(replies));

        let inner = Arc::new(ClientInner {
            transport: self.transport,
            codec: self.codec,
            reply_topic: self.reply_topic,
            default_policy: Arc::new(self.default_policy),
            id_generator: self.id_generator,
            table,
            scheduler,
            coordinator: RetryCoordinator::new(),
            stats,
            runtime: runtime::Handle::current(),
            running: AtomicBool::new(true),
            tasks: Mutex::new(vec![demux_task]),
        });
        let worker = tokio::spawn(retry_worker(Arc::downgrade(&inner), expired_rx));
        inner.lock_tasks().push(worker);

        info!(reply_topic = %inner.reply_topic, "request-reply client started");
        Ok(RequestReplyClient { inner })
    }
}

impl<T, C> fmt::Debug for ClientBuilder<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("reply_topic", &self.reply_topic)
            .field("default_policy", &self.default_policy)
            .finish_non_exhaustive()
    }
}

/// Sends requests over a [`Transport`] and correlates their replies.
///
/// Cloning is cheap and clones share the same pending calls. The background tasks stop when the last clone is
/// dropped or [`shutdown`](RequestReplyClient::shutdown) is called.
pub struct RequestReplyClient<T, C = JsonCodec> {
    inner: Arc<ClientInner<T, C>>,
}

struct ClientInner<T, C> {
    transport: T,
    codec: C,
    reply_topic: String,
    default_policy: Arc<RetryPolicy>,
    id_generator: Box<dyn CorrelationIdGenerator>,
    table: Arc<PendingRequestTable>,
    scheduler: Arc<TimeoutScheduler>,
    coordinator: RetryCoordinator,
    stats: Arc<StatsRecorder>,
    runtime: runtime::Handle,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> RequestReplyClient<T>
where
    T: Transport,
{
    /// Creates a builder with the default reply topic, policy, codec and id generator.
    pub fn builder(transport: T) -> ClientBuilder<T> {
        ClientBuilder {
            transport,
            codec: JsonCodec,
            reply_topic: DEFAULT_REPLY_TOPIC.to_string(),
            default_policy: RetryPolicy::default(),
            id_generator: Box::new(RandomIdGenerator),
        }
    }

    /// Starts a client with default settings.
    pub async fn start(transport: T) -> Result<Self, TransportError> {
        Self::builder(transport).start().await
    }
}

impl<T, C> RequestReplyClient<T, C>
where
    T: Transport,
    C: Codec,
{
    /// Publishes `payload` to `topic` and returns a handle resolving to its reply.
    ///
    /// The call is registered before it is published, so a reply can never outrun its registration. A failed publish
    /// is retried under `policy` like a timeout.
    pub async fn send(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        policy: &RetryPolicy,
    ) -> ReplyHandle {
        self.inner
            .dispatch(topic, OutboundMessage::new(payload), Arc::new(*policy))
            .await
    }

    /// Encodes `value` with the client's codec and sends it.
    ///
    /// An encode failure resolves the handle with [`RequestError::Serialization`] without publishing anything.
    pub async fn send_encoded<R>(&self, topic: &str, value: &R, policy: &RetryPolicy) -> ReplyHandle
    where
        R: Serialize + ?Sized,
    {
        match self.inner.codec.encode(value) {
            Ok(payload) => self.send(topic, payload, policy).await,
            Err(err) => {
                let id = self.inner.id_generator.generate();
                error!(%id, topic, %err, "failed to encode request");
                self.inner.stats.failed();
                let (completion, handle) = reply::completion(id);
                completion.resolve(Err(err.into()));
                handle
            }
        }
    }

    /// Creates a request to `topic` using the client's default policy.
    ///
    /// The request can be customized before being awaited.
    pub fn request(&self, topic: impl Into<String>, payload: impl Into<Bytes>) -> Request<'_, T, C> {
        Request::new(self, topic.into(), payload.into())
    }

    /// Sends a typed request and decodes the reply, using the client's codec and default policy.
    pub async fn call<Req, Resp>(&self, topic: &str, request: &Req) -> Result<Resp, RequestError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let policy = *self.inner.default_policy;
        self.send_encoded(topic, request, &policy)
            .await
            .recv_as(&self.inner.codec)
            .await
    }

    /// Sends a request from outside the async runtime and blocks until it resolves or `wait` elapses.
    ///
    /// Returns `None` if `wait` elapsed first. The call keeps running in the background.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn blocking_send(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        policy: &RetryPolicy,
        wait: Duration,
    ) -> Option<Outcome> {
        let mut handle = self.inner.runtime.block_on(self.send(topic, payload, policy));
        handle.blocking_recv_timeout(wait)
    }

    /// Publishes `payload` to `topic` without expecting a reply.
    ///
    /// The message still carries a fresh correlation id, which is returned, and is marked with a `no_reply` header.
    pub async fn send_without_reply(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> Result<CorrelationId, RequestError> {
        let (id, message) = self.inner.fire_and_forget(payload.into());
        self.inner.transport.publish(topic, message).await?;
        self.inner.stats.published();
        debug!(%id, topic, "published fire-and-forget message");
        Ok(id)
    }

    /// Publishes `payload` to `topic` without expecting a reply, retrying failed publishes under `policy`.
    pub async fn send_without_reply_with_retry(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        policy: &RetryPolicy,
    ) -> Result<CorrelationId, RequestError> {
        let (id, message) = self.inner.fire_and_forget(payload.into());
        let mut attempt = 1;
        loop {
            match self.inner.transport.publish(topic, message.clone()).await {
                Ok(()) => {
                    self.inner.stats.published();
                    return Ok(id);
                }
                Err(err) if attempt < policy.max_attempts() => {
                    let delay = policy.retry_delay(attempt - 1);
                    warn!(
                        %id, %err, ?delay,
                        "retry attempt {}/{}", attempt + 1, policy.max_attempts()
                    );
                    self.inner.stats.retried();
                    time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// The number of calls currently in flight.
    pub fn pending_count(&self) -> usize {
        self.inner.table.len()
    }

    /// Returns `true` until the client is shut down.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// The topic replies are consumed from.
    pub fn reply_topic(&self) -> &str {
        &self.inner.reply_topic
    }

    /// The policy used by calls which don't specify their own.
    pub fn default_policy(&self) -> &RetryPolicy {
        &self.inner.default_policy
    }

    /// The client's codec.
    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    /// A snapshot of the client's counters.
    pub fn stats(&self) -> ClientStats {
        self.inner.stats.snapshot()
    }

    /// Stops the background tasks and resolves every pending call with [`RequestError::Shutdown`].
    ///
    /// Calls sent after shutdown resolve with [`RequestError::Shutdown`] immediately. Shutting down twice is a no-op.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for task in self.inner.lock_tasks().drain(..) {
            task.abort();
        }
        self.inner.scheduler.shutdown();
        let abandoned = self.inner.table.fail_all();
        info!(abandoned, "request-reply client shut down");
    }

    pub(crate) async fn dispatch(
        &self,
        topic: &str,
        message: OutboundMessage,
        policy: Arc<RetryPolicy>,
    ) -> ReplyHandle {
        self.inner.dispatch(topic, message, policy).await
    }

    pub(crate) fn shared_default_policy(&self) -> Arc<RetryPolicy> {
        self.inner.default_policy.clone()
    }
}

impl<T, C> Clone for RequestReplyClient<T, C> {
    fn clone(&self) -> Self {
        RequestReplyClient {
            inner: self.inner.clone(),
        }
    }
}

impl<T, C> fmt::Debug for RequestReplyClient<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestReplyClient")
            .field("reply_topic", &self.inner.reply_topic)
            .field("pending", &self.inner.table.len())
            .field("running", &self.inner.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T, C> ClientInner<T, C>
where
    T: Transport,
    C: Codec,
{
    async fn dispatch(
        &self,
        topic: &str,
        mut message: OutboundMessage,
        policy: Arc<RetryPolicy>,
    ) -> ReplyHandle {
        let id = self.id_generator.generate();
        let (completion, handle) = reply::completion(id);
        if !self.running.load(Ordering::Acquire) {
            completion.resolve(Err(RequestError::Shutdown));
            return handle;
        }

        let id_bytes = Bytes::from(id.to_string());
        message.key = Some(id_bytes.clone());
        message.headers.set(CORRELATION_ID_HEADER, id_bytes);
        message
            .headers
            .set(REPLY_TOPIC_HEADER, self.reply_topic.clone());

        let entry = PendingRequest::new(id, topic, message, &self.reply_topic, policy, completion);
        let deadline = entry.deadline();
        let first = entry.attempt_message();
        if let Err((err, entry)) = self.table.register(entry) {
            error!(%id, topic, "generated correlation id is already in flight");
            self.stats.failed();
            entry.resolve(Err(err.into()));
            return handle;
        }
        if !self.arm(id, deadline, TimerKind::ReplyDeadline, 1) {
            return handle;
        }

        info!(%id, topic, "publishing request");
        match self.transport.publish(topic, first).await {
            Ok(()) => self.stats.published(),
            Err(err) => {
                warn!(%id, topic, %err, "failed to publish request");
                self.on_attempt_failed(id, 1, FailureCause::Transport(err));
            }
        }
        handle
    }

    fn fire_and_forget(&self, payload: Bytes) -> (CorrelationId, OutboundMessage) {
        let id = self.id_generator.generate();
        let id_bytes = Bytes::from(id.to_string());
        let mut message = OutboundMessage::new(payload);
        message.key = Some(id_bytes.clone());
        message.headers.set(CORRELATION_ID_HEADER, id_bytes);
        message.headers.set(NO_REPLY_HEADER, "true");
        (id, message)
    }

    /// Arms a timer, failing the call if the scheduler is already shut down.
    fn arm(&self, id: CorrelationId, deadline: Instant, kind: TimerKind, attempt: u32) -> bool {
        if self.scheduler.schedule(id, deadline, kind, attempt) {
            return true;
        }
        self.table.complete(id, Err(RequestError::Shutdown));
        false
    }

    fn on_attempt_failed(&self, id: CorrelationId, attempt: u32, cause: FailureCause) {
        let outcome = self.table.expire_attempt(id, attempt, |entry| {
            self.coordinator.on_expire(entry, Instant::now(), cause)
        });
        match outcome {
            ExpireOutcome::Stale => {}
            ExpireOutcome::Retry {
                resend_at,
                failed_attempt,
                max_attempts,
            } => {
                self.stats.retried();
                warn!(
                    %id,
                    attempt = failed_attempt + 1,
                    max_attempts,
                    "retry attempt {}/{}",
                    failed_attempt + 1,
                    max_attempts
                );
                self.arm(id, resend_at, TimerKind::Resend, failed_attempt);
            }
            ExpireOutcome::Exhausted { .. } => {
                self.scheduler.cancel(id);
            }
        }
    }
}

impl<T, C> ClientInner<T, C> {
    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T, C> Drop for ClientInner<T, C> {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.scheduler.shutdown();
        self.table.fail_all();
    }
}

/// Turns fired timers into retry decisions and re-publishes.
async fn retry_worker<T, C>(
    weak: Weak<ClientInner<T, C>>,
    mut expired: mpsc::UnboundedReceiver<Expired>,
) where
    T: Transport,
    C: Codec,
{
    while let Some(Expired {
        correlation_id: id,
        kind,
        attempt,
    }) = expired.recv().await
    {
        let Some(client) = weak.upgrade() else {
            break;
        };
        match kind {
            TimerKind::ReplyDeadline => {
                debug!(%id, attempt, "attempt timed out");
                client.on_attempt_failed(id, attempt, FailureCause::Timeout);
            }
            TimerKind::Resend => resend(client, id, attempt),
        }
    }
}

fn resend<T, C>(client: Arc<ClientInner<T, C>>, id: CorrelationId, after_attempt: u32)
where
    T: Transport,
    C: Codec,
{
    let Some(resend) = client.table.begin_resend(id, after_attempt) else {
        return;
    };
    if !client.arm(id, resend.deadline, TimerKind::ReplyDeadline, resend.attempt) {
        return;
    }

    tokio::spawn(async move {
        let attempt = resend.attempt;
        match client
            .transport
            .publish(&resend.destination, resend.message)
            .await
        {
            Ok(()) => {
                client.stats.published();
                debug!(%id, attempt, "re-published request");
            }
            Err(err) => {
                warn!(%id, attempt, %err, "failed to re-publish request");
                client.on_attempt_failed(id, attempt, FailureCause::Transport(err));
            }
        }
    });
}
