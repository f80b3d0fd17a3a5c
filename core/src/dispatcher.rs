use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::RequestReplyConfig;
use crate::correlation::{CorrelationIdGenerator, UuidGenerator};
use crate::messaging::{
    keys, Envelope, EnvelopeKind, MessageBus, ReplyOutcome, SubscriptionId, DEFAULT_CHANNEL,
};
use crate::promise::{OneshotDeferred, PromiseConfig, Rejection, ReplyFuture, TimeoutError};
use crate::reply_router::ReplyRouter;
use crate::{CourierError, Result};

/// Input to [`RequestDispatcher::request`].
///
/// Either `topic` or `envelope` must be given. When an envelope is supplied
/// its topic and data are used as-is and `topic`/`data` are ignored.
///
/// # Examples
///
/// ```
/// use courier_core::RequestOptions;
/// use serde_json::json;
/// use std::time::Duration;
///
/// let opts = RequestOptions::new("who.are.you")
///     .channel("channel1")
///     .data(json!({ "asking": "Martha" }))
///     .timeout(Duration::from_millis(500));
/// assert_eq!(opts.topic.as_deref(), Some("who.are.you"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Channel the request is published on (default `/`)
    pub channel: Option<String>,
    pub topic: Option<String>,
    pub data: Value,
    /// Extra headers merged into the outgoing envelope
    pub headers: HashMap<String, Value>,
    pub envelope: Option<Envelope>,
    /// Defaults to the generated request id
    pub reply_topic: Option<String>,
    /// Defaults to the dispatcher's reply channel
    pub reply_channel: Option<String>,
    /// `None` (or zero) waits indefinitely unless the dispatcher has a
    /// default timeout
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Default::default()
        }
    }

    pub fn from_envelope(envelope: Envelope) -> Self {
        Self {
            envelope: Some(envelope),
            ..Default::default()
        }
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    pub fn reply_topic(mut self, topic: impl Into<String>) -> Self {
        self.reply_topic = Some(topic.into());
        self
    }

    pub fn reply_channel(mut self, channel: impl Into<String>) -> Self {
        self.reply_channel = Some(channel.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn build_envelope(&mut self) -> Result<Envelope> {
        let mut envelope = match self.envelope.take() {
            Some(envelope) => envelope,
            None => {
                let topic = self
                    .topic
                    .take()
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| {
                        CourierError::InvalidRequest("a topic or an envelope is required".into())
                    })?;
                Envelope::new(topic, std::mem::take(&mut self.data))
            }
        };
        if envelope.topic.is_empty() {
            return Err(CourierError::InvalidRequest(
                "request envelope has an empty topic".into(),
            ));
        }
        if let Some(channel) = self.channel.take() {
            envelope.channel = channel;
        }
        if envelope.channel.is_empty() {
            envelope.channel = DEFAULT_CHANNEL.to_string();
        }
        envelope.headers.extend(std::mem::take(&mut self.headers));
        // Correlation headers are owned by the envelope kind
        for key in keys::CORRELATION {
            envelope.headers.remove(key);
        }
        envelope.replier = None;
        Ok(envelope)
    }
}

/// Bookkeeping for a request awaiting its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub request_id: String,
    pub reply_channel: String,
    pub reply_topic: String,
    pub subscription: SubscriptionId,
    pub deadline: Option<Instant>,
}

/// Request/response entry point on top of a [`MessageBus`].
///
/// Each request publishes an envelope tagged with a fresh correlation id and
/// returns the adapter's future, which settles with the first reply or with a
/// [`TimeoutError`] rejection, whichever comes first. Settling releases the
/// reply subscription, the timer and the pending record together.
/// With the built-in adapter, dropping the future before it settles releases
/// them as well.
///
/// # Examples
///
/// ```
/// use courier_core::{MessageBus, RequestDispatcher, RequestOptions};
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> courier_core::Result<()> {
/// let bus = MessageBus::new();
/// let dispatcher = RequestDispatcher::tokio(bus.clone());
///
/// let (_id, mut requests) = bus.subscribe("channel1", "who.are.you");
/// tokio::spawn(async move {
///     while let Some(req) = requests.recv().await {
///         let _ = req.reply(None, json!({ "name": "I'm the Doctor" }));
///     }
/// });
///
/// let answer = dispatcher
///     .request(RequestOptions::new("who.are.you").channel("channel1"))?
///     .await
///     .unwrap();
/// assert_eq!(answer, json!({ "name": "I'm the Doctor" }));
/// # Ok(())
/// # }
/// ```
pub struct RequestDispatcher<D = OneshotDeferred, F = ReplyFuture> {
    bus: MessageBus,
    promise: PromiseConfig<D, F>,
    config: RequestReplyConfig,
    ids: Arc<dyn CorrelationIdGenerator>,
    pending: Arc<DashMap<String, PendingRequest>>,
}

impl RequestDispatcher<OneshotDeferred, ReplyFuture> {
    /// Dispatcher using the built-in tokio promise adapter.
    pub fn tokio(bus: MessageBus) -> Self {
        Self::new(bus, PromiseConfig::tokio())
    }
}

impl<D, F> RequestDispatcher<D, F>
where
    D: Send + 'static,
    F: 'static,
{
    pub fn new(bus: MessageBus, promise: PromiseConfig<D, F>) -> Self {
        Self::with_config(bus, promise, RequestReplyConfig::default())
    }

    /// Creates a dispatcher and installs the reply router on `bus`.
    pub fn with_config(
        bus: MessageBus,
        promise: PromiseConfig<D, F>,
        config: RequestReplyConfig,
    ) -> Self {
        bus.add_interceptor(Arc::new(ReplyRouter));
        Self {
            bus,
            promise,
            config,
            ids: Arc::new(UuidGenerator::new()),
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn CorrelationIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn config(&self) -> &RequestReplyConfig {
        &self.config
    }

    /// Number of requests still waiting for a reply or a timeout.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending.get(request_id).map(|p| p.clone())
    }

    /// Issues a request and returns the future for its reply.
    ///
    /// Configuration and argument errors are returned here, before any
    /// subscription, timer or publish takes place. Must be called from
    /// within a tokio runtime.
    pub fn request(&self, mut options: RequestOptions) -> Result<F> {
        self.promise.ensure_configured()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CourierError::RuntimeUnavailable)?;

        let mut envelope = options.build_envelope()?;
        let request_id = self.ids.create();
        let reply_topic = options
            .reply_topic
            .take()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| request_id.clone());
        let reply_channel = options
            .reply_channel
            .take()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.config.reply_channel.clone());
        let timeout = options
            .timeout
            .or_else(|| self.config.default_timeout())
            .filter(|t| !t.is_zero());
        // A deadline past the clock's range behaves like no deadline
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        envelope.kind = EnvelopeKind::Request {
            request_id: request_id.clone(),
            reply_channel: reply_channel.clone(),
            reply_topic: reply_topic.clone(),
        };

        // Reserve the id before any subscription exists
        let slot = match self.pending.entry(request_id.clone()) {
            Entry::Occupied(_) => return Err(CourierError::DuplicateRequest(request_id)),
            Entry::Vacant(slot) => slot,
        };
        let (deferred, future) = self.promise.make()?;

        // Subscribe before publishing so an immediate reply cannot be missed
        let (subscription, reply_rx) = self
            .bus
            .subscribe_once(reply_channel.clone(), reply_topic.clone());
        slot.insert(PendingRequest {
            request_id: request_id.clone(),
            reply_channel: reply_channel.clone(),
            reply_topic: reply_topic.clone(),
            subscription,
            deadline,
        });

        debug!(
            %request_id,
            channel = %envelope.channel,
            topic = %envelope.topic,
            %reply_channel,
            %reply_topic,
            ?timeout,
            "Publishing request"
        );
        if let Err(err) = self.bus.publish(envelope) {
            self.bus.unsubscribe(subscription);
            self.pending.remove(&request_id);
            return Err(err);
        }

        let waiter = Waiter {
            request_id,
            subscription,
            timeout,
            reply_rx,
            deferred,
            promise: self.promise.clone(),
            bus: self.bus.clone(),
            pending: Arc::clone(&self.pending),
        };
        runtime.spawn(waiter.run());

        Ok(future)
    }
}

impl<D, F> Clone for RequestDispatcher<D, F> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            promise: self.promise.clone(),
            config: self.config.clone(),
            ids: Arc::clone(&self.ids),
            pending: Arc::clone(&self.pending),
        }
    }
}

/// Races a request's reply against its timer and settles the deferred.
struct Waiter<D, F> {
    request_id: String,
    subscription: SubscriptionId,
    timeout: Option<Duration>,
    reply_rx: oneshot::Receiver<Envelope>,
    deferred: D,
    promise: PromiseConfig<D, F>,
    bus: MessageBus,
    pending: Arc<DashMap<String, PendingRequest>>,
}

impl<D, F> Waiter<D, F>
where
    D: Send + 'static,
    F: 'static,
{
    async fn run(self) {
        let Waiter {
            request_id,
            subscription,
            timeout,
            reply_rx,
            mut deferred,
            promise,
            bus,
            pending,
        } = self;

        let abandoned = promise.watch_abandoned(&mut deferred);
        let reply = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, reply_rx).await.ok(),
                None => Some(reply_rx.await),
            }
        };
        let caller_gone = async move {
            match abandoned {
                Some(signal) => signal.await,
                None => std::future::pending().await,
            }
        };

        let received = tokio::select! {
            biased;
            received = reply => received,
            _ = caller_gone => {
                pending.remove(&request_id);
                bus.unsubscribe(subscription);
                debug!(%request_id, "Caller dropped its future; request released");
                return;
            }
        };

        // Release the reply route before the caller can observe the outcome
        pending.remove(&request_id);
        match received {
            Some(Ok(reply)) => {
                let failed = matches!(
                    reply.kind,
                    EnvelopeKind::Reply {
                        outcome: ReplyOutcome::Error,
                        ..
                    }
                );
                debug!(%request_id, failed, "Reply received");
                if failed {
                    promise.fail(&deferred, Rejection::Application(reply.data));
                } else {
                    promise.fulfill(&deferred, reply.data);
                }
            }
            Some(Err(_)) => {
                // Subscription removed without delivery (bus reset); the
                // deferred is dropped unsettled
                warn!(%request_id, "Reply subscription removed before a reply arrived");
            }
            None => {
                bus.unsubscribe(subscription);
                info!(%request_id, "Request timed out");
                promise.fail(&deferred, Rejection::Timeout(TimeoutError { request_id }));
            }
        }
    }
}
