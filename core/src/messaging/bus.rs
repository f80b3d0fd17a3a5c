// In-process message bus
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::envelope::Envelope;
use super::resolver::TopicResolver;
use crate::Result;

/// Publish middleware.
///
/// Interceptors run in registration order on every envelope passed to
/// [`MessageBus::publish`], before delivery. They may decorate the envelope
/// but cannot veto the publish.
pub trait PublishInterceptor: Send + Sync {
    /// Unique name; the bus keeps at most one interceptor per name.
    fn name(&self) -> &str;

    fn before_publish(&self, envelope: &mut Envelope, bus: &MessageBus);
}

/// Handle identifying a subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

enum Delivery {
    Stream(mpsc::UnboundedSender<Envelope>),
    // Taken on first delivery
    Once(Option<oneshot::Sender<Envelope>>),
}

struct Subscription {
    id: SubscriptionId,
    binding: String,
    delivery: Delivery,
}

/// Per-channel bus statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusStats {
    pub total_published: u64,
    pub total_delivered: u64,
    /// Publishes that matched no subscription
    pub undelivered: u64,
}

pub(crate) struct BusInner {
    // Channel -> subscriber list
    subscriptions: DashMap<String, Vec<Subscription>>,
    interceptors: RwLock<Vec<Arc<dyn PublishInterceptor>>>,
    resolver: TopicResolver,
    stats: DashMap<String, BusStats>,
    next_id: AtomicU64,
}

/// Topic-based publish/subscribe bus.
///
/// Subscriptions are scoped to a channel and bound to a topic pattern (see
/// [`TopicResolver`]). Delivery is fire-and-forget: publishing never waits on
/// subscribers and nothing is retried.
///
/// `MessageBus` is a cheap handle; clones share the same registry.
///
/// # Examples
///
/// ```
/// use courier_core::{Envelope, MessageBus};
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> courier_core::Result<()> {
/// let bus = MessageBus::new();
/// let (_id, mut rx) = bus.subscribe("orders", "order.*");
/// bus.publish(Envelope::new("order.created", json!(42)).with_channel("orders"))?;
/// let env = rx.recv().await.unwrap();
/// assert_eq!(env.data, json!(42));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

/// Non-owning bus handle held by reply capabilities.
#[derive(Clone)]
pub struct WeakBus(Weak<BusInner>);

impl WeakBus {
    pub fn upgrade(&self) -> Option<MessageBus> {
        self.0.upgrade().map(|inner| MessageBus { inner })
    }
}

impl fmt::Debug for WeakBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakBus")
            .field("alive", &(self.0.strong_count() > 0))
            .finish()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscriptions: DashMap::new(),
                interceptors: RwLock::new(Vec::new()),
                resolver: TopicResolver::new(),
                stats: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakBus {
        WeakBus(Arc::downgrade(&self.inner))
    }

    /// Registers a publish interceptor. Returns `false` if one with the same
    /// name is already installed.
    pub fn add_interceptor(&self, interceptor: Arc<dyn PublishInterceptor>) -> bool {
        let mut chain = self
            .inner
            .interceptors
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if chain.iter().any(|i| i.name() == interceptor.name()) {
            return false;
        }
        info!(interceptor = interceptor.name(), "Installed publish interceptor");
        chain.push(interceptor);
        true
    }

    pub fn interceptor_names(&self) -> Vec<String> {
        self.inner
            .interceptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|i| i.name().to_string())
            .collect()
    }

    /// Publish an envelope to every matching subscription on its channel.
    ///
    /// Returns the number of subscriptions the envelope was delivered to.
    pub fn publish(&self, mut envelope: Envelope) -> Result<usize> {
        envelope.timestamp_ms = chrono::Utc::now().timestamp_millis();

        let chain: Vec<Arc<dyn PublishInterceptor>> = self
            .inner
            .interceptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for interceptor in &chain {
            interceptor.before_publish(&mut envelope, self);
        }

        debug!(
            channel = %envelope.channel,
            topic = %envelope.topic,
            "Publishing envelope"
        );

        let no_cache = envelope.kind.resolver_no_cache();
        let mut delivered = 0usize;
        if let Some(mut subs) = self.inner.subscriptions.get_mut(&envelope.channel) {
            subs.retain_mut(|sub| {
                if !self
                    .inner
                    .resolver
                    .compare(&sub.binding, &envelope.topic, no_cache)
                {
                    return true;
                }
                match &mut sub.delivery {
                    Delivery::Stream(tx) => {
                        if tx.send(envelope.clone()).is_ok() {
                            delivered += 1;
                            true
                        } else {
                            warn!(subscription = %sub.id, "Subscriber dropped; pruning subscription");
                            false
                        }
                    }
                    Delivery::Once(slot) => {
                        if let Some(tx) = slot.take() {
                            if tx.send(envelope.clone()).is_ok() {
                                delivered += 1;
                            }
                        }
                        false
                    }
                }
            });
        }
        self.inner
            .subscriptions
            .remove_if(&envelope.channel, |_, subs| subs.is_empty());

        self.update_stats(&envelope.channel, |stats| {
            stats.total_published += 1;
            stats.total_delivered += delivered as u64;
            if delivered == 0 {
                stats.undelivered += 1;
            }
        });
        if delivered == 0 {
            debug!(
                channel = %envelope.channel,
                topic = %envelope.topic,
                "No subscriptions matched"
            );
        }
        Ok(delivered)
    }

    /// Subscribe to every topic on `channel` matching `binding`.
    pub fn subscribe(
        &self,
        channel: impl Into<String>,
        binding: impl Into<String>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = channel.into();
        let binding = binding.into();
        let id = self.register(channel.clone(), binding.clone(), Delivery::Stream(tx));
        info!(subscription = %id, %channel, %binding, "Created subscription");
        (id, rx)
    }

    /// Subscribe for a single envelope; the subscription removes itself at
    /// its first delivery.
    pub fn subscribe_once(
        &self,
        channel: impl Into<String>,
        binding: impl Into<String>,
    ) -> (SubscriptionId, oneshot::Receiver<Envelope>) {
        let (tx, rx) = oneshot::channel();
        let channel = channel.into();
        let binding = binding.into();
        let id = self.register(channel.clone(), binding.clone(), Delivery::Once(Some(tx)));
        debug!(subscription = %id, %channel, %binding, "Created one-shot subscription");
        (id, rx)
    }

    /// Remove a subscription. Returns whether it was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for mut entry in self.inner.subscriptions.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|sub| sub.id != id);
            removed |= entry.value().len() != before;
        }
        self.inner.subscriptions.retain(|_, subs| !subs.is_empty());
        if removed {
            debug!(subscription = %id, "Unsubscribed");
        }
        removed
    }

    pub fn subscription_count(&self, channel: &str) -> usize {
        self.inner
            .subscriptions
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    pub fn stats(&self, channel: &str) -> Option<BusStats> {
        self.inner.stats.get(channel).map(|s| s.clone())
    }

    /// Cached topic bindings held by the resolver
    pub fn resolver_cache_len(&self) -> usize {
        self.inner.resolver.cache_len()
    }

    /// Drops every subscription, cached binding and statistic. Interceptors
    /// stay installed.
    pub fn reset(&self) {
        self.inner.subscriptions.clear();
        self.inner.resolver.reset();
        self.inner.stats.clear();
        info!("Message bus reset");
    }

    fn register(&self, channel: String, binding: String, delivery: Delivery) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscriptions
            .entry(channel)
            .or_default()
            .push(Subscription {
                id,
                binding,
                delivery,
            });
        id
    }

    fn update_stats<F>(&self, channel: &str, f: F)
    where
        F: FnOnce(&mut BusStats),
    {
        f(self
            .inner
            .stats
            .entry(channel.to_string())
            .or_default()
            .value_mut());
    }
}
