//! Messaging layer: in-process bus, envelopes, and topic resolution.
//!
//! - `MessageBus`: channel/topic pub/sub with a publish interceptor chain
//! - `Envelope`: the message unit, tagged with its request/reply role
//! - `TopicResolver`: wildcard binding matching with a binding cache

pub mod bus;
pub mod envelope;
pub mod resolver;

// Re-export key types for ergonomic access
pub use bus::{BusStats, MessageBus, PublishInterceptor, SubscriptionId, WeakBus};
pub use envelope::{
    is_truthy, keys, Envelope, EnvelopeKind, ReplyOutcome, WireEnvelope, DEFAULT_CHANNEL,
};
pub use resolver::TopicResolver;
