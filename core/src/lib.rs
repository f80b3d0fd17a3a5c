// Courier Core Library
// Request/response correlation on top of a fire-and-forget pub/sub bus

pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod messaging;
pub mod promise;
pub mod reply_router;
pub mod telemetry;

// Export core types
pub use config::{RequestReplyConfig, REPLY_CHANNEL};
pub use correlation::{CorrelationIdGenerator, UuidGenerator};
pub use dispatcher::{PendingRequest, RequestDispatcher, RequestOptions};
pub use messaging::{
    keys, BusStats, Envelope, EnvelopeKind, MessageBus, PublishInterceptor, ReplyOutcome,
    SubscriptionId, TopicResolver, WireEnvelope, DEFAULT_CHANNEL,
};
pub use promise::{
    Abandoned, Deferred, OneshotDeferred, PromiseConfig, Rejection, ReplyFuture, TimeoutError,
    TIMEOUT_MESSAGE,
};
pub use reply_router::{Replier, ReplyRouter};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CourierError {
    /// The promise adapter is missing `create_deferred` or `get_promise`
    #[error("{0}")]
    Configuration(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request id already pending: {0}")]
    DuplicateRequest(String),

    #[error("Envelope does not expect a reply")]
    NotReplyable,

    #[error("Message bus has been dropped")]
    BusClosed,

    #[error("No tokio runtime available to drive the request")]
    RuntimeUnavailable,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, CourierError>;
