use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reply_router::Replier;
use crate::{CourierError, Result};

/// Reserved header keys for request/reply correlation.
///
/// These keys appear in the wire form of an envelope (`WireEnvelope.headers`).
/// Inside the crate they are carried by [`EnvelopeKind`] instead, so a
/// half-populated combination cannot be constructed.
pub mod keys {
    /// The envelope expects a reply
    pub const REPLYABLE: &str = "replyable";
    /// Correlation identifier linking a reply to its request
    pub const REQUEST_ID: &str = "requestId";
    /// Topic replies must be published on
    pub const REPLY_TOPIC: &str = "replyTopic";
    /// Channel replies must be published on
    pub const REPLY_CHANNEL: &str = "replyChannel";
    /// The envelope is itself a reply
    pub const IS_REPLY: &str = "isReply";
    /// The reply carries an error value instead of a success value
    pub const IS_ERROR: &str = "isError";
    /// Hint to the bus resolver not to cache this topic binding
    pub const RESOLVER_NO_CACHE: &str = "resolverNoCache";

    /// All keys owned by the correlation layer.
    pub const CORRELATION: [&str; 7] = [
        REPLYABLE,
        REQUEST_ID,
        REPLY_TOPIC,
        REPLY_CHANNEL,
        IS_REPLY,
        IS_ERROR,
        RESOLVER_NO_CACHE,
    ];
}

/// Channel used for plain publishes when none is given.
pub const DEFAULT_CHANNEL: &str = "/";

/// Whether a reply settles the request successfully or with an error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyOutcome {
    Success,
    Error,
}

/// Role of an envelope in the request/reply protocol.
///
/// Each variant carries exactly the correlation fields relevant to it:
///
/// * `Plain` - ordinary fire-and-forget publish
/// * `Request` - expects a reply on `(reply_channel, reply_topic)`
/// * `Reply` - answers the request identified by `request_id`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EnvelopeKind {
    #[default]
    Plain,
    Request {
        request_id: String,
        reply_channel: String,
        reply_topic: String,
    },
    Reply {
        request_id: String,
        outcome: ReplyOutcome,
    },
}

impl EnvelopeKind {
    /// Returns the correlation identifier for requests and replies.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            EnvelopeKind::Plain => None,
            EnvelopeKind::Request { request_id, .. } | EnvelopeKind::Reply { request_id, .. } => {
                Some(request_id)
            }
        }
    }

    pub fn is_replyable(&self) -> bool {
        matches!(self, EnvelopeKind::Request { .. })
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, EnvelopeKind::Reply { .. })
    }

    /// Reply topics are single-use, so their bindings must not be cached.
    pub fn resolver_no_cache(&self) -> bool {
        self.is_reply()
    }

    /// Writes the correlation headers for this kind into a header map,
    /// overwriting any existing values for those keys.
    pub fn apply_to_headers(&self, headers: &mut HashMap<String, Value>) {
        match self {
            EnvelopeKind::Plain => {}
            EnvelopeKind::Request {
                request_id,
                reply_channel,
                reply_topic,
            } => {
                headers.insert(keys::REPLYABLE.into(), Value::Bool(true));
                headers.insert(keys::REQUEST_ID.into(), Value::from(request_id.as_str()));
                headers.insert(keys::REPLY_TOPIC.into(), Value::from(reply_topic.as_str()));
                headers.insert(
                    keys::REPLY_CHANNEL.into(),
                    Value::from(reply_channel.as_str()),
                );
            }
            EnvelopeKind::Reply {
                request_id,
                outcome,
            } => {
                headers.insert(keys::IS_REPLY.into(), Value::Bool(true));
                headers.insert(
                    keys::IS_ERROR.into(),
                    Value::Bool(*outcome == ReplyOutcome::Error),
                );
                headers.insert(keys::REQUEST_ID.into(), Value::from(request_id.as_str()));
                headers.insert(keys::RESOLVER_NO_CACHE.into(), Value::Bool(true));
            }
        }
    }

    /// Parses the kind back out of wire headers.
    ///
    /// A request needs all three of `requestId`, `replyTopic` and
    /// `replyChannel`; a reply needs `requestId`. Anything less is `Plain`.
    pub fn from_headers(headers: &HashMap<String, Value>) -> Self {
        let flag = |key: &str| headers.get(key).map(is_truthy).unwrap_or(false);
        let text = |key: &str| {
            headers
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        if flag(keys::IS_REPLY) {
            if let Some(request_id) = text(keys::REQUEST_ID) {
                let outcome = if flag(keys::IS_ERROR) {
                    ReplyOutcome::Error
                } else {
                    ReplyOutcome::Success
                };
                return EnvelopeKind::Reply {
                    request_id,
                    outcome,
                };
            }
        }
        if flag(keys::REPLYABLE) {
            if let (Some(request_id), Some(reply_channel), Some(reply_topic)) = (
                text(keys::REQUEST_ID),
                text(keys::REPLY_CHANNEL),
                text(keys::REPLY_TOPIC),
            ) {
                return EnvelopeKind::Request {
                    request_id,
                    reply_channel,
                    reply_topic,
                };
            }
        }
        EnvelopeKind::Plain
    }
}

/// Serializable shape of an envelope as it travels between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub channel: String,
    pub topic: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub headers: HashMap<String, Value>,
}

/// The unit exchanged over the bus.
///
/// `headers` holds caller-supplied extra headers only; correlation metadata
/// lives in `kind`. Use [`Envelope::wire_headers`] for the merged view.
///
/// Envelopes delivered for a request carry a reply capability attached by the
/// reply router, reachable through [`Envelope::reply`].
///
/// # Examples
///
/// ```
/// use courier_core::Envelope;
/// use serde_json::json;
///
/// let env = Envelope::new("who.are.you", json!({ "asking": "Martha" }))
///     .with_channel("channel1")
///     .with_header("traceId", json!("abc"));
/// assert_eq!(env.channel, "channel1");
/// assert!(!env.is_replyable());
/// assert_eq!(env.wire_headers().get("traceId"), Some(&json!("abc")));
/// ```
#[derive(Debug, Clone)]
pub struct Envelope {
    pub channel: String,
    pub topic: String,
    pub data: Value,
    pub headers: HashMap<String, Value>,
    pub kind: EnvelopeKind,
    /// Set by the bus at publish time (milliseconds since epoch)
    pub timestamp_ms: i64,
    pub(crate) replier: Option<Replier>,
}

impl Envelope {
    /// Creates a plain envelope on the default channel.
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            topic: topic.into(),
            data,
            headers: HashMap::new(),
            kind: EnvelopeKind::Plain,
            timestamp_ms: 0,
            replier: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    pub fn with_kind(mut self, kind: EnvelopeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn is_replyable(&self) -> bool {
        self.kind.is_replyable()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.kind.request_id()
    }

    /// The reply capability, present only on delivered request envelopes.
    pub fn replier(&self) -> Option<&Replier> {
        self.replier.as_ref()
    }

    /// Answers this request.
    ///
    /// A truthy `err` publishes an error reply carrying `err`; otherwise a
    /// success reply carrying `data` is published. Fails with
    /// [`CourierError::NotReplyable`] when the envelope carries no reply
    /// capability.
    pub fn reply(&self, err: Option<Value>, data: Value) -> Result<usize> {
        self.replier
            .as_ref()
            .ok_or(CourierError::NotReplyable)?
            .reply(err, data)
    }

    /// Merged header view: extra headers overlaid by correlation headers.
    pub fn wire_headers(&self) -> HashMap<String, Value> {
        let mut headers = self.headers.clone();
        self.kind.apply_to_headers(&mut headers);
        headers
    }

    pub fn to_wire(&self) -> WireEnvelope {
        WireEnvelope {
            channel: self.channel.clone(),
            topic: self.topic.clone(),
            data: self.data.clone(),
            headers: self.wire_headers(),
        }
    }

    /// Builds an envelope from its wire form, lifting correlation headers
    /// into [`EnvelopeKind`].
    pub fn from_wire(wire: WireEnvelope) -> Self {
        let kind = EnvelopeKind::from_headers(&wire.headers);
        let mut headers = wire.headers;
        for key in keys::CORRELATION {
            headers.remove(key);
        }
        Self {
            channel: wire.channel,
            topic: wire.topic,
            data: wire.data,
            headers,
            kind,
            timestamp_ms: 0,
            replier: None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_wire())?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let wire: WireEnvelope = serde_json::from_str(s)?;
        Ok(Self::from_wire(wire))
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.channel == other.channel
            && self.topic == other.topic
            && self.data == other.data
            && self.headers == other.headers
            && self.kind == other.kind
            && self.timestamp_ms == other.timestamp_ms
    }
}

/// JavaScript-style truthiness of a JSON value.
///
/// `null`, `false`, `0`, `NaN` and `""` are falsy; everything else, including
/// empty arrays and objects, is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
