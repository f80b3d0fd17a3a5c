use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::messaging::{
    is_truthy, Envelope, EnvelopeKind, MessageBus, PublishInterceptor, ReplyOutcome, WeakBus,
};
use crate::{CourierError, Result};

/// Interceptor name under which the router is installed on a bus.
pub const REPLY_ROUTER: &str = "reply-router";

/// Publish interceptor attaching a [`Replier`] to every request envelope.
///
/// The bus delivers the decorated envelope unchanged otherwise, so plain
/// publishes and replies pass straight through.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplyRouter;

impl PublishInterceptor for ReplyRouter {
    fn name(&self) -> &str {
        REPLY_ROUTER
    }

    fn before_publish(&self, envelope: &mut Envelope, bus: &MessageBus) {
        if let EnvelopeKind::Request {
            request_id,
            reply_channel,
            reply_topic,
        } = &envelope.kind
        {
            envelope.replier = Some(Replier {
                bus: bus.downgrade(),
                request_id: request_id.clone(),
                reply_channel: reply_channel.clone(),
                reply_topic: reply_topic.clone(),
            });
        }
    }
}

/// Reply capability handed to responders with a request envelope.
///
/// Every call publishes a fresh reply; only the first one reaches the
/// requester's one-shot subscription, later ones find no subscriber.
#[derive(Debug, Clone)]
pub struct Replier {
    bus: WeakBus,
    request_id: String,
    reply_channel: String,
    reply_topic: String,
}

impl Replier {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn reply_channel(&self) -> &str {
        &self.reply_channel
    }

    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    /// Publishes a reply. A truthy `err` makes it an error reply carrying
    /// `err`; otherwise it is a success reply carrying `data`.
    pub fn reply(&self, err: Option<Value>, data: Value) -> Result<usize> {
        match err {
            Some(err) if is_truthy(&err) => self.send(ReplyOutcome::Error, err),
            _ => self.send(ReplyOutcome::Success, data),
        }
    }

    pub fn reply_ok(&self, data: Value) -> Result<usize> {
        self.send(ReplyOutcome::Success, data)
    }

    pub fn reply_err(&self, err: Value) -> Result<usize> {
        self.send(ReplyOutcome::Error, err)
    }

    fn send(&self, outcome: ReplyOutcome, data: Value) -> Result<usize> {
        let bus = self.bus.upgrade().ok_or(CourierError::BusClosed)?;
        let envelope = Envelope {
            channel: self.reply_channel.clone(),
            topic: self.reply_topic.clone(),
            data,
            headers: HashMap::new(),
            kind: EnvelopeKind::Reply {
                request_id: self.request_id.clone(),
                outcome,
            },
            timestamp_ms: 0,
            replier: None,
        };
        debug!(
            request_id = %self.request_id,
            channel = %self.reply_channel,
            topic = %self.reply_topic,
            ?outcome,
            "Publishing reply"
        );
        bus.publish(envelope)
    }
}
