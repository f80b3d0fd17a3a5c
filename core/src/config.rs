//! Configuration for the request/reply layer.

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

/// Channel replies are published on unless a request overrides it.
pub const REPLY_CHANNEL: &str = "postal.request-response";

/// Dispatcher-wide defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestReplyConfig {
    /// Channel used for replies when a request does not name one
    pub reply_channel: String,

    /// Timeout applied to requests that do not set their own; `None` waits
    /// indefinitely
    pub default_timeout_ms: Option<u64>,
}

impl Default for RequestReplyConfig {
    fn default() -> Self {
        Self {
            reply_channel: REPLY_CHANNEL.to_string(),
            default_timeout_ms: None,
        }
    }
}

impl RequestReplyConfig {
    /// Defaults overridden by `COURIER_REPLY_CHANNEL` and
    /// `COURIER_DEFAULT_TIMEOUT_MS` when set.
    pub fn from_env() -> Self {
        Self {
            reply_channel: std::env::var("COURIER_REPLY_CHANNEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| REPLY_CHANNEL.to_string()),
            default_timeout_ms: std::env::var("COURIER_DEFAULT_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|ms| *ms > 0),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        // Saturates instead of truncating the u128 millisecond count
        self.default_timeout_ms =
            Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}
