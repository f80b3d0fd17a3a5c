use std::fs;
use std::path::Path;

use courier_core::RequestReplyConfig;

/// Demo configuration: defaults, then env, then an optional TOML overlay
#[derive(Clone, Debug)]
pub struct LastLoginConfig {
    /// Channel the responder listens on
    pub channel: String,
    /// Topic the responder answers
    pub topic: String,
    pub user_id: u64,
    pub request_timeout_ms: u64,
    /// Artificial responder latency; set above the timeout to see a rejection
    pub responder_delay_ms: u64,
    pub request_reply: RequestReplyConfig,
}

impl Default for LastLoginConfig {
    fn default() -> Self {
        Self {
            channel: std::env::var("LAST_LOGIN_CHANNEL").unwrap_or_else(|_| "channel1".into()),
            topic: std::env::var("LAST_LOGIN_TOPIC").unwrap_or_else(|_| "last.login".into()),
            user_id: std::env::var("LAST_LOGIN_USER_ID")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(8_675_309),
            request_timeout_ms: std::env::var("REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(2_000),
            responder_delay_ms: std::env::var("RESPONDER_DELAY_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0),
            request_reply: RequestReplyConfig::from_env(),
        }
    }
}

impl LastLoginConfig {
    /// Load configuration from a TOML file (path via LAST_LOGIN_CONFIG or ./last_login.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("LAST_LOGIN_CONFIG").unwrap_or_else(|_| "last_login.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target = "last_login", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<LastLoginToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target = "last_login", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target = "last_login", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct LastLoginToml {
    pub channel: Option<String>,
    pub topic: Option<String>,
    pub user_id: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub responder_delay_ms: Option<u64>,
    pub reply_channel: Option<String>,
}

impl LastLoginToml {
    fn overlay(self, mut base: LastLoginConfig) -> LastLoginConfig {
        if let Some(v) = self.channel {
            base.channel = v;
        }
        if let Some(v) = self.topic {
            base.topic = v;
        }
        if let Some(v) = self.user_id {
            base.user_id = v;
        }
        if let Some(v) = self.request_timeout_ms {
            base.request_timeout_ms = v;
        }
        if let Some(v) = self.responder_delay_ms {
            base.responder_delay_ms = v;
        }
        if let Some(v) = self.reply_channel {
            base.request_reply.reply_channel = v;
        }
        base
    }
}
