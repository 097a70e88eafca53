//! Runtime configuration schema (§4.L). Grounded on the teacher's
//! `config::schema` module: every section is `#[serde(default)]` with a
//! matching `Default` impl, so a config file only needs to mention the
//! fields it wants to override.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MessengerConfig {
    /// `"console"` or `"telegram"`.
    pub kind: String,
    pub telegram_token: String,
    /// Required non-empty for `kind = "telegram"` — validated at load
    /// time (§4.L), not here, so the error message can name the file.
    pub allowed_chat_ids: Vec<i64>,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self { kind: "console".to_string(), telegram_token: String::new(), allowed_chat_ids: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct HomeAssistantConfig {
    pub base_url: String,
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests_per_window: usize,
    pub window_secs: u64,
    pub max_pending_approvals: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_requests_per_window: 60, window_secs: 60, max_pending_approvals: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// `host:port` to bind the gateway's WebSocket listener to.
    pub bind_addr: String,
    pub tls: Option<TlsConfig>,
    /// Overrides the generated `~/.sentrygate/daemon.token` file when set.
    pub agent_token: Option<String>,
    pub messenger: MessengerConfig,
    pub home_assistant: Option<HomeAssistantConfig>,
    pub store_path: PathBuf,
    pub approval_timeout_secs: u64,
    pub rate_limit: RateLimitConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8443".to_string(),
            tls: None,
            agent_token: None,
            messenger: MessengerConfig::default(),
            home_assistant: None,
            store_path: default_store_path(),
            approval_timeout_secs: 900,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

pub fn default_store_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".sentrygate")
        .join("gateway.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_messenger_is_console() {
        assert_eq!(RuntimeConfig::default().messenger.kind, "console");
    }

    #[test]
    fn default_rate_limit_matches_ratelimit_defaults() {
        let rl = RuntimeConfig::default().rate_limit;
        assert_eq!(rl.max_requests_per_window, 60);
        assert_eq!(rl.max_pending_approvals, 10);
    }
}
