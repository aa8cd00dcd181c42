//! HyveRelay agent configuration.
//!
//! One versioned JSON document per install, written atomically under the
//! agent home with restrictive permissions. The loader always produces a
//! fully-populated document: missing fields take defaults, unreadable content
//! falls back to defaults with a warning.

use hr_common::ChannelTag;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod store;

pub use store::ConfigStore;

/// Current schema version of the on-disk document.
pub const CONFIG_VERSION: u32 = 1;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access config storage: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("agent home directory could not be resolved (HOME is unset)")]
    NoHome,
}

/// Root configuration document.
///
/// `relay_id` and `device_token` are written only together (see
/// [`ConfigStore::store_activation`]); `channel` is never changed in place —
/// reconfiguration replaces the whole document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub version: u32,
    pub channel: Option<ChannelTag>,
    pub relay_id: Option<String>,
    pub device_token: Option<String>,
    pub user_id: Option<String>,
    pub server: ServerConfig,
    pub heartbeat: HeartbeatConfig,
    pub outbound: OutboundConfig,
    pub reconnect: ReconnectConfig,
    pub logging: LoggingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            channel: None,
            relay_id: None,
            device_token: None,
            user_id: None,
            server: ServerConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            outbound: OutboundConfig::default(),
            reconnect: ReconnectConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AgentConfig {
    /// True once activation has produced both server-issued identifiers and
    /// a channel has been chosen.
    pub fn is_activated(&self) -> bool {
        let has_id = self.relay_id.as_deref().is_some_and(|s| !s.is_empty());
        let has_token = self.device_token.as_deref().is_some_and(|s| !s.is_empty());
        has_id && has_token && self.channel.is_some()
    }

    /// Validate startup invariants. Violations refuse the agent at boot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.base_url.trim().is_empty() {
            return Err(ConfigError::Validation("server.baseUrl must not be empty".into()));
        }
        if self.heartbeat.interval_seconds == 0 {
            return Err(ConfigError::Validation(
                "heartbeat.intervalSeconds must be at least 1".into(),
            ));
        }
        if self.outbound.poll_interval_seconds == 0 {
            return Err(ConfigError::Validation(
                "outbound.pollIntervalSeconds must be at least 1".into(),
            ));
        }
        if self.outbound.max_per_poll == 0 {
            return Err(ConfigError::Validation("outbound.maxPerPoll must be at least 1".into()));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Validation(
                "reconnect.initialDelayMs must not exceed reconnect.maxDelayMs".into(),
            ));
        }
        Ok(())
    }
}

/// Cloud gateway location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { base_url: "https://relay.myndhyve.com".to_string() }
    }
}

/// Heartbeat cadence. The server may override the interval at runtime; that
/// override lives in memory only and is never written back here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatConfig {
    pub interval_seconds: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_seconds: 30 }
    }
}

/// Outbound poll cadence and batch cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutboundConfig {
    pub poll_interval_seconds: u64,
    pub max_per_poll: u32,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self { poll_interval_seconds: 5, max_per_poll: 10 }
    }
}

/// Reconnect policy for plugin-transient disconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    /// None means unbounded attempts (the watchdog still applies).
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound on cumulative reconnect time before the supervisor gives up.
    pub watchdog_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            watchdog_timeout_ms: 600_000,
        }
    }
}

/// Log level and optional file sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// One of `debug | info | warn | error`.
    pub level: String,
    /// Mirror log lines to `<home>/logs/relay.log` when true.
    pub file_sink: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), file_sink: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_document_is_valid_and_not_activated() {
        let config = AgentConfig::default();
        config.validate().unwrap();
        assert!(!config.is_activated());
    }

    #[test]
    fn activation_requires_channel_and_both_identifiers() {
        let mut config = AgentConfig::default();
        config.relay_id = Some("r1".to_string());
        config.device_token = Some("dt1".to_string());
        assert!(!config.is_activated(), "channel still unset");

        config.channel = Some(ChannelTag::Signal);
        assert!(config.is_activated());

        config.device_token = Some(String::new());
        assert!(!config.is_activated(), "empty token does not count");
    }

    #[test]
    fn partial_document_merges_with_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"channel":"signal","server":{"baseUrl":"https://x.test"}}"#)
                .unwrap();
        assert_eq!(config.channel, Some(ChannelTag::Signal));
        assert_eq!(config.server.base_url, "https://x.test");
        assert_eq!(config.heartbeat.interval_seconds, 30);
        assert_eq!(config.outbound.max_per_poll, 10);
    }

    #[test]
    fn delay_ordering_is_enforced() {
        let mut config = AgentConfig::default();
        config.reconnect.initial_delay_ms = 5_000;
        config.reconnect.max_delay_ms = 1_000;
        assert!(config.validate().is_err());
    }
}
