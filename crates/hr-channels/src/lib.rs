//! Channel plugins: one uniform contract over three very different
//! platform integrations, plus the registry that dispatches by channel tag.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hr_common::{
    ChannelTag, ConnectionState, DeliveryOutcome, DisconnectReason, EgressEnvelope,
    IngressEnvelope,
};
use hr_config::ConfigStore;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod imessage;
pub mod signal;
pub mod whatsapp;

pub use imessage::IMessagePlugin;
pub use signal::SignalPlugin;
pub use whatsapp::WhatsAppPlugin;

/// Sender half of the inbound pipeline. Plugins push normalized envelopes
/// here in emission order; the runtime forwards them serially.
pub type InboundSender = mpsc::Sender<IngressEnvelope>;

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Error types shared by all channel plugins.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// A required external executable is not installed. Distinct from
    /// runtime failures so callers can print install guidance.
    #[error("'{0}' was not found on PATH")]
    BinaryMissing(String),

    #[error("channel is not supported on this host: {0}")]
    Unsupported(String),

    #[error("not authenticated with the platform; run login first")]
    NotAuthenticated,

    #[error("pairing failed: {0}")]
    Pairing(String),

    /// The live session ended with a classified reason. `LoggedOut` is
    /// fatal; everything else is retryable by the supervisor.
    #[error("session ended: {0}")]
    Disconnected(DisconnectReason),

    #[error("platform store error: {0}")]
    Store(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ChannelError {
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self {
            ChannelError::Disconnected(reason) => Some(*reason),
            _ => None,
        }
    }

    /// True when the supervisor must treat this as terminal.
    pub fn is_fatal(&self) -> bool {
        self.disconnect_reason().is_some_and(|r| r.is_fatal())
    }
}

/// Whether a channel can run on this host.
#[derive(Debug, Clone)]
pub struct SupportStatus {
    pub supported: bool,
    pub unsupported_reason: Option<String>,
}

impl SupportStatus {
    pub fn supported() -> Self {
        Self { supported: true, unsupported_reason: None }
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self { supported: false, unsupported_reason: Some(reason.into()) }
    }
}

/// The capability set every platform adapter implements.
///
/// One plugin instance exists per channel; the supervisor owns its lifetime
/// and never runs two instances for the same channel concurrently.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    fn channel(&self) -> ChannelTag;

    fn display_name(&self) -> &'static str;

    fn support(&self) -> SupportStatus;

    /// Cheap check of local credential presence; no network.
    async fn is_authenticated(&self) -> bool;

    /// Interactive pairing. May print a QR payload or pairing URI and block
    /// until the human completes the action.
    async fn login(&self) -> Result<()>;

    /// Open the live inbound pipeline and run until `cancel` fires (clean
    /// `Ok(())`) or a classified disconnect ends the session
    /// ([`ChannelError::Disconnected`]).
    async fn start(&self, inbound: InboundSender, cancel: CancellationToken) -> Result<()>;

    /// Deliver a single egress envelope. Failures are encoded in the
    /// outcome, never as panics or plugin-loop disruptions.
    async fn deliver(&self, envelope: &EgressEnvelope) -> DeliveryOutcome;

    fn status(&self) -> ConnectionState;

    /// Wipe local credentials and release held resources.
    async fn logout(&self) -> Result<()>;
}

/// In-memory map from channel tag to plugin. Re-registration replaces the
/// existing entry.
#[derive(Default)]
pub struct ChannelRegistry {
    plugins: RwLock<HashMap<ChannelTag, Arc<dyn ChannelPlugin>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry holding the three built-in plugins, each rooted in
    /// its own credential directory. Called lazily on first relay-runtime
    /// access so unrelated operations stay cheap.
    pub fn with_builtins(store: &ConfigStore) -> std::result::Result<Self, hr_config::ConfigError> {
        let registry = Self::new();
        registry.register(Arc::new(WhatsAppPlugin::new(store.channel_dir(ChannelTag::Whatsapp)?)));
        registry.register(Arc::new(SignalPlugin::new(store.channel_dir(ChannelTag::Signal)?)));
        registry.register(Arc::new(IMessagePlugin::new(store.channel_dir(ChannelTag::Imessage)?)));
        Ok(registry)
    }

    pub fn register(&self, plugin: Arc<dyn ChannelPlugin>) {
        self.plugins.write().insert(plugin.channel(), plugin);
    }

    pub fn get(&self, tag: ChannelTag) -> Option<Arc<dyn ChannelPlugin>> {
        self.plugins.read().get(&tag).cloned()
    }

    pub fn tags(&self) -> Vec<ChannelTag> {
        self.plugins.read().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubPlugin {
        name: &'static str,
    }

    #[async_trait]
    impl ChannelPlugin for StubPlugin {
        fn channel(&self) -> ChannelTag {
            ChannelTag::Signal
        }

        fn display_name(&self) -> &'static str {
            self.name
        }

        fn support(&self) -> SupportStatus {
            SupportStatus::supported()
        }

        async fn is_authenticated(&self) -> bool {
            false
        }

        async fn login(&self) -> Result<()> {
            Ok(())
        }

        async fn start(&self, _inbound: InboundSender, cancel: CancellationToken) -> Result<()> {
            cancel.cancelled().await;
            Ok(())
        }

        async fn deliver(&self, _envelope: &EgressEnvelope) -> DeliveryOutcome {
            DeliveryOutcome::delivered_without_id()
        }

        fn status(&self) -> ConnectionState {
            ConnectionState::Disconnected
        }

        async fn logout(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registry_dispatches_by_tag_and_replaces_on_reregister() {
        let registry = ChannelRegistry::new();
        assert!(registry.get(ChannelTag::Signal).is_none());

        registry.register(Arc::new(StubPlugin { name: "first" }));
        assert_eq!(registry.get(ChannelTag::Signal).unwrap().display_name(), "first");

        registry.register(Arc::new(StubPlugin { name: "second" }));
        assert_eq!(registry.get(ChannelTag::Signal).unwrap().display_name(), "second");
        assert_eq!(registry.tags(), vec![ChannelTag::Signal]);
    }

    #[test]
    fn fatal_classification_covers_only_logged_out() {
        assert!(ChannelError::Disconnected(DisconnectReason::LoggedOut).is_fatal());
        assert!(!ChannelError::Disconnected(DisconnectReason::Replaced).is_fatal());
        assert!(!ChannelError::Disconnected(DisconnectReason::ConnectionLost).is_fatal());
        assert!(!ChannelError::NotAuthenticated.is_fatal());
    }
}
