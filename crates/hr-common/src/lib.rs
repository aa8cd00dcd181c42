use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod backoff;
pub mod logging;

// ============================================================================
// Channel Identity
// ============================================================================

/// Tag identifying one of the supported messaging platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelTag {
    Whatsapp,
    Signal,
    Imessage,
}

impl ChannelTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelTag::Whatsapp => "whatsapp",
            ChannelTag::Signal => "signal",
            ChannelTag::Imessage => "imessage",
        }
    }
}

impl std::fmt::Display for ChannelTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChannelTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "whatsapp" => Ok(ChannelTag::Whatsapp),
            "signal" => Ok(ChannelTag::Signal),
            "imessage" => Ok(ChannelTag::Imessage),
            other => Err(format!("unknown channel tag: {}", other)),
        }
    }
}

// ============================================================================
// Envelopes
// ============================================================================

/// Kind of a media item attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

/// A reference to a media item in either direction.
///
/// `reference` is an opaque platform id on ingress and an absolute,
/// fetchable URL on egress. Bytes are never carried through the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDescriptor {
    pub kind: MediaKind,
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Normalized platform → cloud message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressEnvelope {
    pub channel: ChannelTag,
    /// Unique within the channel.
    pub platform_message_id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_name: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaDescriptor>,
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
}

/// Cloud → platform reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressEnvelope {
    pub channel: ChannelTag,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
}

/// An outbound message as returned by the cloud's poll endpoint.
///
/// The record lives cloud-side; the agent never persists it. The same id is
/// returned by subsequent polls until the agent acks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub id: String,
    pub envelope: EgressEnvelope,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub attempts: u32,
}

/// Delivery acknowledgment posted back to the cloud after a dispatch attempt.
///
/// `retryable` tells the cloud whether to re-queue (transient failure) or
/// mark the message failed (permanent).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAck {
    pub outbound_message_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    pub duration_ms: u64,
}

// ============================================================================
// Delivery Outcome
// ============================================================================

/// Result of a single plugin delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub platform_message_id: Option<String>,
    pub error: Option<String>,
    pub retryable: bool,
}

impl DeliveryOutcome {
    pub fn delivered(platform_message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            platform_message_id: Some(platform_message_id.into()),
            error: None,
            retryable: false,
        }
    }

    pub fn delivered_without_id() -> Self {
        Self {
            success: true,
            platform_message_id: None,
            error: None,
            retryable: false,
        }
    }

    pub fn failed_retryable(error: impl Into<String>) -> Self {
        Self {
            success: false,
            platform_message_id: None,
            error: Some(error.into()),
            retryable: true,
        }
    }

    pub fn failed_permanent(error: impl Into<String>) -> Self {
        Self {
            success: false,
            platform_message_id: None,
            error: Some(error.into()),
            retryable: false,
        }
    }
}

// ============================================================================
// Connection State & Disconnect Classification
// ============================================================================

/// Connection status of a plugin's live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Classified reason a plugin session ended.
///
/// `LoggedOut` is fatal (credentials are gone); `Replaced` and
/// `ConnectionLost` are retryable with backoff; `Unknown` is treated as
/// retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    LoggedOut,
    Replaced,
    ConnectionLost,
    Unknown,
}

impl DisconnectReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DisconnectReason::LoggedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::LoggedOut => "logged-out",
            DisconnectReason::Replaced => "replaced",
            DisconnectReason::ConnectionLost => "connection-lost",
            DisconnectReason::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_tag_round_trips_through_serde() {
        let json = serde_json::to_string(&ChannelTag::Whatsapp).unwrap();
        assert_eq!(json, "\"whatsapp\"");
        let tag: ChannelTag = serde_json::from_str("\"imessage\"").unwrap();
        assert_eq!(tag, ChannelTag::Imessage);
    }

    #[test]
    fn ingress_envelope_uses_camel_case_wire_names() {
        let envelope = IngressEnvelope {
            channel: ChannelTag::Signal,
            platform_message_id: "sig-1700000000000".to_string(),
            conversation_id: "+1555".to_string(),
            thread_id: None,
            peer_id: "+1555".to_string(),
            peer_name: None,
            text: "hi".to_string(),
            media: vec![],
            is_group: false,
            group_name: None,
            timestamp: "2023-11-14T22:13:20Z".parse().unwrap(),
            reply_to_message_id: None,
            mentions: vec![],
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["platformMessageId"], "sig-1700000000000");
        assert_eq!(value["conversationId"], "+1555");
        assert_eq!(value["isGroup"], false);
        // Optional empties stay off the wire entirely.
        assert!(value.get("threadId").is_none());
        assert!(value.get("media").is_none());
    }

    #[test]
    fn delivery_outcome_constructors_classify() {
        assert!(DeliveryOutcome::delivered("m1").success);
        assert!(DeliveryOutcome::failed_retryable("timeout").retryable);
        assert!(!DeliveryOutcome::failed_permanent("blocked").retryable);
    }

    #[test]
    fn fatal_disconnects_are_only_logged_out() {
        assert!(DisconnectReason::LoggedOut.is_fatal());
        assert!(!DisconnectReason::Replaced.is_fatal());
        assert!(!DisconnectReason::ConnectionLost.is_fatal());
        assert!(!DisconnectReason::Unknown.is_fatal());
    }
}
