//! WhatsApp adapter: QR pairing, persistent socket session, inbound
//! normalization with markdown coercion, typed outbound sends.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hr_common::{
    ChannelTag, ConnectionState, DeliveryOutcome, DisconnectReason, EgressEnvelope,
    IngressEnvelope, MediaDescriptor, MediaKind,
};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ChannelError, ChannelPlugin, InboundSender, Result, SupportStatus};

pub mod markdown;
pub mod socket;

use socket::{
    OutgoingMessage, SessionBlob, SocketConfig, SocketEvent, SocketHandle, WireMessage,
};

/// Pairing must complete within this absolute deadline.
const PAIRING_DEADLINE: Duration = Duration::from_secs(120);
/// The resumed session must report `connected` within this window.
const CONNECT_DEADLINE: Duration = Duration::from_secs(30);

const SESSION_FILE: &str = "session.json";

pub struct WhatsAppPlugin {
    credential_dir: PathBuf,
    config: SocketConfig,
    status: RwLock<ConnectionState>,
    active: RwLock<Option<SocketHandle>>,
}

impl WhatsAppPlugin {
    pub fn new(credential_dir: PathBuf) -> Self {
        Self::with_config(credential_dir, SocketConfig::default())
    }

    pub fn with_config(credential_dir: PathBuf, config: SocketConfig) -> Self {
        Self {
            credential_dir,
            config,
            status: RwLock::new(ConnectionState::Disconnected),
            active: RwLock::new(None),
        }
    }

    fn session_path(&self) -> PathBuf {
        self.credential_dir.join(SESSION_FILE)
    }

    fn load_session(&self) -> Option<SessionBlob> {
        let raw = std::fs::read_to_string(self.session_path()).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn persist_session(&self, session: &SessionBlob) -> Result<()> {
        std::fs::create_dir_all(&self.credential_dir)?;
        let path = self.session_path();
        std::fs::write(&path, serde_json::to_string_pretty(session).map_err(|e| {
            ChannelError::Other(format!("encode session blob: {}", e))
        })?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn set_status(&self, state: ConnectionState) {
        *self.status.write() = state;
    }

    fn normalize(&self, message: WireMessage) -> Option<IngressEnvelope> {
        if message.from_me || message.broadcast {
            return None;
        }

        let raw_text = message
            .text
            .as_deref()
            .filter(|t| !t.is_empty())
            .or(message.caption.as_deref().filter(|t| !t.is_empty()))
            .unwrap_or("");
        if raw_text.is_empty() && message.media.is_empty() {
            return None;
        }

        let media = message
            .media
            .into_iter()
            .filter_map(|m| {
                let kind = parse_media_kind(&m.kind)?;
                Some(MediaDescriptor {
                    kind,
                    reference: m.media_id,
                    mime_type: m.mime_type,
                    file_name: m.file_name,
                    size: m.file_size,
                })
            })
            .collect();

        let timestamp: DateTime<Utc> =
            DateTime::from_timestamp(message.timestamp, 0).unwrap_or_else(Utc::now);

        Some(IngressEnvelope {
            channel: ChannelTag::Whatsapp,
            platform_message_id: message.id,
            conversation_id: message.chat_id,
            thread_id: None,
            peer_id: message.sender_id,
            peer_name: message.sender_name,
            text: markdown::wa_to_markdown(raw_text),
            media,
            is_group: message.group,
            group_name: message.group_subject,
            timestamp,
            reply_to_message_id: message.quoted_message_id,
            mentions: message.mentions,
        })
    }
}

fn parse_media_kind(kind: &str) -> Option<MediaKind> {
    match kind {
        "image" => Some(MediaKind::Image),
        "video" => Some(MediaKind::Video),
        "audio" => Some(MediaKind::Audio),
        "document" => Some(MediaKind::Document),
        "sticker" => Some(MediaKind::Sticker),
        _ => None,
    }
}

/// Choose the typed send for an envelope. Stickers have no typed send on
/// the gateway and downgrade to a text message carrying the URL.
fn outgoing_payload(envelope: &EgressEnvelope) -> OutgoingMessage {
    let text = markdown::markdown_to_wa(&envelope.text);

    let typed = envelope
        .media
        .iter()
        .find(|m| !matches!(m.kind, MediaKind::Sticker));
    if let Some(media) = typed {
        let kind = match media.kind {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
            MediaKind::Sticker => unreachable!("stickers filtered above"),
        };
        return OutgoingMessage {
            chat_id: envelope.conversation_id.clone(),
            kind: kind.to_string(),
            text,
            media_url: Some(media.reference.clone()),
            mime_type: media.mime_type.clone(),
            file_name: media.file_name.clone(),
            quoted_message_id: envelope.reply_to_message_id.clone(),
        };
    }

    let mut text = text;
    for sticker in envelope.media.iter().filter(|m| matches!(m.kind, MediaKind::Sticker)) {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&sticker.reference);
    }

    OutgoingMessage {
        chat_id: envelope.conversation_id.clone(),
        kind: "text".to_string(),
        text,
        media_url: None,
        mime_type: None,
        file_name: None,
        quoted_message_id: envelope.reply_to_message_id.clone(),
    }
}

#[async_trait]
impl ChannelPlugin for WhatsAppPlugin {
    fn channel(&self) -> ChannelTag {
        ChannelTag::Whatsapp
    }

    fn display_name(&self) -> &'static str {
        "WhatsApp"
    }

    fn support(&self) -> SupportStatus {
        SupportStatus::supported()
    }

    async fn is_authenticated(&self) -> bool {
        self.load_session().is_some()
    }

    async fn login(&self) -> Result<()> {
        let (handle, mut events) = socket::connect(&self.config, None).await?;

        let pairing = async {
            while let Some(event) = events.recv().await {
                match event {
                    SocketEvent::Qr { code } => {
                        eprintln!();
                        eprintln!("Scan this code with WhatsApp (Settings > Linked Devices):");
                        eprintln!();
                        eprintln!("  {}", code);
                        eprintln!();
                    }
                    SocketEvent::Paired { session } => return Ok(session),
                    SocketEvent::Closed { reason } => {
                        return Err(ChannelError::Pairing(format!(
                            "gateway closed during pairing ({})",
                            reason
                        )));
                    }
                    _ => {}
                }
            }
            Err(ChannelError::Pairing("gateway stream ended during pairing".to_string()))
        };

        let session = match tokio::time::timeout(PAIRING_DEADLINE, pairing).await {
            Ok(result) => result?,
            Err(_) => {
                handle.close().await;
                return Err(ChannelError::Pairing("pairing timed out".to_string()));
            }
        };

        handle.close().await;
        self.persist_session(&session)?;
        info!(client_id = %session.client_id, "whatsapp pairing complete");
        Ok(())
    }

    async fn start(&self, inbound: InboundSender, cancel: CancellationToken) -> Result<()> {
        let session = self.load_session().ok_or(ChannelError::NotAuthenticated)?;

        self.set_status(ConnectionState::Connecting);
        let (handle, mut events) = match socket::connect(&self.config, Some(&session)).await {
            Ok(pair) => pair,
            Err(e) => {
                self.set_status(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        // The gateway resumes the device and reports `connected` before any
        // message flows.
        let connected = tokio::time::timeout(CONNECT_DEADLINE, async {
            while let Some(event) = events.recv().await {
                match event {
                    SocketEvent::Connected => return Ok(()),
                    SocketEvent::Closed { reason } => return Err(reason),
                    _ => {}
                }
            }
            Err(DisconnectReason::ConnectionLost)
        })
        .await;

        match connected {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                self.set_status(ConnectionState::Disconnected);
                return Err(ChannelError::Disconnected(reason));
            }
            Err(_) => {
                handle.close().await;
                self.set_status(ConnectionState::Disconnected);
                return Err(ChannelError::Disconnected(DisconnectReason::ConnectionLost));
            }
        }

        self.set_status(ConnectionState::Connected);
        *self.active.write() = Some(handle.clone());
        info!("whatsapp session connected");

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    handle.close().await;
                    break Ok(());
                }
                event = events.recv() => match event {
                    Some(SocketEvent::Message(message)) => {
                        if let Some(envelope) = self.normalize(*message) {
                            if inbound.send(envelope).await.is_err() {
                                // Receiver gone: the runtime is shutting down.
                                handle.close().await;
                                break Ok(());
                            }
                        }
                    }
                    Some(SocketEvent::Closed { reason }) => {
                        warn!(%reason, "whatsapp session closed");
                        break Err(ChannelError::Disconnected(reason));
                    }
                    Some(_) => {}
                    None => break Err(ChannelError::Disconnected(DisconnectReason::ConnectionLost)),
                },
            }
        };

        *self.active.write() = None;
        self.set_status(ConnectionState::Disconnected);
        outcome
    }

    async fn deliver(&self, envelope: &EgressEnvelope) -> DeliveryOutcome {
        let handle = match self.active.read().clone() {
            Some(handle) => handle,
            None => return DeliveryOutcome::failed_retryable("whatsapp session not connected"),
        };

        match handle.send_message(outgoing_payload(envelope)).await {
            Ok(ack) => match ack.error {
                None => match ack.message_id {
                    Some(id) => DeliveryOutcome::delivered(id),
                    None => DeliveryOutcome::delivered_without_id(),
                },
                Some(error) => {
                    let detail = error
                        .message
                        .clone()
                        .unwrap_or_else(|| error.code.clone());
                    if error.is_permanent() {
                        DeliveryOutcome::failed_permanent(detail)
                    } else {
                        DeliveryOutcome::failed_retryable(detail)
                    }
                }
            },
            Err(e) => DeliveryOutcome::failed_retryable(e.to_string()),
        }
    }

    fn status(&self) -> ConnectionState {
        *self.status.read()
    }

    async fn logout(&self) -> Result<()> {
        let handle = self.active.write().take();
        if let Some(handle) = handle {
            handle.close().await;
        }
        match std::fs::remove_file(self.session_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.set_status(ConnectionState::Disconnected);
        debug!("whatsapp credentials wiped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin() -> WhatsAppPlugin {
        WhatsAppPlugin::new(tempfile::tempdir().unwrap().keep())
    }

    fn wire_message(text: &str) -> WireMessage {
        WireMessage {
            id: "m1".to_string(),
            chat_id: "+1555".to_string(),
            sender_id: "+1555".to_string(),
            sender_name: Some("Ada".to_string()),
            from_me: false,
            broadcast: false,
            text: Some(text.to_string()),
            caption: None,
            group: false,
            group_subject: None,
            timestamp: 1_700_000_000,
            quoted_message_id: None,
            mentions: vec![],
            media: vec![],
        }
    }

    #[test]
    fn own_and_broadcast_messages_are_skipped() {
        let plugin = plugin();

        let mut own = wire_message("hi");
        own.from_me = true;
        assert!(plugin.normalize(own).is_none());

        let mut status = wire_message("hi");
        status.broadcast = true;
        assert!(plugin.normalize(status).is_none());

        assert!(plugin.normalize(wire_message("")).is_none());
    }

    #[test]
    fn normalization_coerces_platform_formatting() {
        let plugin = plugin();
        let envelope = plugin.normalize(wire_message("*hello*")).unwrap();
        assert_eq!(envelope.text, "**hello**");
        assert_eq!(envelope.channel, ChannelTag::Whatsapp);
        assert!(!envelope.is_group);
    }

    #[test]
    fn caption_is_used_when_body_is_empty() {
        let plugin = plugin();
        let mut message = wire_message("");
        message.caption = Some("look".to_string());
        message.media.push(socket::WireMedia {
            kind: "image".to_string(),
            media_id: "media-1".to_string(),
            mime_type: Some("image/jpeg".to_string()),
            file_name: None,
            file_size: Some(1024),
        });

        let envelope = plugin.normalize(message).unwrap();
        assert_eq!(envelope.text, "look");
        assert_eq!(envelope.media.len(), 1);
        assert_eq!(envelope.media[0].kind, MediaKind::Image);
        assert_eq!(envelope.media[0].reference, "media-1");
    }

    #[test]
    fn sticker_egress_downgrades_to_text() {
        let envelope = EgressEnvelope {
            channel: ChannelTag::Whatsapp,
            conversation_id: "+1555".to_string(),
            thread_id: None,
            text: "here".to_string(),
            media: vec![MediaDescriptor {
                kind: MediaKind::Sticker,
                reference: "https://cdn.test/sticker.webp".to_string(),
                mime_type: None,
                file_name: None,
                size: None,
            }],
            reply_to_message_id: None,
        };

        let payload = outgoing_payload(&envelope);
        assert_eq!(payload.kind, "text");
        assert!(payload.text.contains("https://cdn.test/sticker.webp"));
        assert!(payload.media_url.is_none());
    }

    #[test]
    fn image_egress_uses_typed_send() {
        let envelope = EgressEnvelope {
            channel: ChannelTag::Whatsapp,
            conversation_id: "+1555".to_string(),
            thread_id: None,
            text: "**caption**".to_string(),
            media: vec![MediaDescriptor {
                kind: MediaKind::Image,
                reference: "https://cdn.test/a.jpg".to_string(),
                mime_type: Some("image/jpeg".to_string()),
                file_name: None,
                size: None,
            }],
            reply_to_message_id: None,
        };

        let payload = outgoing_payload(&envelope);
        assert_eq!(payload.kind, "image");
        assert_eq!(payload.media_url.as_deref(), Some("https://cdn.test/a.jpg"));
        // Outbound text is re-coerced to the platform dialect.
        assert_eq!(payload.text, "*caption*");
    }
}
