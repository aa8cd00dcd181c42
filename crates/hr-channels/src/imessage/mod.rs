//! iMessage adapter: polls the local Messages store with a monotonic
//! watermark and delivers through the macOS scripting bridge.
//!
//! No credential material of its own — the host OS account is the identity.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hr_common::backoff::{self, BackoffPolicy, SleepOutcome};
use hr_common::{
    ChannelTag, ConnectionState, DeliveryOutcome, EgressEnvelope, IngressEnvelope,
    MediaDescriptor, MediaKind,
};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ChannelError, ChannelPlugin, InboundSender, Result, SupportStatus};

pub mod script;
pub mod store;

use store::{MessageStore, StoredAttachment, StoredMessage};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const FAILURE_BACKOFF_INITIAL_MS: u64 = 2_000;
const FAILURE_BACKOFF_MAX_MS: u64 = 60_000;

pub struct IMessagePlugin {
    db_path: PathBuf,
    status: RwLock<ConnectionState>,
}

impl IMessagePlugin {
    pub fn new(_credential_dir: PathBuf) -> Self {
        let db_path = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_default()
            .join("Library")
            .join("Messages")
            .join("chat.db");
        Self::with_db_path(db_path)
    }

    pub fn with_db_path(db_path: PathBuf) -> Self {
        Self { db_path, status: RwLock::new(ConnectionState::Disconnected) }
    }

    fn set_status(&self, state: ConnectionState) {
        *self.status.write() = state;
    }

    async fn build_envelope(
        &self,
        store: &MessageStore,
        message: StoredMessage,
    ) -> Option<IngressEnvelope> {
        let attachments = if message.has_attachments {
            match store.attachments_for(message.rowid).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(rowid = message.rowid, error = %e, "failed to load attachments");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let text = message.text.clone().unwrap_or_default();
        if text.is_empty() && attachments.is_empty() {
            return None;
        }

        let (secs, nanos) = message.unix_timestamp();
        let timestamp: DateTime<Utc> =
            DateTime::from_timestamp(secs, nanos).unwrap_or_else(Utc::now);

        let conversation_id = message.chat_identifier.clone().or(message.sender.clone())?;

        Some(IngressEnvelope {
            channel: ChannelTag::Imessage,
            platform_message_id: message.guid.clone(),
            conversation_id,
            thread_id: None,
            peer_id: message.sender.clone().unwrap_or_default(),
            peer_name: None,
            text,
            media: attachments.into_iter().map(media_descriptor).collect(),
            is_group: message.is_group(),
            group_name: message.chat_name.clone().filter(|n| !n.is_empty()),
            timestamp,
            reply_to_message_id: None,
            mentions: vec![],
        })
    }
}

fn media_descriptor(attachment: StoredAttachment) -> MediaDescriptor {
    let kind = match attachment.mime_type.as_deref() {
        Some(m) if m.starts_with("image/") => MediaKind::Image,
        Some(m) if m.starts_with("video/") => MediaKind::Video,
        Some(m) if m.starts_with("audio/") => MediaKind::Audio,
        _ => MediaKind::Document,
    };
    MediaDescriptor {
        kind,
        reference: attachment.rowid.to_string(),
        mime_type: attachment.mime_type,
        file_name: attachment.transfer_name,
        size: attachment.total_bytes.and_then(|b| u64::try_from(b).ok()),
    }
}

#[async_trait]
impl ChannelPlugin for IMessagePlugin {
    fn channel(&self) -> ChannelTag {
        ChannelTag::Imessage
    }

    fn display_name(&self) -> &'static str {
        "iMessage"
    }

    fn support(&self) -> SupportStatus {
        if cfg!(target_os = "macos") {
            SupportStatus::supported()
        } else {
            SupportStatus::unsupported("iMessage requires macOS (the Messages app and its local store)")
        }
    }

    async fn is_authenticated(&self) -> bool {
        std::fs::File::open(&self.db_path).is_ok()
    }

    async fn login(&self) -> Result<()> {
        if !self.db_path.exists() {
            return Err(ChannelError::Store(format!(
                "Messages store not found at {} — sign in to Messages first",
                self.db_path.display()
            )));
        }
        if std::fs::File::open(&self.db_path).is_err() {
            return Err(ChannelError::Store(
                "cannot read the Messages store. Grant Full Disk Access to your terminal in \
                 System Settings > Privacy & Security > Full Disk Access, then retry"
                    .to_string(),
            ));
        }
        eprintln!("Messages store is readable; iMessage relay is ready.");
        Ok(())
    }

    async fn start(&self, inbound: InboundSender, cancel: CancellationToken) -> Result<()> {
        self.set_status(ConnectionState::Connecting);
        let store = match MessageStore::open(&self.db_path).await {
            Ok(store) => store,
            Err(e) => {
                self.set_status(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        // Startup never replays history: only rows strictly newer than the
        // max row id at this instant are ever emitted.
        let mut watermark = match store.max_rowid().await {
            Ok(max) => max,
            Err(e) => {
                self.set_status(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        self.set_status(ConnectionState::Connected);
        info!(watermark, "imessage poller started");

        let failure_policy =
            BackoffPolicy::from_millis(FAILURE_BACKOFF_INITIAL_MS, FAILURE_BACKOFF_MAX_MS);
        let mut consecutive_failures: u32 = 0;

        loop {
            let delay = if consecutive_failures == 0 {
                POLL_INTERVAL
            } else {
                failure_policy.delay(consecutive_failures - 1)
            };
            if backoff::sleep(delay, &cancel).await == SleepOutcome::Aborted {
                self.set_status(ConnectionState::Disconnected);
                return Ok(());
            }

            match store.messages_after(watermark).await {
                Ok(rows) => {
                    consecutive_failures = 0;
                    for row in rows {
                        let rowid = row.rowid;
                        if let Some(envelope) = self.build_envelope(&store, row).await {
                            if inbound.send(envelope).await.is_err() {
                                self.set_status(ConnectionState::Disconnected);
                                return Ok(());
                            }
                        }
                        watermark = rowid;
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(error = %e, consecutive_failures, "imessage poll failed");
                }
            }
        }
    }

    async fn deliver(&self, envelope: &EgressEnvelope) -> DeliveryOutcome {
        // The scripting bridge cannot attach remote files; media rides along
        // as URLs in the body.
        let mut text = envelope.text.clone();
        for media in &envelope.media {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&media.reference);
        }

        let script = script::build_send_script(&envelope.conversation_id, &text);
        match script::run_osascript(&script).await {
            Ok(()) => DeliveryOutcome::delivered_without_id(),
            // Spawn failures (osascript missing, fork pressure) are transient.
            Err(ChannelError::Other(e)) => DeliveryOutcome::failed_retryable(e),
            // Script errors (bad recipient, Messages refused) are permanent.
            Err(e) => DeliveryOutcome::failed_permanent(e.to_string()),
        }
    }

    fn status(&self) -> ConnectionState {
        *self.status.read()
    }

    async fn logout(&self) -> Result<()> {
        // Credentials belong to the host OS; nothing to wipe.
        debug!("imessage logout is a no-op");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::fixture;

    #[tokio::test]
    async fn poller_emits_only_rows_above_the_initial_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("chat.db");
        let writer = fixture::create(&db).await;
        fixture::seed_contacts(&writer).await;
        fixture::insert_message(&writer, 1, "history", false, 0).await;

        let plugin = IMessagePlugin::with_db_path(db);
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let cancel = CancellationToken::new();

        let start_cancel = cancel.clone();
        let handle = tokio::spawn(async move { plugin.start(tx, start_cancel).await });

        // Let the poller take its watermark, then add a fresh row.
        tokio::time::sleep(Duration::from_millis(300)).await;
        fixture::insert_message(&writer, 2, "fresh", false, 0).await;

        let envelope = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("poll within deadline")
            .expect("envelope");
        assert_eq!(envelope.text, "fresh");
        assert_eq!(envelope.channel, ChannelTag::Imessage);
        assert_eq!(envelope.conversation_id, "+15550001111");

        // Nothing older leaks through.
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn envelope_carries_attachment_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("chat.db");
        let writer = fixture::create(&db).await;
        fixture::seed_contacts(&writer).await;
        fixture::insert_message(&writer, 1, "photo", false, 0).await;
        sqlx::query("UPDATE message SET cache_has_attachments = 1 WHERE ROWID = 1")
            .execute(&writer)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO attachment (ROWID, mime_type, transfer_name, total_bytes) VALUES (9, 'image/png', 'pic.png', 77)",
        )
        .execute(&writer)
        .await
        .unwrap();
        sqlx::query("INSERT INTO message_attachment_join (message_id, attachment_id) VALUES (1, 9)")
            .execute(&writer)
            .await
            .unwrap();

        let plugin = IMessagePlugin::with_db_path(db.clone());
        let store = MessageStore::open(&db).await.unwrap();
        let rows = store.messages_after(0).await.unwrap();
        let envelope = plugin.build_envelope(&store, rows[0].clone()).await.unwrap();

        assert_eq!(envelope.media.len(), 1);
        assert_eq!(envelope.media[0].kind, MediaKind::Image);
        assert_eq!(envelope.media[0].file_name.as_deref(), Some("pic.png"));
        assert_eq!(envelope.media[0].size, Some(77));
    }

    #[test]
    fn support_follows_the_host_os() {
        let plugin = IMessagePlugin::with_db_path(PathBuf::from("/nonexistent"));
        let support = plugin.support();
        if cfg!(target_os = "macos") {
            assert!(support.supported);
        } else {
            assert!(!support.supported);
            assert!(support.unsupported_reason.is_some());
        }
    }
}
