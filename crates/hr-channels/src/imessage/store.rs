//! Read-only access to the Messages database (`chat.db`).
//!
//! The poller never replays history: the watermark starts at the maximum
//! row id at open time and only strictly greater rows are ever fetched.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::{ChannelError, Result};

/// Rows fetched per poll.
pub const POLL_LIMIT: i64 = 100;

/// Offset between the Apple reference epoch (2001-01-01) and Unix time.
const APPLE_EPOCH_OFFSET_SECS: i64 = 978_307_200;

/// `chat.style` value for group chats.
const CHAT_STYLE_GROUP: i64 = 43;

/// One inbound row from the message table.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub rowid: i64,
    pub guid: String,
    pub text: Option<String>,
    pub sender: Option<String>,
    pub chat_identifier: Option<String>,
    pub chat_name: Option<String>,
    pub chat_style: Option<i64>,
    /// Nanoseconds since the Apple reference epoch.
    pub date: i64,
    pub has_attachments: bool,
}

impl StoredMessage {
    pub fn is_group(&self) -> bool {
        self.chat_style == Some(CHAT_STYLE_GROUP)
    }

    pub fn unix_timestamp(&self) -> (i64, u32) {
        let secs = APPLE_EPOCH_OFFSET_SECS + self.date / 1_000_000_000;
        let nanos = (self.date % 1_000_000_000).unsigned_abs() as u32;
        (secs, nanos)
    }
}

/// One attachment row joined to a message.
#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub rowid: i64,
    pub mime_type: Option<String>,
    pub transfer_name: Option<String>,
    pub total_bytes: Option<i64>,
}

/// Read-only pool over the local message store.
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    /// Open the store read-only. Fails with a store error when the file is
    /// missing or unreadable.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| ChannelError::Store(format!("cannot open {}: {}", path.display(), e)))?;
        Ok(Self { pool })
    }

    /// The current maximum row id; the initial watermark at start.
    pub async fn max_rowid(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(ROWID), 0) AS max_rowid FROM message")
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        row.try_get::<i64, _>("max_rowid").map_err(store_err)
    }

    /// Rows strictly newer than the watermark, oldest first: not from this
    /// account, not reactions, capped at [`POLL_LIMIT`].
    pub async fn messages_after(&self, watermark: i64) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT m.ROWID AS rowid, m.guid AS guid, m.text AS text,
                   h.id AS sender,
                   c.chat_identifier AS chat_identifier,
                   c.display_name AS chat_name,
                   c.style AS chat_style,
                   m.date AS date,
                   m.cache_has_attachments AS has_attachments
            FROM message m
            JOIN chat_message_join cmj ON cmj.message_id = m.ROWID
            JOIN chat c ON c.ROWID = cmj.chat_id
            LEFT JOIN handle h ON h.ROWID = m.handle_id
            WHERE m.ROWID > ?
              AND m.is_from_me = 0
              AND m.associated_message_type = 0
            ORDER BY m.ROWID ASC
            LIMIT ?
            "#,
        )
        .bind(watermark)
        .bind(POLL_LIMIT)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.into_iter()
            .map(|row| {
                Ok(StoredMessage {
                    rowid: row.try_get("rowid").map_err(store_err)?,
                    guid: row.try_get("guid").map_err(store_err)?,
                    text: row.try_get("text").map_err(store_err)?,
                    sender: row.try_get("sender").map_err(store_err)?,
                    chat_identifier: row.try_get("chat_identifier").map_err(store_err)?,
                    chat_name: row.try_get("chat_name").map_err(store_err)?,
                    chat_style: row.try_get("chat_style").map_err(store_err)?,
                    date: row.try_get("date").map_err(store_err)?,
                    has_attachments: row.try_get::<i64, _>("has_attachments").map_err(store_err)?
                        != 0,
                })
            })
            .collect()
    }

    /// Attachment rows for one message.
    pub async fn attachments_for(&self, message_rowid: i64) -> Result<Vec<StoredAttachment>> {
        let rows = sqlx::query(
            r#"
            SELECT a.ROWID AS rowid, a.mime_type AS mime_type,
                   a.transfer_name AS transfer_name, a.total_bytes AS total_bytes
            FROM attachment a
            JOIN message_attachment_join maj ON maj.attachment_id = a.ROWID
            WHERE maj.message_id = ?
            ORDER BY a.ROWID ASC
            "#,
        )
        .bind(message_rowid)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.into_iter()
            .map(|row| {
                Ok(StoredAttachment {
                    rowid: row.try_get("rowid").map_err(store_err)?,
                    mime_type: row.try_get("mime_type").map_err(store_err)?,
                    transfer_name: row.try_get("transfer_name").map_err(store_err)?,
                    total_bytes: row.try_get("total_bytes").map_err(store_err)?,
                })
            })
            .collect()
    }
}

fn store_err(e: sqlx::Error) -> ChannelError {
    ChannelError::Store(e.to_string())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watermark_starts_at_current_max_and_never_replays() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("chat.db");
        let writer = fixture::create(&db).await;
        fixture::seed_contacts(&writer).await;
        fixture::insert_message(&writer, 1, "old one", false, 0).await;
        fixture::insert_message(&writer, 2, "old two", false, 0).await;

        let store = MessageStore::open(&db).await.unwrap();
        let watermark = store.max_rowid().await.unwrap();
        assert_eq!(watermark, 2);

        // Nothing strictly above the watermark yet: history is not replayed.
        assert!(store.messages_after(watermark).await.unwrap().is_empty());

        fixture::insert_message(&writer, 3, "fresh", false, 0).await;
        let rows = store.messages_after(watermark).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rowid, 3);
        assert_eq!(rows[0].text.as_deref(), Some("fresh"));
        assert_eq!(rows[0].sender.as_deref(), Some("+15550001111"));
    }

    #[tokio::test]
    async fn own_messages_and_reactions_are_filtered_in_sql() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("chat.db");
        let writer = fixture::create(&db).await;
        fixture::seed_contacts(&writer).await;
        fixture::insert_message(&writer, 1, "mine", true, 0).await;
        fixture::insert_message(&writer, 2, "tapback", false, 2000).await;
        fixture::insert_message(&writer, 3, "real", false, 0).await;

        let store = MessageStore::open(&db).await.unwrap();
        let rows = store.messages_after(0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text.as_deref(), Some("real"));
    }

    #[tokio::test]
    async fn attachments_join_by_message_rowid() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("chat.db");
        let writer = fixture::create(&db).await;
        fixture::seed_contacts(&writer).await;
        fixture::insert_message(&writer, 1, "photo", false, 0).await;

        sqlx::query(
            "INSERT INTO attachment (ROWID, mime_type, transfer_name, total_bytes) VALUES (7, 'image/heic', 'IMG_1.heic', 12345)",
        )
        .execute(&writer)
        .await
        .unwrap();
        sqlx::query("INSERT INTO message_attachment_join (message_id, attachment_id) VALUES (1, 7)")
            .execute(&writer)
            .await
            .unwrap();

        let store = MessageStore::open(&db).await.unwrap();
        let attachments = store.attachments_for(1).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].mime_type.as_deref(), Some("image/heic"));
        assert_eq!(attachments[0].total_bytes, Some(12345));
    }

    #[test]
    fn apple_epoch_conversion() {
        let message = StoredMessage {
            rowid: 1,
            guid: "g".into(),
            text: None,
            sender: None,
            chat_identifier: None,
            chat_name: None,
            chat_style: None,
            date: 0,
            has_attachments: false,
        };
        let (secs, nanos) = message.unix_timestamp();
        assert_eq!(secs, 978_307_200); // 2001-01-01T00:00:00Z
        assert_eq!(nanos, 0);
    }
}
