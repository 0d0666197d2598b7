//! Postgres repositories for chats, messages, and notifications.
//!
//! Writes that clients observe live go through the write-through pattern:
//! insert durably first, then mirror the row into the recipient's bounded
//! cache list and publish a wake-up marker. The durable row is authoritative;
//! the cached copy carries the same id, which reconciliation relies on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::cache::{keys, FanoutCache};
use crate::error::{Error, Result};
use crate::models::{ChatSummary, DeliveryStatus, Message, Notification, NotificationKind};
use crate::store::{ChatStore, NotificationStore};

/// Bundled DDL for the tables these repositories own.
pub const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

/// Apply the bundled schema. Idempotent.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(INIT_SQL).execute(pool).await?;
    Ok(())
}

const GET_PARTICIPANTS: &str = r#"
SELECT first_profile, second_profile
FROM chats
WHERE chat_id = $1
"#;

const FIND_CHAT_BY_PAIR: &str = r#"
SELECT chat_id
FROM chats
WHERE (first_profile = $1 AND second_profile = $2)
   OR (first_profile = $2 AND second_profile = $1)
"#;

const CREATE_CHAT: &str = r#"
INSERT INTO chats (first_profile, second_profile)
VALUES ($1, $2)
RETURNING chat_id
"#;

const GET_CHATS: &str = r#"
SELECT c.chat_id,
       CASE WHEN c.first_profile = $1 THEN c.second_profile
            ELSE c.first_profile END AS companion_id,
       COALESCE(m.content, '')       AS last_message,
       COALESCE(m.status = 3, TRUE)  AS is_read,
       COALESCE(m.sender_id = $1, FALSE) AS is_self
FROM chats c
LEFT JOIN LATERAL (
    SELECT content, status, sender_id
    FROM messages
    WHERE chat_id = c.chat_id
    ORDER BY created_at DESC, message_id DESC
    LIMIT 1
) m ON TRUE
WHERE c.first_profile = $1 OR c.second_profile = $1
ORDER BY c.chat_id
"#;

const CREATE_MESSAGE: &str = r#"
INSERT INTO messages (chat_id, sender_id, content, status)
VALUES ($1, $2, $3, $4)
RETURNING message_id, sender_id, content AS text, status, created_at
"#;

const LIST_MESSAGES: &str = r#"
SELECT message_id, sender_id, content AS text, status, created_at
FROM messages
WHERE chat_id = $1
ORDER BY created_at ASC, message_id ASC
"#;

const DELETE_MESSAGE: &str = r#"
DELETE FROM messages
WHERE message_id = $1 AND chat_id = $2
"#;

const MARK_MESSAGES_READ: &str = r#"
UPDATE messages
SET status = 3
WHERE chat_id = $1 AND sender_id <> $2 AND status <> 3
"#;

pub struct PgChatStore {
    pool: PgPool,
    cache: Arc<dyn FanoutCache>,
    cache_len: i64,
    cache_ttl: Duration,
}

impl PgChatStore {
    pub fn new(
        pool: PgPool,
        cache: Arc<dyn FanoutCache>,
        cache_len: i64,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            pool,
            cache,
            cache_len,
            cache_ttl,
        }
    }

    async fn participants(&self, chat_id: i64) -> Result<(i64, i64)> {
        let row: Option<(i64, i64)> = sqlx::query_as(GET_PARTICIPANTS)
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| Error::not_found("Chat not found"))
    }

    /// Rewrite one participant's cached entries, marking messages from the
    /// other side as read. Preserves list order: LRANGE yields newest first,
    /// so re-pushing oldest first restores it.
    async fn rewrite_cached_as_read(&self, chat_id: i64, reader_id: i64) -> Result<()> {
        let key = keys::chat_messages(chat_id, reader_id);
        let items = self.cache.read_recent(&key).await?;
        if items.is_empty() {
            return Ok(());
        }

        let mut rewritten = Vec::with_capacity(items.len());
        for raw in &items {
            let Ok(mut msg) = serde_json::from_str::<Message>(raw) else {
                continue;
            };
            if msg.sender_id != reader_id {
                msg.status = DeliveryStatus::Read;
            }
            rewritten.push(serde_json::to_string(&msg)?);
        }

        self.cache.invalidate(&key).await?;
        for payload in rewritten.iter().rev() {
            self.cache
                .push_recent(&key, payload, self.cache_len, self.cache_ttl)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn create_chat(&self, first: i64, second: i64) -> Result<i64> {
        if first == second {
            return Err(Error::validation("Cannot create a chat with yourself"));
        }
        let (chat_id,): (i64,) = sqlx::query_as(CREATE_CHAT)
            .bind(first)
            .bind(second)
            .fetch_one(&self.pool)
            .await?;
        info!(chat_id, first, second, "chat created");
        Ok(chat_id)
    }

    async fn delete_chat(&self, first: i64, second: i64) -> Result<()> {
        if first == second {
            return Err(Error::validation("Cannot delete a chat with yourself"));
        }
        let row: Option<(i64,)> = sqlx::query_as(FIND_CHAT_BY_PAIR)
            .bind(first)
            .bind(second)
            .fetch_optional(&self.pool)
            .await?;
        let Some((chat_id,)) = row else {
            return Err(Error::not_found("Chat not found"));
        };

        // Messages and the chat row go together or not at all.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE chat_id = $1")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chats WHERE chat_id = $1")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        for user_id in [first, second] {
            self.cache
                .invalidate(&keys::chat_messages(chat_id, user_id))
                .await?;
        }
        info!(chat_id, "chat deleted");
        Ok(())
    }

    async fn get_chats(&self, user_id: i64) -> Result<Vec<ChatSummary>> {
        let chats = sqlx::query_as::<_, ChatSummary>(GET_CHATS)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(chats)
    }

    async fn get_participants(&self, chat_id: i64) -> Result<(i64, i64)> {
        self.participants(chat_id).await
    }

    async fn create_message(&self, chat_id: i64, sender_id: i64, text: &str) -> Result<Message> {
        let (first, second) = self.participants(chat_id).await?;

        let message = sqlx::query_as::<_, Message>(CREATE_MESSAGE)
            .bind(chat_id)
            .bind(sender_id)
            .bind(text)
            .bind(i32::from(DeliveryStatus::Sent))
            .fetch_one(&self.pool)
            .await?;

        // Fan out after the insert so the cached id equals the durable id.
        let payload = serde_json::to_string(&message)?;
        for user_id in [first, second] {
            self.cache
                .push_recent(
                    &keys::chat_messages(chat_id, user_id),
                    &payload,
                    self.cache_len,
                    self.cache_ttl,
                )
                .await?;
            self.cache
                .publish(&keys::chat_channel(chat_id, user_id), "new")
                .await?;
        }

        debug!(
            chat_id,
            message_id = message.message_id,
            "message persisted and fanned out"
        );
        Ok(message)
    }

    async fn list_messages(&self, chat_id: i64) -> Result<Vec<Message>> {
        // A missing chat is an error; an empty chat is an empty list.
        self.participants(chat_id).await?;
        let messages = sqlx::query_as::<_, Message>(LIST_MESSAGES)
            .bind(chat_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(messages)
    }

    async fn delete_message(&self, message_id: i64, chat_id: i64) -> Result<()> {
        sqlx::query(DELETE_MESSAGE)
            .bind(message_id)
            .bind(chat_id)
            .execute(&self.pool)
            .await?;

        match self.participants(chat_id).await {
            Ok((first, second)) => {
                for user_id in [first, second] {
                    self.cache
                        .invalidate(&keys::chat_messages(chat_id, user_id))
                        .await?;
                }
            }
            // The chat itself may already be gone; the delete stays idempotent.
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn update_delivery_status(&self, chat_id: i64, reader_id: i64) -> Result<()> {
        sqlx::query(MARK_MESSAGES_READ)
            .bind(chat_id)
            .bind(reader_id)
            .execute(&self.pool)
            .await?;
        self.rewrite_cached_as_read(chat_id, reader_id).await
    }
}

const ADD_NOTIFICATION: &str = r#"
INSERT INTO notifications (user_id, notification_type, content)
VALUES (
    $1,
    (SELECT notif_type FROM notification_types WHERE type_description = $2),
    $3
)
RETURNING notification_id
"#;

const GET_NOTIFICATIONS: &str = r#"
SELECT n.notification_id,
       nt.type_description,
       n.content,
       n.read_at
FROM notifications n
JOIN notification_types nt ON n.notification_type = nt.notif_type
WHERE n.user_id = $1
ORDER BY n.created_at DESC
"#;

const MARK_NOTIFICATIONS: &str = r#"
UPDATE notifications n
SET read_at = CURRENT_TIMESTAMP
FROM notification_types nt
WHERE n.notification_type = nt.notif_type
  AND n.user_id = $1
  AND nt.type_description = $2
"#;

const DELETE_NOTIFICATION: &str = r#"
DELETE FROM notifications
WHERE notification_id = $1 AND user_id = $2
"#;

pub struct PgNotificationStore {
    pool: PgPool,
    cache: Arc<dyn FanoutCache>,
    cache_len: i64,
    cache_ttl: Duration,
}

impl PgNotificationStore {
    pub fn new(
        pool: PgPool,
        cache: Arc<dyn FanoutCache>,
        cache_len: i64,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            pool,
            cache,
            cache_len,
            cache_ttl,
        }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn add_notification(
        &self,
        user_id: i64,
        kind: NotificationKind,
        content: &str,
    ) -> Result<Notification> {
        let (notification_id,): (i64,) = sqlx::query_as(ADD_NOTIFICATION)
            .bind(user_id)
            .bind(kind.as_str())
            .bind(content)
            .fetch_one(&self.pool)
            .await?;

        let notification = Notification {
            notification_id,
            read: 0,
            kind: kind.as_str().to_string(),
            content: content.to_string(),
        };

        let payload = serde_json::to_string(&notification)?;
        let key = keys::notifications(user_id);
        self.cache
            .push_recent(&key, &payload, self.cache_len, self.cache_ttl)
            .await?;
        self.cache
            .publish(&keys::notification_channel(user_id), "new")
            .await?;

        debug!(user_id, notification_id, kind = %kind, "notification recorded");
        Ok(notification)
    }

    async fn get_notifications(&self, user_id: i64) -> Result<Vec<Notification>> {
        let rows: Vec<(i64, String, String, Option<DateTime<Utc>>)> =
            sqlx::query_as(GET_NOTIFICATIONS)
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(notification_id, kind, content, read_at)| Notification {
                notification_id,
                read: i32::from(read_at.is_some()),
                kind,
                content,
            })
            .collect())
    }

    async fn mark_notifications(&self, user_id: i64, kind: &str) -> Result<()> {
        sqlx::query(MARK_NOTIFICATIONS)
            .bind(user_id)
            .bind(kind)
            .execute(&self.pool)
            .await?;

        // Mirror the status change into the cached copies.
        let key = keys::notifications(user_id);
        let items = self.cache.read_recent(&key).await?;
        if items.is_empty() {
            return Ok(());
        }

        let mut rewritten = Vec::with_capacity(items.len());
        for raw in &items {
            let Ok(mut notif) = serde_json::from_str::<Notification>(raw) else {
                continue;
            };
            if notif.kind == kind {
                notif.read = 1;
            }
            rewritten.push(serde_json::to_string(&notif)?);
        }

        self.cache.invalidate(&key).await?;
        for payload in rewritten.iter().rev() {
            self.cache
                .push_recent(&key, payload, self.cache_len, self.cache_ttl)
                .await?;
        }
        Ok(())
    }

    async fn delete_notification(&self, notification_id: i64, user_id: i64) -> Result<()> {
        sqlx::query(DELETE_NOTIFICATION)
            .bind(notification_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        self.cache.invalidate(&keys::notifications(user_id)).await
    }
}
