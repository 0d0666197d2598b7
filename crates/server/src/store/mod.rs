//! Durable persistence contracts.
//!
//! Protocol handlers and the reconciliation engine depend on these traits;
//! the Postgres implementations live in [`postgres`]. Tests substitute
//! in-memory fakes.

pub mod postgres;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ChatSummary, Message, Notification, NotificationKind};

pub use postgres::{PgChatStore, PgNotificationStore};

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Create a chat between two distinct users. Rejects `first == second`.
    async fn create_chat(&self, first: i64, second: i64) -> Result<i64>;

    /// Delete the chat between two users along with all of its messages,
    /// in one transaction. Symmetric: either side may call it.
    async fn delete_chat(&self, first: i64, second: i64) -> Result<()>;

    /// Every chat the user belongs to, with last-message previews.
    async fn get_chats(&self, user_id: i64) -> Result<Vec<ChatSummary>>;

    /// The two participants of a chat. `NotFound` if the chat is absent.
    async fn get_participants(&self, chat_id: i64) -> Result<(i64, i64)>;

    /// Persist a message, then fan it out: the serialized row is pushed to
    /// both participants' recent-message lists and a wake-up marker is
    /// published on both of their chat channels.
    async fn create_message(&self, chat_id: i64, sender_id: i64, text: &str) -> Result<Message>;

    /// All messages of a chat, ascending by creation time. Empty for an
    /// empty chat; `NotFound` only if the chat itself is absent.
    async fn list_messages(&self, chat_id: i64) -> Result<Vec<Message>>;

    /// Idempotent delete by message id, scoped to its chat. Invalidates both
    /// participants' recent-message lists (destructive edit).
    async fn delete_message(&self, message_id: i64, chat_id: i64) -> Result<()>;

    /// Mark every message in the chat not sent by `reader_id` as read, in
    /// the durable store and in the reader's cached entries.
    async fn update_delivery_status(&self, chat_id: i64, reader_id: i64) -> Result<()>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a notification, mirror it into the recipient's recent list,
    /// and publish a wake-up on their notification channel.
    async fn add_notification(
        &self,
        user_id: i64,
        kind: NotificationKind,
        content: &str,
    ) -> Result<Notification>;

    /// Durable notifications for a user, newest first.
    async fn get_notifications(&self, user_id: i64) -> Result<Vec<Notification>>;

    /// Mark all notifications of one kind as read, durably and in the
    /// user's cached entries.
    async fn mark_notifications(&self, user_id: i64, kind: &str) -> Result<()>;

    /// Delete one notification and drop the user's cached list.
    async fn delete_notification(&self, notification_id: i64, user_id: i64) -> Result<()>;
}
