//! Wire and storage models for chats, messages, and notifications.
//!
//! Field renames pin the JSON contract the web client already speaks;
//! internal names stay idiomatic Rust.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery state of a chat message. Stored and serialized as an integer:
/// `1` sent, `2` delivered, `3` read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(from = "i32", into = "i32")]
#[repr(i32)]
pub enum DeliveryStatus {
    Sent = 1,
    Delivered = 2,
    Read = 3,
}

impl From<i32> for DeliveryStatus {
    fn from(value: i32) -> Self {
        match value {
            2 => DeliveryStatus::Delivered,
            3 => DeliveryStatus::Read,
            _ => DeliveryStatus::Sent,
        }
    }
}

impl From<DeliveryStatus> for i32 {
    fn from(status: DeliveryStatus) -> i32 {
        status as i32
    }
}

/// A chat message, both as stored durably and as cached/sent to clients.
///
/// The owning chat is implied by context (the session scope or the cache
/// key); it is not part of the wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    #[serde(rename = "messageid")]
    pub message_id: i64,
    #[serde(rename = "senderid")]
    pub sender_id: i64,
    pub text: String,
    pub status: DeliveryStatus,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// One entry of a user's chat list: the companion plus the latest message
/// preview and its read state.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ChatSummary {
    #[serde(rename = "chatId")]
    pub chat_id: i64,
    #[serde(rename = "companionId")]
    pub companion_id: i64,
    #[serde(rename = "lastMessage")]
    pub last_message: String,
    #[serde(rename = "isRead")]
    pub is_read: bool,
    #[serde(rename = "isSelf")]
    pub is_self: bool,
}

/// Kind of a user-level notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Message,
    Match,
    Flowers,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Message => "message",
            NotificationKind::Match => "match",
            NotificationKind::Flowers => "flowers",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-level notification as sent to clients and mirrored in the cache.
/// `read` is `0`/`1` on the wire, derived from the nullable `read_at` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "notificationID")]
    pub notification_id: i64,
    pub read: i32,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}

/// Envelope of every client-to-server WebSocket frame.
///
/// A missing `type` decodes as an empty string, which dispatch reports as an
/// unknown action rather than a malformed frame.
#[derive(Debug, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct CreatePayload {
    pub chat_id: i64,
    pub user_id: i64,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct DeletePayload {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReadPayload {
    pub chat_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct FlowersPayload {
    pub user_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct DeleteNotifPayload {
    pub notif_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReadNotifPayload {
    pub notif_type: String,
}

/// Body of the chat create/delete REST endpoints. Both sides are named; the
/// caller must be one of them.
#[derive(Debug, Deserialize)]
pub struct ChatPairRequest {
    #[serde(rename = "firstID")]
    pub first_id: i64,
    #[serde(rename = "secondID")]
    pub second_id: i64,
}
