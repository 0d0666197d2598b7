//! HTTP surface: chat CRUD plus the two WebSocket upgrade endpoints.

mod chat;
mod notifications;

pub use chat::{chat_ws, create_chat, delete_chat, get_chats};
pub use notifications::notifications_ws;
