//! Chat session domain: one authenticated participant streaming one chat.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::warn;

use crate::cache::{keys, FanoutCache};
use crate::error::{Error, Result};
use crate::models::{CreatePayload, DeletePayload, Message, NotificationKind, ReadPayload};
use crate::reconcile::ReconcileEngine;
use crate::session::{FrameSink, SessionDomain};
use crate::store::{ChatStore, NotificationStore};

pub struct ChatSession {
    chat_id: i64,
    user_id: i64,
    store: Arc<dyn ChatStore>,
    notifications: Arc<dyn NotificationStore>,
    cache: Arc<dyn FanoutCache>,
    engine: ReconcileEngine,
    /// Participants, resolved once during authorization.
    participants: OnceCell<(i64, i64)>,
    /// Message ids already pushed on this connection. Absorbs the race
    /// between the `created` acknowledgment and the outbound loop surfacing
    /// the same message from the cache: at most a suppressed duplicate,
    /// never a duplicate delivery.
    delivered: Arc<Mutex<HashSet<i64>>>,
}

impl ChatSession {
    pub fn new(
        chat_id: i64,
        user_id: i64,
        store: Arc<dyn ChatStore>,
        notifications: Arc<dyn NotificationStore>,
        cache: Arc<dyn FanoutCache>,
    ) -> Self {
        let engine = ReconcileEngine::new(store.clone(), cache.clone());
        Self {
            chat_id,
            user_id,
            store,
            notifications,
            cache,
            engine,
            participants: OnceCell::new(),
            delivered: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    async fn pair(&self) -> Result<(i64, i64)> {
        self.participants
            .get_or_try_init(|| async { self.store.get_participants(self.chat_id).await })
            .await
            .map(|pair| *pair)
    }

    fn mark_delivered(&self, messages: &[Message]) {
        let mut delivered = self.delivered.lock();
        for message in messages {
            delivered.insert(message.message_id);
        }
    }

    /// Drop the session user's consumed cache entries. Best-effort: a
    /// failure here only risks a suppressed re-delivery later.
    async fn invalidate_own(&self) {
        let key = keys::chat_messages(self.chat_id, self.user_id);
        if let Err(e) = self.cache.invalidate(&key).await {
            warn!(chat_id = self.chat_id, user_id = self.user_id, error = %e,
                "failed to invalidate recent-message cache");
        }
    }

    async fn handle_create(&self, payload: serde_json::Value, out: &FrameSink) -> Result<()> {
        let request: CreatePayload = serde_json::from_value(payload)
            .map_err(|_| Error::validation("Invalid create payload"))?;

        let (first, second) = self.pair().await?;
        if (request.user_id != first && request.user_id != second)
            || request.chat_id != self.chat_id
        {
            return Err(Error::Unauthorized("You don't have access"));
        }
        let recipient = if request.user_id == first { second } else { first };

        // The recipient is notified synchronously; a failure aborts the
        // command before anything is persisted.
        let content = format!("User {} sent you a message!", request.user_id);
        if let Err(e) = self
            .notifications
            .add_notification(recipient, NotificationKind::Message, &content)
            .await
        {
            warn!(recipient, error = %e, "failed to record message notification");
            out.send_error("Failed to notify").await;
            return Ok(());
        }

        // Persistence runs off the inbound loop; the acknowledgment carries
        // the durable id once the insert lands.
        let store = self.store.clone();
        let delivered = self.delivered.clone();
        let out = out.clone();
        tokio::spawn(async move {
            match store
                .create_message(request.chat_id, request.user_id, &request.content)
                .await
            {
                Ok(message) => {
                    delivered.lock().insert(message.message_id);
                    out.send_json(&json!({
                        "type": "created",
                        "message_id": message.message_id,
                    }))
                    .await;
                }
                Err(e) => {
                    warn!(chat_id = request.chat_id, error = %e, "failed to create message");
                    out.send_error("Failed to create message").await;
                }
            }
        });
        Ok(())
    }

    async fn handle_delete(&self, payload: serde_json::Value, out: &FrameSink) -> Result<()> {
        let request: DeletePayload = serde_json::from_value(payload)
            .map_err(|_| Error::validation("Invalid delete payload"))?;
        if request.chat_id != self.chat_id {
            return Err(Error::Unauthorized("You don't have access"));
        }

        let store = self.store.clone();
        let out = out.clone();
        tokio::spawn(async move {
            match store.delete_message(request.message_id, request.chat_id).await {
                Ok(()) => {
                    out.send_json(&json!({
                        "type": "deleted",
                        "message_id": request.message_id,
                    }))
                    .await;
                }
                Err(e) => {
                    warn!(message_id = request.message_id, error = %e, "failed to delete message");
                    out.send_error("Failed to delete message").await;
                }
            }
        });
        Ok(())
    }

    async fn handle_get(&self, out: &FrameSink) -> Result<()> {
        let messages = match self.engine.recent_for(self.chat_id, self.user_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(chat_id = self.chat_id, error = %e, "failed to reconcile messages");
                out.send_error("Failed to get messages").await;
                return Ok(());
            }
        };
        self.mark_delivered(&messages);
        out.send_json(&json!({ "type": "new_messages", "messages": messages }))
            .await;
        self.invalidate_own().await;
        Ok(())
    }

    async fn handle_read(&self, payload: serde_json::Value, out: &FrameSink) -> Result<()> {
        let request: ReadPayload = serde_json::from_value(payload)
            .map_err(|_| Error::validation("Invalid read payload"))?;
        if request.chat_id != self.chat_id {
            return Err(Error::Unauthorized("You don't have access"));
        }

        let store = self.store.clone();
        let reader_id = self.user_id;
        let out = out.clone();
        tokio::spawn(async move {
            match store.update_delivery_status(request.chat_id, reader_id).await {
                Ok(()) => {
                    out.send_json(&json!({
                        "type": "status_updated",
                        "chat": request.chat_id,
                    }))
                    .await;
                }
                Err(e) => {
                    warn!(chat_id = request.chat_id, error = %e, "failed to update message status");
                    out.send_error("Failed to update message status").await;
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl SessionDomain for ChatSession {
    fn label(&self) -> &'static str {
        "chat"
    }

    fn channel(&self) -> String {
        keys::chat_channel(self.chat_id, self.user_id)
    }

    async fn authorize(&self) -> Result<()> {
        let (first, second) = self.pair().await?;
        if self.user_id != first && self.user_id != second {
            return Err(Error::Unauthorized("You don't have access"));
        }
        Ok(())
    }

    async fn initial_snapshot(&self, out: &FrameSink) -> Result<()> {
        let (first, second) = self.pair().await?;
        let messages = self.engine.merged_view(self.chat_id, first, second).await?;
        self.mark_delivered(&messages);
        out.send_json(&json!({ "type": "init_messages", "messages": messages }))
            .await;
        self.invalidate_own().await;
        Ok(())
    }

    async fn on_wake(&self, out: &FrameSink) -> Result<()> {
        // Wake-ups re-read the cache only; the durable store is not polled.
        let cached = match self.engine.cached_for(self.chat_id, self.user_id).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(chat_id = self.chat_id, error = %e, "failed to read recent messages");
                out.send_error("Failed to get messages").await;
                return Ok(());
            }
        };

        let fresh: Vec<Message> = {
            let mut delivered = self.delivered.lock();
            cached
                .into_iter()
                .filter(|m| delivered.insert(m.message_id))
                .collect()
        };

        if !fresh.is_empty() {
            out.send_json(&json!({ "type": "new_messages", "messages": fresh }))
                .await;
        }
        self.invalidate_own().await;
        Ok(())
    }

    async fn dispatch(
        &self,
        action: &str,
        payload: serde_json::Value,
        out: &FrameSink,
    ) -> Result<()> {
        match action {
            "create" => self.handle_create(payload, out).await,
            "delete" => self.handle_delete(payload, out).await,
            "get" => self.handle_get(out).await,
            "read" => self.handle_read(payload, out).await,
            _ => Err(Error::validation("Unknown action type")),
        }
    }
}
