//! Notification session domain: user-level notifications, single recipient.
//!
//! Simpler than the chat domain: no participant pairing, and the initial
//! snapshot reads the durable store directly. The cache here is
//! read-through-on-signal only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::cache::{keys, FanoutCache};
use crate::error::{Error, Result};
use crate::models::{DeleteNotifPayload, FlowersPayload, Notification, ReadNotifPayload};
use crate::session::{FrameSink, SessionDomain};
use crate::store::NotificationStore;

pub struct NotificationSession {
    user_id: i64,
    store: Arc<dyn NotificationStore>,
    cache: Arc<dyn FanoutCache>,
    cache_len: i64,
    flowers_ttl: Duration,
}

impl NotificationSession {
    pub fn new(
        user_id: i64,
        store: Arc<dyn NotificationStore>,
        cache: Arc<dyn FanoutCache>,
        cache_len: i64,
        flowers_ttl: Duration,
    ) -> Self {
        Self {
            user_id,
            store,
            cache,
            cache_len,
            flowers_ttl,
        }
    }

    async fn handle_send_flowers(&self, payload: serde_json::Value, out: &FrameSink) -> Result<()> {
        let request: FlowersPayload =
            serde_json::from_value(payload).map_err(|_| Error::validation("Invalid payload"))?;

        // Fire-and-forget fan-out to the target's cache and channel; errors
        // surface to the sender only. No durable row is written for flowers.
        let sender_id = self.user_id;
        let cache = self.cache.clone();
        let cache_len = self.cache_len;
        let ttl = self.flowers_ttl;
        let out = out.clone();
        tokio::spawn(async move {
            let notification = Notification {
                notification_id: 0,
                read: 0,
                kind: "flowers".to_string(),
                content: format!("User {sender_id} sent you flowers!"),
            };
            let result = async {
                let payload = serde_json::to_string(&notification)?;
                cache
                    .push_recent(&keys::notifications(request.user_id), &payload, cache_len, ttl)
                    .await?;
                cache
                    .publish(&keys::notification_channel(request.user_id), "new")
                    .await
            }
            .await;

            match result {
                Ok(()) => {
                    out.send_json(&json!({
                        "type": "SentFlowersTo",
                        "user": request.user_id,
                    }))
                    .await;
                }
                Err(e) => {
                    warn!(target = request.user_id, error = %e, "failed to send flowers");
                    out.send_error("Failed to notify").await;
                }
            }
        });
        Ok(())
    }

    async fn handle_delete(&self, payload: serde_json::Value, out: &FrameSink) -> Result<()> {
        let request: DeleteNotifPayload = serde_json::from_value(payload)
            .map_err(|_| Error::validation("Invalid read payload"))?;

        let store = self.store.clone();
        let user_id = self.user_id;
        let out = out.clone();
        tokio::spawn(async move {
            match store.delete_notification(request.notif_id, user_id).await {
                Ok(()) => {
                    out.send_json(&json!({ "type": "status_updated", "user": user_id }))
                        .await;
                }
                Err(e) => {
                    warn!(notif_id = request.notif_id, error = %e, "failed to delete notification");
                    out.send_error("Failed to delete notification").await;
                }
            }
        });
        Ok(())
    }

    async fn handle_read(&self, payload: serde_json::Value, out: &FrameSink) -> Result<()> {
        let request: ReadNotifPayload =
            serde_json::from_value(payload).map_err(|_| Error::validation("Invalid payload"))?;

        let store = self.store.clone();
        let user_id = self.user_id;
        let out = out.clone();
        tokio::spawn(async move {
            match store.mark_notifications(user_id, &request.notif_type).await {
                Ok(()) => {
                    out.send_json(&json!({ "type": "status_updated", "user": user_id }))
                        .await;
                }
                Err(e) => {
                    warn!(user_id, error = %e, "failed to update notification status");
                    out.send_error("Failed to update notification status").await;
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl SessionDomain for NotificationSession {
    fn label(&self) -> &'static str {
        "notifications"
    }

    fn channel(&self) -> String {
        keys::notification_channel(self.user_id)
    }

    async fn authorize(&self) -> Result<()> {
        // The middleware already resolved the identity; a notification
        // session is scoped to that user alone.
        Ok(())
    }

    async fn initial_snapshot(&self, out: &FrameSink) -> Result<()> {
        let notifications = self.store.get_notifications(self.user_id).await?;
        out.send_json(&json!({
            "type": "init_notifications",
            "notifications": notifications,
        }))
        .await;
        Ok(())
    }

    async fn on_wake(&self, out: &FrameSink) -> Result<()> {
        let items = match self.cache.read_recent(&keys::notifications(self.user_id)).await {
            Ok(items) => items,
            Err(e) => {
                warn!(user_id = self.user_id, error = %e, "failed to read recent notifications");
                out.send_error("Failed to get notifications").await;
                return Ok(());
            }
        };

        let notifications: Vec<Notification> = items
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect();

        if !notifications.is_empty() {
            out.send_json(&json!({
                "type": "new_notifications",
                "notifications": notifications,
            }))
            .await;
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        action: &str,
        payload: serde_json::Value,
        out: &FrameSink,
    ) -> Result<()> {
        match action {
            "sendFlowers" => self.handle_send_flowers(payload, out).await,
            "delete" => self.handle_delete(payload, out).await,
            "read" => self.handle_read(payload, out).await,
            _ => Err(Error::validation("Unknown action type")),
        }
    }
}
