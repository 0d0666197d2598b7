//! Ephemeral fan-out cache: Redis bounded lists plus pub/sub wake-up signals.
//!
//! The cache is never authoritative. Lists hold recently-published payloads
//! per recipient so live sessions can re-fetch cheaply on a pub/sub signal
//! instead of polling the durable store; channels carry wake-up markers whose
//! content subscribers never trust.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::Result;

/// Key and channel naming. Everything is scoped by semantic domain and
/// recipient so that publishing for one recipient never wakes an unrelated
/// connection.
pub mod keys {
    /// Bounded list of recent messages for one chat participant.
    pub fn chat_messages(chat_id: i64, user_id: i64) -> String {
        format!("chat:{chat_id}:recipient:{user_id}")
    }

    /// Wake-up channel paired with [`chat_messages`].
    pub fn chat_channel(chat_id: i64, user_id: i64) -> String {
        format!("chat:{chat_id}:recipient:{user_id}:events")
    }

    /// Bounded list of recent notifications for one user.
    pub fn notifications(user_id: i64) -> String {
        format!("notifications:{user_id}")
    }

    /// Wake-up channel paired with [`notifications`].
    pub fn notification_channel(user_id: i64) -> String {
        format!("notifications:{user_id}:events")
    }

    /// Session token written by the sessions service, read here only.
    pub fn session(token: &str) -> String {
        format!("session:{token}")
    }
}

/// A live pub/sub subscription delivering unit wake-up markers.
///
/// Dropping the subscription tears down the forwarding task behind it.
pub struct Subscription {
    rx: mpsc::Receiver<()>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<()>) -> Self {
        Self { rx }
    }

    /// Waits for the next wake-up. `None` means the subscription is gone
    /// (cache connection lost or forwarder stopped).
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait FanoutCache: Send + Sync {
    /// Prepend `payload` to the bounded list at `key`, truncate to
    /// `max_len`, and reset the list's time-to-live.
    async fn push_recent(
        &self,
        key: &str,
        payload: &str,
        max_len: i64,
        ttl: Duration,
    ) -> Result<()>;

    /// Read the whole bounded list, newest first. Non-consuming.
    async fn read_recent(&self, key: &str) -> Result<Vec<String>>;

    /// Drop the bounded list. Used after a successful reconciliation read by
    /// the recipient, or after a destructive edit.
    async fn invalidate(&self, key: &str) -> Result<()>;

    /// Publish a wake-up marker. At-least-once; subscribers re-query state
    /// on every signal instead of trusting the marker.
    async fn publish(&self, channel: &str, marker: &str) -> Result<()>;

    /// Subscribe to a wake-up channel.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Redis-backed implementation. One multiplexed connection shared by every
/// command path; one dedicated pub/sub connection per subscription.
pub struct RedisCache {
    client: redis::Client,
    conn: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        // Readiness probe; fail startup early rather than on first command.
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self {
            client,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// The shared command connection, for collaborators that read adjacent
    /// keyspaces (session validation).
    pub fn shared_connection(&self) -> Arc<Mutex<MultiplexedConnection>> {
        self.conn.clone()
    }
}

#[async_trait]
impl FanoutCache for RedisCache {
    async fn push_recent(
        &self,
        key: &str,
        payload: &str,
        max_len: i64,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LPUSH")
            .arg(key)
            .arg(payload)
            .ignore()
            .cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(max_len - 1)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .ignore();
        let _: () = pipe.query_async(&mut *conn).await?;
        Ok(())
    }

    async fn read_recent(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let items: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut *conn)
            .await?;
        Ok(items)
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut *conn).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, marker: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let _: () = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(marker)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(8);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            loop {
                tokio::select! {
                    msg = stream.next() => match msg {
                        // Arrival is the signal; the payload is ignored.
                        Some(_) => {
                            if tx.send(()).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            warn!(channel, "pub/sub stream closed");
                            break;
                        }
                    },
                    _ = tx.closed() => break,
                }
            }
            debug!(channel, "pub/sub forwarder stopped");
        });

        Ok(Subscription::new(rx))
    }
}
