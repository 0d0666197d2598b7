//! In-memory fakes of the store and cache contracts, plus a channel-driven
//! client for exercising protocol sessions without sockets.
//!
//! The fakes mirror the write-through fan-out the Postgres repositories
//! perform: `create_message` and `add_notification` also populate the cache
//! and publish wake-up markers.

// Each test binary uses a different slice of this module.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use amora_server::cache::{keys, FanoutCache, Subscription};
use amora_server::error::{Error, Result};
use amora_server::models::{
    ChatSummary, DeliveryStatus, Message, Notification, NotificationKind,
};
use amora_server::session::{run_session, Incoming, SessionDomain};
use amora_server::store::{ChatStore, NotificationStore};

pub const CACHE_LEN: i64 = 100;
pub const CACHE_TTL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Fake fan-out cache
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCache {
    /// Key -> (payloads newest first, expiry of the whole list).
    lists: Mutex<HashMap<String, (Vec<String>, Instant)>>,
    channels: Mutex<HashMap<String, Vec<mpsc::Sender<()>>>>,
}

impl MemoryCache {
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Spin until a session has subscribed to `channel`, so a test can
    /// publish without racing session setup.
    pub async fn wait_for_subscriber(&self, channel: &str) {
        for _ in 0..100 {
            if self.subscriber_count(channel) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no subscriber appeared on {channel}");
    }
}

#[async_trait]
impl FanoutCache for MemoryCache {
    async fn push_recent(
        &self,
        key: &str,
        payload: &str,
        max_len: i64,
        ttl: Duration,
    ) -> Result<()> {
        let mut lists = self.lists.lock();
        let entry = lists
            .entry(key.to_string())
            .or_insert_with(|| (Vec::new(), Instant::now() + ttl));
        if entry.1 <= Instant::now() {
            entry.0.clear();
        }
        entry.0.insert(0, payload.to_string());
        entry.0.truncate(max_len as usize);
        entry.1 = Instant::now() + ttl;
        Ok(())
    }

    async fn read_recent(&self, key: &str) -> Result<Vec<String>> {
        let lists = self.lists.lock();
        Ok(match lists.get(key) {
            Some((items, expires)) if *expires > Instant::now() => items.clone(),
            _ => Vec::new(),
        })
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.lists.lock().remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, _marker: &str) -> Result<()> {
        let mut channels = self.channels.lock();
        if let Some(subs) = channels.get_mut(channel) {
            subs.retain(|tx| match tx.try_send(()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(8);
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }
}

// ---------------------------------------------------------------------------
// Fake chat store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChatTables {
    chats: HashMap<i64, (i64, i64)>,
    messages: Vec<(i64, Message)>,
    next_chat_id: i64,
    next_message_id: i64,
}

pub struct MemoryChatStore {
    cache: Arc<MemoryCache>,
    inner: Mutex<ChatTables>,
}

impl MemoryChatStore {
    pub fn new(cache: Arc<MemoryCache>) -> Self {
        Self {
            cache,
            inner: Mutex::new(ChatTables::default()),
        }
    }

    /// Seed a chat without going through validation.
    pub fn seed_chat(&self, first: i64, second: i64) -> i64 {
        let mut inner = self.inner.lock();
        inner.next_chat_id += 1;
        let chat_id = inner.next_chat_id;
        inner.chats.insert(chat_id, (first, second));
        chat_id
    }

    /// Seed a durable message without touching the cache.
    pub fn seed_message(&self, chat_id: i64, sender_id: i64, text: &str) -> Message {
        let mut inner = self.inner.lock();
        inner.next_message_id += 1;
        let message = Message {
            message_id: inner.next_message_id,
            sender_id,
            text: text.to_string(),
            status: DeliveryStatus::Sent,
            created_at: Utc::now(),
        };
        inner.messages.push((chat_id, message.clone()));
        message
    }

    pub fn message_count(&self) -> usize {
        self.inner.lock().messages.len()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn create_chat(&self, first: i64, second: i64) -> Result<i64> {
        if first == second {
            return Err(Error::validation("Cannot create a chat with yourself"));
        }
        Ok(self.seed_chat(first, second))
    }

    async fn delete_chat(&self, first: i64, second: i64) -> Result<()> {
        let chat_id = {
            let mut inner = self.inner.lock();
            let chat_id = inner
                .chats
                .iter()
                .find(|(_, &(a, b))| (a, b) == (first, second) || (a, b) == (second, first))
                .map(|(&id, _)| id)
                .ok_or_else(|| Error::not_found("Chat not found"))?;
            inner.chats.remove(&chat_id);
            inner.messages.retain(|(owner, _)| *owner != chat_id);
            chat_id
        };
        for user_id in [first, second] {
            self.cache
                .invalidate(&keys::chat_messages(chat_id, user_id))
                .await?;
        }
        Ok(())
    }

    async fn get_chats(&self, user_id: i64) -> Result<Vec<ChatSummary>> {
        let inner = self.inner.lock();
        let mut summaries = Vec::new();
        for (&chat_id, &(first, second)) in &inner.chats {
            if user_id != first && user_id != second {
                continue;
            }
            let last = inner
                .messages
                .iter()
                .filter(|(owner, _)| *owner == chat_id)
                .map(|(_, m)| m)
                .next_back();
            summaries.push(ChatSummary {
                chat_id,
                companion_id: if user_id == first { second } else { first },
                last_message: last.map(|m| m.text.clone()).unwrap_or_default(),
                is_read: last.map(|m| m.status == DeliveryStatus::Read).unwrap_or(true),
                is_self: last.map(|m| m.sender_id == user_id).unwrap_or(false),
            });
        }
        summaries.sort_by_key(|s| s.chat_id);
        Ok(summaries)
    }

    async fn get_participants(&self, chat_id: i64) -> Result<(i64, i64)> {
        self.inner
            .lock()
            .chats
            .get(&chat_id)
            .copied()
            .ok_or_else(|| Error::not_found("Chat not found"))
    }

    async fn create_message(&self, chat_id: i64, sender_id: i64, text: &str) -> Result<Message> {
        let (first, second) = self.get_participants(chat_id).await?;
        let message = self.seed_message(chat_id, sender_id, text);

        let payload = serde_json::to_string(&message)?;
        for user_id in [first, second] {
            self.cache
                .push_recent(
                    &keys::chat_messages(chat_id, user_id),
                    &payload,
                    CACHE_LEN,
                    CACHE_TTL,
                )
                .await?;
            self.cache
                .publish(&keys::chat_channel(chat_id, user_id), "new")
                .await?;
        }
        Ok(message)
    }

    async fn list_messages(&self, chat_id: i64) -> Result<Vec<Message>> {
        let inner = self.inner.lock();
        if !inner.chats.contains_key(&chat_id) {
            return Err(Error::not_found("Chat not found"));
        }
        let mut messages: Vec<Message> = inner
            .messages
            .iter()
            .filter(|(owner, _)| *owner == chat_id)
            .map(|(_, m)| m.clone())
            .collect();
        messages.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.message_id.cmp(&b.message_id))
        });
        Ok(messages)
    }

    async fn delete_message(&self, message_id: i64, chat_id: i64) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner
                .messages
                .retain(|(owner, m)| !(*owner == chat_id && m.message_id == message_id));
        }
        if let Ok((first, second)) = self.get_participants(chat_id).await {
            for user_id in [first, second] {
                self.cache
                    .invalidate(&keys::chat_messages(chat_id, user_id))
                    .await?;
            }
        }
        Ok(())
    }

    async fn update_delivery_status(&self, chat_id: i64, reader_id: i64) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            for (owner, message) in inner.messages.iter_mut() {
                if *owner == chat_id && message.sender_id != reader_id {
                    message.status = DeliveryStatus::Read;
                }
            }
        }

        let key = keys::chat_messages(chat_id, reader_id);
        let items = self.cache.read_recent(&key).await?;
        if items.is_empty() {
            return Ok(());
        }
        let mut rewritten = Vec::new();
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
                .push_recent(&key, payload, CACHE_LEN, CACHE_TTL)
                .await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake notification store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct NotifTables {
    rows: Vec<(i64, Notification)>,
    next_id: i64,
}

pub struct MemoryNotificationStore {
    cache: Arc<MemoryCache>,
    inner: Mutex<NotifTables>,
}

impl MemoryNotificationStore {
    pub fn new(cache: Arc<MemoryCache>) -> Self {
        Self {
            cache,
            inner: Mutex::new(NotifTables::default()),
        }
    }

    pub fn for_user(&self, user_id: i64) -> Vec<Notification> {
        self.inner
            .lock()
            .rows
            .iter()
            .filter(|(owner, _)| *owner == user_id)
            .map(|(_, n)| n.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn add_notification(
        &self,
        user_id: i64,
        kind: NotificationKind,
        content: &str,
    ) -> Result<Notification> {
        let notification = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let notification = Notification {
                notification_id: inner.next_id,
                read: 0,
                kind: kind.as_str().to_string(),
                content: content.to_string(),
            };
            inner.rows.push((user_id, notification.clone()));
            notification
        };

        let payload = serde_json::to_string(&notification)?;
        let key = keys::notifications(user_id);
        self.cache
            .push_recent(&key, &payload, CACHE_LEN, CACHE_TTL)
            .await?;
        self.cache
            .publish(&keys::notification_channel(user_id), "new")
            .await?;
        Ok(notification)
    }

    async fn get_notifications(&self, user_id: i64) -> Result<Vec<Notification>> {
        let mut rows = self.for_user(user_id);
        rows.reverse(); // newest first
        Ok(rows)
    }

    async fn mark_notifications(&self, user_id: i64, kind: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            for (owner, notification) in inner.rows.iter_mut() {
                if *owner == user_id && notification.kind == kind {
                    notification.read = 1;
                }
            }
        }

        let key = keys::notifications(user_id);
        let items = self.cache.read_recent(&key).await?;
        let mut rewritten = Vec::new();
        for raw in &items {
            let Ok(mut notification) = serde_json::from_str::<Notification>(raw) else {
                continue;
            };
            if notification.kind == kind {
                notification.read = 1;
            }
            rewritten.push(serde_json::to_string(&notification)?);
        }
        self.cache.invalidate(&key).await?;
        for payload in rewritten.iter().rev() {
            self.cache
                .push_recent(&key, payload, CACHE_LEN, CACHE_TTL)
                .await?;
        }
        Ok(())
    }

    async fn delete_notification(&self, notification_id: i64, user_id: i64) -> Result<()> {
        self.inner.lock().rows.retain(|(owner, n)| {
            !(*owner == user_id && n.notification_id == notification_id)
        });
        self.cache.invalidate(&keys::notifications(user_id)).await
    }
}

// ---------------------------------------------------------------------------
// Channel-driven session client
// ---------------------------------------------------------------------------

pub struct TestClient {
    tx: futures::channel::mpsc::Sender<Incoming>,
    rx: futures::channel::mpsc::Receiver<String>,
    pub handle: tokio::task::JoinHandle<()>,
}

impl TestClient {
    pub async fn send(&mut self, frame: serde_json::Value) {
        self.tx
            .send(Incoming::Frame(frame.to_string()))
            .await
            .expect("session inbound closed");
    }

    /// Next frame from the session, parsed. Panics after two seconds.
    pub async fn next_frame(&mut self) -> serde_json::Value {
        let text = tokio::time::timeout(Duration::from_secs(2), self.rx.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("session output ended");
        serde_json::from_str(&text).expect("frame is not JSON")
    }

    /// Skip frames until one matches; tolerates interleaved pushes from the
    /// outbound loop.
    pub async fn frame_where(
        &mut self,
        pred: impl Fn(&serde_json::Value) -> bool,
    ) -> serde_json::Value {
        for _ in 0..10 {
            let frame = self.next_frame().await;
            if pred(&frame) {
                return frame;
            }
        }
        panic!("expected frame never arrived");
    }

    /// Assert the session's output stream has ended.
    pub async fn expect_end(&mut self) {
        let next = tokio::time::timeout(Duration::from_secs(2), self.rx.next())
            .await
            .expect("timed out waiting for session end");
        assert!(next.is_none(), "unexpected frame after close: {next:?}");
    }

    /// Drop the inbound half, simulating the client going away.
    pub fn close(&mut self) {
        self.tx.close_channel();
    }
}

/// Spawn a session over channel transports and hand back the client half.
pub fn start_session<D: SessionDomain>(domain: Arc<D>, cache: Arc<MemoryCache>) -> TestClient {
    let (in_tx, in_rx) = futures::channel::mpsc::channel::<Incoming>(16);
    let (out_tx, out_rx) = futures::channel::mpsc::channel::<String>(64);
    let handle = tokio::spawn(run_session(domain, cache, out_tx, in_rx));
    TestClient {
        tx: in_tx,
        rx: out_rx,
        handle,
    }
}
