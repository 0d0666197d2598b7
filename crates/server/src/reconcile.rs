//! Merging durable message history with cache-resident recent messages.
//!
//! The durable store is authoritative; cached copies exist only to cut the
//! latency between a publish and the recipient seeing the message. Both
//! participants' cache entries may transiently hold the same message, so the
//! merge dedupes by message id before ordering.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::{keys, FanoutCache};
use crate::error::Result;
use crate::models::Message;
use crate::store::ChatStore;

/// Merge durable rows with cached copies into one deduplicated view, sorted
/// ascending by `(created_at, message_id)`.
///
/// A durable row always wins over a cached copy with the same id; cached-only
/// entries (not yet durably committed) are kept best-effort.
pub fn reconcile(durable: Vec<Message>, cached: Vec<Message>) -> Vec<Message> {
    let mut by_id: HashMap<i64, Message> = HashMap::with_capacity(durable.len() + cached.len());
    for msg in durable {
        by_id.insert(msg.message_id, msg);
    }
    for msg in cached {
        by_id.entry(msg.message_id).or_insert(msg);
    }

    let mut merged: Vec<Message> = by_id.into_values().collect();
    merged.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then(a.message_id.cmp(&b.message_id))
    });
    merged
}

/// Decode cached payloads, skipping entries that fail to parse.
pub fn decode_cached<S: AsRef<str>>(items: &[S]) -> Vec<Message> {
    items
        .iter()
        .filter_map(|raw| serde_json::from_str(raw.as_ref()).ok())
        .collect()
}

/// Reconciliation scoped to one chat, over injected store and cache handles.
#[derive(Clone)]
pub struct ReconcileEngine {
    store: Arc<dyn ChatStore>,
    cache: Arc<dyn FanoutCache>,
}

impl ReconcileEngine {
    pub fn new(store: Arc<dyn ChatStore>, cache: Arc<dyn FanoutCache>) -> Self {
        Self { store, cache }
    }

    /// Full merged view for the initial snapshot: durable history plus both
    /// participants' cached-recent entries.
    pub async fn merged_view(
        &self,
        chat_id: i64,
        first: i64,
        second: i64,
    ) -> Result<Vec<Message>> {
        let durable = self.store.list_messages(chat_id).await?;
        let mut cached = decode_cached(
            &self
                .cache
                .read_recent(&keys::chat_messages(chat_id, first))
                .await?,
        );
        cached.extend(decode_cached(
            &self
                .cache
                .read_recent(&keys::chat_messages(chat_id, second))
                .await?,
        ));
        Ok(reconcile(durable, cached))
    }

    /// Durable history plus one participant's cached entries. Used for the
    /// client-driven `get` command.
    pub async fn recent_for(&self, chat_id: i64, user_id: i64) -> Result<Vec<Message>> {
        let durable = self.store.list_messages(chat_id).await?;
        let cached = decode_cached(
            &self
                .cache
                .read_recent(&keys::chat_messages(chat_id, user_id))
                .await?,
        );
        Ok(reconcile(durable, cached))
    }

    /// One participant's cached entries only, ordered like a merge result.
    /// Used on pub/sub wake-ups, which must not poll the durable store.
    pub async fn cached_for(&self, chat_id: i64, user_id: i64) -> Result<Vec<Message>> {
        let cached = decode_cached(
            &self
                .cache
                .read_recent(&keys::chat_messages(chat_id, user_id))
                .await?,
        );
        Ok(reconcile(Vec::new(), cached))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeliveryStatus;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: i64, sender: i64, text: &str, secs: i64) -> Message {
        Message {
            message_id: id,
            sender_id: sender,
            text: text.to_string(),
            status: DeliveryStatus::Sent,
            created_at: at(secs),
        }
    }

    #[test]
    fn each_identifier_appears_exactly_once() {
        let durable = vec![msg(1, 10, "a", 0), msg(2, 11, "b", 1)];
        let cached = vec![msg(2, 11, "b", 1), msg(3, 10, "c", 2), msg(3, 10, "c", 2)];

        let merged = reconcile(durable, cached);

        let ids: Vec<i64> = merged.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn durable_rows_are_never_dropped() {
        let durable = vec![msg(5, 10, "kept", 3), msg(6, 11, "also kept", 4)];
        let merged = reconcile(durable.clone(), vec![msg(99, 10, "extra", 0)]);

        for row in &durable {
            assert!(merged.iter().any(|m| m.message_id == row.message_id));
        }
    }

    #[test]
    fn durable_copy_wins_over_cached_copy() {
        // The cached copy may lag a status update; the durable row is truth.
        let mut durable_row = msg(7, 10, "hello", 1);
        durable_row.status = DeliveryStatus::Read;
        let cached_row = msg(7, 10, "hello", 1);

        let merged = reconcile(vec![durable_row], vec![cached_row]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, DeliveryStatus::Read);
    }

    #[test]
    fn ordered_by_timestamp_then_identifier() {
        // Two cache entries sharing a coarse timestamp tie-break by id.
        let cached = vec![msg(22, 11, "second", 5), msg(21, 10, "first", 5)];
        let durable = vec![msg(9, 10, "oldest", 1)];

        let merged = reconcile(durable, cached);
        let ids: Vec<i64> = merged.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![9, 21, 22]);
    }

    #[test]
    fn idempotent_for_unchanged_inputs() {
        let durable = vec![msg(1, 10, "a", 0), msg(3, 11, "c", 2)];
        let cached = vec![msg(2, 10, "b", 1), msg(3, 11, "c", 2)];

        let once = reconcile(durable.clone(), cached.clone());
        let twice = reconcile(durable, cached);
        assert_eq!(once, twice);
    }

    #[test]
    fn undecodable_cache_entries_are_skipped() {
        let items = vec![
            serde_json::to_string(&msg(4, 10, "ok", 1)).unwrap(),
            "{ not json".to_string(),
            String::new(),
        ];
        let decoded = decode_cached(&items);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].message_id, 4);
    }

    #[test]
    fn empty_inputs_merge_to_empty() {
        assert!(reconcile(Vec::new(), Vec::new()).is_empty());
    }
}
