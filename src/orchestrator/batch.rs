//! Batch store: per-sender ordered list of pending inbound events.

use crate::store::{CoordinationStore, KeyKind, KeySpace, Store, StoreResult};
use crate::{InboundEvent, SenderKey};

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BatchStore {
    store: Store,
    keys: KeySpace,
}

impl BatchStore {
    pub fn new(store: Store, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Append to the tail and extend the batch lifetime. Returns the new size.
    pub async fn append(&self, event: &InboundEvent, ttl: Duration) -> StoreResult<usize> {
        let payload = serde_json::to_string(event)?;
        self.store
            .push(&self.keys.key(KeyKind::Batch, &event.sender_key), &payload, ttl)
            .await
    }

    /// Atomically read and empty the batch. Undecodable entries are dropped
    /// with a warning rather than wedging the sender.
    pub async fn drain(&self, sender: &SenderKey) -> StoreResult<Vec<InboundEvent>> {
        let raw = self
            .store
            .drain(&self.keys.key(KeyKind::Batch, sender))
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(|payload| match serde_json::from_str::<InboundEvent>(&payload) {
                Ok(event) => Some(event),
                Err(error) => {
                    tracing::warn!(%sender, %error, "dropping undecodable batch entry");
                    None
                }
            })
            .collect())
    }

    pub async fn size(&self, sender: &SenderKey) -> StoreResult<usize> {
        self.store.len(&self.keys.key(KeyKind::Batch, sender)).await
    }

    /// Discard everything pending for `sender`. Returns whether anything was queued.
    pub async fn clear(&self, sender: &SenderKey) -> StoreResult<bool> {
        self.store
            .delete(&self.keys.key(KeyKind::Batch, sender))
            .await
    }

    /// Senders with a non-empty batch.
    pub async fn pending_senders(&self) -> StoreResult<Vec<SenderKey>> {
        let keys = self
            .store
            .keys(&self.keys.kind_prefix(KeyKind::Batch))
            .await?;
        Ok(keys
            .iter()
            .filter_map(|key| self.keys.sender_of(KeyKind::Batch, key))
            .collect())
    }
}

/// Join event contents into one unit, preserving arrival order.
///
/// Each content is trimmed and its internal whitespace runs collapsed;
/// blank contents are skipped. A single-event batch passes through as-is.
pub fn combine(events: &[InboundEvent]) -> String {
    if let [only] = events {
        return only.content.clone();
    }
    events
        .iter()
        .map(|event| normalize_whitespace(&event.content))
        .filter(|content| !content.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn normalize_whitespace(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}
