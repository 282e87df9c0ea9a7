//! In-process coordination store.
//!
//! Clones share state, so several orchestrators built from clones of one
//! `MemoryStore` behave like separate server instances sharing a store.
//! Expiry runs on the tokio clock, which keeps paused-clock tests exact.

use super::{CoordinationStore, StoreResult};
use crate::error::StoreError;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
enum Value {
    Text(String),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while set, every operation fails.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn entries(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Entry>>> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(self
            .inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

/// Look up a live entry, dropping it first if it has expired.
fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn wrong_type(key: &str, expected: &str) -> StoreError {
    StoreError::InvalidValue {
        key: key.to_string(),
        value: format!("not a {expected}"),
    }
}

impl CoordinationStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        if live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        match live(&mut entries, key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(wrong_type(key, "string")),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        let existed = live(&mut entries, key, now).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        let matches = matches!(
            live(&mut entries, key, now),
            Some(Entry { value: Value::Text(current), .. }) if current == value
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn expire_if_equals(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        match live(&mut entries, key, now) {
            Some(entry) if matches!(&entry.value, Value::Text(current) if current == value) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        Ok(live(&mut entries, key, now).is_some())
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        if live(&mut entries, key, now).is_none() {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Text("1".into()),
                    expires_at: None,
                },
            );
            return Ok(1);
        }
        let Some(Entry {
            value: Value::Text(text),
            ..
        }) = entries.get_mut(key)
        else {
            return Err(wrong_type(key, "integer"));
        };
        let current: i64 = text.parse().map_err(|_| StoreError::InvalidValue {
            key: key.to_string(),
            value: text.clone(),
        })?;
        let next = current + 1;
        *text = next.to_string();
        Ok(next)
    }

    async fn push(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<usize> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        if live(&mut entries, key, now).is_none() {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::List(VecDeque::new()),
                    expires_at: None,
                },
            );
        }
        let Some(entry) = entries.get_mut(key) else {
            return Err(wrong_type(key, "list"));
        };
        let Value::List(list) = &mut entry.value else {
            return Err(wrong_type(key, "list"));
        };
        list.push_back(value.to_string());
        let len = list.len();
        entry.expires_at = Some(now + ttl);
        Ok(len)
    }

    async fn drain(&self, key: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        if live(&mut entries, key, now).is_none() {
            return Ok(Vec::new());
        }
        match entries.remove(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.into_iter().collect()),
            Some(entry) => {
                entries.insert(key.to_string(), entry);
                Err(wrong_type(key, "list"))
            }
            None => Ok(Vec::new()),
        }
    }

    async fn len(&self, key: &str) -> StoreResult<usize> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        match live(&mut entries, key, now) {
            None => Ok(0),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.len()),
            Some(_) => Err(wrong_type(key, "list")),
        }
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        entries.retain(|_, entry| entry.is_live(now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_respects_expiry() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("lock", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_if_absent("lock", "b", Duration::from_secs(5)).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(!store.exists("lock").await.unwrap());
        assert!(store.set_if_absent("lock", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn drain_reads_and_clears_in_order() {
        let store = MemoryStore::new();
        for item in ["one", "two", "three"] {
            store.push("batch", item, Duration::from_secs(60)).await.unwrap();
        }
        assert_eq!(store.len("batch").await.unwrap(), 3);

        let drained = store.drain("batch").await.unwrap();
        assert_eq!(drained, vec!["one", "two", "three"]);
        assert!(store.drain("batch").await.unwrap().is_empty());
        assert_eq!(store.len("batch").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn push_extends_list_expiry() {
        let store = MemoryStore::new();
        store.push("batch", "one", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        store.push("batch", "two", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;

        assert_eq!(store.len("batch").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn compare_and_delete_only_matches_owner() {
        let store = MemoryStore::new();
        store.set("lock", "owner", None).await.unwrap();

        assert!(!store.delete_if_equals("lock", "intruder").await.unwrap());
        assert!(store.exists("lock").await.unwrap());
        assert!(store.delete_if_equals("lock", "owner").await.unwrap());
        assert!(!store.exists("lock").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn compare_and_expire_extends_owned_key() {
        let store = MemoryStore::new();
        store.set_if_absent("lock", "owner", Duration::from_secs(3)).await.unwrap();

        assert!(!store
            .expire_if_equals("lock", "other", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(store
            .expire_if_equals("lock", "owner", Duration::from_secs(30))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store.exists("lock").await.unwrap());
    }

    #[tokio::test]
    async fn increment_starts_from_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.increment("generation").await.unwrap(), 1);
        assert_eq!(store.increment("generation").await.unwrap(), 2);
        assert_eq!(store.get("generation").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn type_mismatch_is_reported() {
        let store = MemoryStore::new();
        store.push("batch", "x", Duration::from_secs(60)).await.unwrap();
        assert!(matches!(
            store.increment("batch").await,
            Err(StoreError::InvalidValue { .. })
        ));
        assert!(store.get("batch").await.is_err());
    }

    #[tokio::test]
    async fn keys_filters_by_prefix() {
        let store = MemoryStore::new();
        store.set("bot:lock:a", "t", None).await.unwrap();
        store.push("bot:batch:a", "x", Duration::from_secs(60)).await.unwrap();
        store.push("bot:batch:b", "y", Duration::from_secs(60)).await.unwrap();

        let keys = store.keys("bot:batch:").await.unwrap();
        assert_eq!(keys, vec!["bot:batch:a", "bot:batch:b"]);
    }

    #[tokio::test]
    async fn clones_share_state_and_outages() {
        let first = MemoryStore::new();
        let second = first.clone();
        first.set("k", "v", None).await.unwrap();
        assert_eq!(second.get("k").await.unwrap().as_deref(), Some("v"));

        second.set_unavailable(true);
        assert!(matches!(first.get("k").await, Err(StoreError::Unavailable(_))));
        second.set_unavailable(false);
        assert!(first.get("k").await.is_ok());
    }
}
