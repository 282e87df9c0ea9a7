//! Shared coordination store: the primitives batch, lock and generation
//! bookkeeping are built from.
//!
//! Any backend that offers atomic conditional-set with expiry, atomic
//! increment, list append/drain and existence checks is sufficient. Two are
//! provided: [`MemoryStore`] for single-instance deployments and tests, and
//! [`RedisStore`] for clusters.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::SenderKey;
use crate::config::{StoreBackend, StoreConfig};
use crate::error::StoreError;

use std::future::Future;
use std::time::Duration;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Primitive operations required from the shared store.
///
/// Every operation is atomic with respect to every other operation on the
/// same key, across all instances sharing the store.
pub trait CoordinationStore: Send + Sync + 'static {
    /// Set `key` to `value` with an expiry iff it does not exist. Returns
    /// whether the value was written.
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = StoreResult<Option<String>>> + Send;

    /// Overwrite `key`. `None` stores without expiry.
    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Remove `key`. Returns whether anything was removed.
    fn delete(&self, key: &str) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Remove `key` only while it still holds `value`.
    fn delete_if_equals(
        &self,
        key: &str,
        value: &str,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Reset the expiry of `key` only while it still holds `value`.
    fn expire_if_equals(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    fn exists(&self, key: &str) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Increment the integer at `key`, treating a missing key as zero.
    fn increment(&self, key: &str) -> impl Future<Output = StoreResult<i64>> + Send;

    /// Append to the list at `key` and extend its expiry. Returns the new
    /// length.
    fn push(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = StoreResult<usize>> + Send;

    /// Read and clear the list at `key` in one step.
    fn drain(&self, key: &str) -> impl Future<Output = StoreResult<Vec<String>>> + Send;

    fn len(&self, key: &str) -> impl Future<Output = StoreResult<usize>> + Send;

    /// All live keys starting with `prefix`.
    fn keys(&self, prefix: &str) -> impl Future<Output = StoreResult<Vec<String>>> + Send;
}

/// Store selected at startup.
#[derive(Debug, Clone)]
pub enum Store {
    Memory(MemoryStore),
    Redis(RedisStore),
}

impl Store {
    /// Connect to the configured backend.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        match config.backend {
            StoreBackend::Memory => {
                tracing::warn!(
                    "using in-memory coordination store; batching and locking are not shared across instances"
                );
                Ok(Self::Memory(MemoryStore::new()))
            }
            StoreBackend::Redis => {
                let store = RedisStore::connect(&config.redis_url).await?;
                tracing::info!(url = %config.redis_url, "connected to redis coordination store");
                Ok(Self::Redis(store))
            }
        }
    }
}

impl From<MemoryStore> for Store {
    fn from(store: MemoryStore) -> Self {
        Self::Memory(store)
    }
}

impl From<RedisStore> for Store {
    fn from(store: RedisStore) -> Self {
        Self::Redis(store)
    }
}

macro_rules! dispatch {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            Store::Memory($store) => $call.await,
            Store::Redis($store) => $call.await,
        }
    };
}

impl CoordinationStore for Store {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        dispatch!(self, store => store.set_if_absent(key, value, ttl))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        dispatch!(self, store => store.get(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        dispatch!(self, store => store.set(key, value, ttl))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        dispatch!(self, store => store.delete(key))
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> StoreResult<bool> {
        dispatch!(self, store => store.delete_if_equals(key, value))
    }

    async fn expire_if_equals(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        dispatch!(self, store => store.expire_if_equals(key, value, ttl))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        dispatch!(self, store => store.exists(key))
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        dispatch!(self, store => store.increment(key))
    }

    async fn push(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<usize> {
        dispatch!(self, store => store.push(key, value, ttl))
    }

    async fn drain(&self, key: &str) -> StoreResult<Vec<String>> {
        dispatch!(self, store => store.drain(key))
    }

    async fn len(&self, key: &str) -> StoreResult<usize> {
        dispatch!(self, store => store.len(key))
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        dispatch!(self, store => store.keys(prefix))
    }
}

/// Kinds of per-sender records kept in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Batch,
    Lock,
    Generation,
    Reset,
}

impl KeyKind {
    fn segment(self) -> &'static str {
        match self {
            KeyKind::Batch => "batch",
            KeyKind::Lock => "lock",
            KeyKind::Generation => "generation",
            KeyKind::Reset => "reset",
        }
    }
}

/// Key layout: `{prefix}:{kind}:{sender}`.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn key(&self, kind: KeyKind, sender: &SenderKey) -> String {
        format!("{}{}", self.kind_prefix(kind), sender)
    }

    /// Prefix shared by every key of `kind`, for sweeps and stats.
    pub fn kind_prefix(&self, kind: KeyKind) -> String {
        format!("{}:{}:", self.prefix, kind.segment())
    }

    /// Recover the sender from a key of `kind`.
    pub fn sender_of(&self, kind: KeyKind, key: &str) -> Option<SenderKey> {
        key.strip_prefix(&self.kind_prefix(kind))
            .filter(|sender| !sender.is_empty())
            .map(SenderKey::new)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("relaybot")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_round_trips_sender() {
        let keys = KeySpace::new("bot");
        let sender = SenderKey::new("+15550100");
        let key = keys.key(KeyKind::Batch, &sender);

        assert_eq!(key, "bot:batch:+15550100");
        assert_eq!(keys.sender_of(KeyKind::Batch, &key), Some(sender));
        assert_eq!(keys.sender_of(KeyKind::Lock, &key), None);
    }

    #[test]
    fn sender_with_separator_survives() {
        let keys = KeySpace::default();
        let sender = SenderKey::new("whatsapp:+4477");
        let key = keys.key(KeyKind::Lock, &sender);
        assert_eq!(keys.sender_of(KeyKind::Lock, &key), Some(sender));
    }
}
