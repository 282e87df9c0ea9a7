//! Lock manager: cluster-wide "a processing unit is in flight" marker.

use crate::SenderKey;
use crate::store::{CoordinationStore, KeyKind, KeySpace, Store, StoreResult};

use std::time::Duration;

/// Random value written into the lock by one acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn for_tests(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct LockManager {
    store: Store,
    keys: KeySpace,
}

impl LockManager {
    pub fn new(store: Store, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Acquire iff no unexpired lock exists. The returned token identifies
    /// this acquisition.
    pub async fn try_acquire(
        &self,
        sender: &SenderKey,
        ttl: Duration,
    ) -> StoreResult<Option<LockToken>> {
        let token = LockToken::generate();
        let acquired = self
            .store
            .set_if_absent(&self.keys.key(KeyKind::Lock, sender), token.as_str(), ttl)
            .await?;
        Ok(acquired.then_some(token))
    }

    /// Clear the lock regardless of who holds it. Idempotent.
    pub async fn release(&self, sender: &SenderKey) -> StoreResult<()> {
        self.store
            .delete(&self.keys.key(KeyKind::Lock, sender))
            .await?;
        Ok(())
    }

    /// Clear the lock only if `token` still holds it.
    pub async fn release_owned(&self, sender: &SenderKey, token: &LockToken) -> StoreResult<bool> {
        self.store
            .delete_if_equals(&self.keys.key(KeyKind::Lock, sender), token.as_str())
            .await
    }

    pub async fn is_held(&self, sender: &SenderKey) -> StoreResult<bool> {
        self.store
            .exists(&self.keys.key(KeyKind::Lock, sender))
            .await
    }

    pub async fn is_held_by(&self, sender: &SenderKey, token: &LockToken) -> StoreResult<bool> {
        let current = self
            .store
            .get(&self.keys.key(KeyKind::Lock, sender))
            .await?;
        Ok(current.as_deref() == Some(token.as_str()))
    }

    /// Push the expiry out while `token` still holds the lock.
    pub async fn refresh(
        &self,
        sender: &SenderKey,
        token: &LockToken,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.store
            .expire_if_equals(&self.keys.key(KeyKind::Lock, sender), token.as_str(), ttl)
            .await
    }

    /// Senders with a live lock.
    pub async fn held_senders(&self) -> StoreResult<Vec<SenderKey>> {
        let keys = self
            .store
            .keys(&self.keys.kind_prefix(KeyKind::Lock))
            .await?;
        Ok(keys
            .iter()
            .filter_map(|key| self.keys.sender_of(KeyKind::Lock, key))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn locks() -> LockManager {
        LockManager::new(MemoryStore::new().into(), KeySpace::default())
    }

    #[tokio::test]
    async fn only_one_acquisition_wins() {
        let locks = locks();
        let sender = SenderKey::new("s");

        let token = locks
            .try_acquire(&sender, Duration::from_secs(30))
            .await
            .unwrap()
            .expect("first acquire wins");
        assert!(locks
            .try_acquire(&sender, Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
        assert!(locks.is_held(&sender).await.unwrap());
        assert!(locks.is_held_by(&sender, &token).await.unwrap());
    }

    #[tokio::test]
    async fn release_is_idempotent_and_unconditional() {
        let locks = locks();
        let sender = SenderKey::new("s");
        locks
            .try_acquire(&sender, Duration::from_secs(30))
            .await
            .unwrap();

        locks.release(&sender).await.unwrap();
        locks.release(&sender).await.unwrap();
        assert!(!locks.is_held(&sender).await.unwrap());
    }

    #[tokio::test]
    async fn release_owned_ignores_stale_token() {
        let locks = locks();
        let sender = SenderKey::new("s");
        let stale = locks
            .try_acquire(&sender, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        locks.release(&sender).await.unwrap();
        let fresh = locks
            .try_acquire(&sender, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        assert!(!locks.release_owned(&sender, &stale).await.unwrap());
        assert!(locks.is_held_by(&sender, &fresh).await.unwrap());
        assert!(locks.release_owned(&sender, &fresh).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_holder_recovers_through_expiry() {
        let locks = locks();
        let sender = SenderKey::new("s");
        let token = locks
            .try_acquire(&sender, Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(locks
            .refresh(&sender, &token, Duration::from_secs(10))
            .await
            .unwrap());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(locks.is_held(&sender).await.unwrap());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!locks.is_held(&sender).await.unwrap());
        assert!(!locks
            .refresh(&sender, &token, Duration::from_secs(10))
            .await
            .unwrap());
        assert!(locks
            .try_acquire(&sender, Duration::from_secs(10))
            .await
            .unwrap()
            .is_some());
    }
}
