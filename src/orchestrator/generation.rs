//! Generation counter and abort-handle registry.
//!
//! Every event that arrives while a sender is locked bumps the sender's
//! generation in the shared store. A processing iteration registers an abort
//! handle under the generation it observed when it started; interruption
//! always looks the handle up by that registered generation, never by the
//! value the concurrent increment just produced.

use crate::SenderKey;
use crate::error::StoreError;
use crate::store::{CoordinationStore, KeyKind, KeySpace, Store, StoreResult};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Generation value before any increment.
pub const BASE_GENERATION: u64 = 0;

/// Shared-store generation counter, plus the RESET marker.
#[derive(Debug, Clone)]
pub struct GenerationCounter {
    store: Store,
    keys: KeySpace,
}

impl GenerationCounter {
    pub fn new(store: Store, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    pub async fn increment(&self, sender: &SenderKey) -> StoreResult<u64> {
        let key = self.keys.key(KeyKind::Generation, sender);
        let value = self.store.increment(&key).await?;
        u64::try_from(value).map_err(|_| StoreError::InvalidValue {
            key,
            value: value.to_string(),
        })
    }

    pub async fn current(&self, sender: &SenderKey) -> StoreResult<u64> {
        let key = self.keys.key(KeyKind::Generation, sender);
        self.read_u64(&key)
            .await
            .map(|value| value.unwrap_or(BASE_GENERATION))
    }

    /// Bump the generation and record it as the latest reset point.
    pub async fn mark_reset(&self, sender: &SenderKey) -> StoreResult<u64> {
        let generation = self.increment(sender).await?;
        self.store
            .set(
                &self.keys.key(KeyKind::Reset, sender),
                &generation.to_string(),
                None,
            )
            .await?;
        Ok(generation)
    }

    /// Generation produced by the most recent reset, if any.
    pub async fn last_reset(&self, sender: &SenderKey) -> StoreResult<Option<u64>> {
        self.read_u64(&self.keys.key(KeyKind::Reset, sender)).await
    }

    async fn read_u64(&self, key: &str) -> StoreResult<Option<u64>> {
        match self.store.get(key).await? {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| StoreError::InvalidValue {
                    key: key.to_string(),
                    value: raw,
                }),
        }
    }
}

/// Cancellation token bound to one `(sender, generation)` pair.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    generation: u64,
    token: CancellationToken,
}

impl AbortHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The signal handed to the responder.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    handles: HashMap<(SenderKey, u64), AbortHandle>,
    /// Generation each running iteration registered under.
    active: HashMap<SenderKey, u64>,
}

/// In-process registry of abort handles for iterations running on this
/// instance. Owned by one orchestrator; never global.
#[derive(Debug, Clone, Default)]
pub struct AbortRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a fresh handle for the iteration running at `generation`,
    /// discarding the handle of any earlier generation for the sender.
    pub fn register(&self, sender: &SenderKey, generation: u64) -> AbortHandle {
        let handle = AbortHandle {
            generation,
            token: CancellationToken::new(),
        };
        let mut state = self.state();
        if let Some(previous) = state.active.insert(sender.clone(), generation) {
            state.handles.remove(&(sender.clone(), previous));
        }
        state
            .handles
            .insert((sender.clone(), generation), handle.clone());
        handle
    }

    /// Remove and return the handle registered for exactly `generation`.
    pub fn take(&self, sender: &SenderKey, generation: u64) -> Option<AbortHandle> {
        let mut state = self.state();
        if state.active.get(sender) == Some(&generation) {
            state.active.remove(sender);
        }
        state.handles.remove(&(sender.clone(), generation))
    }

    /// Generation the running iteration for `sender` registered, if any.
    pub fn active_generation(&self, sender: &SenderKey) -> Option<u64> {
        self.state().active.get(sender).copied()
    }

    /// Signal the handle of the iteration currently running for `sender`.
    /// Returns the generation that was aborted, or `None` when no iteration
    /// is running on this instance.
    pub fn trigger_abort(&self, sender: &SenderKey) -> Option<u64> {
        self.abort_where(sender, |_| true)
    }

    /// Like [`AbortRegistry::trigger_abort`], but leaves alone an iteration
    /// that registered at `newer` or later: it already saw that increment.
    pub fn trigger_abort_older_than(&self, sender: &SenderKey, newer: u64) -> Option<u64> {
        self.abort_where(sender, |registered| registered < newer)
    }

    fn abort_where(&self, sender: &SenderKey, applies: impl FnOnce(u64) -> bool) -> Option<u64> {
        let handle = {
            let mut state = self.state();
            let generation = *state.active.get(sender)?;
            if !applies(generation) {
                return None;
            }
            state.active.remove(sender);
            state.handles.remove(&(sender.clone(), generation))?
        };
        handle.abort();
        Some(handle.generation)
    }

    /// Drop the handle for `generation` without signalling it.
    pub fn discard(&self, sender: &SenderKey, generation: u64) {
        self.take(sender, generation);
    }

    /// Number of iterations with a registered handle.
    #[cfg(test)]
    pub fn running(&self) -> usize {
        self.state().active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn counter_starts_at_base_and_increases() {
        let counter = GenerationCounter::new(MemoryStore::new().into(), KeySpace::default());
        let sender = SenderKey::new("s");

        assert_eq!(counter.current(&sender).await.unwrap(), BASE_GENERATION);
        assert_eq!(counter.increment(&sender).await.unwrap(), 1);
        assert_eq!(counter.increment(&sender).await.unwrap(), 2);
        assert_eq!(counter.current(&sender).await.unwrap(), 2);
        assert_eq!(counter.current(&SenderKey::new("other")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reset_marker_tracks_reset_generation() {
        let counter = GenerationCounter::new(MemoryStore::new().into(), KeySpace::default());
        let sender = SenderKey::new("s");
        counter.increment(&sender).await.unwrap();

        assert_eq!(counter.last_reset(&sender).await.unwrap(), None);
        let generation = counter.mark_reset(&sender).await.unwrap();
        assert_eq!(generation, 2);
        assert_eq!(counter.last_reset(&sender).await.unwrap(), Some(2));
        assert_eq!(counter.current(&sender).await.unwrap(), 2);
    }

    #[test]
    fn trigger_abort_uses_registered_generation_not_latest() {
        let registry = AbortRegistry::new();
        let sender = SenderKey::new("s");
        let handle = registry.register(&sender, 3);

        // A concurrent increment produced generation 4; the lookup must still
        // find the handle registered at 3.
        assert!(registry.take(&sender, 4).is_none());
        assert_eq!(registry.trigger_abort(&sender), Some(3));
        assert!(handle.is_aborted());
        assert_eq!(registry.active_generation(&sender), None);
    }

    #[test]
    fn iteration_that_saw_the_increment_is_not_aborted() {
        let registry = AbortRegistry::new();
        let sender = SenderKey::new("s");
        let handle = registry.register(&sender, 5);

        assert_eq!(registry.trigger_abort_older_than(&sender, 5), None);
        assert!(!handle.is_aborted());
        assert_eq!(registry.active_generation(&sender), Some(5));

        assert_eq!(registry.trigger_abort_older_than(&sender, 6), Some(5));
        assert!(handle.is_aborted());
    }

    #[test]
    fn trigger_abort_without_running_iteration_is_a_noop() {
        let registry = AbortRegistry::new();
        assert_eq!(registry.trigger_abort(&SenderKey::new("s")), None);
    }

    #[test]
    fn re_register_discards_previous_generation() {
        let registry = AbortRegistry::new();
        let sender = SenderKey::new("s");
        let first = registry.register(&sender, 1);
        let second = registry.register(&sender, 2);

        assert!(registry.take(&sender, 1).is_none());
        assert_eq!(registry.active_generation(&sender), Some(2));
        registry.trigger_abort(&sender);
        assert!(!first.is_aborted());
        assert!(second.is_aborted());
    }

    #[test]
    fn discard_clears_without_signalling() {
        let registry = AbortRegistry::new();
        let sender = SenderKey::new("s");
        let handle = registry.register(&sender, 1);
        assert_eq!(registry.running(), 1);

        registry.discard(&sender, 1);
        assert!(!handle.is_aborted());
        assert_eq!(registry.running(), 0);
        assert_eq!(registry.trigger_abort(&sender), None);
    }
}
