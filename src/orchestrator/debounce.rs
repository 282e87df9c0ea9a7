//! Debounce scheduler: one-shot quiet-window timer per lock acquisition.
//!
//! The timer is armed once, when the lock is acquired, and is never pushed
//! back by later events. It fires early when the batch reaches the configured
//! maximum: either because an event on this instance called
//! [`DebounceScheduler::fire_now`], or because the periodic size probe saw a
//! full batch filled through another instance.

use super::batch::BatchStore;
use super::lock::LockToken;
use crate::SenderKey;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Why an armed timer stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireReason {
    /// The quiet window elapsed.
    Window,
    /// The batch reached its maximum size.
    MaxSize,
    /// The timer was cancelled (reset, or superseded by a newer acquisition).
    Cancelled,
}

impl FireReason {
    pub fn should_process(self) -> bool {
        !matches!(self, FireReason::Cancelled)
    }
}

#[derive(Debug)]
struct TimerEntry {
    token: LockToken,
    fire: Arc<Notify>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct DebounceScheduler {
    timers: Arc<Mutex<HashMap<SenderKey, TimerEntry>>>,
}

impl DebounceScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<SenderKey, TimerEntry>> {
        self.timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arm the timer for the acquisition identified by `token`. A timer left
    /// over from an earlier acquisition is cancelled.
    pub fn arm(&self, sender: &SenderKey, token: LockToken, window: Duration) -> ArmedTimer {
        let fire = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let previous = self.timers().insert(
            sender.clone(),
            TimerEntry {
                token: token.clone(),
                fire: fire.clone(),
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        ArmedTimer {
            scheduler: self.clone(),
            sender: sender.clone(),
            token,
            deadline: Instant::now() + window,
            fire,
            cancel,
        }
    }

    /// Fire the sender's pending timer immediately. Returns whether a timer
    /// was armed on this instance.
    pub fn fire_now(&self, sender: &SenderKey) -> bool {
        match self.timers().get(sender) {
            Some(entry) => {
                entry.fire.notify_one();
                true
            }
            None => false,
        }
    }

    /// Cancel the sender's pending timer without firing it.
    pub fn cancel(&self, sender: &SenderKey) -> bool {
        match self.timers().remove(sender) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self, sender: &SenderKey) -> bool {
        self.timers().contains_key(sender)
    }

    fn remove_if_owned(&self, sender: &SenderKey, token: &LockToken) {
        let mut timers = self.timers();
        if timers.get(sender).is_some_and(|entry| &entry.token == token) {
            timers.remove(sender);
        }
    }
}

/// A timer that has been armed but not yet awaited.
#[derive(Debug)]
pub struct ArmedTimer {
    scheduler: DebounceScheduler,
    sender: SenderKey,
    token: LockToken,
    deadline: Instant,
    fire: Arc<Notify>,
    cancel: CancellationToken,
}

impl ArmedTimer {
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// Wait until the window elapses, the batch fills, or the timer is
    /// cancelled.
    pub async fn wait(
        self,
        batches: &BatchStore,
        max_batch_size: usize,
        size_poll: Duration,
    ) -> FireReason {
        let mut probe = tokio::time::interval_at(Instant::now() + size_poll, size_poll);
        probe.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reason = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break FireReason::Cancelled,
                () = self.fire.notified() => break FireReason::MaxSize,
                () = tokio::time::sleep_until(self.deadline) => break FireReason::Window,
                _ = probe.tick() => match batches.size(&self.sender).await {
                    Ok(size) if size >= max_batch_size => break FireReason::MaxSize,
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(sender = %self.sender, %error, "batch size probe failed");
                    }
                },
            }
        };

        self.scheduler.remove_if_owned(&self.sender, &self.token);
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InboundEvent;
    use crate::store::{KeySpace, MemoryStore};

    fn token() -> LockToken {
        LockToken::for_tests("test-token")
    }

    fn batches() -> BatchStore {
        BatchStore::new(MemoryStore::new().into(), KeySpace::default())
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_window() {
        let scheduler = DebounceScheduler::new();
        let sender = SenderKey::new("s");
        let started = Instant::now();

        let timer = scheduler.arm(&sender, token(), Duration::from_millis(2000));
        assert!(scheduler.is_armed(&sender));
        let reason = timer
            .wait(&batches(), 5, Duration::from_millis(100))
            .await;

        assert_eq!(reason, FireReason::Window);
        assert_eq!(started.elapsed(), Duration::from_millis(2000));
        assert!(!scheduler.is_armed(&sender));
    }

    #[tokio::test(start_paused = true)]
    async fn fire_now_preempts_window() {
        let scheduler = DebounceScheduler::new();
        let sender = SenderKey::new("s");
        let started = Instant::now();

        let timer = scheduler.arm(&sender, token(), Duration::from_millis(2000));
        assert!(scheduler.fire_now(&sender));
        let reason = timer.wait(&batches(), 5, Duration::from_millis(100)).await;

        assert_eq!(reason, FireReason::MaxSize);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn size_probe_fires_for_batches_filled_elsewhere() {
        let scheduler = DebounceScheduler::new();
        let sender = SenderKey::new("s");
        let batches = batches();
        for index in 0..3 {
            let event = InboundEvent::new(
                format!("e{index}"),
                sender.clone(),
                "hi",
                Default::default(),
            );
            batches.append(&event, Duration::from_secs(60)).await.unwrap();
        }
        let started = Instant::now();

        let timer = scheduler.arm(&sender, token(), Duration::from_millis(2000));
        let reason = timer.wait(&batches, 3, Duration::from_millis(100)).await;

        assert_eq!(reason, FireReason::MaxSize);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_timer() {
        let scheduler = DebounceScheduler::new();
        let sender = SenderKey::new("s");

        let timer = scheduler.arm(&sender, token(), Duration::from_millis(2000));
        assert!(scheduler.cancel(&sender));
        let reason = timer.wait(&batches(), 5, Duration::from_millis(100)).await;

        assert_eq!(reason, FireReason::Cancelled);
        assert!(!reason.should_process());
        assert!(!scheduler.cancel(&sender));
    }

    #[tokio::test(start_paused = true)]
    async fn re_arming_cancels_the_stale_timer() {
        let scheduler = DebounceScheduler::new();
        let sender = SenderKey::new("s");

        let stale = scheduler.arm(&sender, LockToken::for_tests("old"), Duration::from_millis(2000));
        let fresh = scheduler.arm(&sender, LockToken::for_tests("new"), Duration::from_millis(500));

        let batches = batches();
        assert_eq!(
            stale.wait(&batches, 5, Duration::from_millis(100)).await,
            FireReason::Cancelled
        );
        assert!(scheduler.is_armed(&sender));
        assert_eq!(
            fresh.wait(&batches, 5, Duration::from_millis(100)).await,
            FireReason::Window
        );
        assert!(!scheduler.is_armed(&sender));
    }
}
