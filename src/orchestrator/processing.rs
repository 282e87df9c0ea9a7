//! Processing loop for one unit of work.
//!
//! A unit owns the sender's lock from Start to Finish. It drains the batch,
//! asks the responder for a reply, and delivers only if nothing newer arrived
//! in the meantime. Interruptions restart the unit with every event drained
//! so far plus whatever is newly queued, so the eventual reply answers the
//! whole burst.

use super::Orchestrator;
use super::batch::combine;
use super::generation::AbortHandle;
use super::lock::LockToken;
use crate::config::OrchestratorConfig;
use crate::conversation::{HistoryEntry, HistoryRole};
use crate::error::GenerateError;
use crate::store::StoreResult;
use crate::{InboundEvent, SenderKey};

use futures::FutureExt as _;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How a unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// A reply was handed to the messenger.
    Delivered {
        generation: u64,
        events: usize,
        restarts: u32,
    },
    /// The batch was already empty when the unit started.
    Empty,
    /// A reset discarded everything the unit had drained.
    Superseded,
    /// The lock no longer belonged to this acquisition.
    LockLost,
    /// Generation or the store failed; the fallback reply was sent.
    Failed,
}

/// Result of one Invoke + Recheck pass.
enum Pass {
    Done(UnitOutcome),
    Restart { cancelled: bool },
}

impl Orchestrator {
    /// Run a unit for the acquisition identified by `token`, then release
    /// the lock and pick up anything queued after the final drain.
    pub(super) async fn run_unit(&self, sender: SenderKey, token: LockToken) -> UnitOutcome {
        let config = self.config();
        let heartbeat = self.spawn_heartbeat(&sender, &token, config.lock_ttl());

        let outcome = match AssertUnwindSafe(self.process(&sender, &token, &config))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(%sender, "processing unit panicked");
                UnitOutcome::Failed
            }
        };

        heartbeat.cancel();
        if let Some(generation) = self.inner.aborts.active_generation(&sender) {
            self.inner.aborts.discard(&sender, generation);
        }
        match self.inner.locks.release_owned(&sender, &token).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(%sender, "lock already released or taken over"),
            Err(error) => {
                tracing::error!(%sender, %error, "failed to release lock, waiting for expiry")
            }
        }
        tracing::info!(%sender, ?outcome, "unit finished");

        self.reschedule_leftovers(&sender, &config).await;
        outcome
    }

    async fn process(
        &self,
        sender: &SenderKey,
        token: &LockToken,
        config: &OrchestratorConfig,
    ) -> UnitOutcome {
        match self.inner.locks.is_held_by(sender, token).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(%sender, "lock lost before unit started");
                return UnitOutcome::LockLost;
            }
            Err(error) => {
                tracing::error!(%sender, %error, "failed to confirm lock");
                return UnitOutcome::Failed;
            }
        }

        let mut generation = match self.inner.generations.current(sender).await {
            Ok(generation) => generation,
            Err(error) => {
                tracing::error!(%sender, %error, "failed to read generation");
                return UnitOutcome::Failed;
            }
        };
        let mut handle = self.inner.aborts.register(sender, generation);
        let mut accumulated: Vec<InboundEvent> = Vec::new();
        let mut restarts = 0u32;
        let mut reset_seen = false;

        loop {
            match self.inner.batches.drain(sender).await {
                Ok(drained) => accumulated.extend(drained),
                Err(error) => {
                    tracing::error!(%sender, %error, "failed to drain batch");
                    if !accumulated.is_empty() {
                        self.deliver_fallback(sender, config).await;
                    }
                    return UnitOutcome::Failed;
                }
            }
            if accumulated.is_empty() {
                return if reset_seen {
                    UnitOutcome::Superseded
                } else {
                    UnitOutcome::Empty
                };
            }

            let cancelled = match self
                .invoke_and_recheck(sender, &accumulated, &handle, generation, restarts, config)
                .await
            {
                Pass::Done(outcome) => return outcome,
                Pass::Restart { cancelled } => cancelled,
            };

            let current = match self.inner.generations.current(sender).await {
                Ok(current) => current,
                Err(error) => {
                    tracing::error!(%sender, %error, "failed to read generation for restart");
                    self.deliver_fallback(sender, config).await;
                    return UnitOutcome::Failed;
                }
            };
            if cancelled && current <= generation {
                tracing::error!(
                    %sender,
                    generation,
                    current,
                    "generation cancelled without a newer generation"
                );
                self.deliver_fallback(sender, config).await;
                return UnitOutcome::Failed;
            }

            match self.inner.generations.last_reset(sender).await {
                Ok(Some(reset)) if reset > generation => {
                    tracing::debug!(%sender, reset, discarded = accumulated.len(), "reset during unit");
                    accumulated.clear();
                    reset_seen = true;
                }
                Ok(_) => {}
                Err(error) => tracing::warn!(%sender, %error, "failed to read reset marker"),
            }

            // A reset releases the lock; whatever it let in belongs to the
            // next acquisition.
            match self.inner.locks.is_held_by(sender, token).await {
                Ok(true) => {}
                Ok(false) if reset_seen => return UnitOutcome::Superseded,
                Ok(false) => {
                    tracing::warn!(%sender, events = accumulated.len(), "lock lost during unit, requeueing");
                    self.requeue(&accumulated, config).await;
                    return UnitOutcome::LockLost;
                }
                Err(error) => {
                    tracing::error!(%sender, %error, "failed to confirm lock for restart");
                    self.deliver_fallback(sender, config).await;
                    return UnitOutcome::Failed;
                }
            }

            generation = current.max(generation);
            handle = self.inner.aborts.register(sender, generation);
            restarts += 1;
            tracing::debug!(%sender, generation, restarts, "restarting unit");
        }
    }

    async fn invoke_and_recheck(
        &self,
        sender: &SenderKey,
        accumulated: &[InboundEvent],
        handle: &AbortHandle,
        generation: u64,
        restarts: u32,
        config: &OrchestratorConfig,
    ) -> Pass {
        let unit = combine(accumulated);
        let history = match self
            .inner
            .deps
            .history
            .load_recent(sender, config.history_limit)
            .await
        {
            Ok(history) => history,
            Err(error) => {
                tracing::warn!(%sender, %error, "failed to load history, generating without it");
                Vec::new()
            }
        };
        if let Err(error) = self.inner.deps.messenger.send_typing(sender).await {
            tracing::debug!(%sender, %error, "typing indicator failed");
        }

        let reply = match self.invoke(sender, &unit, &history, handle, config).await {
            Ok(_) if handle.is_aborted() => {
                tracing::debug!(%sender, generation, "discarding reply produced after abort");
                return Pass::Restart { cancelled: true };
            }
            Ok(reply) => reply,
            Err(GenerateError::Cancelled) => {
                tracing::debug!(%sender, generation, "generation cancelled");
                return Pass::Restart { cancelled: true };
            }
            Err(error) => {
                tracing::error!(%sender, generation, %error, "generation failed");
                self.deliver_fallback(sender, config).await;
                return Pass::Done(UnitOutcome::Failed);
            }
        };

        // A reset through another instance clears the batch and may land
        // between generation polls; only the counter shows it.
        match self.inner.generations.current(sender).await {
            Ok(current) if current > generation => {
                tracing::info!(%sender, generation, current, "generation moved, discarding stale reply");
                return Pass::Restart { cancelled: false };
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(%sender, %error, "generation recheck failed");
            }
        }

        match self.inner.batches.size(sender).await {
            Ok(0) => {}
            Ok(pending) => {
                tracing::info!(%sender, pending, "newer events queued, discarding stale reply");
                return Pass::Restart { cancelled: false };
            }
            Err(error) => {
                tracing::warn!(%sender, %error, "recheck failed, delivering reply");
            }
        }

        self.deliver_reply(sender, &unit, &reply).await;
        Pass::Done(UnitOutcome::Delivered {
            generation,
            events: accumulated.len(),
            restarts,
        })
    }

    /// Call the responder, bounded by the generation timeout, while watching
    /// the shared generation for interruptions raised on other instances.
    async fn invoke(
        &self,
        sender: &SenderKey,
        unit: &str,
        history: &[HistoryEntry],
        handle: &AbortHandle,
        config: &OrchestratorConfig,
    ) -> Result<String, GenerateError> {
        let abort = handle.token();
        let generate = self
            .inner
            .deps
            .responder
            .generate(sender, unit, history, abort.clone());
        let watch = self.watch_generation(
            sender,
            handle.generation(),
            abort,
            config.generation_poll(),
        );

        let bounded = async {
            tokio::pin!(generate);
            tokio::pin!(watch);
            let mut watching = true;
            loop {
                tokio::select! {
                    result = &mut generate => break result,
                    () = &mut watch, if watching => watching = false,
                }
            }
        };

        let timeout = config.generation_timeout();
        match tokio::time::timeout(timeout, bounded).await {
            Ok(result) => result,
            Err(_) => Err(GenerateError::Timeout(timeout)),
        }
    }

    /// Cancel `abort` as soon as the shared generation moves past
    /// `generation`. Returns once cancelled by anyone.
    async fn watch_generation(
        &self,
        sender: &SenderKey,
        generation: u64,
        abort: CancellationToken,
        poll: Duration,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + poll, poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = abort.cancelled() => return,
                _ = ticker.tick() => match self.inner.generations.current(sender).await {
                    Ok(current) if current > generation => {
                        tracing::debug!(%sender, generation, current, "newer generation observed");
                        abort.cancel();
                        return;
                    }
                    Ok(_) => {}
                    Err(error) => tracing::warn!(%sender, %error, "generation poll failed"),
                },
            }
        }
    }

    async fn deliver_reply(&self, sender: &SenderKey, unit: &str, reply: &str) {
        match self.inner.deps.messenger.deliver(sender, reply).await {
            Ok(()) => tracing::info!(%sender, reply_len = reply.len(), "reply delivered"),
            Err(error) => tracing::error!(%sender, %error, "reply delivery failed"),
        }

        let history = &self.inner.deps.history;
        for (role, content) in [(HistoryRole::User, unit), (HistoryRole::Assistant, reply)] {
            if let Err(error) = history.append(sender, role, content).await {
                tracing::warn!(%sender, %error, role = role.as_str(), "failed to record history");
            }
        }
    }

    async fn requeue(&self, events: &[InboundEvent], config: &OrchestratorConfig) {
        for event in events {
            if let Err(error) = self.inner.batches.append(event, config.batch_ttl()).await {
                tracing::error!(sender = %event.sender_key, event_id = %event.id, %error, "failed to requeue event");
            }
        }
    }

    async fn deliver_fallback(&self, sender: &SenderKey, config: &OrchestratorConfig) {
        if config.fallback_reply.is_empty() {
            return;
        }
        if let Err(error) = self
            .inner
            .deps
            .messenger
            .deliver(sender, &config.fallback_reply)
            .await
        {
            tracing::error!(%sender, %error, "fallback delivery failed");
        }
    }

    /// Refresh the lock every third of its TTL until the returned token is
    /// cancelled or the lock is lost.
    fn spawn_heartbeat(
        &self,
        sender: &SenderKey,
        token: &LockToken,
        ttl: Duration,
    ) -> CancellationToken {
        let stop = CancellationToken::new();
        let locks = self.inner.locks.clone();
        let sender = sender.clone();
        let token = token.clone();
        let period = (ttl / 3).max(Duration::from_millis(1));
        let stopped = stop.clone();

        self.inner.tasks.spawn(async move {
            loop {
                tokio::select! {
                    () = stopped.cancelled() => return,
                    () = tokio::time::sleep(period) => {}
                }
                match locks.refresh(&sender, &token, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(%sender, "lock lost while unit is running");
                        return;
                    }
                    Err(error) => tracing::warn!(%sender, %error, "lock refresh failed"),
                }
            }
        });
        stop
    }

    /// Events queued after the final drain would otherwise wait for the
    /// janitor; schedule them now if nobody else holds the lock.
    async fn reschedule_leftovers(&self, sender: &SenderKey, config: &OrchestratorConfig) {
        let result: StoreResult<()> = async {
            let pending = self.inner.batches.size(sender).await?;
            if pending == 0 {
                return Ok(());
            }
            if let Some(token) = self
                .inner
                .locks
                .try_acquire(sender, config.lock_ttl())
                .await?
            {
                tracing::debug!(%sender, pending, "rescheduling events queued during unit");
                self.start_acquired(sender, token, pending, config);
            }
            Ok(())
        }
        .await;

        if let Err(error) = result {
            tracing::warn!(%sender, %error, "post-release recheck failed");
        }
    }

    /// Answer one event on its own while the coordination store is down.
    pub(super) async fn run_uncoordinated(&self, event: InboundEvent) {
        let config = self.config();
        let sender = &event.sender_key;
        let history = self
            .inner
            .deps
            .history
            .load_recent(sender, config.history_limit)
            .await
            .unwrap_or_default();

        let abort = CancellationToken::new();
        let generate = self
            .inner
            .deps
            .responder
            .generate(sender, &event.content, &history, abort.clone());
        let result = match tokio::time::timeout(config.generation_timeout(), generate).await {
            Ok(result) => result,
            Err(_) => {
                abort.cancel();
                Err(GenerateError::Timeout(config.generation_timeout()))
            }
        };

        match result {
            Ok(reply) => self.deliver_reply(sender, &event.content, &reply).await,
            Err(error) => {
                tracing::error!(%sender, %error, "uncoordinated generation failed");
                self.deliver_fallback(sender, &config).await;
            }
        }
    }
}
