//! Orchestrator: routes inbound events into per-sender batches and schedules
//! at most one processing unit per sender across every instance sharing the
//! coordination store.

pub mod batch;
pub mod debounce;
pub mod generation;
pub mod lock;
pub mod processing;

pub use batch::{BatchStore, combine};
pub use debounce::{ArmedTimer, DebounceScheduler, FireReason};
pub use generation::{AbortHandle, AbortRegistry, GenerationCounter};
pub use lock::{LockManager, LockToken};
pub use processing::UnitOutcome;

use crate::config::{OrchestratorConfig, RuntimeConfig};
use crate::conversation::ConversationHistoryDyn;
use crate::messaging::MessengerDyn;
use crate::responder::ResponderDyn;
use crate::store::{CoordinationStore, KeyKind, KeySpace, Store, StoreResult};
use crate::{ChannelMeta, InboundEvent, SenderKey};

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument as _;

/// Everything the orchestrator needs from the outside world.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub store: Store,
    pub keys: KeySpace,
    pub runtime_config: Arc<RuntimeConfig>,
    pub responder: Arc<dyn ResponderDyn>,
    pub messenger: Arc<dyn MessengerDyn>,
    pub history: Arc<dyn ConversationHistoryDyn>,
}

impl std::fmt::Debug for OrchestratorDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorDeps")
            .field("store", &self.store)
            .field("keys", &self.keys)
            .field("messenger", &self.messenger.name())
            .finish_non_exhaustive()
    }
}

/// Per-sender view returned by [`Orchestrator::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SenderStatus {
    pub is_processing: bool,
    pub pending_count: usize,
}

/// Aggregate view returned by [`Orchestrator::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    /// Senders with queued events or a live lock.
    pub active_senders: usize,
    pub total_pending_events: usize,
    pub processing_senders: usize,
}

/// What [`Orchestrator::submit`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Appended to the sender's batch.
    Queued {
        pending: usize,
        scheduling: Scheduling,
    },
    /// A reset command; the conversation was cleared.
    Reset,
    /// The store was unreachable and the event is answered on its own.
    Uncoordinated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scheduling {
    /// This event acquired the lock and armed the quiet window.
    Debounced,
    /// This event acquired the lock with a full batch; the unit starts now.
    Immediate,
    /// A unit was already queued or running; its generation was bumped.
    Interrupted {
        generation: u64,
        aborted_local: bool,
    },
    /// Queued, but scheduling failed; the janitor picks the batch up.
    Deferred,
}

/// Cheaply cloneable handle to one orchestrator instance.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    deps: OrchestratorDeps,
    batches: BatchStore,
    locks: LockManager,
    generations: GenerationCounter,
    aborts: AbortRegistry,
    debounce: DebounceScheduler,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        let store = deps.store.clone();
        let keys = deps.keys.clone();
        Self {
            inner: Arc::new(Inner {
                batches: BatchStore::new(store.clone(), keys.clone()),
                locks: LockManager::new(store.clone(), keys.clone()),
                generations: GenerationCounter::new(store, keys),
                aborts: AbortRegistry::new(),
                debounce: DebounceScheduler::new(),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                deps,
            }),
        }
    }

    /// Snapshot of the current (hot-reloadable) settings.
    pub fn config(&self) -> Arc<OrchestratorConfig> {
        self.inner.deps.runtime_config.orchestrator.load_full()
    }

    pub fn batches(&self) -> &BatchStore {
        &self.inner.batches
    }

    /// Accept one inbound event. Returns once the event is either queued,
    /// handled as a reset, or handed to an uncoordinated unit; replies are
    /// produced in the background.
    pub async fn submit(
        &self,
        event_id: impl Into<String>,
        sender: SenderKey,
        content: impl Into<String>,
        channel_meta: ChannelMeta,
    ) -> SubmitOutcome {
        let config = self.config();
        let event = InboundEvent::new(event_id, sender, content, channel_meta);

        if config.is_reset_command(&event.content) {
            self.reset(&event.sender_key, &config).await;
            return SubmitOutcome::Reset;
        }

        let pending = match self.inner.batches.append(&event, config.batch_ttl()).await {
            Ok(pending) => pending,
            Err(error) => {
                tracing::error!(
                    sender = %event.sender_key,
                    event_id = %event.id,
                    %error,
                    "coordination store unavailable, answering event without batching"
                );
                self.spawn_uncoordinated(event);
                return SubmitOutcome::Uncoordinated;
            }
        };

        let sender = event.sender_key;
        let scheduling = match self.schedule(&sender, pending, &config).await {
            Ok(scheduling) => scheduling,
            Err(error) => {
                tracing::error!(
                    %sender,
                    %error,
                    "event queued but scheduling failed, leaving it for the janitor"
                );
                Scheduling::Deferred
            }
        };
        tracing::debug!(%sender, pending, ?scheduling, "event queued");

        SubmitOutcome::Queued {
            pending,
            scheduling,
        }
    }

    async fn schedule(
        &self,
        sender: &SenderKey,
        pending: usize,
        config: &OrchestratorConfig,
    ) -> StoreResult<Scheduling> {
        if !self.inner.locks.is_held(sender).await?
            && let Some(token) = self
                .inner
                .locks
                .try_acquire(sender, config.lock_ttl())
                .await?
        {
            return Ok(self.start_acquired(sender, token, pending, config));
        }

        // Locked, or another submit won the acquire race.
        let generation = self.inner.generations.increment(sender).await?;
        let aborted_local = self
            .inner
            .aborts
            .trigger_abort_older_than(sender, generation)
            .is_some();
        if pending >= config.max_batch_size {
            self.inner.debounce.fire_now(sender);
        }
        if aborted_local {
            tracing::info!(%sender, generation, "interrupting in-flight unit");
        }
        Ok(Scheduling::Interrupted {
            generation,
            aborted_local,
        })
    }

    /// Schedule the unit for a fresh acquisition: immediately when the batch
    /// is already full, otherwise after the quiet window.
    fn start_acquired(
        &self,
        sender: &SenderKey,
        token: LockToken,
        pending: usize,
        config: &OrchestratorConfig,
    ) -> Scheduling {
        if pending >= config.max_batch_size {
            self.spawn_unit(sender.clone(), token);
            return Scheduling::Immediate;
        }

        let timer = self
            .inner
            .debounce
            .arm(sender, token, config.debounce());
        let this = self.clone();
        let sender = sender.clone();
        let span = tracing::debug_span!("debounce", %sender);
        self.inner.tasks.spawn(
            async move {
                let config = this.config();
                let token = timer.token().clone();
                let reason = timer
                    .wait(&this.inner.batches, config.max_batch_size, config.size_poll())
                    .await;
                if !reason.should_process() {
                    tracing::debug!("debounce timer cancelled");
                    return;
                }
                tracing::debug!(?reason, "debounce timer fired");
                this.run_unit(sender, token).await;
            }
            .instrument(span),
        );
        Scheduling::Debounced
    }

    fn spawn_unit(&self, sender: SenderKey, token: LockToken) {
        let this = self.clone();
        let span = tracing::info_span!("unit", %sender);
        self.inner
            .tasks
            .spawn(async move { this.run_unit(sender, token).await }.instrument(span));
    }

    /// Reset bypasses batching entirely. Each step is attempted even when an
    /// earlier one fails.
    async fn reset(&self, sender: &SenderKey, config: &OrchestratorConfig) {
        tracing::info!(%sender, "resetting conversation");

        if let Err(error) = self.inner.batches.clear(sender).await {
            tracing::error!(%sender, %error, "failed to clear batch on reset");
        }
        let aborted = match self.inner.generations.mark_reset(sender).await {
            Ok(generation) => {
                tracing::debug!(%sender, generation, "reset marked");
                self.inner.aborts.trigger_abort_older_than(sender, generation)
            }
            Err(error) => {
                tracing::error!(%sender, %error, "failed to mark reset");
                self.inner.aborts.trigger_abort(sender)
            }
        };
        self.inner.debounce.cancel(sender);
        if let Some(generation) = aborted {
            tracing::debug!(%sender, generation, "aborted in-flight unit for reset");
        }
        if let Err(error) = self.inner.locks.release(sender).await {
            tracing::error!(%sender, %error, "failed to release lock on reset");
        }
        match self.inner.deps.history.clear(sender).await {
            Ok(removed) => tracing::debug!(%sender, removed, "conversation history cleared"),
            Err(error) => tracing::error!(%sender, %error, "failed to clear history on reset"),
        }
        if let Err(error) = self
            .inner
            .deps
            .messenger
            .deliver(sender, &config.reset_reply)
            .await
        {
            tracing::error!(%sender, %error, "failed to deliver reset confirmation");
        }
    }

    fn spawn_uncoordinated(&self, event: InboundEvent) {
        let this = self.clone();
        let span = tracing::info_span!("uncoordinated", sender = %event.sender_key);
        self.inner
            .tasks
            .spawn(async move { this.run_uncoordinated(event).await }.instrument(span));
    }

    /// Round-trip to the coordination store.
    pub async fn ping(&self) -> StoreResult<()> {
        let probe = self.inner.deps.keys.kind_prefix(KeyKind::Lock);
        self.inner.deps.store.exists(&probe).await.map(|_| ())
    }

    pub async fn status(&self, sender: &SenderKey) -> StoreResult<SenderStatus> {
        Ok(SenderStatus {
            is_processing: self.inner.locks.is_held(sender).await?,
            pending_count: self.inner.batches.size(sender).await?,
        })
    }

    pub async fn stats(&self) -> StoreResult<OrchestratorStats> {
        let pending = self.inner.batches.pending_senders().await?;
        let processing = self.inner.locks.held_senders().await?;

        let mut total_pending_events = 0;
        for sender in &pending {
            total_pending_events += self.inner.batches.size(sender).await?;
        }
        let active: BTreeSet<&SenderKey> = pending.iter().chain(processing.iter()).collect();

        Ok(OrchestratorStats {
            active_senders: active.len(),
            total_pending_events,
            processing_senders: processing.len(),
        })
    }

    /// Schedule batches left behind without a live lock, e.g. by an instance
    /// that crashed mid-unit. Returns how many senders were picked up.
    pub async fn sweep(&self) -> StoreResult<usize> {
        let config = self.config();
        let mut scheduled = 0;
        for sender in self.inner.batches.pending_senders().await? {
            if self.inner.locks.is_held(&sender).await? {
                continue;
            }
            let pending = self.inner.batches.size(&sender).await?;
            if pending == 0 {
                continue;
            }
            if let Some(token) = self
                .inner
                .locks
                .try_acquire(&sender, config.lock_ttl())
                .await?
            {
                tracing::info!(%sender, pending, "scheduling orphaned batch");
                self.start_acquired(&sender, token, pending, &config);
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    /// Run [`Orchestrator::sweep`] periodically until shutdown. A zero
    /// interval disables the janitor.
    pub fn spawn_janitor(&self) -> Option<JoinHandle<()>> {
        let interval = self.config().janitor_interval();
        if interval.is_zero() {
            tracing::info!("janitor disabled");
            return None;
        }

        let this = self.clone();
        let shutdown = self.inner.shutdown.clone();
        Some(tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        _ = ticker.tick() => match this.sweep().await {
                            Ok(0) => {}
                            Ok(scheduled) => tracing::info!(scheduled, "janitor scheduled orphaned batches"),
                            Err(error) => tracing::warn!(%error, "janitor sweep failed"),
                        },
                    }
                }
                tracing::debug!("janitor stopped");
            }
            .instrument(tracing::info_span!("janitor")),
        ))
    }

    /// Wait until every timer and unit spawned so far has finished.
    pub async fn wait_idle(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// Stop the janitor and let in-flight units run to completion.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        tracing::info!(in_flight = self.inner.tasks.len(), "waiting for in-flight units");
        self.inner.tasks.wait().await;
    }
}
