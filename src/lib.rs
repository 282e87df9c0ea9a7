//! relaybot: burst-coalescing reply orchestration for a messaging channel.
//!
//! Inbound events for a sender are queued in a shared coordination store,
//! combined into one unit of work after a short quiet window, answered by a
//! (slow) responder, and delivered as exactly one reply, even when more
//! events arrive while the reply is being produced.

pub mod api;
pub mod config;
pub mod conversation;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod orchestrator;
pub mod responder;
pub mod store;

pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, OrchestratorDeps, OrchestratorStats, SenderStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Stable identifier for one conversation (e.g. a phone number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SenderKey(Arc<str>);

impl SenderKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SenderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SenderKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SenderKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SenderKey {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// Transport-specific metadata carried alongside an inbound event.
pub type ChannelMeta = HashMap<String, serde_json::Value>;

/// A single inbound text event, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub id: String,
    pub sender_key: SenderKey,
    pub content: String,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub channel_meta: ChannelMeta,
}

impl InboundEvent {
    pub fn new(
        id: impl Into<String>,
        sender_key: SenderKey,
        content: impl Into<String>,
        channel_meta: ChannelMeta,
    ) -> Self {
        Self {
            id: id.into(),
            sender_key,
            content: content.into(),
            received_at: Utc::now(),
            channel_meta,
        }
    }
}
