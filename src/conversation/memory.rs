//! Process-local history, used when no database is configured.

use super::history::{ConversationHistory, HistoryEntry, HistoryRole};
use crate::SenderKey;
use crate::error::HistoryError;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct MemoryHistory {
    entries: Arc<RwLock<HashMap<SenderKey, Vec<HistoryEntry>>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationHistory for MemoryHistory {
    async fn load_recent(
        &self,
        sender: &SenderKey,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, HistoryError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(sender)
            .map(|history| {
                let start = history.len().saturating_sub(limit);
                history[start..].to_vec()
            })
            .unwrap_or_default())
    }

    async fn append(
        &self,
        sender: &SenderKey,
        role: HistoryRole,
        content: &str,
    ) -> Result<(), HistoryError> {
        self.entries
            .write()
            .await
            .entry(sender.clone())
            .or_default()
            .push(HistoryEntry {
                role,
                content: content.to_string(),
                created_at: chrono::Utc::now(),
            });
        Ok(())
    }

    async fn clear(&self, sender: &SenderKey) -> Result<u64, HistoryError> {
        let removed = self.entries.write().await.remove(sender);
        Ok(removed.map_or(0, |history| history.len() as u64))
    }
}
