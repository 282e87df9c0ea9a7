//! Conversation history handed to the responder as prior context.

pub mod history;
pub mod memory;

pub use history::{
    ConversationHistory, ConversationHistoryDyn, HistoryEntry, HistoryRole, SqliteHistory,
};
pub use memory::MemoryHistory;

use crate::config::HistoryConfig;
use std::sync::Arc;

/// Open the history store described by the config.
pub async fn from_config(config: &HistoryConfig) -> crate::Result<Arc<dyn ConversationHistoryDyn>> {
    match &config.sqlite_path {
        Some(path) => {
            let history = SqliteHistory::connect(path).await?;
            tracing::info!(path = %path.display(), "conversation history opened");
            Ok(Arc::new(history))
        }
        None => {
            tracing::info!("conversation history kept in memory");
            Ok(Arc::new(MemoryHistory::new()))
        }
    }
}
