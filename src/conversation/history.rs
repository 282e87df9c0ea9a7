//! Conversation message persistence (SQLite).

use crate::SenderKey;
use crate::error::HistoryError;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row as _, SqlitePool};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Who authored a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Assistant,
}

impl HistoryRole {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryRole::User => "user",
            HistoryRole::Assistant => "assistant",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "assistant" => HistoryRole::Assistant,
            _ => HistoryRole::User,
        }
    }
}

/// One persisted turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Durable conversation history, keyed by sender.
pub trait ConversationHistory: Send + Sync + 'static {
    /// Most recent `limit` entries, oldest first.
    fn load_recent(
        &self,
        sender: &SenderKey,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<HistoryEntry>, HistoryError>> + Send;

    fn append(
        &self,
        sender: &SenderKey,
        role: HistoryRole,
        content: &str,
    ) -> impl Future<Output = Result<(), HistoryError>> + Send;

    /// Forget everything for `sender`. Returns the number of entries removed.
    fn clear(&self, sender: &SenderKey) -> impl Future<Output = Result<u64, HistoryError>> + Send;
}

type HistoryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, HistoryError>> + Send + 'a>>;

/// Object-safe companion of [`ConversationHistory`].
pub trait ConversationHistoryDyn: Send + Sync + 'static {
    fn load_recent<'a>(
        &'a self,
        sender: &'a SenderKey,
        limit: usize,
    ) -> HistoryFuture<'a, Vec<HistoryEntry>>;

    fn append<'a>(
        &'a self,
        sender: &'a SenderKey,
        role: HistoryRole,
        content: &'a str,
    ) -> HistoryFuture<'a, ()>;

    fn clear<'a>(&'a self, sender: &'a SenderKey) -> HistoryFuture<'a, u64>;
}

impl<T: ConversationHistory> ConversationHistoryDyn for T {
    fn load_recent<'a>(
        &'a self,
        sender: &'a SenderKey,
        limit: usize,
    ) -> HistoryFuture<'a, Vec<HistoryEntry>> {
        Box::pin(ConversationHistory::load_recent(self, sender, limit))
    }

    fn append<'a>(
        &'a self,
        sender: &'a SenderKey,
        role: HistoryRole,
        content: &'a str,
    ) -> HistoryFuture<'a, ()> {
        Box::pin(ConversationHistory::append(self, sender, role, content))
    }

    fn clear<'a>(&'a self, sender: &'a SenderKey) -> HistoryFuture<'a, u64> {
        Box::pin(ConversationHistory::clear(self, sender))
    }
}

/// SQLite-backed history.
#[derive(Debug, Clone)]
pub struct SqliteHistory {
    pool: SqlitePool,
}

impl SqliteHistory {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub async fn connect(path: &Path) -> crate::Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create history directory: {}", parent.display())
            })?;
        }
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("failed to connect to history db at {}", path.display()))?;
        Ok(Self::with_pool(pool).await?)
    }

    /// Single-connection in-memory database, mainly for tests.
    pub async fn in_memory() -> Result<Self, HistoryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, HistoryError> {
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

impl ConversationHistory for SqliteHistory {
    async fn load_recent(
        &self,
        sender: &SenderKey,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, HistoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT role, content, created_at FROM conversation_messages \
             WHERE sender_key = ? \
             ORDER BY seq DESC \
             LIMIT ?",
        )
        .bind(sender.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = rows
            .into_iter()
            .map(|row| -> Result<HistoryEntry, sqlx::Error> {
                Ok(HistoryEntry {
                    role: HistoryRole::parse(&row.try_get::<String, _>("role")?),
                    content: row.try_get("content")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        entries.reverse();
        Ok(entries)
    }

    async fn append(
        &self,
        sender: &SenderKey,
        role: HistoryRole,
        content: &str,
    ) -> Result<(), HistoryError> {
        sqlx::query(
            "INSERT INTO conversation_messages (id, sender_key, role, content, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(sender.as_str())
        .bind(role.as_str())
        .bind(content)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self, sender: &SenderKey) -> Result<u64, HistoryError> {
        let result = sqlx::query("DELETE FROM conversation_messages WHERE sender_key = ?")
            .bind(sender.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
