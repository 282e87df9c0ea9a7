//! Top-level error types.

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error that wraps the per-concern error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures of the shared coordination store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to encode or decode stored value: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unexpected value at {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

/// Configuration loading and validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Outcome of a generation call that did not produce a reply.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    /// The abort handle was signalled and the responder stopped.
    #[error("generation cancelled")]
    Cancelled,

    #[error("generation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("generation failed: {0}")]
    Failed(#[from] anyhow::Error),
}

/// Outbound delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("delivery endpoint returned {status}")]
    Status { status: u16 },

    #[error("delivery failed: {0}")]
    Other(#[from] anyhow::Error),
}

/// Conversation history persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("history migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}
