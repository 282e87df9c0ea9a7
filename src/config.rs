//! Configuration loading from `relaybot.toml` with environment overrides.

use crate::error::ConfigError;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const ENV_CONFIG_PATH: &str = "RELAYBOT_CONFIG";
const ENV_REDIS_URL: &str = "RELAYBOT_REDIS_URL";
const ENV_BIND: &str = "RELAYBOT_BIND";
const ENV_RESPONDER_URL: &str = "RELAYBOT_RESPONDER_URL";
const ENV_OUTBOUND_URL: &str = "RELAYBOT_OUTBOUND_URL";
const ENV_HISTORY_PATH: &str = "RELAYBOT_HISTORY_PATH";

/// Full service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub store: StoreConfig,
    pub responder: ResponderConfig,
    pub messenger: MessengerConfig,
    pub history: HistoryConfig,
    pub api: ApiConfig,
}

/// Batching, locking and processing-loop tuneables.
///
/// Hot-reloadable through [`RuntimeConfig`]; every submit and every
/// processing unit reads a fresh snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct OrchestratorConfig {
    /// Quiet window after the first unconsumed event before the batch fires.
    pub debounce_ms: u64,
    /// Batch size at which the batch fires without waiting for the window.
    pub max_batch_size: usize,
    /// Lock lifetime. Refreshed by the processing heartbeat while a unit runs.
    pub lock_ttl_secs: u64,
    /// Lifetime of an idle batch list, extended on every append.
    pub batch_ttl_secs: u64,
    /// Upper bound on a single generation call. Must stay below the lock TTL.
    pub generation_timeout_secs: u64,
    /// How often a running unit checks the shared generation counter.
    pub generation_poll_ms: u64,
    /// How often an armed debounce timer checks the shared batch size.
    pub size_poll_ms: u64,
    /// Number of prior history entries handed to the responder.
    pub history_limit: usize,
    /// Interval of the orphaned-batch sweep. Zero disables it.
    pub janitor_interval_secs: u64,
    /// Control commands that bypass batching and reset the conversation.
    pub reset_commands: Vec<String>,
    /// Reply sent after a reset. Empty sends nothing.
    pub reset_reply: String,
    /// Reply sent when generation fails.
    pub fallback_reply: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2000,
            max_batch_size: 5,
            lock_ttl_secs: 120,
            batch_ttl_secs: 600,
            generation_timeout_secs: 90,
            generation_poll_ms: 250,
            size_poll_ms: 100,
            history_limit: 20,
            janitor_interval_secs: 30,
            reset_commands: vec!["RESET".into()],
            reset_reply: "Conversation reset.".into(),
            fallback_reply: "Sorry, something went wrong. Please try again in a moment.".into(),
        }
    }
}

impl OrchestratorConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn batch_ttl(&self) -> Duration {
        Duration::from_secs(self.batch_ttl_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn generation_poll(&self) -> Duration {
        Duration::from_millis(self.generation_poll_ms.max(1))
    }

    pub fn size_poll(&self) -> Duration {
        Duration::from_millis(self.size_poll_ms.max(1))
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }

    /// Whether `content` is a control command rather than conversation text.
    pub fn is_reset_command(&self, content: &str) -> bool {
        let trimmed = content.trim();
        self.reset_commands
            .iter()
            .any(|command| command.trim().eq_ignore_ascii_case(trimmed))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.max_batch_size must be at least 1".into(),
            ));
        }
        if self.lock_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.lock_ttl_secs must be greater than zero".into(),
            ));
        }
        if self.generation_timeout_secs >= self.lock_ttl_secs {
            return Err(ConfigError::Invalid(format!(
                "orchestrator.generation_timeout_secs ({}) must be shorter than lock_ttl_secs ({})",
                self.generation_timeout_secs, self.lock_ttl_secs
            )));
        }
        if self.batch_ttl_secs < self.lock_ttl_secs {
            return Err(ConfigError::Invalid(format!(
                "orchestrator.batch_ttl_secs ({}) must not be shorter than lock_ttl_secs ({})",
                self.batch_ttl_secs, self.lock_ttl_secs
            )));
        }
        Ok(())
    }
}

/// Which coordination store backs batches, locks and generations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store. Single-instance deployments and tests only.
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    /// Prefix applied to every key so several bots can share one server.
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".into(),
            key_prefix: "relaybot".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ResponderConfig {
    /// Endpoint that turns a combined unit into reply text. Unset echoes the input.
    pub url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MessengerConfig {
    /// Outbound webhook for replies and typing indicators. Unset logs replies.
    pub outbound_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct HistoryConfig {
    /// SQLite database path. Unset keeps history in memory.
    pub sqlite_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ApiConfig {
    pub bind: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8088)),
        }
    }
}

impl Config {
    /// Resolve the config path: explicit argument, then `RELAYBOT_CONFIG`,
    /// then `./relaybot.toml`.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(ENV_CONFIG_PATH).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("relaybot.toml"))
    }

    /// Load and validate configuration. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.orchestrator.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup(ENV_REDIS_URL) {
            self.store.redis_url = url;
            self.store.backend = StoreBackend::Redis;
        }
        if let Some(bind) = lookup(ENV_BIND) {
            self.api.bind = bind
                .parse()
                .map_err(|error| ConfigError::Invalid(format!("{ENV_BIND}={bind}: {error}")))?;
        }
        if let Some(url) = lookup(ENV_RESPONDER_URL) {
            self.responder.url = Some(url);
        }
        if let Some(url) = lookup(ENV_OUTBOUND_URL) {
            self.messenger.outbound_url = Some(url);
        }
        if let Some(path) = lookup(ENV_HISTORY_PATH) {
            self.history.sqlite_path = Some(PathBuf::from(path));
        }
        Ok(())
    }
}

/// Live orchestrator settings that can be swapped without a restart.
#[derive(Debug)]
pub struct RuntimeConfig {
    pub orchestrator: ArcSwap<OrchestratorConfig>,
}

impl RuntimeConfig {
    pub fn new(orchestrator: OrchestratorConfig) -> Self {
        Self {
            orchestrator: ArcSwap::from_pointee(orchestrator),
        }
    }

    /// Swap in reloaded settings. Invalid settings are rejected and the
    /// current snapshot is kept.
    pub fn reload(&self, orchestrator: OrchestratorConfig) -> Result<(), ConfigError> {
        orchestrator.validate()?;
        self.orchestrator.store(Arc::new(orchestrator));
        Ok(())
    }
}
