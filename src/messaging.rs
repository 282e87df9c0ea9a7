//! Outbound delivery adapters (webhook, log).

pub mod log;
pub mod traits;
pub mod webhook;

pub use self::log::LogMessenger;
pub use traits::{Messenger, MessengerDyn};
pub use webhook::WebhookMessenger;

use crate::config::MessengerConfig;
use std::sync::Arc;

/// Build the messenger described by the config.
pub fn from_config(config: &MessengerConfig) -> anyhow::Result<Arc<dyn MessengerDyn>> {
    match &config.outbound_url {
        Some(url) => Ok(Arc::new(WebhookMessenger::new(
            url.clone(),
            config.api_key.clone(),
        )?)),
        None => {
            tracing::warn!("no outbound url configured, replies will only be logged");
            Ok(Arc::new(LogMessenger))
        }
    }
}
