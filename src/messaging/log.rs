//! Messenger that only logs replies. Used when no outbound channel is set up.

use crate::SenderKey;
use crate::error::DeliveryError;
use crate::messaging::traits::Messenger;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogMessenger;

impl Messenger for LogMessenger {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, sender: &SenderKey, text: &str) -> Result<(), DeliveryError> {
        tracing::info!(%sender, reply = %crate::logging::preview(text, 160), "reply ready (log messenger)");
        Ok(())
    }
}
