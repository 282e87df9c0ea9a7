//! Webhook messenger: posts replies and typing indicators to an outbound URL.
//!
//! The receiving side translates the JSON body into whatever the transport
//! (WhatsApp, SMS, ...) expects.

use crate::SenderKey;
use crate::error::DeliveryError;
use crate::messaging::traits::Messenger;

use anyhow::Context as _;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundBody<'a> {
    Typing { to: &'a str },
    Message { to: &'a str, text: &'a str },
}

#[derive(Debug, Clone)]
pub struct WebhookMessenger {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl WebhookMessenger {
    pub fn new(url: String, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("relaybot/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("failed to build outbound http client")?;
        Ok(Self {
            client,
            url,
            api_key,
        })
    }

    async fn post(&self, body: &OutboundBody<'_>) -> Result<(), DeliveryError> {
        let mut request = self.client.post(&self.url).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

impl Messenger for WebhookMessenger {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send_typing(&self, sender: &SenderKey) -> Result<(), DeliveryError> {
        self.post(&OutboundBody::Typing {
            to: sender.as_str(),
        })
        .await
    }

    async fn deliver(&self, sender: &SenderKey, text: &str) -> Result<(), DeliveryError> {
        self.post(&OutboundBody::Message {
            to: sender.as_str(),
            text,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_body_is_tagged() {
        let body = serde_json::to_value(OutboundBody::Message {
            to: "+1555",
            text: "hi",
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "type": "message", "to": "+1555", "text": "hi" })
        );

        let typing = serde_json::to_value(OutboundBody::Typing { to: "+1555" }).unwrap();
        assert_eq!(typing["type"], "typing");
    }
}
