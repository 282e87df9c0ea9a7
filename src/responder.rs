//! Generation collaborator: turns a combined unit into reply text.

use crate::SenderKey;
use crate::config::ResponderConfig;
use crate::conversation::HistoryEntry;
use crate::error::GenerateError;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Produces a reply for one combined unit.
///
/// Implementations must watch `abort` at safe points and return
/// [`GenerateError::Cancelled`] promptly once it fires. An implementation
/// that cannot stop may still return a reply; the processing loop discards
/// it when it is stale.
pub trait Responder: Send + Sync + 'static {
    fn generate(
        &self,
        sender: &SenderKey,
        combined_text: &str,
        history: &[HistoryEntry],
        abort: CancellationToken,
    ) -> impl Future<Output = Result<String, GenerateError>> + Send;
}

/// Object-safe companion of [`Responder`], blanket-implemented for every
/// responder so the orchestrator can hold `Arc<dyn ResponderDyn>`.
pub trait ResponderDyn: Send + Sync + 'static {
    fn generate<'a>(
        &'a self,
        sender: &'a SenderKey,
        combined_text: &'a str,
        history: &'a [HistoryEntry],
        abort: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<String, GenerateError>> + Send + 'a>>;
}

impl<T: Responder> ResponderDyn for T {
    fn generate<'a>(
        &'a self,
        sender: &'a SenderKey,
        combined_text: &'a str,
        history: &'a [HistoryEntry],
        abort: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<String, GenerateError>> + Send + 'a>> {
        Box::pin(Responder::generate(
            self,
            sender,
            combined_text,
            history,
            abort,
        ))
    }
}

/// Build the responder described by the config.
pub fn from_config(config: &ResponderConfig) -> anyhow::Result<std::sync::Arc<dyn ResponderDyn>> {
    match &config.url {
        Some(url) => Ok(std::sync::Arc::new(HttpResponder::new(
            url.clone(),
            config.api_key.clone(),
        )?)),
        None => {
            tracing::warn!("no responder url configured, replies will echo the input");
            Ok(std::sync::Arc::new(EchoResponder))
        }
    }
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    sender: &'a str,
    text: &'a str,
    history: &'a [HistoryEntry],
}

#[derive(Deserialize)]
struct GenerateReply {
    reply: String,
}

/// Calls an HTTP endpoint that accepts `{ sender, text, history }` and
/// answers `{ reply }`. Cancellation drops the in-flight request.
#[derive(Debug, Clone)]
pub struct HttpResponder {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpResponder {
    pub fn new(url: String, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("relaybot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build responder http client")?;
        Ok(Self {
            client,
            url,
            api_key,
        })
    }

    async fn request(
        &self,
        sender: &SenderKey,
        combined_text: &str,
        history: &[HistoryEntry],
    ) -> Result<String, GenerateError> {
        let mut request = self.client.post(&self.url).json(&GenerateBody {
            sender: sender.as_str(),
            text: combined_text,
            history,
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .context("responder request failed")?
            .error_for_status()
            .context("responder returned an error status")?;
        let body: GenerateReply = response
            .json()
            .await
            .context("responder returned an invalid body")?;
        Ok(body.reply)
    }
}

impl Responder for HttpResponder {
    async fn generate(
        &self,
        sender: &SenderKey,
        combined_text: &str,
        history: &[HistoryEntry],
        abort: CancellationToken,
    ) -> Result<String, GenerateError> {
        tokio::select! {
            biased;
            () = abort.cancelled() => Err(GenerateError::Cancelled),
            result = self.request(sender, combined_text, history) => result,
        }
    }
}

/// Replies with the combined unit itself. Used when no responder is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoResponder;

impl Responder for EchoResponder {
    async fn generate(
        &self,
        _sender: &SenderKey,
        combined_text: &str,
        _history: &[HistoryEntry],
        abort: CancellationToken,
    ) -> Result<String, GenerateError> {
        if abort.is_cancelled() {
            return Err(GenerateError::Cancelled);
        }
        Ok(combined_text.to_string())
    }
}
