//! HTTP surface: the inbound webhook plus read-only status endpoints.
//!
//! Transport authentication is expected to happen upstream; this surface
//! only accepts already-verified events.

mod inbound;
mod state;
mod status;

pub use inbound::InboundRequest;
pub use state::ApiState;

use anyhow::Context as _;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/inbound", post(inbound::receive))
        .route("/status/{sender}", get(status::sender_status))
        .route("/stats", get(status::stats))
        .route("/health", get(status::health))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ApiState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let address = listener.local_addr().context("listener has no local address")?;
    tracing::info!(%address, "http api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http api failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrchestratorConfig, RuntimeConfig};
    use crate::conversation::MemoryHistory;
    use crate::messaging::LogMessenger;
    use crate::responder::EchoResponder;
    use crate::store::{KeySpace, MemoryStore};
    use crate::{Orchestrator, OrchestratorDeps};

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt as _;

    fn app(store: &MemoryStore) -> Router {
        let orchestrator = Orchestrator::new(OrchestratorDeps {
            store: store.clone().into(),
            keys: KeySpace::default(),
            runtime_config: Arc::new(RuntimeConfig::new(OrchestratorConfig::default())),
            responder: Arc::new(EchoResponder),
            messenger: Arc::new(LogMessenger),
            history: Arc::new(MemoryHistory::new()),
        });
        router(Arc::new(ApiState::new(orchestrator)))
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_inbound(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/inbound")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn inbound_event_is_accepted_and_visible_in_status() {
        let store = MemoryStore::new();
        let app = app(&store);

        let response = app
            .clone()
            .oneshot(post_inbound(serde_json::json!({
                "id": "evt-1",
                "sender": "+15550001",
                "content": "hello",
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        assert_eq!(body["id"], "evt-1");
        assert_eq!(body["result"]["outcome"], "queued");
        assert_eq!(body["result"]["scheduling"]["kind"], "debounced");

        let response = app.clone().oneshot(get("/status/+15550001")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({ "is_processing": true, "pending_count": 1 })
        );

        let response = app.oneshot(get("/stats")).await.unwrap();
        let stats = json_body(response).await;
        assert_eq!(stats["active_senders"], 1);
        assert_eq!(stats["total_pending_events"], 1);
    }

    #[tokio::test]
    async fn missing_id_is_generated() {
        let app = app(&MemoryStore::new());
        let response = app
            .oneshot(post_inbound(serde_json::json!({
                "sender": "s",
                "content": "hi",
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        assert!(!body["id"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_sender_is_rejected() {
        let app = app(&MemoryStore::new());
        let response = app
            .oneshot(post_inbound(serde_json::json!({
                "sender": "  ",
                "content": "hi",
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let app = app(&MemoryStore::new());
        let response = app
            .oneshot(post_inbound(serde_json::json!({ "content": "hi" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn store_outage_maps_to_service_unavailable() {
        let store = MemoryStore::new();
        let app = app(&store);

        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        store.set_unavailable(true);
        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let response = app.clone().oneshot(get("/status/s")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let response = app.oneshot(get("/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
