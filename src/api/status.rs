//! Read-only views over the coordination store.

use crate::SenderKey;
use crate::api::state::ApiState;
use crate::error::StoreError;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

fn store_unavailable(error: StoreError) -> Response {
    tracing::warn!(%error, "status query failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({"error": error.to_string()})),
    )
        .into_response()
}

pub async fn sender_status(
    State(state): State<Arc<ApiState>>,
    Path(sender): Path<String>,
) -> Response {
    match state.orchestrator.status(&SenderKey::new(sender)).await {
        Ok(status) => Json(status).into_response(),
        Err(error) => store_unavailable(error),
    }
}

pub async fn stats(State(state): State<Arc<ApiState>>) -> Response {
    match state.orchestrator.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(error) => store_unavailable(error),
    }
}

pub async fn health(State(state): State<Arc<ApiState>>) -> Response {
    match state.orchestrator.ping().await {
        Ok(()) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Err(error) => store_unavailable(error),
    }
}
