//! Inbound webhook: one verified text event per request.

use crate::api::state::ApiState;
use crate::{ChannelMeta, SenderKey};

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use std::sync::Arc;

/// Request body for `POST /inbound`.
#[derive(Debug, Deserialize)]
pub struct InboundRequest {
    /// Transport event id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub sender: String,
    pub content: String,
    #[serde(default)]
    pub meta: ChannelMeta,
}

pub async fn receive(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<InboundRequest>,
) -> impl IntoResponse {
    let sender = request.sender.trim();
    if sender.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "sender must not be empty"})),
        )
            .into_response();
    }

    let id = request
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let result = state
        .orchestrator
        .submit(
            id.clone(),
            SenderKey::new(sender),
            request.content,
            request.meta,
        )
        .await;

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "id": id, "result": result })),
    )
        .into_response()
}
