use axum::response::{IntoResponse, Response};
use axum::{extract::State, Json};
use serde_json::json;

use crate::AppState;

/// Liveness check.
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "Meta",
    responses(
        (status = 200, description = "Service healthy", body = crate::openapi::HealthOk)
    )
)]
pub async fn healthz() -> impl IntoResponse {
    Json(json!({"ok": true}))
}

/// Service name, version, bind address and registered endpoints.
#[utoipa::path(
    get,
    path = "/about",
    tag = "Meta",
    responses(
        (status = 200, description = "Service metadata", body = crate::openapi::AboutResponse)
    )
)]
pub async fn about(State(state): State<AppState>) -> Response {
    crate::responses::json_ok(json!({
        "service": "loopgate-server",
        "version": env!("CARGO_PKG_VERSION"),
        "http": state.http(),
        "endpoints": state.endpoints(),
        "topics": loopgate_topics::ALL_TOPICS,
        "recipes": state.recipes().recipes().iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
    }))
}
