use axum::body::Bytes;
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use loopgate_topics as topics;
use serde::Deserialize;

use crate::{responses, AppState};

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ReconcileBody {
    #[serde(default)]
    grace_secs: Option<u64>,
}

/// Repair claims left half-finished by a failed compensation.
#[utoipa::path(
    post,
    path = "/admin/claims/reconcile",
    tag = "Admin",
    request_body(content = serde_json::Value, description = "Optional graceSecs"),
    responses(
        (status = 200, description = "Reconcile report", body = serde_json::Value),
        (status = 500, description = "Store failure", body = loopgate_protocol::ProblemDetails)
    )
)]
pub async fn admin_claims_reconcile(State(state): State<AppState>, raw: Bytes) -> Response {
    let body: ReconcileBody = match responses::optional_body(&raw) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let grace_secs = body.grace_secs.unwrap_or_else(|| state.reconcile_grace_secs());
    match reconcile_once(&state, grace_secs).await {
        Ok(report) => responses::json_ok(report),
        Err(e) => responses::store_error(e),
    }
}

const MAX_GRACE_SECS: u64 = 365 * 24 * 3600;

/// One reconcile pass; publishes only when something was repaired.
pub(crate) async fn reconcile_once(
    state: &AppState,
    grace_secs: u64,
) -> anyhow::Result<loopgate_kernel::ReconcileReport> {
    let grace = chrono::Duration::seconds(grace_secs.min(MAX_GRACE_SECS) as i64);
    let report = state.kernel().reconcile_async(Utc::now(), grace).await?;
    if !report.is_clean() {
        state.publish(topics::TOPIC_TASKS_RECONCILED, &report);
    }
    Ok(report)
}
