use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use loopgate_kernel::{ClaimOutcome, ClaimRequest, ReleaseOutcome};
use loopgate_topics as topics;
use serde::Deserialize;
use serde_json::json;

use crate::{api, responses, AppState};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateTaskRequest {
    #[serde(default)]
    id: Option<String>,
    title: String,
    #[serde(default)]
    source: Option<String>,
}

/// Create an `open` task. Re-posting an existing id is a no-op.
#[utoipa::path(
    post,
    path = "/tasks",
    tag = "Tasks",
    request_body = serde_json::Value,
    responses(
        (status = 201, description = "Created", body = serde_json::Value),
        (status = 200, description = "Already existed", body = serde_json::Value),
        (status = 400, description = "Invalid input", body = loopgate_protocol::ProblemDetails)
    )
)]
pub async fn tasks_create(
    State(state): State<AppState>,
    req: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Response {
    let req = match responses::body(req) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let title = req.title.trim();
    if title.is_empty() {
        return responses::validation("title must not be empty");
    }
    let id = req
        .id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let now = Utc::now();
    let kernel = state.kernel();
    let created = match kernel
        .create_task_async(&id, title, req.source.as_deref(), now)
        .await
    {
        Ok(c) => c,
        Err(e) => return responses::store_error(e),
    };
    let task = match kernel.get_task_async(&id).await {
        Ok(Some(task)) => task,
        Ok(None) => return responses::store_error(format!("task {id} vanished after insert")),
        Err(e) => return responses::store_error(e),
    };
    if created {
        state.publish(
            topics::TOPIC_TASKS_CREATED,
            &json!({"taskId": id, "source": task.source}),
        );
    }
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (status, Json(json!({"created": created, "task": task}))).into_response()
}

/// Task row with its lock and owner assignments.
#[utoipa::path(
    get,
    path = "/state/tasks/{id}",
    tag = "Tasks",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task snapshot", body = serde_json::Value),
        (status = 404, description = "Unknown task", body = loopgate_protocol::ProblemDetails)
    )
)]
pub async fn state_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let kernel = state.kernel().clone();
    let lookup = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let Some(task) = kernel.get_task(&id)? else {
            return Ok(Err(id));
        };
        let lock = kernel.task_lock(&task.id)?;
        let owners = kernel.assignments(&task.id)?;
        Ok(Ok((task, lock, owners)))
    })
    .await;
    match lookup {
        Ok(Ok(Ok((task, lock, owners)))) => {
            let now = Utc::now();
            let active = lock.as_ref().is_some_and(|l| l.is_active(now));
            responses::json_ok(json!({
                "task": task,
                "lock": lock,
                "lockActive": active,
                "assignments": owners,
            }))
        }
        Ok(Ok(Err(id))) => responses::not_found(format!("task {id} not found")),
        Ok(Err(e)) => responses::store_error(e),
        Err(e) => responses::store_error(format!("join error: {e}")),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ClaimBody {
    #[serde(default)]
    user_agent: Option<String>,
    #[serde(default)]
    ip_address: Option<String>,
}

/// Claim a task for the calling actor.
///
/// Conflicts (`lock_held`, `lost_race`, `task_not_open`) are 200 responses
/// with `status = "rejected"`.
#[utoipa::path(
    post,
    path = "/tasks/{id}/claim",
    tag = "Tasks",
    params(("id" = String, Path, description = "Task id")),
    request_body(content = serde_json::Value, description = "Optional userAgent / ipAddress"),
    responses(
        (status = 200, description = "Claimed or rejected", body = serde_json::Value),
        (status = 404, description = "Unknown task", body = loopgate_protocol::ProblemDetails),
        (status = 500, description = "Store failure", body = loopgate_protocol::ProblemDetails)
    )
)]
pub async fn tasks_claim(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    raw: Bytes,
) -> Response {
    let body: ClaimBody = match responses::optional_body(&raw) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let actor = api::actor(&headers);
    let req = ClaimRequest {
        task_id: id,
        actor: actor.clone(),
        user_agent: body
            .user_agent
            .or_else(|| api::header_str(&headers, header::USER_AGENT)),
        ip_address: body.ip_address,
        now: Utc::now(),
    };
    let outcome = match state.claims().claim_async(req).await {
        Ok(outcome) => outcome,
        Err(e) => return responses::claim_error(e),
    };
    match &outcome {
        ClaimOutcome::Claimed { .. } => {
            state.publish(topics::TOPIC_TASKS_CLAIMED, &outcome);
        }
        ClaimOutcome::Rejected { task_id, reason, .. } => {
            tracing::debug!(task_id = %task_id, actor = %actor, ?reason, "claim rejected");
            state.publish(topics::TOPIC_TASKS_CLAIM_REJECTED, &outcome);
        }
    }
    responses::json_ok(outcome)
}

/// Release the caller's lock and reopen the task.
#[utoipa::path(
    post,
    path = "/tasks/{id}/release",
    tag = "Tasks",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Released or not held", body = serde_json::Value),
        (status = 404, description = "Unknown task", body = loopgate_protocol::ProblemDetails)
    )
)]
pub async fn tasks_release(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let actor = api::actor(&headers);
    let outcome = match state.claims().release_async(&id, &actor, Utc::now()).await {
        Ok(outcome) => outcome,
        Err(e) => return responses::claim_error(e),
    };
    if matches!(outcome, ReleaseOutcome::Released { .. }) {
        state.publish(topics::TOPIC_TASKS_RELEASED, &outcome);
    }
    responses::json_ok(outcome)
}
