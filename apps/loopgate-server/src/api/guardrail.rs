use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use loopgate_guardrail::{
    format_decision, timebox_expiry, timebox_status, Adjusted, Audience, ChangeKind,
    GuardrailContext, GuardrailDecision, GuardrailResult, RuleFiring, TaskSnapshot,
};
use loopgate_kernel::{ActuationAttempt, Enforcement, RenewalRow};
use loopgate_topics as topics;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{api, responses, AppState};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EvaluateRequest {
    task_id: String,
    change_kind: ChangeKind,
    #[serde(default)]
    delta_estimate: Option<f64>,
    #[serde(default)]
    coverage_estimate_pct: Option<f64>,
    #[serde(default)]
    substeps_requested: Option<u32>,
    /// Overrides the `X-Loopgate-Actor` header.
    #[serde(default)]
    actor: Option<String>,
    /// Caller's proposed change, logged with the attempt.
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    now: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateResponse {
    result: GuardrailResult,
    allowed: bool,
    rules_fired: Vec<RuleFiring>,
    #[serde(skip_serializing_if = "Option::is_none")]
    adjusted: Option<Adjusted>,
    evaluation_ms: f64,
    current_renewals: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    requires_evaluation: Option<bool>,
    message: String,
}

/// Evaluate a proposed change against the active guardrail policy.
///
/// Block and throttle are ordinary 200 responses. An allowed `renew` counts
/// the renewal and restarts the timebox.
#[utoipa::path(
    post,
    path = "/guardrail/evaluate",
    tag = "Guardrail",
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Evaluation result", body = serde_json::Value),
        (status = 400, description = "Invalid input", body = loopgate_protocol::ProblemDetails),
        (status = 404, description = "Unknown task", body = loopgate_protocol::ProblemDetails),
        (status = 500, description = "Store failure", body = loopgate_protocol::ProblemDetails)
    )
)]
pub async fn guardrail_evaluate(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<EvaluateRequest>, JsonRejection>,
) -> Response {
    let req = match responses::body(req) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let now = req.now.unwrap_or_else(Utc::now);
    let actor = req
        .actor
        .clone()
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| api::actor(&headers));

    let task = match state.kernel().get_task_async(&req.task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => return responses::not_found(format!("task {} not found", req.task_id)),
        Err(e) => return responses::store_error(e),
    };
    let mut ctx = GuardrailContext {
        task: TaskSnapshot {
            id: task.id.clone(),
            created_at: task.timebox_anchor(),
            renewals: task.renewals,
        },
        change_kind: req.change_kind,
        delta_estimate: req.delta_estimate,
        coverage_estimate_pct: req.coverage_estimate_pct,
        substeps_requested: req.substeps_requested,
        now,
    };
    let mut decision = match state.guardrail().evaluate(&ctx) {
        Ok(d) => d,
        Err(e) => return responses::validation(e),
    };

    let mut current_renewals = task.renewals;
    let mut renewal: Option<RenewalRow> = None;
    if ctx.change_kind == ChangeKind::Renew && decision.allowed() {
        let (limit, threshold) = {
            let p = state.guardrail().policy();
            (p.renewal_limit, p.evaluation_required_after_renewals)
        };
        let renewed = state
            .kernel()
            .renew_task_async(&task.id, &actor, now, limit, threshold)
            .await;
        match renewed {
            Ok(Some(row)) => {
                current_renewals = row.renewals;
                renewal = Some(row);
            }
            Ok(None) => {
                // A concurrent renewal reached the ceiling first; judge again
                // against the stored count.
                let fresh = match state.kernel().get_task_async(&task.id).await {
                    Ok(Some(fresh)) => fresh,
                    Ok(None) => {
                        return responses::not_found(format!("task {} not found", task.id))
                    }
                    Err(e) => return responses::store_error(e),
                };
                ctx.task.created_at = fresh.timebox_anchor();
                ctx.task.renewals = fresh.renewals;
                current_renewals = fresh.renewals;
                decision = match state.guardrail().evaluate(&ctx) {
                    Ok(d) => d,
                    Err(e) => return responses::validation(e),
                };
            }
            Err(e) => return responses::store_error(e),
        }
    }

    if let Err(e) = record_attempt(&state, &ctx, &actor, &decision, req.payload).await {
        return responses::store_error(e);
    }

    let requires_evaluation = renewal.as_ref().map(|r| r.requires_evaluation);
    if let Some(row) = &renewal {
        state.publish(topics::TOPIC_GUARDRAIL_RENEWED, row);
    }

    state.publish(
        topics::TOPIC_GUARDRAIL_EVALUATED,
        &json!({
            "taskId": task.id,
            "actor": actor,
            "changeKind": ctx.change_kind.as_str(),
            "result": decision.result.as_str(),
            "rules": decision.rules_fired.iter().map(|r| r.rule.as_str()).collect::<Vec<_>>(),
        }),
    );
    tracing::debug!(
        task_id = %task.id,
        result = decision.result.as_str(),
        evaluation_ms = decision.evaluation_ms,
        "guardrail evaluated"
    );

    let message = format_decision(&decision, Audience::EndUser);
    let allowed = decision.allowed();
    responses::json_ok(EvaluateResponse {
        result: decision.result,
        allowed,
        rules_fired: decision.rules_fired,
        adjusted: decision.adjusted,
        evaluation_ms: decision.evaluation_ms,
        current_renewals,
        requires_evaluation,
        message,
    })
}

async fn record_attempt(
    state: &AppState,
    ctx: &GuardrailContext,
    actor: &str,
    decision: &GuardrailDecision,
    payload: Value,
) -> anyhow::Result<i64> {
    let kernel = state.kernel().clone();
    let task_id = ctx.task.id.clone();
    let actor = actor.to_string();
    let change_kind = ctx.change_kind;
    let at = ctx.now;
    let decision = decision.clone();
    tokio::task::spawn_blocking(move || {
        let fired: Vec<Enforcement<'_>> = decision
            .rules_fired
            .iter()
            .map(|r| Enforcement {
                rule: r.rule.as_str(),
                effect: r.effect.as_str(),
                message: &r.message,
            })
            .collect();
        kernel.record_actuation(
            &ActuationAttempt {
                task_id: &task_id,
                actor: &actor,
                change_kind: change_kind.as_str(),
                result: decision.result.as_str(),
                evaluation_ms: decision.evaluation_ms,
                payload: &payload,
                at,
            },
            &fired,
        )
    })
    .await
    .map_err(|e| anyhow::anyhow!("join error: {e}"))?
}

/// Active guardrail policy.
#[utoipa::path(
    get,
    path = "/state/guardrail/policy",
    tag = "Guardrail",
    responses((status = 200, description = "Policy snapshot", body = serde_json::Value))
)]
pub async fn state_guardrail_policy(State(state): State<AppState>) -> Response {
    responses::json_ok(json!({ "policy": state.guardrail().snapshot() }))
}

/// Timebox expiry for a task, relative to its last renewal.
#[utoipa::path(
    get,
    path = "/guardrail/timebox/{task_id}",
    tag = "Guardrail",
    params(("task_id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Timebox status", body = serde_json::Value),
        (status = 404, description = "Unknown task", body = loopgate_protocol::ProblemDetails)
    )
)]
pub async fn guardrail_timebox(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Response {
    let task = match state.kernel().get_task_async(&task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => return responses::not_found(format!("task {task_id} not found")),
        Err(e) => return responses::store_error(e),
    };
    let hours = state.guardrail().policy().timebox_hours;
    let anchor = task.timebox_anchor();
    let now = Utc::now();
    responses::json_ok(json!({
        "taskId": task.id,
        "anchor": anchor,
        "expiresAt": timebox_expiry(anchor, hours),
        "status": timebox_status(anchor, hours, now),
        "renewals": task.renewals,
    }))
}
