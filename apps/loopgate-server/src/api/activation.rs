use axum::extract::rejection::JsonRejection;
use axum::response::Response;
use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use loopgate_activation::{decide_timed, ActivationInput, Capacity, Decision};
use loopgate_kernel::NewDecision;
use loopgate_recipes::{expand, no_base_tasks, Expansion};
use loopgate_topics as topics;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{responses, AppState};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DecideRequest {
    #[serde(flatten)]
    input: ActivationInput,
    /// Evaluation instant; defaults to the server clock.
    #[serde(default)]
    now: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DecideResponse {
    decision: Decision,
    evaluation_ms: f64,
    record_id: i64,
    event: loopgate_events::Envelope,
    #[serde(skip_serializing_if = "Option::is_none")]
    expansion: Option<Expansion>,
    tasks_created: Vec<String>,
}

/// Decide the response capacity for a loop and persist the decision.
///
/// Reflexive decisions are expanded with the first recipe that applies to the
/// loop; the resulting tasks are created `open`.
#[utoipa::path(
    post,
    path = "/activation/decide",
    tag = "Activation",
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Decision recorded", body = serde_json::Value),
        (status = 400, description = "Invalid input", body = loopgate_protocol::ProblemDetails),
        (status = 500, description = "Store failure", body = loopgate_protocol::ProblemDetails)
    )
)]
pub async fn activation_decide(
    State(state): State<AppState>,
    req: Result<Json<DecideRequest>, JsonRejection>,
) -> Response {
    let req = match responses::body(req) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let now = req.now.unwrap_or_else(Utc::now);
    let timed = match decide_timed(&req.input, now) {
        Ok(t) => t,
        Err(e) => return responses::validation(e),
    };
    let decision = timed.decision;

    let record_id = match persist(&state, &decision).await {
        Ok(id) => id,
        Err(e) => return responses::store_error(e),
    };
    let topic = if decision.blocked {
        topics::TOPIC_ACTIVATION_BLOCKED
    } else {
        topics::TOPIC_ACTIVATION_DECIDED
    };
    let event = state.publish(topic, &decision);
    tracing::debug!(
        decision_id = %decision.decision_id,
        loop_id = %decision.loop_id,
        capacity = decision.capacity.map(Capacity::as_str).unwrap_or("blocked"),
        "activation decided"
    );

    let (expansion, tasks_created) = match expand_reflexive(&state, &decision, now).await {
        Ok(out) => out,
        Err(resp) => return resp,
    };

    responses::json_ok(DecideResponse {
        decision,
        evaluation_ms: timed.evaluation_ms,
        record_id,
        event,
        expansion,
        tasks_created,
    })
}

async fn persist(state: &AppState, decision: &Decision) -> anyhow::Result<i64> {
    let kernel = state.kernel().clone();
    let decision = decision.clone();
    tokio::task::spawn_blocking(move || {
        let payload = serde_json::to_value(&decision)?;
        kernel.record_decision(&NewDecision {
            decision_id: &decision.decision_id,
            loop_id: &decision.loop_id,
            capacity: decision.capacity.map(Capacity::as_str),
            blocked: decision.blocked,
            fingerprint: &decision.fingerprint,
            payload: &payload,
            at: decision.decided_at,
        })
    })
    .await
    .map_err(|e| anyhow::anyhow!("join error: {e}"))?
}

async fn expand_reflexive(
    state: &AppState,
    decision: &Decision,
    now: DateTime<Utc>,
) -> Result<(Option<Expansion>, Vec<String>), Response> {
    if decision.blocked || decision.capacity != Some(Capacity::Reflexive) {
        return Ok((None, Vec::new()));
    }
    let Some(recipe) = state.recipes().select(&decision.loop_id) else {
        return Ok((None, Vec::new()));
    };
    let expansion = expand(decision, recipe, &no_base_tasks, now).map_err(|e| {
        tracing::error!(recipe = %recipe.id, error = %e, "recipe expansion failed");
        responses::problem(
            loopgate_protocol::ProblemDetails::new(500, "Error")
                .with_detail(e.to_string())
                .with_code(loopgate_protocol::ProblemCode::Internal),
        )
    })?;

    let mut created = Vec::new();
    for task in &expansion.tasks {
        let fresh = state
            .kernel()
            .create_task_async(&task.id, &task.title, Some(decision.decision_id.as_str()), now)
            .await
            .map_err(responses::store_error)?;
        if fresh {
            state.publish(
                topics::TOPIC_TASKS_CREATED,
                &json!({"taskId": task.id, "source": decision.decision_id}),
            );
            created.push(task.id.clone());
        }
    }
    state.publish(
        topics::TOPIC_ACTIVATION_EXPANDED,
        &json!({
            "decisionId": decision.decision_id,
            "recipeId": recipe.id,
            "tasks": expansion.tasks.len(),
            "bands": expansion.bands.len(),
            "tuning": expansion.tuning.is_some(),
        }),
    );
    Ok((Some(expansion), created))
}
