use utoipa::{OpenApi, ToSchema};

#[allow(dead_code)]
#[derive(ToSchema)]
pub struct HealthOk {
    pub ok: bool,
}

#[allow(dead_code)]
#[derive(ToSchema)]
pub struct HttpInfo {
    pub bind: String,
    pub port: u16,
}

#[allow(dead_code)]
#[derive(ToSchema)]
pub struct AboutResponse {
    pub service: String,
    pub version: String,
    pub http: HttpInfo,
    pub endpoints: Vec<String>,
    pub topics: Vec<String>,
    pub recipes: Vec<String>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::meta::healthz,
        crate::api::meta::about,
        crate::api::activation::activation_decide,
        crate::api::guardrail::guardrail_evaluate,
        crate::api::guardrail::guardrail_timebox,
        crate::api::guardrail::state_guardrail_policy,
        crate::api::tasks::tasks_create,
        crate::api::tasks::state_task,
        crate::api::tasks::tasks_claim,
        crate::api::tasks::tasks_release,
        crate::api::admin::admin_claims_reconcile,
    ),
    components(
        schemas(HealthOk, HttpInfo, AboutResponse, loopgate_protocol::ProblemDetails)
    ),
    tags(
        (name = "Meta", description = "Service metadata and health"),
        (name = "Activation", description = "Capacity decisions for monitored loops"),
        (name = "Guardrail", description = "Timebox and limit enforcement on task changes"),
        (name = "Tasks", description = "Task creation and claim coordination"),
        (name = "Admin", description = "Store maintenance")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_route_is_documented() {
        let doc = ApiDoc::openapi();
        let (_, endpoints) = crate::router::build_router();
        for ep in endpoints {
            let (_, path) = ep.split_once(' ').expect("METHOD path");
            assert!(doc.paths.paths.contains_key(path), "{path} missing from openapi");
        }
    }
}
