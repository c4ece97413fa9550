use std::mem;

use axum::{
    handler::Handler,
    routing::{get, post},
    Router,
};

use crate::{api, AppState};

pub(crate) mod paths {
    pub const HEALTHZ: &str = "/healthz";
    pub const ABOUT: &str = "/about";
    pub const ACTIVATION_DECIDE: &str = "/activation/decide";
    pub const GUARDRAIL_EVALUATE: &str = "/guardrail/evaluate";
    pub const GUARDRAIL_TIMEBOX: &str = "/guardrail/timebox/{task_id}";
    pub const STATE_GUARDRAIL_POLICY: &str = "/state/guardrail/policy";
    pub const TASKS: &str = "/tasks";
    pub const STATE_TASK: &str = "/state/tasks/{id}";
    pub const TASK_CLAIM: &str = "/tasks/{id}/claim";
    pub const TASK_RELEASE: &str = "/tasks/{id}/release";
    pub const ADMIN_CLAIMS_RECONCILE: &str = "/admin/claims/reconcile";
}

/// Router plus the `METHOD path` list served by `/about`.
pub(crate) struct RouterBuilder {
    router: Router<AppState>,
    endpoints: Vec<String>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn route_get<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.endpoints.push(format!("GET {path}"));
        let router = mem::take(&mut self.router);
        self.router = router.route(path, get(handler));
        self
    }

    pub fn route_post<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.endpoints.push(format!("POST {path}"));
        let router = mem::take(&mut self.router);
        self.router = router.route(path, post(handler));
        self
    }

    pub fn build(self) -> (Router<AppState>, Vec<String>) {
        (self.router, self.endpoints)
    }
}

pub(crate) fn build_router() -> (Router<AppState>, Vec<String>) {
    let mut builder = RouterBuilder::new();
    builder
        .route_get(paths::HEALTHZ, api::meta::healthz)
        .route_get(paths::ABOUT, api::meta::about)
        .route_post(paths::ACTIVATION_DECIDE, api::activation::activation_decide)
        .route_post(paths::GUARDRAIL_EVALUATE, api::guardrail::guardrail_evaluate)
        .route_get(paths::GUARDRAIL_TIMEBOX, api::guardrail::guardrail_timebox)
        .route_get(
            paths::STATE_GUARDRAIL_POLICY,
            api::guardrail::state_guardrail_policy,
        )
        .route_post(paths::TASKS, api::tasks::tasks_create)
        .route_get(paths::STATE_TASK, api::tasks::state_task)
        .route_post(paths::TASK_CLAIM, api::tasks::tasks_claim)
        .route_post(paths::TASK_RELEASE, api::tasks::tasks_release)
        .route_post(
            paths::ADMIN_CLAIMS_RECONCILE,
            api::admin::admin_claims_reconcile,
        );
    builder.build()
}
