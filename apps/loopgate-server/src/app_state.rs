use std::sync::Arc;

use loopgate_events::{Bus, Envelope};
use loopgate_guardrail::GuardrailEngine;
use loopgate_kernel::{ClaimCoordinator, Kernel};
use loopgate_recipes::RecipeBook;
use serde::Serialize;

#[derive(Clone)]
pub(crate) struct AppState {
    bus: Bus,
    kernel: Kernel,
    claims: ClaimCoordinator<Kernel>,
    guardrail: Arc<GuardrailEngine>,
    recipes: Arc<RecipeBook>,
    endpoints: Arc<Vec<String>>,
    http: Arc<HttpInfo>,
    reconcile_grace_secs: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub(crate) struct HttpInfo {
    pub bind: String,
    pub port: u16,
}

impl AppState {
    pub fn new(
        bus: Bus,
        kernel: Kernel,
        guardrail: GuardrailEngine,
        recipes: RecipeBook,
        lease: chrono::Duration,
    ) -> Self {
        Self {
            claims: ClaimCoordinator::with_lease(kernel.clone(), lease),
            bus,
            kernel,
            guardrail: Arc::new(guardrail),
            recipes: Arc::new(recipes),
            endpoints: Arc::new(Vec::new()),
            http: Arc::new(HttpInfo::default()),
            reconcile_grace_secs: 120,
        }
    }

    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = Arc::new(endpoints);
        self
    }

    pub fn with_http(mut self, bind: String, port: u16) -> Self {
        self.http = Arc::new(HttpInfo { bind, port });
        self
    }

    pub fn with_reconcile_grace(mut self, secs: u64) -> Self {
        self.reconcile_grace_secs = secs;
        self
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn claims(&self) -> &ClaimCoordinator<Kernel> {
        &self.claims
    }

    pub fn guardrail(&self) -> &GuardrailEngine {
        &self.guardrail
    }

    pub fn recipes(&self) -> &RecipeBook {
        &self.recipes
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn http(&self) -> &HttpInfo {
        &self.http
    }

    pub fn reconcile_grace_secs(&self) -> u64 {
        self.reconcile_grace_secs
    }

    /// Publish on the bus; the journal task persists it.
    pub fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> Envelope {
        self.bus.publish(topic, payload)
    }
}
