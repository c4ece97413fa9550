use std::time::Duration;

use anyhow::{Context, Result};
use loopgate_core::Settings;
use loopgate_events::Bus;
use loopgate_guardrail::GuardrailEngine;
use loopgate_kernel::Kernel;
use loopgate_recipes::RecipeBook;
use loopgate_topics as topics;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use utoipa::OpenApi;

use crate::{access_log, app_state::AppState, router::build_router};

pub(crate) struct BootstrapOutput {
    pub router: axum::Router<()>,
    pub state: AppState,
    pub background: Vec<JoinHandle<()>>,
}

pub(crate) async fn build(settings: &Settings) -> Result<BootstrapOutput> {
    let kernel = Kernel::open(&settings.state_dir)
        .with_context(|| format!("failed to open store in {}", settings.state_dir.display()))?;
    let guardrail = GuardrailEngine::with_policy(settings.guardrail.clone())
        .context("guardrail policy failed validation")?;
    let recipes = RecipeBook::load_dir(&settings.recipes_dir)?;
    let bus = Bus::new(256);

    let mut background = vec![spawn_journal(bus.clone(), kernel.clone())];

    let (router, endpoints) = build_router();
    let state = AppState::new(
        bus,
        kernel,
        guardrail,
        recipes,
        chrono::Duration::minutes(i64::from(settings.lease_minutes)),
    )
    .with_endpoints(endpoints)
    .with_http(settings.bind.clone(), settings.port)
    .with_reconcile_grace(settings.reconcile_grace_secs);

    if settings.reconcile_interval_secs > 0 {
        background.push(spawn_reconcile_loop(
            state.clone(),
            Duration::from_secs(settings.reconcile_interval_secs),
        ));
    }

    info!(
        state_dir = %settings.state_dir.display(),
        recipes = state.recipes().len(),
        lease_minutes = settings.lease_minutes,
        "loopgate state ready"
    );
    state.publish(
        topics::TOPIC_SERVICE_START,
        &json!({"version": env!("CARGO_PKG_VERSION")}),
    );

    Ok(BootstrapOutput {
        router: router.with_state(state.clone()),
        state,
        background,
    })
}

/// Persist every bus event to the kernel journal. Failures are logged and
/// dropped; the journal is not a source of truth.
fn spawn_journal(bus: Bus, kernel: Kernel) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(env) => {
                    if let Err(e) = kernel.append_event_async(&env).await {
                        warn!(kind = %env.kind, error = %e, "event journal append failed");
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event journal lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_reconcile_loop(state: AppState, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays quiet.
        tick.tick().await;
        loop {
            tick.tick().await;
            let grace = state.reconcile_grace_secs();
            if let Err(e) = crate::api::admin::reconcile_once(&state, grace).await {
                warn!(error = %e, "background claim reconcile failed");
            }
        }
    })
}

pub(crate) fn attach_layers(router: axum::Router<()>, concurrency_limit: usize) -> axum::Router<()> {
    use tower::limit::ConcurrencyLimitLayer;
    use tower_http::trace::TraceLayer;

    router
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(concurrency_limit))
        .layer(axum::middleware::from_fn(access_log::access_log_mw))
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum HttpConfigError {
    #[error("invalid LOOPGATE_HTTP_MAX_CONC: {0}")]
    InvalidConcurrency(String),
    #[error("invalid bind address: {0}")]
    InvalidBind(String),
}

#[derive(Debug)]
pub(crate) struct HttpConfig {
    pub addr: std::net::SocketAddr,
    pub concurrency_limit: usize,
}

pub(crate) fn http_config(settings: &Settings) -> Result<HttpConfig, HttpConfigError> {
    let max_conc = std::env::var("LOOPGATE_HTTP_MAX_CONC").ok();
    http_config_from(settings, max_conc.as_deref())
}

fn http_config_from(
    settings: &Settings,
    max_conc: Option<&str>,
) -> Result<HttpConfig, HttpConfigError> {
    let concurrency_limit = max_conc
        .map(|raw| {
            raw.trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| HttpConfigError::InvalidConcurrency(raw.to_string()))
        })
        .transpose()?
        .unwrap_or(1024);
    let host = if settings.bind.contains(':') && !settings.bind.starts_with('[') {
        format!("[{}]", settings.bind)
    } else {
        settings.bind.clone()
    };
    let addr = format!("{host}:{}", settings.port)
        .parse()
        .map_err(|_| HttpConfigError::InvalidBind(settings.bind.clone()))?;
    Ok(HttpConfig {
        addr,
        concurrency_limit,
    })
}

/// When `OPENAPI_OUT` is set, write the OpenAPI YAML there and report the
/// path so `main` can exit without serving.
pub(crate) fn ensure_openapi_export() -> Result<Option<String>> {
    let Ok(path) = std::env::var("OPENAPI_OUT") else {
        return Ok(None);
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = crate::openapi::ApiDoc::openapi()
        .to_yaml()
        .context("failed to render openapi yaml")?;
    std::fs::write(&path, yaml).with_context(|| format!("failed to write {path}"))?;
    Ok(Some(path))
}
